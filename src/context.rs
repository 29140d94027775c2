/// Application context and dependency injection
use crate::{
    account::AccountRegistry,
    config::BotConfig,
    db,
    error::BotResult,
    identity::IdentityMap,
    jobs::JobBoard,
    notify::{self, Notifier},
    panel::{HiddifyAdapter, MarzbanAdapter, PanelAdapter},
    resolver::Resolver,
    usage::{SnapshotStore, WarningLog},
};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
///
/// Adapters and the identity map are built once here and handed to the
/// resolver, the jobs and the admin API.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<BotConfig>,
    pub tz: Tz,
    pub db: SqlitePool,
    pub identity: Arc<IdentityMap>,
    pub resolver: Arc<Resolver>,
    pub accounts: AccountRegistry,
    pub snapshots: SnapshotStore,
    pub warnings: WarningLog,
    pub notifier: Arc<dyn Notifier>,
    pub jobs: Arc<JobBoard>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: BotConfig) -> BotResult<Self> {
        // Validate configuration
        config.validate()?;

        // Create data directories if they don't exist
        Self::ensure_directories(&config).await?;

        // Initialize database and run migrations
        let db = db::create_pool(&config.storage.database_path, db::DatabaseOptions::default()).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        // Identity map must exist before the Marzban adapter, which back-resolves usernames
        let identity = Arc::new(IdentityMap::load(&config.storage.identity_map_path)?);
        tracing::info!("Identity map loaded with {} entries", identity.len());

        let tz = config.scheduler.tz()?;
        let hiddify: Arc<dyn PanelAdapter> =
            Arc::new(HiddifyAdapter::new(&config.hiddify, &config.http, tz)?);
        let marzban: Arc<dyn PanelAdapter> = Arc::new(MarzbanAdapter::new(
            &config.marzban,
            &config.http,
            identity.clone(),
        )?);

        if !config.hiddify.is_configured() {
            tracing::warn!("HIDDIFY_DOMAIN not set, Hiddify panel disabled");
        }
        if !config.marzban.is_configured() {
            tracing::warn!("MARZBAN_API_BASE_URL not set, Marzban panel disabled");
        }

        let notifier = notify::from_config(&config.telegram)?;

        Self::from_parts(config, db, hiddify, marzban, identity, notifier)
    }

    /// Assemble a context from already-built collaborators
    pub fn from_parts(
        config: BotConfig,
        db: SqlitePool,
        hiddify: Arc<dyn PanelAdapter>,
        marzban: Arc<dyn PanelAdapter>,
        identity: Arc<IdentityMap>,
        notifier: Arc<dyn Notifier>,
    ) -> BotResult<Self> {
        let tz = config.scheduler.tz()?;
        let accounts = AccountRegistry::new(db.clone());
        let snapshots = SnapshotStore::new(db.clone());
        let warnings = WarningLog::new(db.clone());

        let resolver = Arc::new(Resolver::new(
            hiddify,
            marzban,
            identity.clone(),
            accounts.clone(),
            snapshots.clone(),
            warnings.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            tz,
            db,
            identity,
            resolver,
            accounts,
            snapshots,
            warnings,
            notifier,
            jobs: Arc::new(JobBoard::new()),
        })
    }

    /// Ensure required directories exist
    async fn ensure_directories(config: &BotConfig) -> BotResult<()> {
        tokio::fs::create_dir_all(&config.storage.data_directory).await?;
        if config.backup.enabled {
            tokio::fs::create_dir_all(&config.backup.directory).await?;
        }
        Ok(())
    }
}
