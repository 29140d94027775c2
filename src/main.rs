/// Dual-panel VPN usage bot
///
/// Watches Hiddify and Marzban accounts, snapshots usage every hour and
/// sends warnings and nightly reports over Telegram.
use dualpanel_bot::{
    config::BotConfig,
    context::AppContext,
    error::BotResult,
    jobs::JobScheduler,
    server,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> BotResult<()> {
    // Load configuration first so the log format can follow it
    let config = BotConfig::from_env()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dualpanel_bot=info,tower_http=info".into());
    if config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    print_banner();

    // Create application context
    let ctx = Arc::new(AppContext::new(config).await?);
    tracing::info!(
        "Timezone {}, {} admin(s), identity map with {} entries",
        ctx.tz,
        ctx.config.telegram.admin_ids.len(),
        ctx.identity.len()
    );

    // Start background jobs
    let scheduler = Arc::new(JobScheduler::new(Arc::clone(&ctx))?);
    let jobs = scheduler.start();

    if ctx.config.admin_api.enabled {
        server::serve((*ctx).clone()).await?;
    } else {
        tracing::info!("Admin API disabled; running scheduler only");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        jobs.abort();
    }

    Ok(())
}

fn print_banner() {
    println!(
        r#"
    dualpanel-bot v{}
    Hiddify + Marzban usage reports
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
