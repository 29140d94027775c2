/// Configuration management for the dual-panel bot
use crate::error::{BotError, BotResult};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Main bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub hiddify: HiddifyConfig,
    pub marzban: MarzbanConfig,
    pub http: PanelHttpConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub warnings: WarningConfig,
    pub telegram: TelegramConfig,
    pub admin_api: AdminApiConfig,
    pub backup: BackupSettings,
    pub birthday: BirthdayConfig,
    pub logging: LoggingConfig,
}

/// Hiddify panel connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiddifyConfig {
    /// Panel domain including scheme, e.g. `https://panel.example.com`
    pub domain: String,
    pub admin_proxy_path: String,
    pub api_key: String,
}

impl HiddifyConfig {
    /// Base URL of the v2 admin API
    pub fn api_base(&self) -> String {
        format!(
            "{}/{}/api/v2/admin",
            self.domain.trim_end_matches('/'),
            self.admin_proxy_path.trim_matches('/')
        )
    }

    pub fn is_configured(&self) -> bool {
        !self.domain.is_empty()
    }
}

/// Marzban panel connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarzbanConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl MarzbanConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }
}

/// Outbound panel HTTP behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelHttpConfig {
    pub timeout_secs: u64,
    /// Total attempts for transient failures (first try included)
    pub max_attempts: u32,
    /// Base backoff, doubled after every failed attempt
    pub backoff_ms: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database_path: PathBuf,
    /// JSON document mapping external UUIDs to Marzban usernames
    pub identity_map_path: PathBuf,
}

/// Scheduler timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone used for daily/monthly jobs and "start of day"
    pub timezone: String,
    pub tick_secs: u64,
    /// Minute past each hour at which snapshots are taken
    pub snapshot_minute: u32,
    pub warning_check_hours: u32,
    pub daily_report_time: String,
    pub maintenance_day_of_month: u32,
    pub maintenance_time: String,
    /// Per-account budget inside a job; slower accounts are skipped
    pub account_timeout_secs: u64,
    /// Wall-clock budget per job run before a warning is logged
    pub job_budget_secs: u64,
    pub job_concurrency: usize,
}

impl SchedulerConfig {
    pub fn tz(&self) -> BotResult<Tz> {
        Tz::from_str(&self.timezone)
            .map_err(|_| BotError::Config(format!("Unknown timezone: {}", self.timezone)))
    }

    pub fn report_time(&self) -> BotResult<NaiveTime> {
        parse_clock(&self.daily_report_time)
    }

    pub fn maintenance_clock(&self) -> BotResult<NaiveTime> {
        parse_clock(&self.maintenance_time)
    }
}

/// Warning thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningConfig {
    pub days_before_expiry: i64,
    /// Warn when remaining quota on a panel drops to this percentage or below
    pub usage_threshold_percent: f64,
    pub cooldown_hours: i64,
}

/// Telegram notification sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub admin_ids: Vec<i64>,
    pub api_base: String,
}

/// Admin HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub token: String,
}

/// Database backup scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub retain_days: u32,
    pub time: String,
}

/// Yearly gift added to every account of an owner on their birthday
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BirthdayConfig {
    pub enabled: bool,
    pub gift_gb: f64,
    pub gift_days: i64,
    pub time: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        let data_directory = PathBuf::from("./data");
        Self {
            hiddify: HiddifyConfig {
                domain: String::new(),
                admin_proxy_path: String::new(),
                api_key: String::new(),
            },
            marzban: MarzbanConfig {
                base_url: String::new(),
                username: String::new(),
                password: String::new(),
            },
            http: PanelHttpConfig {
                timeout_secs: 15,
                max_attempts: 3,
                backoff_ms: 500,
            },
            storage: StorageConfig {
                database_path: data_directory.join("bot.sqlite"),
                data_directory: data_directory.clone(),
                identity_map_path: PathBuf::from("./uuid_to_marzban_user.json"),
            },
            scheduler: SchedulerConfig {
                timezone: "Asia/Tehran".to_string(),
                tick_secs: 60,
                snapshot_minute: 1,
                warning_check_hours: 4,
                daily_report_time: "23:59".to_string(),
                maintenance_day_of_month: 1,
                maintenance_time: "04:00".to_string(),
                account_timeout_secs: 30,
                job_budget_secs: 900,
                job_concurrency: 4,
            },
            warnings: WarningConfig {
                days_before_expiry: 3,
                usage_threshold_percent: 20.0,
                cooldown_hours: 24,
            },
            telegram: TelegramConfig {
                bot_token: None,
                admin_ids: Vec::new(),
                api_base: "https://api.telegram.org".to_string(),
            },
            admin_api: AdminApiConfig {
                enabled: false,
                host: "127.0.0.1".to_string(),
                port: 8080,
                token: String::new(),
            },
            backup: BackupSettings {
                enabled: false,
                directory: PathBuf::from("./backups"),
                retain_days: 14,
                time: "03:30".to_string(),
            },
            birthday: BirthdayConfig {
                enabled: true,
                gift_gb: 15.0,
                gift_days: 15,
                time: "00:05".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

impl BotConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BotResult<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();

        let data_directory: PathBuf = env::var("BOT_DATA_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage.data_directory);
        let database_path = env::var("BOT_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("bot.sqlite"));
        let identity_map_path = env::var("UUID_MAP_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage.identity_map_path);

        let admin_ids = env::var("ADMIN_IDS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<i64>()
                    .map_err(|_| BotError::Config(format!("Invalid admin id: {}", s)))
            })
            .collect::<BotResult<Vec<i64>>>()?;

        let config = BotConfig {
            hiddify: HiddifyConfig {
                domain: env::var("HIDDIFY_DOMAIN").unwrap_or_default(),
                admin_proxy_path: env::var("HIDDIFY_ADMIN_PROXY_PATH").unwrap_or_default(),
                api_key: env::var("HIDDIFY_API_KEY").unwrap_or_default(),
            },
            marzban: MarzbanConfig {
                base_url: env::var("MARZBAN_API_BASE_URL").unwrap_or_default(),
                username: env::var("MARZBAN_API_USERNAME").unwrap_or_default(),
                password: env::var("MARZBAN_API_PASSWORD").unwrap_or_default(),
            },
            http: PanelHttpConfig {
                timeout_secs: env_parse("PANEL_API_TIMEOUT_SECS", defaults.http.timeout_secs),
                max_attempts: env_parse("PANEL_API_MAX_ATTEMPTS", defaults.http.max_attempts),
                backoff_ms: env_parse("PANEL_API_BACKOFF_MS", defaults.http.backoff_ms),
            },
            storage: StorageConfig {
                data_directory,
                database_path,
                identity_map_path,
            },
            scheduler: SchedulerConfig {
                timezone: env::var("BOT_TIMEZONE").unwrap_or(defaults.scheduler.timezone),
                tick_secs: env_parse("SCHEDULER_TICK_SECS", defaults.scheduler.tick_secs),
                snapshot_minute: env_parse("SNAPSHOT_MINUTE", defaults.scheduler.snapshot_minute),
                warning_check_hours: env_parse(
                    "USAGE_WARNING_CHECK_HOURS",
                    defaults.scheduler.warning_check_hours,
                ),
                daily_report_time: env::var("DAILY_REPORT_TIME")
                    .unwrap_or(defaults.scheduler.daily_report_time),
                maintenance_day_of_month: env_parse(
                    "MAINTENANCE_DAY_OF_MONTH",
                    defaults.scheduler.maintenance_day_of_month,
                ),
                maintenance_time: env::var("MAINTENANCE_TIME")
                    .unwrap_or(defaults.scheduler.maintenance_time),
                account_timeout_secs: env_parse(
                    "ACCOUNT_TIMEOUT_SECS",
                    defaults.scheduler.account_timeout_secs,
                ),
                job_budget_secs: env_parse("JOB_BUDGET_SECS", defaults.scheduler.job_budget_secs),
                job_concurrency: env_parse("JOB_CONCURRENCY", defaults.scheduler.job_concurrency),
            },
            warnings: WarningConfig {
                days_before_expiry: env_parse(
                    "WARNING_DAYS_BEFORE_EXPIRY",
                    defaults.warnings.days_before_expiry,
                ),
                usage_threshold_percent: env_parse(
                    "WARNING_USAGE_THRESHOLD",
                    defaults.warnings.usage_threshold_percent,
                ),
                cooldown_hours: env_parse("WARNING_COOLDOWN_HOURS", defaults.warnings.cooldown_hours),
            },
            telegram: TelegramConfig {
                bot_token: env::var("TELEGRAM_BOT_TOKEN").ok().filter(|t| !t.is_empty()),
                admin_ids,
                api_base: env::var("TELEGRAM_API_BASE").unwrap_or(defaults.telegram.api_base),
            },
            admin_api: AdminApiConfig {
                enabled: env_parse("ADMIN_API_ENABLED", defaults.admin_api.enabled),
                host: env::var("ADMIN_API_HOST").unwrap_or(defaults.admin_api.host),
                port: env::var("ADMIN_API_PORT")
                    .unwrap_or_else(|_| defaults.admin_api.port.to_string())
                    .parse()
                    .map_err(|_| BotError::Config("Invalid admin API port".to_string()))?,
                token: env::var("ADMIN_API_TOKEN").unwrap_or_default(),
            },
            backup: BackupSettings {
                enabled: env_parse("BACKUP_ENABLED", defaults.backup.enabled),
                directory: env::var("BACKUP_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.backup.directory),
                retain_days: env_parse("BACKUP_RETAIN_DAYS", defaults.backup.retain_days),
                time: env::var("BACKUP_TIME").unwrap_or(defaults.backup.time),
            },
            birthday: BirthdayConfig {
                enabled: env_parse("BIRTHDAY_GIFT_ENABLED", defaults.birthday.enabled),
                gift_gb: env_parse("BIRTHDAY_GIFT_GB", defaults.birthday.gift_gb),
                gift_days: env_parse("BIRTHDAY_GIFT_DAYS", defaults.birthday.gift_days),
                time: env::var("BIRTHDAY_GIFT_TIME").unwrap_or(defaults.birthday.time),
            },
            logging: LoggingConfig {
                level: env::var("RUST_LOG").unwrap_or(defaults.logging.level),
                json: env::var("LOG_FORMAT")
                    .map(|f| f.eq_ignore_ascii_case("json"))
                    .unwrap_or(false),
            },
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> BotResult<()> {
        self.scheduler.tz()?;
        self.scheduler.report_time()?;
        self.scheduler.maintenance_clock()?;
        parse_clock(&self.backup.time)?;
        parse_clock(&self.birthday.time)?;

        if self.scheduler.tick_secs == 0 {
            return Err(BotError::Config("Scheduler tick must be positive".to_string()));
        }
        if self.scheduler.snapshot_minute > 59 {
            return Err(BotError::Config("Snapshot minute must be 0-59".to_string()));
        }
        if self.scheduler.warning_check_hours == 0 {
            return Err(BotError::Config(
                "Warning check interval must be at least one hour".to_string(),
            ));
        }
        if !(1..=28).contains(&self.scheduler.maintenance_day_of_month) {
            return Err(BotError::Config(
                "Maintenance day must be between 1 and 28".to_string(),
            ));
        }
        if self.scheduler.job_concurrency == 0 {
            return Err(BotError::Config("Job concurrency must be positive".to_string()));
        }
        if self.http.max_attempts == 0 {
            return Err(BotError::Config("Panel API attempts must be positive".to_string()));
        }

        let threshold = self.warnings.usage_threshold_percent;
        if !(threshold > 0.0 && threshold <= 100.0) {
            return Err(BotError::Config(
                "Usage warning threshold must be in (0, 100]".to_string(),
            ));
        }

        let gift = &self.birthday;
        if gift.enabled && (!gift.gift_gb.is_finite() || gift.gift_gb < 0.0 || gift.gift_days < 0) {
            return Err(BotError::Config(
                "Birthday gift must not be negative".to_string(),
            ));
        }
        if gift.enabled && gift.gift_gb == 0.0 && gift.gift_days == 0 {
            return Err(BotError::Config(
                "Birthday gift is enabled but empty".to_string(),
            ));
        }

        if self.admin_api.enabled && self.admin_api.token.len() < 16 {
            return Err(BotError::Config(
                "Admin API token must be at least 16 characters".to_string(),
            ));
        }

        if !self.hiddify.is_configured() && !self.marzban.is_configured() {
            tracing::warn!("Neither Hiddify nor Marzban is configured; every lookup will miss");
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse an `HH:MM` wall-clock time
pub fn parse_clock(value: &str) -> BotResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| BotError::Config(format!("Invalid time of day (expected HH:MM): {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.tz().unwrap(), chrono_tz::Asia::Tehran);
    }

    #[test]
    fn test_rejects_bad_timezone_and_clock() {
        let mut config = BotConfig::default();
        config.scheduler.timezone = "Mars/Olympus".to_string();
        assert!(matches!(config.validate(), Err(BotError::Config(_))));

        let mut config = BotConfig::default();
        config.scheduler.daily_report_time = "25:00".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_admin_token_required_when_enabled() {
        let mut config = BotConfig::default();
        config.admin_api.enabled = true;
        config.admin_api.token = "short".to_string();
        assert!(config.validate().is_err());

        config.admin_api.token = "0123456789abcdef".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_bounds() {
        let mut config = BotConfig::default();
        config.warnings.usage_threshold_percent = 0.0;
        assert!(config.validate().is_err());
        config.warnings.usage_threshold_percent = 100.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_birthday_gift_bounds() {
        let mut config = BotConfig::default();
        assert_eq!(config.birthday.time, "00:05");

        config.birthday.gift_days = -1;
        assert!(config.validate().is_err());

        config.birthday.gift_days = 0;
        config.birthday.gift_gb = 0.0;
        assert!(config.validate().is_err());

        config.birthday.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hiddify_api_base() {
        let hiddify = HiddifyConfig {
            domain: "https://panel.example.com/".to_string(),
            admin_proxy_path: "/secret/".to_string(),
            api_key: "key".to_string(),
        };
        assert_eq!(
            hiddify.api_base(),
            "https://panel.example.com/secret/api/v2/admin"
        );
    }
}
