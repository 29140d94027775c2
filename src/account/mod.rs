/// Tracked account registry
///
/// Durable AccountIdentity rows: which external ids the bot follows, which
/// Telegram user owns each one, and per-user notification preferences.

mod manager;

pub use manager::AccountRegistry;

use serde::{Deserialize, Serialize};

/// Register (or reactivate) a tracked account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAccountRequest {
    pub external_id: String,
    #[serde(default)]
    pub telegram_user_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Partial settings update; absent fields keep their current value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub daily_reports: Option<bool>,
    pub expiry_warnings: Option<bool>,
    pub data_warning_hiddify: Option<bool>,
    pub data_warning_marzban: Option<bool>,
}

/// Whether `value` is shaped like an external id (a UUID)
pub fn is_external_id(value: &str) -> bool {
    uuid::Uuid::parse_str(value.trim()).is_ok()
}
