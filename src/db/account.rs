/// Row models for the bot database
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tracked account (AccountIdentity) record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedAccount {
    pub id: i64,
    /// Stable UUID-shaped identifier, also the Hiddify key
    pub external_id: String,
    /// Telegram user that receives reports and warnings for this account
    pub telegram_user_id: Option<i64>,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Notification preferences of a Telegram user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub daily_reports: bool,
    pub expiry_warnings: bool,
    pub data_warning_hiddify: bool,
    pub data_warning_marzban: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            daily_reports: true,
            expiry_warnings: true,
            data_warning_hiddify: true,
            data_warning_marzban: true,
        }
    }
}

/// Point-in-time absolute usage counters for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub id: i64,
    pub account_id: i64,
    pub hiddify_usage_gb: f64,
    pub marzban_usage_gb: f64,
    pub captured_at: DateTime<Utc>,
}

/// Last time a warning kind was sent for an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningRecord {
    pub account_id: i64,
    pub warning_kind: String,
    pub last_sent_at: DateTime<Utc>,
}
