/// Panel adapters
///
/// Each adapter wraps one upstream REST API and returns normalized per-user
/// records. Expected failures (timeouts, 5xx, not-found) come back as
/// sentinel values; adapters never surface raw transport errors.

pub mod hiddify;
pub mod http;
pub mod marzban;

pub use hiddify::HiddifyAdapter;
pub use marzban::MarzbanAdapter;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Upstream panel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Panel {
    Hiddify,
    Marzban,
}

impl Panel {
    pub const ALL: [Panel; 2] = [Panel::Hiddify, Panel::Marzban];

    pub fn as_str(&self) -> &'static str {
        match self {
            Panel::Hiddify => "hiddify",
            Panel::Marzban => "marzban",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hiddify" => Some(Panel::Hiddify),
            "marzban" => Some(Panel::Marzban),
            _ => None,
        }
    }
}

impl fmt::Display for Panel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One account as seen by one panel, units already converted to GB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedUserRecord {
    pub name: String,
    /// Native key on the panel: UUID for Hiddify, username for Marzban
    pub panel_key: String,
    /// Stable external id when known (always for Hiddify, via the identity map for Marzban)
    pub external_id: Option<String>,
    pub is_active: bool,
    /// 0 means unlimited
    pub usage_limit_gb: f64,
    pub current_usage_gb: f64,
    pub remaining_gb: f64,
    pub usage_percentage: f64,
    pub last_online: Option<DateTime<Utc>>,
    /// Negative when expired, `None` when unlimited
    pub expire_days: Option<i64>,
}

impl NormalizedUserRecord {
    /// Build a record, deriving remaining quota and percentage
    pub fn new(
        name: impl Into<String>,
        panel_key: impl Into<String>,
        usage_limit_gb: f64,
        current_usage_gb: f64,
    ) -> Self {
        let usage_limit_gb = sanitize_gb(usage_limit_gb);
        let current_usage_gb = sanitize_gb(current_usage_gb);
        Self {
            name: name.into(),
            panel_key: panel_key.into(),
            external_id: None,
            is_active: false,
            usage_limit_gb,
            current_usage_gb,
            remaining_gb: remaining_gb(usage_limit_gb, current_usage_gb),
            usage_percentage: usage_percentage(usage_limit_gb, current_usage_gb),
            last_online: None,
            expire_days: None,
        }
    }

    pub fn with_external_id(mut self, external_id: Option<String>) -> Self {
        self.external_id = external_id;
        self
    }

    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn last_online(mut self, last_online: Option<DateTime<Utc>>) -> Self {
        self.last_online = last_online;
        self
    }

    pub fn expire_days(mut self, expire_days: Option<i64>) -> Self {
        self.expire_days = expire_days;
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.usage_limit_gb <= 0.0
    }
}

/// `max(0, limit - usage)`
pub fn remaining_gb(limit: f64, usage: f64) -> f64 {
    (limit - usage).max(0.0)
}

/// `usage / limit * 100`, or 0 when the limit is 0 (unlimited)
pub fn usage_percentage(limit: f64, usage: f64) -> f64 {
    if limit > 0.0 {
        usage / limit * 100.0
    } else {
        0.0
    }
}

fn sanitize_gb(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Result of a single-account lookup
#[derive(Debug, Clone, PartialEq)]
pub enum PanelLookup {
    Found(NormalizedUserRecord),
    /// The panel answered and the account does not exist there
    NotFound,
    /// The panel could not be reached; the account may or may not exist
    Unavailable(String),
}

impl PanelLookup {
    pub fn found(self) -> Option<NormalizedUserRecord> {
        match self {
            PanelLookup::Found(record) => Some(record),
            _ => None,
        }
    }
}

/// Failure sentinel for list/write calls
#[derive(Debug, Clone, PartialEq)]
pub enum PanelFailure {
    Unavailable(String),
    NotFound,
    Rejected(String),
}

impl fmt::Display for PanelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PanelFailure::Unavailable(reason) => write!(f, "unavailable: {}", reason),
            PanelFailure::NotFound => f.write_str("not found"),
            PanelFailure::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

pub type PanelResult<T> = Result<T, PanelFailure>;

/// Relative adjustments plus absolute overrides applied by `modify`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserChange {
    #[serde(default)]
    pub add_usage_gb: f64,
    #[serde(default)]
    pub add_days: i64,
    #[serde(default)]
    pub enable: Option<bool>,
    #[serde(default)]
    pub reset_usage: bool,
}

impl UserChange {
    pub fn reset() -> Self {
        Self {
            reset_usage: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add_usage_gb == 0.0 && self.add_days == 0 && self.enable.is_none() && !self.reset_usage
    }

    /// Relative changes need the current state read first
    pub fn needs_current_state(&self) -> bool {
        self.add_usage_gb != 0.0 || self.add_days != 0
    }
}

/// Contract every panel backend implements
#[async_trait]
pub trait PanelAdapter: Send + Sync {
    fn panel(&self) -> Panel;

    /// Every account on the panel, normalized
    async fn fetch_all(&self) -> PanelResult<Vec<NormalizedUserRecord>>;

    /// One account by native key
    async fn fetch_one(&self, panel_key: &str) -> PanelLookup;

    /// Read-modify-write of quota/expiry plus absolute overrides
    async fn modify(&self, panel_key: &str, change: &UserChange) -> PanelResult<()>;

    async fn delete(&self, panel_key: &str) -> PanelResult<()>;
}

/// Parse the naive `YYYY-MM-DD HH:MM:SS[.fff]` / ISO forms both panels emit, as UTC
pub fn parse_panel_datetime(value: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = value?.trim();
    if raw.is_empty() || raw.starts_with("0001-01-01") {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    let clean = raw.split('.').next().unwrap_or(raw).replace('T', " ");
    match NaiveDateTime::parse_from_str(&clean, "%Y-%m-%d %H:%M:%S") {
        Ok(naive) => Some(naive.and_utc()),
        Err(e) => {
            tracing::warn!("Could not parse panel datetime {:?}: {}", raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_derived_fields() {
        let record = NormalizedUserRecord::new("alice", "key", 50.0, 10.0);
        assert_eq!(record.remaining_gb, 40.0);
        assert_eq!(record.usage_percentage, 20.0);

        let over = NormalizedUserRecord::new("bob", "key", 10.0, 12.5);
        assert_eq!(over.remaining_gb, 0.0);
        assert_eq!(over.usage_percentage, 125.0);
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let record = NormalizedUserRecord::new("carol", "key", 0.0, 7.0);
        assert!(record.is_unlimited());
        assert_eq!(record.usage_percentage, 0.0);
        assert_eq!(record.remaining_gb, 0.0);
    }

    #[test]
    fn test_negative_and_nan_inputs_clamp_to_zero() {
        let record = NormalizedUserRecord::new("dave", "key", f64::NAN, -3.0);
        assert_eq!(record.usage_limit_gb, 0.0);
        assert_eq!(record.current_usage_gb, 0.0);
    }

    #[test]
    fn test_parse_panel_datetime_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap();
        assert_eq!(parse_panel_datetime(Some("2024-05-01 12:30:15")), Some(expected));
        assert_eq!(parse_panel_datetime(Some("2024-05-01T12:30:15.123456")), Some(expected));
        assert_eq!(parse_panel_datetime(Some("2024-05-01T12:30:15Z")), Some(expected));
        assert_eq!(parse_panel_datetime(Some("0001-01-01 00:00:00")), None);
        assert_eq!(parse_panel_datetime(Some("garbage")), None);
        assert_eq!(parse_panel_datetime(None), None);
    }

    #[test]
    fn test_user_change_flags() {
        assert!(UserChange::default().is_empty());
        assert!(!UserChange::reset().is_empty());
        assert!(!UserChange::reset().needs_current_state());

        let gift = UserChange {
            add_usage_gb: 5.0,
            add_days: 3,
            ..UserChange::default()
        };
        assert!(gift.needs_current_state());
    }

    #[test]
    fn test_panel_names() {
        assert_eq!(Panel::from_str("Marzban"), Some(Panel::Marzban));
        assert_eq!(Panel::from_str("other"), None);
        assert_eq!(Panel::Hiddify.to_string(), "hiddify");
    }
}
