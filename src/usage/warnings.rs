/// Warning dedup log: one row per (account, warning kind) holding the last send time
use crate::{
    db::{encode_timestamp, parse_timestamp},
    error::BotResult,
    panel::Panel,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Expiry,
    LowDataHiddify,
    LowDataMarzban,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::Expiry => "expiry",
            WarningKind::LowDataHiddify => "low_data_hiddify",
            WarningKind::LowDataMarzban => "low_data_marzban",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "expiry" => Some(WarningKind::Expiry),
            "low_data_hiddify" => Some(WarningKind::LowDataHiddify),
            "low_data_marzban" => Some(WarningKind::LowDataMarzban),
            _ => None,
        }
    }

    pub fn low_data(panel: Panel) -> Self {
        match panel {
            Panel::Hiddify => WarningKind::LowDataHiddify,
            Panel::Marzban => WarningKind::LowDataMarzban,
        }
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct WarningLog {
    db: SqlitePool,
}

impl WarningLog {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Last time `kind` was sent for the account
    pub async fn last_sent(&self, account_id: i64, kind: WarningKind) -> BotResult<Option<DateTime<Utc>>> {
        let last: Option<String> = sqlx::query_scalar(
            "SELECT last_sent_at FROM warning_log WHERE account_id = ?1 AND warning_kind = ?2",
        )
        .bind(account_id)
        .bind(kind.as_str())
        .fetch_optional(&self.db)
        .await?;

        last.as_deref().map(parse_timestamp).transpose()
    }

    /// Whether `kind` went out less than `cooldown` before `now`
    pub async fn sent_within(
        &self,
        account_id: i64,
        kind: WarningKind,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> BotResult<bool> {
        Ok(match self.last_sent(account_id, kind).await? {
            Some(last) => now - last < cooldown,
            None => false,
        })
    }

    pub async fn mark_sent(&self, account_id: i64, kind: WarningKind, at: DateTime<Utc>) -> BotResult<()> {
        sqlx::query(
            r#"
            INSERT INTO warning_log (account_id, warning_kind, last_sent_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(account_id, warning_kind) DO UPDATE SET last_sent_at = excluded.last_sent_at
            "#,
        )
        .bind(account_id)
        .bind(kind.as_str())
        .bind(encode_timestamp(&at))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Forget every warning of an account, e.g. after a usage reset
    pub async fn clear(&self, account_id: i64) -> BotResult<()> {
        sqlx::query("DELETE FROM warning_log WHERE account_id = ?1")
            .bind(account_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{account::AccountRegistry, db::create_memory_pool};
    use chrono::TimeZone;

    async fn setup() -> (WarningLog, i64) {
        let pool = create_memory_pool().await.unwrap();
        let account = AccountRegistry::new(pool.clone())
            .register("1a2b3c4d-0000-4e5f-8a9b-0c1d2e3f4a5b", Some(1), None)
            .await
            .unwrap();
        (WarningLog::new(pool), account.id)
    }

    #[tokio::test]
    async fn test_cooldown_window() {
        let (log, id) = setup().await;
        let sent = Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap();
        let cooldown = Duration::hours(24);

        assert!(!log.sent_within(id, WarningKind::Expiry, cooldown, sent).await.unwrap());
        log.mark_sent(id, WarningKind::Expiry, sent).await.unwrap();

        let later = sent + Duration::hours(4);
        assert!(log.sent_within(id, WarningKind::Expiry, cooldown, later).await.unwrap());
        assert!(!log
            .sent_within(id, WarningKind::LowDataHiddify, cooldown, later)
            .await
            .unwrap());

        let next_day = sent + Duration::hours(25);
        assert!(!log.sent_within(id, WarningKind::Expiry, cooldown, next_day).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_sent_upserts() {
        let (log, id) = setup().await;
        let first = Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap();
        let second = first + Duration::hours(30);

        log.mark_sent(id, WarningKind::LowDataMarzban, first).await.unwrap();
        log.mark_sent(id, WarningKind::LowDataMarzban, second).await.unwrap();
        assert_eq!(
            log.last_sent(id, WarningKind::LowDataMarzban).await.unwrap(),
            Some(second)
        );

        log.clear(id).await.unwrap();
        assert_eq!(log.last_sent(id, WarningKind::LowDataMarzban).await.unwrap(), None);
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [
            WarningKind::Expiry,
            WarningKind::LowDataHiddify,
            WarningKind::LowDataMarzban,
        ] {
            assert_eq!(WarningKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(WarningKind::low_data(Panel::Marzban), WarningKind::LowDataMarzban);
    }
}
