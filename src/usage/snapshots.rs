/// Snapshot store
///
/// Rows are append-only absolute counters. "Usage since T" deltas the newest
/// row against the last row at or before T (or the first row ever when none
/// precedes T). A counter that went backwards is treated as a reset.
use crate::{
    db::{account::UsageSnapshot, encode_timestamp, parse_timestamp},
    error::BotResult,
    metrics,
    panel::Panel,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

/// Per-panel GB figures
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PanelUsage {
    pub hiddify: f64,
    pub marzban: f64,
}

impl PanelUsage {
    pub fn new(hiddify: f64, marzban: f64) -> Self {
        Self { hiddify, marzban }
    }

    pub fn total(&self) -> f64 {
        self.hiddify + self.marzban
    }

    pub fn get(&self, panel: Panel) -> f64 {
        match panel {
            Panel::Hiddify => self.hiddify,
            Panel::Marzban => self.marzban,
        }
    }

    /// `latest - baseline` per panel, clamped to `latest` on a counter reset
    pub fn since(latest: PanelUsage, baseline: PanelUsage) -> PanelUsage {
        PanelUsage {
            hiddify: counter_delta(latest.hiddify, baseline.hiddify),
            marzban: counter_delta(latest.marzban, baseline.marzban),
        }
    }
}

fn counter_delta(latest: f64, baseline: f64) -> f64 {
    if latest < baseline {
        latest
    } else {
        latest - baseline
    }
}

#[derive(Clone)]
pub struct SnapshotStore {
    db: SqlitePool,
}

impl SnapshotStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Append one reading
    pub async fn record(
        &self,
        account_id: i64,
        usage: PanelUsage,
        at: DateTime<Utc>,
    ) -> BotResult<()> {
        sqlx::query(
            "INSERT INTO usage_snapshot (account_id, hiddify_usage_gb, marzban_usage_gb, captured_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(account_id)
        .bind(usage.hiddify.max(0.0))
        .bind(usage.marzban.max(0.0))
        .bind(encode_timestamp(&at))
        .execute(&self.db)
        .await?;

        metrics::USAGE_SNAPSHOTS_RECORDED_TOTAL.inc();
        Ok(())
    }

    /// Consumption since `since`; zero when the account has no rows
    pub async fn usage_since(&self, account_id: i64, since: DateTime<Utc>) -> BotResult<PanelUsage> {
        let latest = sqlx::query(
            "SELECT hiddify_usage_gb, marzban_usage_gb FROM usage_snapshot
             WHERE account_id = ?1 ORDER BY captured_at DESC, id DESC LIMIT 1",
        )
        .bind(account_id)
        .fetch_optional(&self.db)
        .await?;

        let Some(latest) = latest else {
            return Ok(PanelUsage::default());
        };

        let baseline = match sqlx::query(
            "SELECT hiddify_usage_gb, marzban_usage_gb FROM usage_snapshot
             WHERE account_id = ?1 AND captured_at <= ?2
             ORDER BY captured_at DESC, id DESC LIMIT 1",
        )
        .bind(account_id)
        .bind(encode_timestamp(&since))
        .fetch_optional(&self.db)
        .await?
        {
            Some(row) => row,
            None => {
                sqlx::query(
                    "SELECT hiddify_usage_gb, marzban_usage_gb FROM usage_snapshot
                     WHERE account_id = ?1 ORDER BY captured_at ASC, id ASC LIMIT 1",
                )
                .bind(account_id)
                .fetch_one(&self.db)
                .await?
            }
        };

        Ok(PanelUsage::since(read_usage(&latest)?, read_usage(&baseline)?))
    }

    /// Delete every row of an account
    pub async fn purge(&self, account_id: i64) -> BotResult<u64> {
        let result = sqlx::query("DELETE FROM usage_snapshot WHERE account_id = ?1")
            .bind(account_id)
            .execute(&self.db)
            .await?;

        tracing::debug!(
            "Purged {} snapshot(s) of account {}",
            result.rows_affected(),
            account_id
        );
        Ok(result.rows_affected())
    }

    /// Rows of an account in capture order
    pub async fn list(&self, account_id: i64) -> BotResult<Vec<UsageSnapshot>> {
        let rows = sqlx::query(
            "SELECT id, account_id, hiddify_usage_gb, marzban_usage_gb, captured_at
             FROM usage_snapshot WHERE account_id = ?1 ORDER BY captured_at ASC, id ASC",
        )
        .bind(account_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(UsageSnapshot {
                    id: row.try_get("id")?,
                    account_id: row.try_get("account_id")?,
                    hiddify_usage_gb: row.try_get("hiddify_usage_gb")?,
                    marzban_usage_gb: row.try_get("marzban_usage_gb")?,
                    captured_at: parse_timestamp(&row.try_get::<String, _>("captured_at")?)?,
                })
            })
            .collect()
    }
}

fn read_usage(row: &SqliteRow) -> BotResult<PanelUsage> {
    Ok(PanelUsage {
        hiddify: row.try_get("hiddify_usage_gb")?,
        marzban: row.try_get("marzban_usage_gb")?,
    })
}
