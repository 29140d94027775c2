/// Account registry backed by SQLite runtime queries
use crate::{
    account::{is_external_id, SettingsUpdate},
    db::{
        account::{TrackedAccount, UserSettings},
        encode_timestamp, parse_timestamp,
    },
    error::{BotError, BotResult},
};
use chrono::{Datelike, NaiveDate, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

/// Registry of tracked accounts and their owners
#[derive(Clone)]
pub struct AccountRegistry {
    db: SqlitePool,
}

impl AccountRegistry {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Track an external id. Re-registering a deactivated account reactivates it.
    pub async fn register(
        &self,
        external_id: &str,
        telegram_user_id: Option<i64>,
        name: Option<&str>,
    ) -> BotResult<TrackedAccount> {
        if !is_external_id(external_id) {
            return Err(BotError::Validation(format!(
                "External id must be a UUID: {}",
                external_id
            )));
        }
        let external_id = external_id.trim().to_lowercase();
        let now = encode_timestamp(&Utc::now());

        sqlx::query(
            r#"
            INSERT INTO tracked_account (external_id, telegram_user_id, name, is_active, created_at)
            VALUES (?1, ?2, ?3, 1, ?4)
            ON CONFLICT(external_id) DO UPDATE SET
                telegram_user_id = COALESCE(excluded.telegram_user_id, tracked_account.telegram_user_id),
                name = CASE WHEN excluded.name = '' THEN tracked_account.name ELSE excluded.name END,
                is_active = 1,
                deactivated_at = NULL
            "#,
        )
        .bind(&external_id)
        .bind(telegram_user_id)
        .bind(name.unwrap_or_default())
        .bind(&now)
        .execute(&self.db)
        .await?;

        tracing::info!("Tracking account {} (owner: {:?})", external_id, telegram_user_id);

        self.get_by_external_id(&external_id)
            .await?
            .ok_or_else(|| BotError::Internal(format!("Account {} vanished after insert", external_id)))
    }

    pub async fn get(&self, id: i64) -> BotResult<Option<TrackedAccount>> {
        let row = sqlx::query(
            "SELECT id, external_id, telegram_user_id, name, is_active, created_at, deactivated_at
             FROM tracked_account WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| map_account(&r)).transpose()
    }

    pub async fn get_by_external_id(&self, external_id: &str) -> BotResult<Option<TrackedAccount>> {
        let row = sqlx::query(
            "SELECT id, external_id, telegram_user_id, name, is_active, created_at, deactivated_at
             FROM tracked_account WHERE external_id = ?1",
        )
        .bind(external_id.trim().to_lowercase())
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| map_account(&r)).transpose()
    }

    /// All active accounts, oldest first
    pub async fn list_active(&self) -> BotResult<Vec<TrackedAccount>> {
        let rows = sqlx::query(
            "SELECT id, external_id, telegram_user_id, name, is_active, created_at, deactivated_at
             FROM tracked_account WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(map_account).collect()
    }

    /// Active accounts owned by one Telegram user
    pub async fn list_for_owner(&self, telegram_user_id: i64) -> BotResult<Vec<TrackedAccount>> {
        let rows = sqlx::query(
            "SELECT id, external_id, telegram_user_id, name, is_active, created_at, deactivated_at
             FROM tracked_account WHERE is_active = 1 AND telegram_user_id = ?1 ORDER BY id",
        )
        .bind(telegram_user_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(map_account).collect()
    }

    /// Distinct owners of active accounts
    pub async fn list_owners(&self) -> BotResult<Vec<i64>> {
        let owners = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT telegram_user_id FROM tracked_account
             WHERE is_active = 1 AND telegram_user_id IS NOT NULL ORDER BY telegram_user_id",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(owners)
    }

    /// Stop tracking an account; history rows are purged separately
    pub async fn deactivate(&self, id: i64) -> BotResult<()> {
        let result = sqlx::query(
            "UPDATE tracked_account SET is_active = 0, deactivated_at = ?1 WHERE id = ?2",
        )
        .bind(encode_timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BotError::NotFound(format!("Tracked account {}", id)));
        }

        tracing::info!("Deactivated tracked account {}", id);
        Ok(())
    }

    /// Keep the stored display name in step with the panels
    pub async fn update_name(&self, id: i64, name: &str) -> BotResult<()> {
        sqlx::query("UPDATE tracked_account SET name = ?1 WHERE id = ?2 AND name != ?1")
            .bind(name)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Settings of a Telegram user; defaults when never stored
    pub async fn settings(&self, telegram_user_id: i64) -> BotResult<UserSettings> {
        let row = sqlx::query(
            "SELECT daily_reports, expiry_warnings, data_warning_hiddify, data_warning_marzban
             FROM user_settings WHERE telegram_user_id = ?1",
        )
        .bind(telegram_user_id)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => Ok(UserSettings {
                daily_reports: row.try_get("daily_reports")?,
                expiry_warnings: row.try_get("expiry_warnings")?,
                data_warning_hiddify: row.try_get("data_warning_hiddify")?,
                data_warning_marzban: row.try_get("data_warning_marzban")?,
            }),
            None => Ok(UserSettings::default()),
        }
    }

    /// Apply a partial update and return the stored result
    pub async fn update_settings(
        &self,
        telegram_user_id: i64,
        update: &SettingsUpdate,
    ) -> BotResult<UserSettings> {
        let current = self.settings(telegram_user_id).await?;
        let merged = UserSettings {
            daily_reports: update.daily_reports.unwrap_or(current.daily_reports),
            expiry_warnings: update.expiry_warnings.unwrap_or(current.expiry_warnings),
            data_warning_hiddify: update
                .data_warning_hiddify
                .unwrap_or(current.data_warning_hiddify),
            data_warning_marzban: update
                .data_warning_marzban
                .unwrap_or(current.data_warning_marzban),
        };

        sqlx::query(
            r#"
            INSERT INTO user_settings
                (telegram_user_id, daily_reports, expiry_warnings, data_warning_hiddify, data_warning_marzban)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(telegram_user_id) DO UPDATE SET
                daily_reports = excluded.daily_reports,
                expiry_warnings = excluded.expiry_warnings,
                data_warning_hiddify = excluded.data_warning_hiddify,
                data_warning_marzban = excluded.data_warning_marzban
            "#,
        )
        .bind(telegram_user_id)
        .bind(merged.daily_reports)
        .bind(merged.expiry_warnings)
        .bind(merged.data_warning_hiddify)
        .bind(merged.data_warning_marzban)
        .execute(&self.db)
        .await?;

        Ok(merged)
    }

    /// Store or clear the birthday of a Telegram user
    pub async fn set_birthday(
        &self,
        telegram_user_id: i64,
        birthday: Option<NaiveDate>,
    ) -> BotResult<()> {
        sqlx::query(
            "INSERT INTO user_settings (telegram_user_id, birthday) VALUES (?1, ?2)
             ON CONFLICT(telegram_user_id) DO UPDATE SET birthday = excluded.birthday",
        )
        .bind(telegram_user_id)
        .bind(birthday.map(|d| d.format(BIRTHDAY_FORMAT).to_string()))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn birthday(&self, telegram_user_id: i64) -> BotResult<Option<NaiveDate>> {
        let stored = sqlx::query_scalar::<_, Option<String>>(
            "SELECT birthday FROM user_settings WHERE telegram_user_id = ?1",
        )
        .bind(telegram_user_id)
        .fetch_optional(&self.db)
        .await?
        .flatten();

        stored
            .map(|s| {
                NaiveDate::parse_from_str(&s, BIRTHDAY_FORMAT)
                    .map_err(|e| BotError::Internal(format!("Invalid stored birthday {}: {}", s, e)))
            })
            .transpose()
    }

    /// Owners of active accounts whose birthday is `today` and who have not
    /// been gifted this year. 29 February counts as 28 February in common years.
    pub async fn birthdays_due(&self, today: NaiveDate) -> BotResult<Vec<i64>> {
        let month_day = today.format("%m-%d").to_string();
        let leap_day = if today.month() == 2
            && today.day() == 28
            && NaiveDate::from_ymd_opt(today.year(), 2, 29).is_none()
        {
            "02-29".to_string()
        } else {
            month_day.clone()
        };

        let owners = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT s.telegram_user_id FROM user_settings s
            WHERE s.birthday IS NOT NULL
              AND substr(s.birthday, 6, 5) IN (?1, ?2)
              AND (s.last_birthday_gift_year IS NULL OR s.last_birthday_gift_year < ?3)
              AND EXISTS (
                  SELECT 1 FROM tracked_account t
                  WHERE t.telegram_user_id = s.telegram_user_id AND t.is_active = 1
              )
            ORDER BY s.telegram_user_id
            "#,
        )
        .bind(month_day)
        .bind(leap_day)
        .bind(today.year())
        .fetch_all(&self.db)
        .await?;

        Ok(owners)
    }

    pub async fn mark_birthday_gift(&self, telegram_user_id: i64, year: i32) -> BotResult<()> {
        sqlx::query(
            "UPDATE user_settings SET last_birthday_gift_year = ?1 WHERE telegram_user_id = ?2",
        )
        .bind(year)
        .bind(telegram_user_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

const BIRTHDAY_FORMAT: &str = "%Y-%m-%d";

fn map_account(row: &SqliteRow) -> BotResult<TrackedAccount> {
    let deactivated_at: Option<String> = row.try_get("deactivated_at")?;
    Ok(TrackedAccount {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        telegram_user_id: row.try_get("telegram_user_id")?,
        name: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        deactivated_at: deactivated_at.as_deref().map(parse_timestamp).transpose()?,
    })
}
