/// Database backups
///
/// `VACUUM INTO` writes a consistent copy of the live SQLite database while
/// the pool stays online. Old copies are pruned by age.
use crate::{
    config::BackupSettings,
    error::{BotError, BotResult},
};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const PREFIX: &str = "backup_";
const EXTENSION: &str = "sqlite";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Backup metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: DateTime<Utc>,
    pub path: PathBuf,
    pub size_bytes: u64,
}

fn backup_file_name(at: DateTime<Utc>) -> String {
    format!("{}{}.{}", PREFIX, at.format(STAMP_FORMAT), EXTENSION)
}

fn parse_backup_name(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(PREFIX)?.strip_suffix(&format!(".{}", EXTENSION))?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Write a backup now and prune expired ones
pub async fn run_backup(db: &SqlitePool, settings: &BackupSettings) -> BotResult<BackupMetadata> {
    tokio::fs::create_dir_all(&settings.directory).await?;

    let now = Utc::now();
    let path = settings.directory.join(backup_file_name(now));
    if tokio::fs::try_exists(&path).await? {
        return Err(BotError::Validation(format!(
            "Backup {} already exists",
            path.display()
        )));
    }

    info!("Starting backup to {}", path.display());
    sqlx::query("VACUUM INTO ?1")
        .bind(path.to_string_lossy().to_string())
        .execute(db)
        .await?;

    let size_bytes = tokio::fs::metadata(&path).await?.len();
    info!("Backup completed: {} ({} bytes)", path.display(), size_bytes);

    let directory = settings.directory.clone();
    let retain_days = settings.retain_days;
    match tokio::task::spawn_blocking(move || cleanup_old_backups(&directory, retain_days, now)).await {
        Ok(Ok(deleted)) if deleted > 0 => info!("Pruned {} old backup(s)", deleted),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Backup pruning failed: {}", e),
        Err(e) => warn!("Backup pruning task failed: {}", e),
    }

    Ok(BackupMetadata {
        timestamp: now,
        path,
        size_bytes,
    })
}

/// List available backups, newest first
pub fn list_backups(backup_dir: &Path) -> BotResult<Vec<BackupMetadata>> {
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();
    for entry in std::fs::read_dir(backup_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(timestamp) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_backup_name)
        else {
            continue;
        };

        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        backups.push(BackupMetadata {
            timestamp,
            path,
            size_bytes,
        });
    }

    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(backups)
}

/// Delete backups older than the retention window
pub fn cleanup_old_backups(backup_dir: &Path, retain_days: u32, now: DateTime<Utc>) -> BotResult<usize> {
    let cutoff = now - Duration::days(retain_days as i64);
    let mut deleted_count = 0;

    for backup in list_backups(backup_dir)? {
        if backup.timestamp >= cutoff {
            continue;
        }
        match std::fs::remove_file(&backup.path) {
            Ok(_) => {
                deleted_count += 1;
                info!("Deleted old backup {}", backup.path.display());
            }
            Err(e) => error!("Failed to delete {}: {}", backup.path.display(), e),
        }
    }

    Ok(deleted_count)
}
