/// Scheduled task bodies
use crate::{
    backup::{self, BackupMetadata},
    config::WarningConfig,
    context::AppContext,
    db::{self, account::{TrackedAccount, UserSettings}},
    error::BotResult,
    jobs::schedule::start_of_local_day,
    metrics,
    panel::{Panel, UserChange},
    report::{self, AdminSummary},
    resolver::{CombinedUserRecord, PanelTarget},
    usage::{PanelUsage, WarningKind},
};
use chrono::{DateTime, Datelike, Duration, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Counts from one snapshot pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotRun {
    pub recorded: usize,
    pub skipped: usize,
}

/// Counts from one nightly pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NightlyRun {
    pub reports_sent: usize,
    pub reports_failed: usize,
    pub purged_accounts: usize,
}

/// Counts from one birthday pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BirthdayRun {
    pub gifted_owners: usize,
    pub failed_owners: usize,
}

/// Resolve a tracked account within the per-account budget
///
/// `None` when the account timed out, is missing everywhere, or one of its
/// panels could not be asked.
async fn resolve_complete(ctx: &AppContext, account: &TrackedAccount) -> Option<CombinedUserRecord> {
    let budget = std::time::Duration::from_secs(ctx.config.scheduler.account_timeout_secs);
    let resolution = match tokio::time::timeout(budget, ctx.resolver.resolve_detailed(&account.external_id)).await {
        Ok(resolution) => resolution,
        Err(_) => {
            warn!("Account {} timed out after {}s, skipping", account.id, budget.as_secs());
            return None;
        }
    };

    if let Some((panel, reason)) = resolution.unavailable.first() {
        warn!("Account {}: {} unavailable ({}), skipping", account.id, panel, reason);
        return None;
    }
    if resolution.record.is_none() {
        debug!("Account {} not found on any panel", account.id);
    }
    resolution.record
}

/// Hourly usage capture for every tracked account
pub async fn snapshot_usage(ctx: &AppContext, now: DateTime<Utc>) -> BotResult<SnapshotRun> {
    let accounts = ctx.accounts.list_active().await?;
    let concurrency = ctx.config.scheduler.job_concurrency.max(1);

    let outcomes: Vec<bool> = stream::iter(accounts)
        .map(|account| async move {
            let Some(record) = resolve_complete(ctx, &account).await else {
                return false;
            };

            if let Err(e) = ctx.snapshots.record(account.id, record.usage(), now).await {
                error!("Failed to record snapshot for account {}: {}", account.id, e);
                return false;
            }

            if record.name != account.name {
                if let Err(e) = ctx.accounts.update_name(account.id, &record.name).await {
                    warn!("Failed to refresh name of account {}: {}", account.id, e);
                }
            }
            true
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let recorded = outcomes.iter().filter(|ok| **ok).count();
    Ok(SnapshotRun {
        recorded,
        skipped: outcomes.len() - recorded,
    })
}

/// Warnings an account qualifies for right now, before cooldown filtering
pub fn due_warnings(
    record: &CombinedUserRecord,
    settings: &UserSettings,
    thresholds: &WarningConfig,
) -> Vec<(WarningKind, String)> {
    let mut due = Vec::new();

    if settings.expiry_warnings {
        if let Some(days) = record.expire_days {
            if (0..=thresholds.days_before_expiry).contains(&days) {
                due.push((WarningKind::Expiry, report::expiry_warning(&record.name, days)));
            }
        }
    }

    for (panel, entry) in &record.breakdown {
        let enabled = match panel {
            Panel::Hiddify => settings.data_warning_hiddify,
            Panel::Marzban => settings.data_warning_marzban,
        };
        if !enabled || entry.is_unlimited() {
            continue;
        }

        let remaining_percent = entry.remaining_gb / entry.usage_limit_gb * 100.0;
        if remaining_percent > 0.0 && remaining_percent <= thresholds.usage_threshold_percent {
            due.push((
                WarningKind::low_data(*panel),
                report::low_data_warning(&record.name, *panel, entry.remaining_gb),
            ));
        }
    }

    due
}

async fn warn_owner(ctx: &AppContext, owner: i64, now: DateTime<Utc>) -> BotResult<usize> {
    let settings = ctx.accounts.settings(owner).await?;
    if !settings.expiry_warnings && !settings.data_warning_hiddify && !settings.data_warning_marzban {
        return Ok(0);
    }

    let cooldown = Duration::hours(ctx.config.warnings.cooldown_hours);
    let mut sent = 0;

    for account in ctx.accounts.list_for_owner(owner).await? {
        let Some(record) = resolve_complete(ctx, &account).await else {
            continue;
        };

        for (kind, text) in due_warnings(&record, &settings, &ctx.config.warnings) {
            if ctx.warnings.sent_within(account.id, kind, cooldown, now).await? {
                debug!("Account {}: {} warning still in cooldown", account.id, kind);
                continue;
            }

            match ctx.notifier.send(owner, &text).await {
                Ok(()) => {
                    metrics::record_notification("warning", true);
                    ctx.warnings.mark_sent(account.id, kind, now).await?;
                    sent += 1;
                }
                Err(e) => {
                    metrics::record_notification("warning", false);
                    warn!("Could not deliver {} warning for account {}: {}", kind, account.id, e);
                }
            }
        }
    }

    Ok(sent)
}

/// Expiry and low-quota warnings, deduplicated through the warning log
pub async fn check_warnings(ctx: &AppContext, now: DateTime<Utc>) -> BotResult<usize> {
    let owners = ctx.accounts.list_owners().await?;
    let concurrency = ctx.config.scheduler.job_concurrency.max(1);

    let results: Vec<(i64, BotResult<usize>)> = stream::iter(owners)
        .map(|owner| async move { (owner, warn_owner(ctx, owner, now).await) })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut sent = 0;
    for (owner, result) in results {
        match result {
            Ok(count) => sent += count,
            Err(e) => error!("Warning check failed for user {}: {}", owner, e),
        }
    }
    Ok(sent)
}

async fn purge_all(ctx: &AppContext, account_ids: &[i64]) -> usize {
    let mut purged = 0;
    for id in account_ids {
        match ctx.snapshots.purge(*id).await {
            Ok(_) => purged += 1,
            Err(e) => error!("Failed to purge snapshots of account {}: {}", id, e),
        }
    }
    purged
}

/// Admin summary first, then one report per owner
///
/// Snapshots of an account are purged only once every report that reads
/// its day has been accepted by the notifier.
pub async fn nightly_report(ctx: &AppContext, now: DateTime<Utc>) -> BotResult<NightlyRun> {
    let start_of_day = start_of_local_day(now, ctx.tz);
    let stamp = now.with_timezone(&ctx.tz).format("%Y/%m/%d - %H:%M").to_string();
    let mut run = NightlyRun::default();

    let tracked = ctx.accounts.list_active().await?;

    // Admin summary, computed before anything is purged. History is only
    // purged once a summary covering every panel has been delivered.
    let admins = &ctx.config.telegram.admin_ids;
    let mut admin_delivered = admins.is_empty();
    if !admins.is_empty() {
        let mut today = HashMap::new();
        for account in &tracked {
            today.insert(
                account.external_id.clone(),
                ctx.snapshots.usage_since(account.id, start_of_day).await?,
            );
        }

        let listing = ctx.resolver.list_all_detailed().await;
        let text = AdminSummary::compute(
            &listing.records,
            &listing.unavailable,
            &today,
            ctx.config.warnings.days_before_expiry,
            now,
        )
        .render(&stamp);
        if !listing.unavailable.is_empty() {
            warn!(
                "Admin summary is missing panels {:?}; snapshot history will be kept",
                listing.unavailable
            );
        }

        for admin in admins {
            match ctx.notifier.send(*admin, &text).await {
                Ok(()) => {
                    metrics::record_notification("admin_summary", true);
                    admin_delivered = listing.unavailable.is_empty();
                }
                Err(e) => {
                    metrics::record_notification("admin_summary", false);
                    warn!("Could not deliver admin summary to {}: {}", admin, e);
                }
            }
        }
    }

    for owner in ctx.accounts.list_owners().await? {
        let settings = ctx.accounts.settings(owner).await?;
        let accounts = ctx.accounts.list_for_owner(owner).await?;

        if !settings.daily_reports {
            if admin_delivered {
                let ids: Vec<i64> = accounts.iter().map(|a| a.id).collect();
                run.purged_accounts += purge_all(ctx, &ids).await;
            }
            continue;
        }

        let mut entries: Vec<(CombinedUserRecord, PanelUsage)> = Vec::new();
        let mut reported = Vec::new();
        for account in &accounts {
            let Some(record) = resolve_complete(ctx, account).await else {
                continue;
            };
            let today = ctx.snapshots.usage_since(account.id, start_of_day).await?;
            entries.push((record, today));
            reported.push(account.id);
        }

        let text = report::user_report(&stamp, &entries);
        match ctx.notifier.send(owner, &text).await {
            Ok(()) => {
                metrics::record_notification("report", true);
                run.reports_sent += 1;
                if admin_delivered {
                    run.purged_accounts += purge_all(ctx, &reported).await;
                }
            }
            Err(e) => {
                metrics::record_notification("report", false);
                run.reports_failed += 1;
                warn!("Could not deliver nightly report to {}: {}", owner, e);
            }
        }
    }

    // Accounts nobody receives a report for
    if admin_delivered {
        let ownerless: Vec<i64> = tracked
            .iter()
            .filter(|a| a.telegram_user_id.is_none())
            .map(|a| a.id)
            .collect();
        run.purged_accounts += purge_all(ctx, &ownerless).await;
    }

    Ok(run)
}

/// Add the configured gift to every account of owners whose birthday is today
///
/// An owner counts as gifted once any account took the gift; the year is
/// recorded before the message goes out so a rerun never gifts twice.
pub async fn birthday_gifts(ctx: &AppContext, now: DateTime<Utc>) -> BotResult<BirthdayRun> {
    let gift = &ctx.config.birthday;
    let today = now.with_timezone(&ctx.tz).date_naive();
    let mut run = BirthdayRun::default();

    let owners = ctx.accounts.birthdays_due(today).await?;
    if owners.is_empty() {
        info!("No birthdays today");
        return Ok(run);
    }

    let change = UserChange {
        add_usage_gb: gift.gift_gb,
        add_days: gift.gift_days,
        ..UserChange::default()
    };

    for owner in owners {
        let mut applied = false;
        for account in ctx.accounts.list_for_owner(owner).await? {
            match ctx
                .resolver
                .modify_everywhere(&account.external_id, &change, PanelTarget::Both)
                .await
            {
                Ok(report) if report.is_success() => applied = true,
                Ok(report) => {
                    applied |= report.is_partial();
                    warn!(
                        "Birthday gift for account {} incomplete (failed: {:?})",
                        account.id,
                        report.failed_panels()
                    );
                }
                Err(e) => warn!("Birthday gift for account {} failed: {}", account.id, e),
            }
        }

        if !applied {
            run.failed_owners += 1;
            error!("No account of user {} took the birthday gift", owner);
            continue;
        }

        ctx.accounts.mark_birthday_gift(owner, today.year()).await?;
        run.gifted_owners += 1;

        let text = report::birthday_message(gift.gift_gb, gift.gift_days);
        match ctx.notifier.send(owner, &text).await {
            Ok(()) => {
                metrics::record_notification("birthday", true);
                info!("Sent birthday gift to user {}", owner);
            }
            Err(e) => {
                metrics::record_notification("birthday", false);
                warn!("Could not deliver birthday message to {}: {}", owner, e);
            }
        }
    }

    Ok(run)
}

/// Monthly storage compaction
pub async fn monthly_maintenance(ctx: &AppContext) -> BotResult<()> {
    info!("Running database VACUUM");
    db::vacuum(&ctx.db).await?;
    info!("Database VACUUM completed");
    Ok(())
}

pub async fn backup(ctx: &AppContext) -> BotResult<BackupMetadata> {
    backup::run_backup(&ctx.db, &ctx.config.backup).await
}
