/// Admin API endpoints
///
/// The admin command surface over HTTP: lookups, search, quota/expiry
/// changes, usage resets, deletion, tracked-account registration and a few
/// operational hooks.
use crate::{
    account::{is_external_id, RegisterAccountRequest, SettingsUpdate},
    backup::{self, BackupMetadata},
    context::AppContext,
    db::account::{TrackedAccount, UserSettings},
    error::{BotError, BotResult},
    jobs::{start_of_local_day, JobStatus},
    panel::UserChange,
    resolver::{CombinedUserRecord, OperationReport, PanelTarget, SearchHit},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Build admin API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        // Panel accounts
        .route("/admin/users", get(list_users))
        .route("/admin/users/:identifier", get(get_user).delete(delete_user))
        .route("/admin/users/:identifier/usage", get(get_usage))
        .route("/admin/users/:identifier/modify", post(modify_user))
        .route("/admin/users/:identifier/reset-usage", post(reset_usage))
        .route("/admin/search", get(search))
        // Tracking and preferences
        .route("/admin/accounts", post(register_account))
        .route("/admin/settings/:telegram_user_id", put(update_settings))
        .route("/admin/birthday/:telegram_user_id", put(set_birthday))
        // Operations
        .route("/admin/identity/reload", post(reload_identity))
        .route("/admin/jobs", get(list_jobs))
        .route("/admin/backup", post(run_backup))
}

/// 200 when every targeted panel succeeded, 207 on a partial result, 502 when nothing succeeded
fn report_response(report: OperationReport) -> (StatusCode, Json<OperationReport>) {
    let status = if report.is_success() {
        StatusCode::OK
    } else if report.is_partial() {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(report))
}

async fn list_users(State(ctx): State<AppContext>) -> Json<Vec<CombinedUserRecord>> {
    Json(ctx.resolver.list_all().await)
}

async fn get_user(
    State(ctx): State<AppContext>,
    Path(identifier): Path<String>,
) -> BotResult<Json<CombinedUserRecord>> {
    Ok(Json(ctx.resolver.require(&identifier).await?))
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    #[serde(default)]
    since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct UsageResponse {
    external_id: String,
    since: DateTime<Utc>,
    hiddify: f64,
    marzban: f64,
    total: f64,
}

/// Tracked account behind a UUID or a mapped Marzban username
async fn tracked_account(ctx: &AppContext, identifier: &str) -> BotResult<TrackedAccount> {
    let identifier = identifier.trim();
    let external_id = if is_external_id(identifier) {
        Some(identifier.to_lowercase())
    } else {
        ctx.identity.to_external_id(identifier)
    };

    let account = match external_id {
        Some(id) => ctx.accounts.get_by_external_id(&id).await?,
        None => None,
    };
    account
        .filter(|a| a.is_active)
        .ok_or_else(|| BotError::NotFound(format!("Tracked account {}", identifier)))
}

/// Usage since `since` (default: start of the local day) from stored snapshots
async fn get_usage(
    State(ctx): State<AppContext>,
    Path(identifier): Path<String>,
    Query(query): Query<UsageQuery>,
) -> BotResult<Json<UsageResponse>> {
    let account = tracked_account(&ctx, &identifier).await?;
    let since = query
        .since
        .unwrap_or_else(|| start_of_local_day(Utc::now(), ctx.tz));

    let usage = ctx.snapshots.usage_since(account.id, since).await?;
    Ok(Json(UsageResponse {
        external_id: account.external_id,
        since,
        hiddify: usage.hiddify,
        marzban: usage.marzban,
        total: usage.total(),
    }))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

async fn search(
    State(ctx): State<AppContext>,
    Query(query): Query<SearchQuery>,
) -> BotResult<Json<Vec<SearchHit>>> {
    if query.q.trim().is_empty() {
        return Err(BotError::Validation("Query parameter q is required".to_string()));
    }
    Ok(Json(ctx.resolver.search(&query.q).await))
}

#[derive(Debug, Deserialize)]
struct ModifyRequest {
    #[serde(default)]
    add_gb: f64,
    #[serde(default)]
    add_days: i64,
    #[serde(default)]
    enable: Option<bool>,
    #[serde(default)]
    target: PanelTarget,
}

async fn modify_user(
    State(ctx): State<AppContext>,
    Path(identifier): Path<String>,
    Json(req): Json<ModifyRequest>,
) -> BotResult<(StatusCode, Json<OperationReport>)> {
    if !req.add_gb.is_finite() {
        return Err(BotError::Validation("add_gb must be a finite number".to_string()));
    }

    let change = UserChange {
        add_usage_gb: req.add_gb,
        add_days: req.add_days,
        enable: req.enable,
        reset_usage: false,
    };
    let report = ctx
        .resolver
        .modify_everywhere(&identifier, &change, req.target)
        .await?;
    Ok(report_response(report))
}

#[derive(Debug, Default, Deserialize)]
struct ResetRequest {
    #[serde(default)]
    target: PanelTarget,
}

async fn reset_usage(
    State(ctx): State<AppContext>,
    Path(identifier): Path<String>,
    Json(req): Json<ResetRequest>,
) -> BotResult<(StatusCode, Json<OperationReport>)> {
    let report = ctx.resolver.reset_usage(&identifier, req.target).await?;
    Ok(report_response(report))
}

async fn delete_user(
    State(ctx): State<AppContext>,
    Path(identifier): Path<String>,
) -> BotResult<(StatusCode, Json<OperationReport>)> {
    let report = ctx.resolver.delete_everywhere(&identifier).await?;
    Ok(report_response(report))
}

async fn register_account(
    State(ctx): State<AppContext>,
    Json(req): Json<RegisterAccountRequest>,
) -> BotResult<(StatusCode, Json<TrackedAccount>)> {
    let account = ctx
        .accounts
        .register(&req.external_id, req.telegram_user_id, req.name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn update_settings(
    State(ctx): State<AppContext>,
    Path(telegram_user_id): Path<i64>,
    Json(update): Json<SettingsUpdate>,
) -> BotResult<Json<UserSettings>> {
    Ok(Json(
        ctx.accounts.update_settings(telegram_user_id, &update).await?,
    ))
}

#[derive(Debug, Serialize, Deserialize)]
struct BirthdayBody {
    /// `YYYY-MM-DD`; null clears it
    birthday: Option<NaiveDate>,
}

async fn set_birthday(
    State(ctx): State<AppContext>,
    Path(telegram_user_id): Path<i64>,
    Json(body): Json<BirthdayBody>,
) -> BotResult<Json<BirthdayBody>> {
    if let Some(birthday) = body.birthday {
        let today = Utc::now().with_timezone(&ctx.tz).date_naive();
        if birthday > today {
            return Err(BotError::Validation("Birthday is in the future".to_string()));
        }
    }

    ctx.accounts.set_birthday(telegram_user_id, body.birthday).await?;
    Ok(Json(BirthdayBody {
        birthday: ctx.accounts.birthday(telegram_user_id).await?,
    }))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    entries: usize,
}

async fn reload_identity(State(ctx): State<AppContext>) -> BotResult<Json<ReloadResponse>> {
    let entries = ctx.identity.reload()?;
    tracing::info!("Identity map reloaded by admin: {} entries", entries);
    Ok(Json(ReloadResponse { entries }))
}

async fn list_jobs(State(ctx): State<AppContext>) -> Json<Vec<JobStatus>> {
    Json(ctx.jobs.snapshot())
}

async fn run_backup(State(ctx): State<AppContext>) -> BotResult<Json<BackupMetadata>> {
    Ok(Json(backup::run_backup(&ctx.db, &ctx.config.backup).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{PanelOutcome, PanelStatus};
    use crate::panel::Panel;
    use std::collections::BTreeMap;

    fn outcome(status: PanelStatus) -> PanelOutcome {
        PanelOutcome { status, detail: None }
    }

    fn report(hiddify: PanelStatus, marzban: PanelStatus) -> OperationReport {
        OperationReport {
            identifier: "x".to_string(),
            external_id: None,
            panels: BTreeMap::from([
                (Panel::Hiddify, outcome(hiddify)),
                (Panel::Marzban, outcome(marzban)),
            ]),
        }
    }

    #[test]
    fn test_routes_created() {
        let _router = routes();
    }

    #[test]
    fn test_report_status_codes() {
        use PanelStatus::*;
        assert_eq!(report_response(report(Succeeded, Skipped)).0, StatusCode::OK);
        assert_eq!(report_response(report(Succeeded, Failed)).0, StatusCode::MULTI_STATUS);
        assert_eq!(report_response(report(Failed, Skipped)).0, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_modify_request_defaults() {
        let req: ModifyRequest = serde_json::from_str(r#"{"add_gb": 5}"#).unwrap();
        assert_eq!(req.add_gb, 5.0);
        assert_eq!(req.add_days, 0);
        assert_eq!(req.target, PanelTarget::Both);

        let req: ModifyRequest = serde_json::from_str(r#"{"add_days": 3, "target": "marzban"}"#).unwrap();
        assert_eq!(req.target, PanelTarget::Marzban);
    }
}
