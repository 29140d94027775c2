/// Hiddify v2 admin API adapter
///
/// Auth is a static `Hiddify-API-Key` header. Quotas are reported in GB and
/// expiry is derived from `start_date + package_days` in the bot timezone.
use crate::{
    config::{HiddifyConfig, PanelHttpConfig},
    error::BotResult,
    panel::{
        http::{build_client, failure_from_response, send_with_retry, RetryPolicy},
        parse_panel_datetime, NormalizedUserRecord, Panel, PanelAdapter, PanelFailure,
        PanelLookup, PanelResult, UserChange,
    },
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};

const API_KEY_HEADER: &str = "Hiddify-API-Key";
const UNKNOWN_NAME: &str = "unknown user";
/// Smallest quota a shrink can leave; 0 would read as unlimited
const MIN_LIMIT_GB: f64 = 0.001;

pub struct HiddifyAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    policy: RetryPolicy,
    tz: Tz,
    configured: bool,
}

impl HiddifyAdapter {
    pub fn new(config: &HiddifyConfig, http: &PanelHttpConfig, tz: Tz) -> BotResult<Self> {
        Ok(Self {
            client: build_client(http)?,
            base_url: config.api_base(),
            api_key: config.api_key.clone(),
            policy: RetryPolicy::from_config(http),
            tz,
            configured: config.is_configured(),
        })
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz).date_naive()
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, PanelFailure> {
        let url = format!("{}{}", self.base_url, endpoint);
        let label = format!("{} {}", method, endpoint);
        send_with_retry(Panel::Hiddify, &self.policy, &label, || {
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .header(API_KEY_HEADER, &self.api_key)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(body) = body {
                builder = builder.json(body);
            }
            builder
        })
        .await
    }

    fn user_path(uuid: &str) -> String {
        format!("/user/{}/", uuid.to_lowercase())
    }
}

#[async_trait]
impl PanelAdapter for HiddifyAdapter {
    fn panel(&self) -> Panel {
        Panel::Hiddify
    }

    async fn fetch_all(&self) -> PanelResult<Vec<NormalizedUserRecord>> {
        if !self.configured {
            return Ok(Vec::new());
        }

        let response = self.request(Method::GET, "/user/", None).await?;
        if !response.status().is_success() {
            return Err(failure_from_response(Panel::Hiddify, "GET /user/", response).await);
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| PanelFailure::Unavailable(format!("invalid user list: {}", e)))?;

        let today = self.today();
        Ok(user_list(&payload)
            .iter()
            .filter_map(|raw| normalize(raw, today))
            .collect())
    }

    async fn fetch_one(&self, panel_key: &str) -> PanelLookup {
        if !self.configured {
            return PanelLookup::NotFound;
        }

        let path = Self::user_path(panel_key);
        let response = match self.request(Method::GET, &path, None).await {
            Ok(response) => response,
            Err(PanelFailure::Unavailable(reason)) => return PanelLookup::Unavailable(reason),
            Err(other) => return PanelLookup::Unavailable(other.to_string()),
        };

        if response.status() == StatusCode::NOT_FOUND {
            return PanelLookup::NotFound;
        }
        if !response.status().is_success() {
            let label = format!("GET {}", path);
            return match failure_from_response(Panel::Hiddify, &label, response).await {
                PanelFailure::NotFound => PanelLookup::NotFound,
                other => PanelLookup::Unavailable(other.to_string()),
            };
        }

        match response.json::<Value>().await {
            Ok(raw) => match normalize(&raw, self.today()) {
                Some(record) => PanelLookup::Found(record),
                None => PanelLookup::NotFound,
            },
            Err(e) => PanelLookup::Unavailable(format!("invalid user payload: {}", e)),
        }
    }

    async fn modify(&self, panel_key: &str, change: &UserChange) -> PanelResult<()> {
        if !self.configured {
            return Err(PanelFailure::Rejected("panel not configured".to_string()));
        }

        let current = if change.needs_current_state() {
            match self.fetch_one(panel_key).await {
                PanelLookup::Found(record) => Some(record),
                PanelLookup::NotFound => return Err(PanelFailure::NotFound),
                PanelLookup::Unavailable(reason) => {
                    tracing::error!("Cannot modify Hiddify user {}: {}", panel_key, reason);
                    return Err(PanelFailure::Unavailable(reason));
                }
            }
        } else {
            None
        };

        let payload = build_patch(change, current.as_ref(), self.today());
        if payload.is_empty() {
            return Ok(());
        }

        let path = Self::user_path(panel_key);
        let body = Value::Object(payload);
        let response = self.request(Method::PATCH, &path, Some(&body)).await?;
        if response.status().is_success() {
            tracing::info!("Hiddify: modified user {}", panel_key);
            Ok(())
        } else {
            Err(failure_from_response(Panel::Hiddify, &format!("PATCH {}", path), response).await)
        }
    }

    async fn delete(&self, panel_key: &str) -> PanelResult<()> {
        if !self.configured {
            return Err(PanelFailure::Rejected("panel not configured".to_string()));
        }

        let path = Self::user_path(panel_key);
        let response = self.request(Method::DELETE, &path, None).await?;
        if response.status().is_success() {
            tracing::info!("Hiddify: deleted user {}", panel_key);
            Ok(())
        } else {
            Err(failure_from_response(Panel::Hiddify, &format!("DELETE {}", path), response).await)
        }
    }
}

/// The list endpoint answers with a bare array or a `results`/`users` envelope
fn user_list(payload: &Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get("results")
            .or_else(|| map.get("users"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn as_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn as_i64(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Normalize one raw Hiddify user; missing fields take neutral defaults
pub(crate) fn normalize(raw: &Value, today: NaiveDate) -> Option<NormalizedUserRecord> {
    let obj = raw.as_object()?;
    let uuid = obj.get("uuid").and_then(Value::as_str)?.to_lowercase();
    if uuid.is_empty() {
        return None;
    }

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .unwrap_or(UNKNOWN_NAME);
    let is_active = obj
        .get("is_active")
        .or_else(|| obj.get("enable"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let record = NormalizedUserRecord::new(
        name,
        uuid.clone(),
        as_f64(obj.get("usage_limit_GB")),
        as_f64(obj.get("current_usage_GB")),
    )
    .with_external_id(Some(uuid))
    .active(is_active)
    .last_online(parse_panel_datetime(
        obj.get("last_online").and_then(Value::as_str),
    ))
    .expire_days(remaining_days(
        obj.get("start_date").and_then(Value::as_str),
        as_i64(obj.get("package_days")),
        today,
    ));

    Some(record)
}

/// Days until `start_date + package_days`; `None` for an unlimited package.
/// A missing or unparseable start date counts from today.
pub(crate) fn remaining_days(
    start_date: Option<&str>,
    package_days: Option<i64>,
    today: NaiveDate,
) -> Option<i64> {
    let package_days = package_days.filter(|d| *d != 0)?;
    let start = start_date
        .and_then(|s| s.split('T').next())
        .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
        .unwrap_or(today);
    let expiration = start + chrono::Duration::days(package_days);
    Some((expiration - today).num_days())
}

/// PATCH body for a change; relative parts need the current record
fn build_patch(
    change: &UserChange,
    current: Option<&NormalizedUserRecord>,
    today: NaiveDate,
) -> Map<String, Value> {
    let mut payload = Map::new();

    if let Some(current) = current {
        if change.add_usage_gb != 0.0 {
            if current.is_unlimited() {
                tracing::warn!(
                    "Hiddify: user {} has unlimited quota; ignoring +{} GB",
                    current.panel_key,
                    change.add_usage_gb
                );
            } else {
                let new_limit = (current.usage_limit_gb + change.add_usage_gb).max(MIN_LIMIT_GB);
                payload.insert("usage_limit_GB".to_string(), json!(new_limit));
            }
        }

        if change.add_days != 0 {
            match current.expire_days {
                Some(days) => {
                    // Restart the package so the new length counts from today.
                    // package_days = 0 reads as unlimited, so a non-positive
                    // result is expressed as a one-day package that already ran out.
                    let new_days = days.max(0) + change.add_days;
                    let (package_days, start) = if new_days > 0 {
                        (new_days, today)
                    } else {
                        (1, today + chrono::Duration::days(new_days - 1))
                    };
                    payload.insert("package_days".to_string(), json!(package_days));
                    payload.insert(
                        "start_date".to_string(),
                        json!(start.format("%Y-%m-%d").to_string()),
                    );
                }
                None => tracing::warn!(
                    "Hiddify: user {} has no expiry; ignoring +{} days",
                    current.panel_key,
                    change.add_days
                ),
            }
        }
    }

    if let Some(enable) = change.enable {
        payload.insert("enable".to_string(), json!(enable));
    }
    if change.reset_usage {
        payload.insert("current_usage_GB".to_string(), json!(0));
    }

    payload
}
