/// Marzban admin API adapter
///
/// Authenticates with a bearer token obtained from `/api/admin/token`. A 401
/// drops the cached token and the request is retried once with a fresh one.
/// Counters arrive in bytes and expiry as epoch seconds.
use crate::{
    config::{MarzbanConfig, PanelHttpConfig},
    error::BotResult,
    identity::IdentityMap,
    panel::{
        http::{build_client, failure_from_response, send_with_retry, RetryPolicy},
        parse_panel_datetime, NormalizedUserRecord, Panel, PanelAdapter, PanelFailure,
        PanelLookup, PanelResult, UserChange, BYTES_PER_GB,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

const SECONDS_PER_DAY: i64 = 86_400;

/// User object as returned by Marzban
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MarzbanUser {
    pub username: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub used_traffic: Option<f64>,
    /// Bytes; null or 0 means unlimited
    #[serde(default)]
    pub data_limit: Option<f64>,
    /// Epoch seconds; null or 0 means never
    #[serde(default)]
    pub expire: Option<i64>,
    #[serde(default)]
    pub online_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<MarzbanUser>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct MarzbanAdapter {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    policy: RetryPolicy,
    token: RwLock<Option<String>>,
    identity: Arc<IdentityMap>,
    configured: bool,
}

impl MarzbanAdapter {
    pub fn new(
        config: &MarzbanConfig,
        http: &PanelHttpConfig,
        identity: Arc<IdentityMap>,
    ) -> BotResult<Self> {
        Ok(Self {
            client: build_client(http)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            policy: RetryPolicy::from_config(http),
            token: RwLock::new(None),
            identity,
            configured: config.is_configured(),
        })
    }

    async fn login(&self) -> PanelResult<String> {
        let url = format!("{}/api/admin/token", self.base_url);
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];

        let response = send_with_retry(Panel::Marzban, &self.policy, "POST /api/admin/token", || {
            self.client.post(&url).form(&form)
        })
        .await?;

        if !response.status().is_success() {
            return Err(
                failure_from_response(Panel::Marzban, "POST /api/admin/token", response).await,
            );
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PanelFailure::Unavailable(format!("invalid token response: {}", e)))?;

        tracing::info!("Marzban: obtained access token");
        Ok(token.access_token)
    }

    async fn bearer(&self) -> PanelResult<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut slot = self.token.write().await;
        // Another task may have logged in while we waited for the write lock
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Authorized request; a 401 triggers exactly one re-authentication
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> PanelResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, endpoint);
        let label = format!("{} {}", method, endpoint);
        let mut reauthenticated = false;

        loop {
            let token = self.bearer().await?;
            let response = send_with_retry(Panel::Marzban, &self.policy, &label, || {
                let mut builder = self
                    .client
                    .request(method.clone(), &url)
                    .bearer_auth(&token)
                    .header(reqwest::header::ACCEPT, "application/json");
                if let Some(body) = body {
                    builder = builder.json(body);
                }
                builder
            })
            .await?;

            if response.status() == StatusCode::UNAUTHORIZED && !reauthenticated {
                tracing::warn!("Marzban: token rejected on {}, re-authenticating", label);
                *self.token.write().await = None;
                reauthenticated = true;
                continue;
            }

            return Ok(response);
        }
    }

    fn user_path(username: &str) -> String {
        format!("/api/user/{}", urlencoding::encode(username))
    }

    async fn fetch_raw(&self, username: &str) -> PanelResult<MarzbanUser> {
        let path = Self::user_path(username);
        let response = self.request(Method::GET, &path, None).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PanelFailure::NotFound);
        }
        if !response.status().is_success() {
            return Err(failure_from_response(Panel::Marzban, &format!("GET {}", path), response).await);
        }

        response
            .json()
            .await
            .map_err(|e| PanelFailure::Unavailable(format!("invalid user payload: {}", e)))
    }

    fn normalize(&self, user: &MarzbanUser, now: i64) -> NormalizedUserRecord {
        normalize(user, now).with_external_id(self.identity.to_external_id(&user.username))
    }
}

#[async_trait]
impl PanelAdapter for MarzbanAdapter {
    fn panel(&self) -> Panel {
        Panel::Marzban
    }

    async fn fetch_all(&self) -> PanelResult<Vec<NormalizedUserRecord>> {
        if !self.configured {
            return Ok(Vec::new());
        }

        let response = self.request(Method::GET, "/api/users", None).await?;
        if !response.status().is_success() {
            return Err(failure_from_response(Panel::Marzban, "GET /api/users", response).await);
        }

        let list: UserList = response
            .json()
            .await
            .map_err(|e| PanelFailure::Unavailable(format!("invalid user list: {}", e)))?;

        let now = Utc::now().timestamp();
        Ok(list.users.iter().map(|u| self.normalize(u, now)).collect())
    }

    async fn fetch_one(&self, panel_key: &str) -> PanelLookup {
        if !self.configured {
            return PanelLookup::NotFound;
        }

        match self.fetch_raw(panel_key).await {
            Ok(user) => PanelLookup::Found(self.normalize(&user, Utc::now().timestamp())),
            Err(PanelFailure::NotFound) => PanelLookup::NotFound,
            Err(PanelFailure::Unavailable(reason)) => PanelLookup::Unavailable(reason),
            Err(other) => PanelLookup::Unavailable(other.to_string()),
        }
    }

    async fn modify(&self, panel_key: &str, change: &UserChange) -> PanelResult<()> {
        if !self.configured {
            return Err(PanelFailure::Rejected("panel not configured".to_string()));
        }

        let update = if change.needs_current_state() || change.enable.is_some() {
            let current = if change.needs_current_state() {
                Some(self.fetch_raw(panel_key).await?)
            } else {
                None
            };
            build_update(change, current.as_ref(), Utc::now().timestamp())
        } else {
            Map::new()
        };

        let path = Self::user_path(panel_key);
        if !update.is_empty() {
            let body = Value::Object(update);
            let response = self.request(Method::PUT, &path, Some(&body)).await?;
            if !response.status().is_success() {
                return Err(
                    failure_from_response(Panel::Marzban, &format!("PUT {}", path), response).await,
                );
            }
            tracing::info!("Marzban: modified user {}", panel_key);
        }

        if change.reset_usage {
            let reset_path = format!("{}/reset", path);
            let response = self.request(Method::POST, &reset_path, None).await?;
            if !response.status().is_success() {
                return Err(failure_from_response(
                    Panel::Marzban,
                    &format!("POST {}", reset_path),
                    response,
                )
                .await);
            }
            tracing::info!("Marzban: reset usage of {}", panel_key);
        }

        Ok(())
    }

    async fn delete(&self, panel_key: &str) -> PanelResult<()> {
        if !self.configured {
            return Err(PanelFailure::Rejected("panel not configured".to_string()));
        }

        let path = Self::user_path(panel_key);
        let response = self.request(Method::DELETE, &path, None).await?;
        if response.status().is_success() {
            tracing::info!("Marzban: deleted user {}", panel_key);
            Ok(())
        } else {
            Err(failure_from_response(Panel::Marzban, &format!("DELETE {}", path), response).await)
        }
    }
}

fn bytes_to_gb(bytes: Option<f64>) -> f64 {
    bytes.map(|b| b / BYTES_PER_GB).unwrap_or(0.0)
}

/// Whole days until `expire`, floored; `None` when the account never expires
pub(crate) fn expire_days(expire: Option<i64>, now: i64) -> Option<i64> {
    match expire {
        Some(ts) if ts > 0 => Some((ts - now).div_euclid(SECONDS_PER_DAY)),
        _ => None,
    }
}

pub(crate) fn normalize(user: &MarzbanUser, now: i64) -> NormalizedUserRecord {
    let is_active = user
        .status
        .as_deref()
        .map(|s| s.eq_ignore_ascii_case("active"))
        .unwrap_or(false);

    NormalizedUserRecord::new(
        user.username.clone(),
        user.username.clone(),
        bytes_to_gb(user.data_limit),
        bytes_to_gb(user.used_traffic),
    )
    .active(is_active)
    .last_online(parse_panel_datetime(user.online_at.as_deref()))
    .expire_days(expire_days(user.expire, now))
}

/// PUT body for a change; quota and expiry are relative to `current`
fn build_update(change: &UserChange, current: Option<&MarzbanUser>, now: i64) -> Map<String, Value> {
    let mut update = Map::new();

    if let Some(current) = current {
        if change.add_usage_gb != 0.0 {
            match current.data_limit.filter(|l| *l > 0.0) {
                Some(limit) => {
                    let added = change.add_usage_gb * BYTES_PER_GB;
                    // 0 reads as unlimited on Marzban, so a shrink bottoms out at one byte
                    let new_limit = (limit + added).round().max(1.0) as i64;
                    update.insert("data_limit".to_string(), json!(new_limit));
                }
                None => tracing::warn!(
                    "Marzban: user {} has unlimited quota; ignoring +{} GB",
                    current.username,
                    change.add_usage_gb
                ),
            }
        }

        if change.add_days != 0 {
            match current.expire.filter(|e| *e > 0) {
                Some(expire) => {
                    let new_expire = expire.max(now) + change.add_days * SECONDS_PER_DAY;
                    update.insert("expire".to_string(), json!(new_expire));
                }
                None => tracing::warn!(
                    "Marzban: user {} never expires; ignoring +{} days",
                    current.username,
                    change.add_days
                ),
            }
        }
    }

    if let Some(enable) = change.enable {
        let status = if enable { "active" } else { "disabled" };
        update.insert("status".to_string(), json!(status));
    }

    update
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_714_560_000; // 2024-05-01T10:40:00Z

    fn user(json: Value) -> MarzbanUser {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_normalize_converts_bytes() {
        let raw = user(json!({
            "username": "bob",
            "status": "active",
            "used_traffic": 5.0 * BYTES_PER_GB,
            "data_limit": 20.0 * BYTES_PER_GB,
            "expire": NOW + 10 * SECONDS_PER_DAY,
            "online_at": "2024-05-01T10:00:00"
        }));

        let record = normalize(&raw, NOW);
        assert_eq!(record.name, "bob");
        assert_eq!(record.panel_key, "bob");
        assert!(record.is_active);
        assert_eq!(record.usage_limit_gb, 20.0);
        assert_eq!(record.current_usage_gb, 5.0);
        assert_eq!(record.remaining_gb, 15.0);
        assert_eq!(record.usage_percentage, 25.0);
        assert_eq!(record.expire_days, Some(10));
        assert!(record.last_online.is_some());
    }

    #[test]
    fn test_normalize_nulls_mean_unlimited() {
        let raw = user(json!({
            "username": "carol",
            "status": "disabled",
            "used_traffic": null,
            "data_limit": null,
            "expire": 0
        }));

        let record = normalize(&raw, NOW);
        assert!(!record.is_active);
        assert!(record.is_unlimited());
        assert_eq!(record.current_usage_gb, 0.0);
        assert_eq!(record.expire_days, None);
        assert_eq!(record.last_online, None);
    }

    #[test]
    fn test_expire_days_floors() {
        assert_eq!(expire_days(Some(NOW + SECONDS_PER_DAY + 5), NOW), Some(1));
        assert_eq!(expire_days(Some(NOW - 5), NOW), Some(-1));
        assert_eq!(expire_days(None, NOW), None);
    }

    #[test]
    fn test_user_list_deserializes_envelope() {
        let list: UserList = serde_json::from_value(json!({
            "users": [{"username": "a"}, {"username": "b", "status": "limited"}],
            "total": 2
        }))
        .unwrap();
        assert_eq!(list.users.len(), 2);
        assert_eq!(list.users[1].status.as_deref(), Some("limited"));
    }

    #[test]
    fn test_build_update_extends_from_now_when_expired() {
        let current = user(json!({
            "username": "bob",
            "data_limit": 10.0 * BYTES_PER_GB,
            "expire": NOW - 3 * SECONDS_PER_DAY
        }));
        let change = UserChange {
            add_usage_gb: 5.0,
            add_days: 30,
            enable: Some(false),
            reset_usage: false,
        };

        let update = build_update(&change, Some(&current), NOW);
        assert_eq!(update["data_limit"], json!((15.0 * BYTES_PER_GB) as i64));
        assert_eq!(update["expire"], json!(NOW + 30 * SECONDS_PER_DAY));
        assert_eq!(update["status"], json!("disabled"));
    }

    #[test]
    fn test_build_update_skips_unlimited() {
        let current = user(json!({ "username": "bob", "data_limit": 0, "expire": null }));
        let change = UserChange {
            add_usage_gb: 5.0,
            add_days: 30,
            ..UserChange::default()
        };
        assert!(build_update(&change, Some(&current), NOW).is_empty());
    }

    #[test]
    fn test_user_path_encodes_username() {
        assert_eq!(MarzbanAdapter::user_path("a b/c"), "/api/user/a%20b%2Fc");
    }

    mod token_refresh {
        use super::*;
        use axum::{
            extract::{Path, State},
            http::{HeaderMap, StatusCode as AxumStatus},
            response::{IntoResponse, Response},
            routing::{get, post},
            Json, Router,
        };
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Clone)]
        struct StubMarzban {
            logins: Arc<AtomicUsize>,
            /// Tokens numbered up to this are answered with 401
            stale_until: usize,
        }

        async fn issue_token(State(stub): State<StubMarzban>) -> Json<Value> {
            let n = stub.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({ "access_token": format!("token-{}", n), "token_type": "bearer" }))
        }

        async fn get_user(
            State(stub): State<StubMarzban>,
            headers: HeaderMap,
            Path(username): Path<String>,
        ) -> Response {
            let n: usize = headers
                .get("authorization")
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.strip_prefix("Bearer token-"))
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            if n <= stub.stale_until {
                return AxumStatus::UNAUTHORIZED.into_response();
            }
            Json(json!({
                "username": username,
                "status": "active",
                "used_traffic": BYTES_PER_GB,
                "data_limit": 10.0 * BYTES_PER_GB,
            }))
            .into_response()
        }

        async fn adapter_against(stale_until: usize) -> (MarzbanAdapter, Arc<AtomicUsize>) {
            let logins = Arc::new(AtomicUsize::new(0));
            let app = Router::new()
                .route("/api/admin/token", post(issue_token))
                .route("/api/user/:username", get(get_user))
                .with_state(StubMarzban {
                    logins: logins.clone(),
                    stale_until,
                });
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            let adapter = MarzbanAdapter::new(
                &MarzbanConfig {
                    base_url,
                    username: "admin".to_string(),
                    password: "secret".to_string(),
                },
                &PanelHttpConfig {
                    timeout_secs: 5,
                    max_attempts: 1,
                    backoff_ms: 0,
                },
                Arc::new(IdentityMap::from_entries([(
                    "0d6f6c6e-8e8f-4f5c-9a3b-7c1a2b3c4d5e",
                    "bob",
                )])),
            )
            .unwrap();
            (adapter, logins)
        }

        #[tokio::test]
        async fn test_rejected_token_is_refreshed_once() {
            let (adapter, logins) = adapter_against(1).await;

            match adapter.fetch_one("bob").await {
                PanelLookup::Found(record) => {
                    assert_eq!(record.usage_limit_gb, 10.0);
                    assert_eq!(
                        record.external_id.as_deref(),
                        Some("0d6f6c6e-8e8f-4f5c-9a3b-7c1a2b3c4d5e")
                    );
                }
                other => panic!("Expected Found, got {:?}", other),
            }
            assert_eq!(logins.load(Ordering::SeqCst), 2);

            // Fresh token is cached for the next call
            assert!(matches!(adapter.fetch_one("bob").await, PanelLookup::Found(_)));
            assert_eq!(logins.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn test_second_rejection_gives_up() {
            let (adapter, logins) = adapter_against(usize::MAX).await;

            assert!(matches!(
                adapter.fetch_one("bob").await,
                PanelLookup::Unavailable(_)
            ));
            assert_eq!(logins.load(Ordering::SeqCst), 2);
        }
    }
}
