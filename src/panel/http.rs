/// Shared HTTP plumbing for panel adapters: client construction and a bounded
/// retry loop with exponential backoff for transient failures.
use crate::{
    config::PanelHttpConfig,
    error::{BotError, BotResult},
    metrics,
    panel::{Panel, PanelFailure},
};
use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

/// Retry budget for one logical request
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PanelHttpConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Backoff before attempt `attempt + 1`, with a little jitter
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self.base_backoff.saturating_mul(factor);
        if base.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis().min(250) as u64);
        base + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Build the HTTP client used by one adapter
pub fn build_client(config: &PanelHttpConfig) -> BotResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("dualpanel-bot/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| BotError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Statuses worth another attempt
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Send a request, retrying connection errors, timeouts and 5xx responses.
///
/// `build` is called once per attempt. Any response that is not transient is
/// returned to the caller as-is (including 401/404), so auth refresh and
/// not-found handling stay in the adapter.
pub async fn send_with_retry<F>(
    panel: Panel,
    policy: &RetryPolicy,
    label: &str,
    build: F,
) -> Result<Response, PanelFailure>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=policy.max_attempts {
        match build().send().await {
            Ok(response) if is_transient_status(response.status()) => {
                last_error = format!("status {}", response.status());
                tracing::warn!(
                    "{}: {} returned {} (attempt {}/{})",
                    panel,
                    label,
                    response.status(),
                    attempt,
                    policy.max_attempts
                );
            }
            Ok(response) => {
                metrics::record_panel_request(panel.as_str(), "ok");
                return Ok(response);
            }
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                last_error = e.to_string();
                tracing::warn!(
                    "{}: {} failed: {} (attempt {}/{})",
                    panel,
                    label,
                    e,
                    attempt,
                    policy.max_attempts
                );
            }
            Err(e) => {
                metrics::record_panel_request(panel.as_str(), "error");
                tracing::error!("{}: {} failed: {}", panel, label, e);
                return Err(PanelFailure::Unavailable(e.to_string()));
            }
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.backoff_for(attempt)).await;
        }
    }

    metrics::record_panel_request(panel.as_str(), "exhausted");
    tracing::error!(
        "{}: {} gave up after {} attempts: {}",
        panel,
        label,
        policy.max_attempts,
        last_error
    );
    Err(PanelFailure::Unavailable(last_error))
}

/// Map a non-success, non-transient response to a failure sentinel
pub async fn failure_from_response(panel: Panel, label: &str, response: Response) -> PanelFailure {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return PanelFailure::NotFound;
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    tracing::error!("{}: {} returned {}: {}", panel, label, status, snippet);
    PanelFailure::Rejected(format!("status {}", status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1000),
        };
        let first = policy.backoff_for(1);
        let second = policy.backoff_for(2);
        assert!(first >= Duration::from_millis(1000) && first <= Duration::from_millis(1250));
        assert!(second >= Duration::from_millis(2000) && second <= Duration::from_millis(2250));
    }

    #[test]
    fn test_zero_backoff_has_no_jitter() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::ZERO,
        };
        assert_eq!(policy.backoff_for(1), Duration::ZERO);
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_transient_status_is_retried_until_success() {
        use axum::{extract::State, http::StatusCode as AxumStatus, routing::get, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        async fn flaky(State(calls): State<Arc<AtomicUsize>>) -> (AxumStatus, &'static str) {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                (AxumStatus::SERVICE_UNAVAILABLE, "busy")
            } else {
                (AxumStatus::OK, "[]")
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/user/", get(flaky))
            .with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/user/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::ZERO,
        };
        let response = send_with_retry(Panel::Hiddify, &policy, "GET /user/", || client.get(&url))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_host_exhausts_attempts() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let policy = RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::ZERO,
        };

        let result = send_with_retry(Panel::Hiddify, &policy, "GET /user/", || {
            client.get("http://127.0.0.1:9/unreachable")
        })
        .await;

        assert!(matches!(result, Err(PanelFailure::Unavailable(_))));
    }
}
