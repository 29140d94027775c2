/// Admin authentication and request accounting middleware
use crate::{context::AppContext, error::BotError, metrics};
use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compare without short-circuiting on the first differing byte
fn tokens_match(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    if given.len() != expected.len() {
        return false;
    }
    given
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Reject requests that do not carry the configured admin token
pub async fn require_admin_token(
    State(ctx): State<AppContext>,
    req: Request,
    next: Next,
) -> Result<Response, BotError> {
    let expected = ctx.config.admin_api.token.as_str();
    if expected.is_empty() {
        return Err(BotError::Authentication("Admin API token not configured".to_string()));
    }

    let token = extract_bearer_token(req.headers())
        .ok_or_else(|| BotError::Authentication("Missing authorization header".to_string()))?;

    if !tokens_match(token, expected) {
        tracing::warn!("Rejected admin request to {} with a bad token", req.uri().path());
        return Err(BotError::Authentication("Invalid admin token".to_string()));
    }

    Ok(next.run(req).await)
}

/// Count requests by route template, method and status
pub async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;
    metrics::record_http_request(&method, &path, response.status().as_u16());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer secret-token"));
        assert_eq!(extract_bearer_token(&headers), Some("secret-token"));
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("0123456789abcdef", "0123456789abcdef"));
        assert!(!tokens_match("0123456789abcdeF", "0123456789abcdef"));
        assert!(!tokens_match("short", "0123456789abcdef"));
    }
}
