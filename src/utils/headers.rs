//! HTTP header inspection and response metadata
//!
//! Transport-level tampering checks (bot signatures, origin allow-list),
//! client fingerprint derivation for the volatile storage backend, and the
//! informational session headers attached to validated responses.

use std::sync::LazyLock;
use std::time::Instant;

use actix_web::{HttpRequest, HttpResponseBuilder};
use regex::RegexSet;
use sha2::{Digest, Sha256};

use crate::errors::{AuthError, AuthErrorCode};

/// Request-scoped id header, echoed back to the caller
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Compiled signatures for automated clients that never carry a session
static BOT_SIGNATURES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)bot\b",
        r"(?i)spider",
        r"(?i)crawler",
        r"(?i)scraper",
        r"(?i)curl/",
        r"(?i)python-requests",
    ])
    .expect("bot signature patterns are valid")
});

/// Transport header validation ahead of any session work
///
/// Rejects requests with a missing user agent, a known bot signature, or an
/// `Origin` header outside the allow-list. Extra patterns from settings are
/// checked after the built-in set.
///
/// # Errors
///
/// Returns `InvalidHeaders` when any check fails.
pub fn check_transport_headers(
    req: &HttpRequest,
    allowed_origins: &[String],
    extra_blocked_patterns: &[regex::Regex],
) -> Result<(), AuthError> {
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|h| h.to_str().ok());

    let Some(user_agent) = user_agent else {
        return Err(AuthError::with_detail(
            AuthErrorCode::InvalidHeaders,
            "missing user-agent header",
        ));
    };

    if BOT_SIGNATURES.is_match(user_agent)
        || extra_blocked_patterns.iter().any(|p| p.is_match(user_agent))
    {
        return Err(AuthError::with_detail(
            AuthErrorCode::InvalidHeaders,
            format!("blocked user agent: {user_agent}"),
        ));
    }

    // Origin is only checked when present; non-CORS requests omit it
    if let Some(origin) = req.headers().get("origin").and_then(|h| h.to_str().ok()) {
        let allowed = allowed_origins
            .iter()
            .any(|o| o.trim_end_matches('/') == origin.trim_end_matches('/'));
        if !allowed {
            return Err(AuthError::with_detail(
                AuthErrorCode::InvalidHeaders,
                format!("origin not allowed: {origin}"),
            ));
        }
    }

    Ok(())
}

/// Extract the client IP, preferring proxy headers over the peer address
#[must_use]
pub fn extract_client_ip(req: &HttpRequest) -> Option<String> {
    req.connection_info()
        .realip_remote_addr()
        .map(std::string::ToString::to_string)
}

/// Extract the bearer token from the `Authorization` header, if any
///
/// This is the secondary credential source the validator cross-checks
/// against the primary session.
#[must_use]
pub fn extract_bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(std::string::ToString::to_string)
}

/// SHA-256 fingerprint of the client context (ip | user-agent | platform)
///
/// Keys the volatile storage backend; two requests from the same client
/// within a session produce the same fingerprint.
#[must_use]
pub fn client_fingerprint(req: &HttpRequest) -> String {
    let ip = extract_client_ip(req);
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|h| h.to_str().ok());
    let platform = req
        .headers()
        .get("sec-ch-ua-platform")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim_matches('"'));

    let mut hasher = Sha256::new();
    hasher.update(ip.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(platform.unwrap_or("").as_bytes());

    format!("{:x}", hasher.finalize())
}

/// Fetch the request id assigned by the pipeline, generating one if absent
#[must_use]
pub fn request_id(req: &HttpRequest) -> String {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string)
}

/// Informational session metadata for response headers
///
/// These are advisory only; clients use them to drive timers and refresh
/// prompts, never as the authorization decision itself.
#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub valid: bool,
    pub time_remaining_secs: Option<i64>,
    pub time_until_warning_secs: Option<i64>,
    pub active: Option<bool>,
    pub warnings: u32,
    pub errors: u32,
}

/// Attach session metadata headers to a response under construction
pub fn apply_session_metadata(
    builder: &mut HttpResponseBuilder,
    meta: &SessionMetadata,
    request_id: &str,
    started: Instant,
) {
    if let Some(user_id) = &meta.user_id {
        builder.insert_header(("x-session-user-id", user_id.as_str()));
    }
    if let Some(role) = &meta.role {
        builder.insert_header(("x-session-role", role.as_str()));
    }
    builder.insert_header(("x-session-valid", if meta.valid { "true" } else { "false" }));
    if let Some(remaining) = meta.time_remaining_secs {
        builder.insert_header(("x-session-time-remaining", remaining.to_string()));
    }
    if let Some(until_warning) = meta.time_until_warning_secs {
        builder.insert_header(("x-session-time-until-warning", until_warning.to_string()));
    }
    if let Some(active) = meta.active {
        builder.insert_header(("x-session-active", if active { "true" } else { "false" }));
    }
    builder.insert_header((REQUEST_ID_HEADER, request_id));
    builder.insert_header((
        "x-middleware-execution-time",
        format!("{}ms", started.elapsed().as_millis()),
    ));
    if meta.warnings > 0 {
        builder.insert_header(("x-middleware-warnings", meta.warnings.to_string()));
    }
    if meta.errors > 0 {
        builder.insert_header(("x-middleware-errors", meta.errors.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RequestBuilder;

    #[test]
    fn test_missing_user_agent_rejected() {
        let req = RequestBuilder::new().build();
        let result = check_transport_headers(&req, &[], &[]);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, AuthErrorCode::InvalidHeaders);
    }

    #[test]
    fn test_bot_signature_rejected() {
        for agent in ["Googlebot/2.1", "my-spider 1.0", "curl/8.4.0"] {
            let req = RequestBuilder::new().user_agent(agent).build();
            assert!(
                check_transport_headers(&req, &[], &[]).is_err(),
                "{agent} should be blocked"
            );
        }
    }

    #[test]
    fn test_browser_agent_accepted() {
        let req = RequestBuilder::new().browser_headers().build();
        assert!(check_transport_headers(&req, &[], &[]).is_ok());
    }

    #[test]
    fn test_origin_allow_list() {
        let allowed = vec!["https://app.example.com".to_string()];

        let ok = RequestBuilder::new()
            .browser_headers()
            .header("Origin", "https://app.example.com")
            .build();
        assert!(check_transport_headers(&ok, &allowed, &[]).is_ok());

        let bad = RequestBuilder::new()
            .browser_headers()
            .header("Origin", "https://evil.example.com")
            .build();
        assert!(check_transport_headers(&bad, &allowed, &[]).is_err());
    }

    #[test]
    fn test_bearer_token_extraction() {
        let req = RequestBuilder::new()
            .header("Authorization", "Bearer abc123")
            .build();
        assert_eq!(extract_bearer_token(&req), Some("abc123".to_string()));

        let no_bearer = RequestBuilder::new()
            .header("Authorization", "Basic abc123")
            .build();
        assert_eq!(extract_bearer_token(&no_bearer), None);
    }

    #[test]
    fn test_fingerprint_stable_per_client() {
        let a = RequestBuilder::new()
            .with_client_ip("192.168.1.1")
            .user_agent("Mozilla/5.0 test")
            .build();
        let b = RequestBuilder::new()
            .with_client_ip("192.168.1.1")
            .user_agent("Mozilla/5.0 test")
            .build();
        assert_eq!(client_fingerprint(&a), client_fingerprint(&b));

        let other = RequestBuilder::new()
            .with_client_ip("192.168.1.2")
            .user_agent("Mozilla/5.0 test")
            .build();
        assert_ne!(client_fingerprint(&a), client_fingerprint(&other));
    }
}
