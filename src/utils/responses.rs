//! HTTP response construction
//!
//! Unified builders for error responses, challenges, and JSON payloads. The
//! common unauthenticated responses are pre-serialized once at startup and
//! reused.

use std::sync::LazyLock;

use actix_web::{http::header, HttpResponse, HttpResponseBuilder};
use serde_json::json;

use crate::errors::{AuthErrorCode, ErrorContext, ErrorResponseBody};
use crate::session::storage::CredentialWrite;

/// Pre-serialized bodies for responses that carry no per-request state
static CACHED_RESPONSES: LazyLock<CachedResponses> = LazyLock::new(CachedResponses::new);

struct CachedResponses {
    unauthorized: String,
}

impl CachedResponses {
    fn new() -> Self {
        Self {
            unauthorized: Self::create_json(
                "unauthorized",
                "Authentication is required to access this resource",
            ),
        }
    }

    fn create_json(error: &str, description: &str) -> String {
        let body = json!({
            "error": error,
            "error_description": description
        });
        serde_json::to_string(&body).expect("Failed to serialize JSON")
    }
}

/// Unified response builder for the session guard's HTTP surface
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Full error response for an unrecovered validation failure
    ///
    /// Status comes from the code mapping; the body is the spec error shape
    /// with a user-safe message. `RateLimited` responses also carry a
    /// `Retry-After` header.
    #[must_use]
    pub fn error(ctx: &ErrorContext, retry_after: Option<u64>) -> HttpResponse {
        let body = ErrorResponseBody::from_context(ctx, retry_after);
        let mut builder = HttpResponseBuilder::new(ctx.code.http_status());

        if let Some(seconds) = retry_after {
            builder.insert_header((header::RETRY_AFTER, seconds.to_string()));
        }

        builder.json(body)
    }

    /// Redirect/challenge response directing the caller to re-authenticate
    ///
    /// Carries the error code and the original target so the sign-in flow
    /// can land the user back where they started. Clears every persisted
    /// credential slot on the way out.
    #[must_use]
    pub fn reauth_challenge(
        sign_in_path: &str,
        code: AuthErrorCode,
        target: &str,
        clear: CredentialWrite,
    ) -> HttpResponse {
        let separator = if sign_in_path.contains('?') { '&' } else { '?' };
        let location = format!(
            "{sign_in_path}{separator}error={}&target={target}",
            code.as_str()
        );

        let mut builder = HttpResponse::Found();
        clear.apply(&mut builder);
        builder
            .append_header((header::LOCATION, location))
            .finish()
    }

    /// OK response with JSON body and credential artifacts applied
    #[must_use]
    pub fn ok_with_write(body: &serde_json::Value, write: Option<CredentialWrite>) -> HttpResponse {
        let mut builder = HttpResponse::Ok();
        if let Some(write) = write {
            write.apply(&mut builder);
        }
        builder.json(body)
    }

    /// Use cached unauthorized response for paths with no context to report
    #[must_use]
    pub fn unauthorized() -> HttpResponse {
        HttpResponse::Unauthorized()
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .body(CACHED_RESPONSES.unauthorized.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use chrono::Utc;

    fn context(code: AuthErrorCode) -> ErrorContext {
        ErrorContext {
            code,
            detail: None,
            session: None,
            identity: "anonymous".to_string(),
            request_id: "req-1".to_string(),
            target: "/orders".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_error_response_status_follows_code() {
        let resp = ResponseBuilder::error(&context(AuthErrorCode::NoSession), None);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = ResponseBuilder::error(&context(AuthErrorCode::MalformedSession), None);
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ResponseBuilder::error(&context(AuthErrorCode::RateLimited), Some(300));
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).unwrap(),
            &"300".to_string()
        );
    }

    #[test]
    fn test_reauth_challenge_carries_code_and_target() {
        let resp = ResponseBuilder::reauth_challenge(
            "/auth/sign_in",
            AuthErrorCode::ExpiredSession,
            "/orders/42",
            CredentialWrite::default(),
        );

        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers().get(header::LOCATION).unwrap().to_str().unwrap();
        assert!(location.contains("error=EXPIRED_SESSION"));
        assert!(location.contains("target=/orders/42"));
    }

    #[test]
    fn test_cached_unauthorized_response() {
        let resp = ResponseBuilder::unauthorized();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
