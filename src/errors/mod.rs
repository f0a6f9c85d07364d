//! Error taxonomy for the session guard
//!
//! Every failure in the validation pipeline funnels through the fixed
//! [`AuthErrorCode`] set. Handlers never leak internal detail to callers;
//! the user-facing message is mapped 1:1 from the code and raw detail is
//! attached only in debug builds.

pub mod rate_limit;
pub mod recovery;

use actix_web::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use rate_limit::ErrorRateLimiter;
pub use recovery::{ErrorHandler, RecoveryOutcome, RecoveryStrategy};

/// Closed set of failure classifications for the validation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthErrorCode {
    NoSession,
    InvalidSession,
    ExpiredSession,
    RevokedSession,
    MalformedSession,
    VerificationFailed,
    RefreshRequired,
    RateLimited,
    InsufficientPermissions,
    EmailNotVerified,
    SessionInconsistent,
    InvalidHeaders,
    ValidationError,
}

impl AuthErrorCode {
    /// Wire representation used in error bodies and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoSession => "NO_SESSION",
            Self::InvalidSession => "INVALID_SESSION",
            Self::ExpiredSession => "EXPIRED_SESSION",
            Self::RevokedSession => "REVOKED_SESSION",
            Self::MalformedSession => "MALFORMED_SESSION",
            Self::VerificationFailed => "VERIFICATION_FAILED",
            Self::RefreshRequired => "REFRESH_REQUIRED",
            Self::RateLimited => "RATE_LIMITED",
            Self::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            Self::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            Self::SessionInconsistent => "SESSION_INCONSISTENT",
            Self::InvalidHeaders => "INVALID_HEADERS",
            Self::ValidationError => "VALIDATION_ERROR",
        }
    }

    /// User-safe message for the error body; never exposes internals
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::NoSession => "No active session was found. Please sign in.",
            Self::InvalidSession => "Your session is invalid. Please sign in again.",
            Self::ExpiredSession => "Your session has expired. Please sign in again.",
            Self::RevokedSession => "Your session has been revoked. Please sign in again.",
            Self::MalformedSession => "The session credential could not be read.",
            Self::VerificationFailed => "We could not verify your identity. Please try again.",
            Self::RefreshRequired => "Your session needs to be renewed.",
            Self::RateLimited => "Too many failed attempts. Please try again later.",
            Self::InsufficientPermissions => {
                "You do not have permission to access this resource."
            }
            Self::EmailNotVerified => "Please verify your email address to continue.",
            Self::SessionInconsistent => {
                "Your sign-in state is inconsistent. Please sign in again."
            }
            Self::InvalidHeaders => "The request could not be accepted.",
            Self::ValidationError => "Session validation failed. Please try again.",
        }
    }

    /// HTTP status mapped from the error code
    #[must_use]
    pub const fn http_status(self) -> StatusCode {
        match self {
            Self::NoSession
            | Self::InvalidSession
            | Self::ExpiredSession
            | Self::RevokedSession
            | Self::VerificationFailed
            | Self::RefreshRequired => StatusCode::UNAUTHORIZED,
            Self::MalformedSession | Self::InvalidHeaders => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InsufficientPermissions | Self::EmailNotVerified => StatusCode::FORBIDDEN,
            Self::SessionInconsistent | Self::ValidationError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl std::fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure carrying optional internal detail
///
/// The detail string is for logs and debug-build error bodies only; the
/// caller-visible message always comes from [`AuthErrorCode::user_message`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {}", detail.as_deref().unwrap_or("no detail"))]
pub struct AuthError {
    pub code: AuthErrorCode,
    pub detail: Option<String>,
}

impl AuthError {
    #[must_use]
    pub const fn new(code: AuthErrorCode) -> Self {
        Self { code, detail: None }
    }

    #[must_use]
    pub fn with_detail(code: AuthErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }
}

impl From<AuthErrorCode> for AuthError {
    fn from(code: AuthErrorCode) -> Self {
        Self::new(code)
    }
}

/// Context assembled for one failed validation, fed to the recovery engine
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub code: AuthErrorCode,
    pub detail: Option<String>,
    /// Session data if one was decoded before the failure
    pub session: Option<crate::models::SessionData>,
    /// Identity key for rate limiting: session id, else subject id, else "anonymous"
    pub identity: String,
    pub request_id: String,
    /// Original request target, carried into re-auth challenges
    pub target: String,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorContext {
    /// Derive the rate-limit identity from whatever is known about the caller
    #[must_use]
    pub fn identity_for(session_id: Option<&str>, subject_id: Option<&str>) -> String {
        session_id
            .or(subject_id)
            .unwrap_or("anonymous")
            .to_string()
    }
}

/// JSON error body returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponseBody {
    pub error: String,
    pub error_code: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponseBody {
    /// Build the caller-visible body for an unrecovered error
    ///
    /// Internal detail is attached only in debug builds.
    #[must_use]
    pub fn from_context(ctx: &ErrorContext, retry_after: Option<u64>) -> Self {
        let details = if cfg!(debug_assertions) {
            ctx.detail
                .as_ref()
                .map(|d| serde_json::json!({ "detail": d }))
        } else {
            None
        };

        Self {
            error: ctx.code.user_message().to_string(),
            error_code: ctx.code.as_str().to_string(),
            timestamp: Utc::now(),
            request_id: ctx.request_id.clone(),
            details,
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AuthErrorCode::NoSession.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthErrorCode::ExpiredSession.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthErrorCode::MalformedSession.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AuthErrorCode::RateLimited.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AuthErrorCode::InsufficientPermissions.http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthErrorCode::ValidationError.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_identity_fallback_order() {
        assert_eq!(
            ErrorContext::identity_for(Some("sess-1"), Some("user-1")),
            "sess-1"
        );
        assert_eq!(ErrorContext::identity_for(None, Some("user-1")), "user-1");
        assert_eq!(ErrorContext::identity_for(None, None), "anonymous");
    }

    #[test]
    fn test_error_body_never_leaks_internals_in_message() {
        let ctx = ErrorContext {
            code: AuthErrorCode::VerificationFailed,
            detail: Some("provider returned 503 at https://internal".to_string()),
            session: None,
            identity: "anonymous".to_string(),
            request_id: "req-1".to_string(),
            target: "/orders".to_string(),
            occurred_at: Utc::now(),
        };

        let body = ErrorResponseBody::from_context(&ctx, None);
        assert_eq!(body.error_code, "VERIFICATION_FAILED");
        assert!(!body.error.contains("503"));
        assert!(!body.error.contains("internal"));
    }

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(AuthErrorCode::NoSession.as_str(), "NO_SESSION");
        assert_eq!(
            AuthErrorCode::SessionInconsistent.as_str(),
            "SESSION_INCONSISTENT"
        );
        assert_eq!(AuthErrorCode::RateLimited.as_str(), "RATE_LIMITED");
    }
}
