//! Error recovery engine
//!
//! Every classified validation failure passes through here before a
//! response goes out. Rate limiting runs first and short-circuits
//! everything else; otherwise the code selects exactly one recovery
//! strategy, and the strategy either rescues the request or the original
//! error surfaces.

use std::sync::Arc;
use std::time::Duration;

use actix_web::HttpRequest;

use crate::errors::{AuthErrorCode, ErrorContext, ErrorRateLimiter};
use crate::models::{SessionData, SessionEvent, SessionEventKind};
use crate::session::storage::CredentialWrite;
use crate::session::validator::SessionValidator;

/// Delay before the single retry a `ValidationError` earns
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Recovery strategies in ascending priority; each code maps to at most one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Renew through the refresh credential, pass through on success
    Refresh,
    /// Challenge the caller to authenticate again
    Reauth,
    /// Rebuild from the secondary source, discarding the primary credential
    Fallback,
    /// One delayed re-validation for transient internal faults
    Retry,
}

impl RecoveryStrategy {
    /// The strategy applicable to a code, if any
    ///
    /// Policy failures, inconsistency, rate limiting, and transport
    /// rejections are final: nothing recovers them.
    #[must_use]
    pub const fn for_code(code: AuthErrorCode) -> Option<Self> {
        match code {
            AuthErrorCode::ExpiredSession | AuthErrorCode::RefreshRequired => Some(Self::Refresh),
            AuthErrorCode::NoSession
            | AuthErrorCode::InvalidSession
            | AuthErrorCode::RevokedSession => Some(Self::Reauth),
            AuthErrorCode::VerificationFailed | AuthErrorCode::MalformedSession => {
                Some(Self::Fallback)
            }
            AuthErrorCode::ValidationError => Some(Self::Retry),
            AuthErrorCode::RateLimited
            | AuthErrorCode::InsufficientPermissions
            | AuthErrorCode::EmailNotVerified
            | AuthErrorCode::SessionInconsistent
            | AuthErrorCode::InvalidHeaders => None,
        }
    }
}

/// What the handler does after recovery has run
pub enum RecoveryOutcome {
    /// Recovery rescued the request; proceed with this session
    PassThrough {
        session: SessionData,
        write: Option<CredentialWrite>,
    },
    /// Send the caller back through sign-in, clearing stored credentials
    Challenge {
        code: AuthErrorCode,
        target: String,
        clear: CredentialWrite,
    },
    /// Error storm from this identity; reply 429 and skip recovery
    RateLimited { retry_after: u64 },
    /// Nothing applies or recovery failed; surface the original error
    Unrecovered,
}

pub struct ErrorHandler {
    validator: Arc<SessionValidator>,
    limiter: ErrorRateLimiter,
}

impl ErrorHandler {
    #[must_use]
    pub fn new(validator: Arc<SessionValidator>, limiter: ErrorRateLimiter) -> Self {
        Self { validator, limiter }
    }

    #[must_use]
    pub const fn limiter(&self) -> &ErrorRateLimiter {
        &self.limiter
    }

    /// Prune idle identities from the limiter on an interval
    ///
    /// Without this sweep an identity that errors once and never returns
    /// keeps its map entry forever.
    pub fn spawn_limiter_maintenance(
        self: &Arc<Self>,
        every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                handler.limiter.prune();
            }
        })
    }

    /// Process one validation failure end to end
    pub async fn handle(&self, req: &HttpRequest, ctx: &ErrorContext) -> RecoveryOutcome {
        log::warn!(
            "Validation failure {} for identity {} on {} (request {})",
            ctx.code,
            ctx.identity,
            ctx.target,
            ctx.request_id
        );

        self.validator.store().emit(
            SessionEvent::new(
                SessionEventKind::Error,
                ctx.session
                    .as_ref()
                    .map_or("", |s| s.session_id.as_str()),
                ctx.session
                    .as_ref()
                    .map_or(ctx.identity.as_str(), |s| s.subject_id.as_str()),
            )
            .with_metadata(serde_json::json!({ "code": ctx.code.as_str() })),
        );

        // Rate limiting precedes recovery
        if self.limiter.record(&ctx.identity) {
            log::warn!("Identity {} rate limited after repeated failures", ctx.identity);
            return RecoveryOutcome::RateLimited {
                retry_after: self.limiter.retry_after_secs(),
            };
        }

        match RecoveryStrategy::for_code(ctx.code) {
            Some(RecoveryStrategy::Refresh) => self.attempt_refresh(req, ctx).await,
            Some(RecoveryStrategy::Reauth) => self.challenge(req, ctx),
            Some(RecoveryStrategy::Fallback) => self.attempt_fallback(req, ctx).await,
            Some(RecoveryStrategy::Retry) => self.attempt_retry(req, ctx).await,
            None => RecoveryOutcome::Unrecovered,
        }
    }

    async fn attempt_refresh(&self, req: &HttpRequest, ctx: &ErrorContext) -> RecoveryOutcome {
        match self.validator.refresh_with_credential(req).await {
            Ok((session, write)) => {
                log::info!(
                    "Recovered {} for session {} via refresh",
                    ctx.code,
                    session.session_id
                );
                RecoveryOutcome::PassThrough {
                    session,
                    write: Some(write),
                }
            }
            Err(err) => {
                // A session that cannot renew is a sign-in problem now
                log::info!("Refresh recovery failed ({err}), escalating to re-auth");
                self.challenge(req, ctx)
            }
        }
    }

    fn challenge(&self, req: &HttpRequest, ctx: &ErrorContext) -> RecoveryOutcome {
        RecoveryOutcome::Challenge {
            code: ctx.code,
            target: ctx.target.clone(),
            clear: self.validator.invalidate_session(req),
        }
    }

    async fn attempt_fallback(&self, req: &HttpRequest, ctx: &ErrorContext) -> RecoveryOutcome {
        match self.validator.validate_via_secondary(req).await {
            Ok((session, write)) => {
                log::info!(
                    "Recovered {} for subject {} via secondary source",
                    ctx.code,
                    session.subject_id
                );
                RecoveryOutcome::PassThrough {
                    session,
                    write: Some(write),
                }
            }
            Err(err) => {
                log::info!("Fallback recovery failed: {err}");
                RecoveryOutcome::Unrecovered
            }
        }
    }

    async fn attempt_retry(&self, req: &HttpRequest, ctx: &ErrorContext) -> RecoveryOutcome {
        tokio::time::sleep(RETRY_DELAY).await;
        match self.validator.validate_session(req).await {
            Ok(result) => {
                log::info!(
                    "Recovered {} for session {} on retry",
                    ctx.code,
                    result.session.session_id
                );
                RecoveryOutcome::PassThrough {
                    session: result.session,
                    write: None,
                }
            }
            Err(err) => {
                log::info!("Retry recovery failed: {err}");
                RecoveryOutcome::Unrecovered
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, TimeoutBudgets};
    use crate::session::storage::{StorageChain, SESSION_COOKIE_NAME};
    use crate::session::store::SessionStore;
    use crate::testing::{constants, MockVerifier, RequestBuilder, TestFixtures};
    use crate::utils::crypto;
    use chrono::Utc;

    fn handler_with(primary: MockVerifier, secondary: Option<MockVerifier>) -> ErrorHandler {
        let store = Arc::new(SessionStore::new(
            crypto::derive_encryption_key(constants::TEST_ENCRYPTION_KEY),
            chrono::Duration::hours(8),
            chrono::Duration::hours(12),
            chrono::Duration::minutes(5),
        ));
        let validator = Arc::new(SessionValidator::new(
            store,
            Arc::new(StorageChain::standard(false)),
            Arc::new(primary),
            secondary.map(|s| Arc::new(s) as Arc<dyn crate::verifier::CredentialSource>),
            TimeoutBudgets {
                inactivity: chrono::Duration::hours(1),
                absolute_age: chrono::Duration::hours(12),
                warning_threshold: chrono::Duration::minutes(5),
            },
            chrono::Duration::minutes(30),
            8 * 3600,
            Vec::new(),
            Vec::new(),
        ));
        ErrorHandler::new(validator, ErrorRateLimiter::default())
    }

    fn context(code: AuthErrorCode, identity: &str) -> ErrorContext {
        ErrorContext {
            code,
            detail: None,
            session: None,
            identity: identity.to_string(),
            request_id: "req-1".to_string(),
            target: "/orders/42".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_strategy_mapping() {
        assert_eq!(
            RecoveryStrategy::for_code(AuthErrorCode::ExpiredSession),
            Some(RecoveryStrategy::Refresh)
        );
        assert_eq!(
            RecoveryStrategy::for_code(AuthErrorCode::NoSession),
            Some(RecoveryStrategy::Reauth)
        );
        assert_eq!(
            RecoveryStrategy::for_code(AuthErrorCode::MalformedSession),
            Some(RecoveryStrategy::Fallback)
        );
        assert_eq!(
            RecoveryStrategy::for_code(AuthErrorCode::ValidationError),
            Some(RecoveryStrategy::Retry)
        );
        assert_eq!(
            RecoveryStrategy::for_code(AuthErrorCode::InsufficientPermissions),
            None
        );
        assert_eq!(
            RecoveryStrategy::for_code(AuthErrorCode::SessionInconsistent),
            None
        );
    }

    #[tokio::test]
    async fn test_limiter_maintenance_prunes_idle_identities() {
        let handler = Arc::new(handler_with(MockVerifier::accepting(), None));
        let stale = Utc::now() - chrono::Duration::seconds(600);
        let _ = handler.limiter().record_at("old-sess", stale);
        assert_eq!(handler.limiter().tracked_identities(), 1);

        let handle = handler.spawn_limiter_maintenance(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.limiter().tracked_identities(), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_rate_limit_short_circuits_recovery() {
        let handler = handler_with(MockVerifier::accepting(), None);
        let req = RequestBuilder::new().browser_headers().build();
        let ctx = context(AuthErrorCode::NoSession, "sess-1");

        // Five failures recover normally (as re-auth challenges)
        for _ in 0..5 {
            let outcome = handler.handle(&req, &ctx).await;
            assert!(matches!(outcome, RecoveryOutcome::Challenge { .. }));
        }

        // The sixth is limited before any strategy runs
        let outcome = handler.handle(&req, &ctx).await;
        match outcome {
            RecoveryOutcome::RateLimited { retry_after } => assert_eq!(retry_after, 300),
            _ => panic!("expected rate limited outcome"),
        }
    }

    #[tokio::test]
    async fn test_reauth_challenge_carries_code_and_target() {
        let handler = handler_with(MockVerifier::accepting(), None);
        let req = RequestBuilder::new().browser_headers().build();
        let ctx = context(AuthErrorCode::InvalidSession, "sess-1");

        match handler.handle(&req, &ctx).await {
            RecoveryOutcome::Challenge { code, target, clear } => {
                assert_eq!(code, AuthErrorCode::InvalidSession);
                assert_eq!(target, "/orders/42");
                assert!(!clear.is_empty());
            }
            _ => panic!("expected challenge outcome"),
        }
    }

    #[tokio::test]
    async fn test_expired_session_refreshes_before_reauth() {
        let handler = handler_with(MockVerifier::accepting(), None);

        // Expired session whose envelope still carries a refresh credential
        let mut session = TestFixtures::session_with_offsets(120, 5, -10);
        session.refresh_credential = Some("refresh-cred".to_string());
        let envelope = TestFixtures::envelope_for(&session);
        let sealed = handler.validator.store().seal_envelope(&envelope).unwrap();
        let req = RequestBuilder::new()
            .browser_headers()
            .cookie(SESSION_COOKIE_NAME, &sealed)
            .build();

        let ctx = context(AuthErrorCode::ExpiredSession, &session.session_id);
        match handler.handle(&req, &ctx).await {
            RecoveryOutcome::PassThrough { session, write } => {
                assert!(session.expires_at > Utc::now());
                assert!(write.is_some());
            }
            _ => panic!("expected refresh pass-through, not re-auth"),
        }
    }

    #[tokio::test]
    async fn test_expired_without_refresh_credential_escalates_to_reauth() {
        let handler = handler_with(MockVerifier::accepting(), None);
        let session = TestFixtures::session_with_offsets(120, 5, -10);
        let envelope = TestFixtures::envelope_for(&session);
        let sealed = handler.validator.store().seal_envelope(&envelope).unwrap();
        let req = RequestBuilder::new()
            .browser_headers()
            .cookie(SESSION_COOKIE_NAME, &sealed)
            .build();

        let ctx = context(AuthErrorCode::ExpiredSession, &session.session_id);
        assert!(matches!(
            handler.handle(&req, &ctx).await,
            RecoveryOutcome::Challenge { .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_credential_falls_back_to_secondary() {
        let handler = handler_with(
            MockVerifier::accepting(),
            Some(MockVerifier::accepting()),
        );
        let req = RequestBuilder::new()
            .browser_headers()
            .cookie(SESSION_COOKIE_NAME, "AAAAtampered")
            .header("Authorization", "Bearer secondary-token")
            .build();

        let ctx = context(AuthErrorCode::MalformedSession, "anonymous");
        match handler.handle(&req, &ctx).await {
            RecoveryOutcome::PassThrough { session, .. } => {
                assert_eq!(session.role, Role::Customer);
            }
            _ => panic!("expected fallback pass-through"),
        }
    }

    #[tokio::test]
    async fn test_validation_error_retries_once() {
        let handler = handler_with(MockVerifier::accepting(), None);
        // A valid session exists; the original failure was transient
        let (_, sealed) = handler
            .validator
            .store()
            .create_session(TestFixtures::claims(), "raw-cred".to_string(), None)
            .unwrap();
        let req = RequestBuilder::new()
            .browser_headers()
            .cookie(SESSION_COOKIE_NAME, &sealed)
            .build();

        let ctx = context(AuthErrorCode::ValidationError, "sess-1");
        assert!(matches!(
            handler.handle(&req, &ctx).await,
            RecoveryOutcome::PassThrough { .. }
        ));
    }
}
