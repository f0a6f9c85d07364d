//! Request validation pipeline
//!
//! [`SessionValidator`] ties the pieces together: transport checks, the
//! storage chain, the cache, credential re-verification, policy
//! enforcement, the secondary-source cross-check, and the inline fail-open
//! refresh. Handlers call [`SessionValidator::validate_request`] and apply
//! whatever artifacts come back.

use std::sync::Arc;

use actix_web::HttpRequest;
use chrono::{Duration, Utc};

use crate::errors::{AuthError, AuthErrorCode};
use crate::models::{
    Role, SessionData, SessionEvent, SessionEventKind, TimeoutBudgets, TimeoutState,
};
use crate::session::storage::{CredentialWrite, StorageChain};
use crate::session::store::SessionStore;
use crate::utils::headers::{check_transport_headers, extract_bearer_token};
use crate::verifier::CredentialSource;

/// Per-route authorization requirements
#[derive(Debug, Clone, Default)]
pub struct SessionPolicy {
    pub require_auth: bool,
    /// Roles accepted for the route; empty means any authenticated role
    pub require_role: Vec<Role>,
    pub require_email_verified: bool,
    /// Anonymous callers pass through with no session facts attached
    pub allow_anonymous: bool,
}

impl SessionPolicy {
    /// Standard policy for authenticated application routes
    #[must_use]
    pub const fn authenticated() -> Self {
        Self {
            require_auth: true,
            require_role: Vec::new(),
            require_email_verified: false,
            allow_anonymous: false,
        }
    }
}

/// Outcome of the store-level validation step
#[derive(Debug)]
pub struct ValidationResult {
    pub session: SessionData,
    pub needs_refresh: bool,
    /// Which storage slot produced the credential
    pub source: &'static str,
    pub envelope: crate::models::CredentialEnvelope,
}

/// Outcome of the full request pipeline
#[derive(Debug)]
pub struct ValidationContext {
    /// None for an anonymous pass-through
    pub session: Option<SessionData>,
    pub timeout: Option<TimeoutState>,
    pub needs_refresh: bool,
    /// Whether the inline refresh ran and succeeded this request
    pub refreshed: bool,
    /// Credential artifacts to apply to the response, if any
    pub write: Option<CredentialWrite>,
}

impl ValidationContext {
    fn anonymous() -> Self {
        Self {
            session: None,
            timeout: None,
            needs_refresh: false,
            refreshed: false,
            write: None,
        }
    }
}

pub struct SessionValidator {
    store: Arc<SessionStore>,
    chain: Arc<StorageChain>,
    primary: Arc<dyn CredentialSource>,
    /// Optional second source cross-checked against the primary session
    secondary: Option<Arc<dyn CredentialSource>>,
    budgets: TimeoutBudgets,
    refresh_threshold: Duration,
    session_window_secs: i64,
    allowed_origins: Vec<String>,
    blocked_agent_patterns: Vec<regex::Regex>,
}

impl SessionValidator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SessionStore>,
        chain: Arc<StorageChain>,
        primary: Arc<dyn CredentialSource>,
        secondary: Option<Arc<dyn CredentialSource>>,
        budgets: TimeoutBudgets,
        refresh_threshold: Duration,
        session_window_secs: i64,
        allowed_origins: Vec<String>,
        blocked_agent_patterns: Vec<regex::Regex>,
    ) -> Self {
        Self {
            store,
            chain,
            primary,
            secondary,
            budgets,
            refresh_threshold,
            session_window_secs,
            allowed_origins,
            blocked_agent_patterns,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<StorageChain> {
        &self.chain
    }

    #[must_use]
    pub const fn budgets(&self) -> &TimeoutBudgets {
        &self.budgets
    }

    // ========================================================================
    // Session establishment
    // ========================================================================

    /// Establish a session from a freshly presented credential
    ///
    /// Verifies through the primary source and requires the verified subject
    /// to match the claimed one before any session state exists.
    ///
    /// # Errors
    ///
    /// `VerificationFailed` on verifier failure or subject mismatch, plus
    /// whatever the store returns from sealing.
    pub async fn create_session(
        &self,
        req: &HttpRequest,
        claimed_subject: &str,
        raw_credential: String,
        refresh_credential: Option<String>,
    ) -> Result<(SessionData, CredentialWrite), AuthError> {
        let claims = self.primary.verify(&raw_credential).await?;

        if claims.subject_id != claimed_subject {
            return Err(AuthError::with_detail(
                AuthErrorCode::VerificationFailed,
                format!(
                    "verified subject does not match claimed subject {claimed_subject}"
                ),
            ));
        }

        let (session, sealed) =
            self.store
                .create_session(claims, raw_credential, refresh_credential)?;
        let write = self.chain.persist(req, &sealed, self.session_window_secs);

        Ok((session, write))
    }

    // ========================================================================
    // Store-level validation
    // ========================================================================

    /// Validate the credential carried by this request
    ///
    /// Walks the storage chain, opens the envelope, enforces the three
    /// timeout budgets, and re-verifies through the primary source when the
    /// cache cannot vouch for the session.
    ///
    /// # Errors
    ///
    /// `NoSession` when no slot holds a credential, `MalformedSession` when
    /// the envelope does not open, `ExpiredSession` when any budget is
    /// exhausted, and verification errors from the primary source.
    pub async fn validate_session(
        &self,
        req: &HttpRequest,
    ) -> Result<ValidationResult, AuthError> {
        let retrieved = self
            .chain
            .retrieve(req)
            .ok_or_else(|| AuthError::new(AuthErrorCode::NoSession))?;

        let envelope = self.store.open_envelope(&retrieved.sealed)?;
        let now = Utc::now();

        // Fresh cache hit vouches for the credential; the budget checks
        // still run so a dead session never validates
        if let Some(session) = self.store.cached(&envelope.session_id) {
            self.check_budgets(&session)?;
            let needs_refresh = session.needs_refresh(now, self.refresh_threshold);
            return Ok(ValidationResult {
                session,
                needs_refresh,
                source: retrieved.source,
                envelope,
            });
        }

        // Cache miss or TTL-stale: budgets are checked against the envelope
        // plus whatever activity record survives in the stale entry
        let stale = self.store.cached_stale(&envelope.session_id);
        let last_activity = stale
            .as_ref()
            .map_or(envelope.issued_at, |s| s.last_activity);

        if envelope.expires_at <= now {
            self.reject_expired(&envelope, "explicit expiry reached")?;
        }
        if envelope.issued_at + self.budgets.absolute_age <= now {
            self.reject_expired(&envelope, "absolute age ceiling reached")?;
        }
        if last_activity + self.budgets.inactivity <= now {
            self.reject_expired(&envelope, "inactivity window exceeded")?;
        }

        // Re-verification through the primary source
        let claims = self.primary.verify(&envelope.credential).await?;
        if claims.subject_id != envelope.subject_id {
            return Err(AuthError::with_detail(
                AuthErrorCode::InvalidSession,
                "credential subject no longer matches the session",
            ));
        }

        let session = SessionData {
            subject_id: claims.subject_id,
            email: claims.email,
            email_verified: claims.email_verified,
            role: claims.role,
            custom_claims: claims.custom_claims,
            session_id: envelope.session_id.clone(),
            created_at: envelope.issued_at,
            expires_at: envelope.expires_at,
            last_activity,
            refresh_credential: envelope.refresh_credential.clone(),
        };

        self.store.cache_session(session.clone());
        self.store.emit(SessionEvent::new(
            SessionEventKind::Validated,
            &session.session_id,
            &session.subject_id,
        ));

        let needs_refresh = session.needs_refresh(now, self.refresh_threshold);
        Ok(ValidationResult {
            session,
            needs_refresh,
            source: retrieved.source,
            envelope,
        })
    }

    fn check_budgets(&self, session: &SessionData) -> Result<(), AuthError> {
        let state = TimeoutState::compute(session, &self.budgets, Utc::now());
        if state.is_active {
            Ok(())
        } else {
            self.store.invalidate_local(
                &session.session_id,
                &session.subject_id,
                SessionEventKind::Expired,
            );
            Err(AuthError::with_detail(
                AuthErrorCode::ExpiredSession,
                "timeout budget exhausted",
            ))
        }
    }

    fn reject_expired(
        &self,
        envelope: &crate::models::CredentialEnvelope,
        reason: &str,
    ) -> Result<(), AuthError> {
        self.store.invalidate_local(
            &envelope.session_id,
            &envelope.subject_id,
            SessionEventKind::Expired,
        );
        Err(AuthError::with_detail(AuthErrorCode::ExpiredSession, reason))
    }

    // ========================================================================
    // Full request pipeline
    // ========================================================================

    /// Run the full validation pipeline against a request and policy
    ///
    /// Order is fixed: transport checks, store validation, anonymous
    /// pass-through, authentication requirement, role, email verification,
    /// secondary cross-check, inline refresh, activity bump.
    ///
    /// # Errors
    ///
    /// Every pipeline failure surfaces as a classified [`AuthError`]; the
    /// caller feeds it to the recovery engine.
    pub async fn validate_request(
        &self,
        req: &HttpRequest,
        policy: &SessionPolicy,
    ) -> Result<ValidationContext, AuthError> {
        check_transport_headers(req, &self.allowed_origins, &self.blocked_agent_patterns)?;

        let result = match self.validate_session(req).await {
            Ok(result) => result,
            Err(err) => {
                // An anonymous-friendly route degrades on any invalid
                // result: broken credentials get the anonymous context, not
                // an error
                if policy.allow_anonymous {
                    log::debug!("Anonymous pass-through after {}", err.code);
                    return Ok(ValidationContext::anonymous());
                }
                if err.code == AuthErrorCode::NoSession && !policy.require_auth {
                    return Ok(ValidationContext::anonymous());
                }
                return Err(err);
            }
        };

        let ValidationResult {
            mut session,
            needs_refresh,
            mut envelope,
            ..
        } = result;

        if !policy.require_role.is_empty() && !policy.require_role.contains(&session.role) {
            return Err(AuthError::with_detail(
                AuthErrorCode::InsufficientPermissions,
                format!("role {} not permitted for this route", session.role),
            ));
        }

        if policy.require_email_verified && !session.email_verified {
            return Err(AuthError::new(AuthErrorCode::EmailNotVerified));
        }

        self.cross_check_secondary(req, &session).await?;

        // Inline refresh is fail-open: a failed renewal logs and the request
        // proceeds on the unrefreshed session
        let mut refreshed = false;
        let mut write = None;
        if needs_refresh {
            match self.store.refresh_session(&mut session, &mut envelope) {
                Ok(sealed) => {
                    write = Some(self.chain.persist(req, &sealed, self.session_window_secs));
                    refreshed = true;
                }
                Err(err) => {
                    log::warn!(
                        "Inline refresh failed for session {}: {err}",
                        session.session_id
                    );
                }
            }
        }

        if !refreshed {
            let _ = self.store.update_activity(&session.session_id);
            session.last_activity = Utc::now();
        }

        let timeout = TimeoutState::compute(&session, &self.budgets, Utc::now());
        Ok(ValidationContext {
            session: Some(session),
            timeout: Some(timeout),
            needs_refresh: needs_refresh && !refreshed,
            refreshed,
            write,
        })
    }

    /// Cross-check the session against a bearer credential when one rides
    /// along and a secondary source is configured
    async fn cross_check_secondary(
        &self,
        req: &HttpRequest,
        session: &SessionData,
    ) -> Result<(), AuthError> {
        let (Some(secondary), Some(token)) = (&self.secondary, extract_bearer_token(req))
        else {
            return Ok(());
        };

        let claims = secondary.verify(&token).await?;
        if claims.subject_id != session.subject_id
            || claims.email != session.email
            || claims.role != session.role
        {
            self.store.invalidate_local(
                &session.session_id,
                &session.subject_id,
                SessionEventKind::Error,
            );
            return Err(AuthError::with_detail(
                AuthErrorCode::SessionInconsistent,
                format!(
                    "secondary source {} disagrees with primary session",
                    secondary.name()
                ),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Explicit refresh and teardown
    // ========================================================================

    /// Explicit refresh taking the request's current credential
    ///
    /// # Errors
    ///
    /// Store validation errors, plus sealing errors from the renewal. Unlike
    /// the inline path this one is fail-closed: the caller asked for a
    /// renewal and gets an error when it cannot happen.
    pub async fn refresh_session(
        &self,
        req: &HttpRequest,
    ) -> Result<(SessionData, CredentialWrite), AuthError> {
        let ValidationResult {
            mut session,
            mut envelope,
            ..
        } = self.validate_session(req).await?;

        let sealed = self.store.refresh_session(&mut session, &mut envelope)?;
        let write = self.chain.persist(req, &sealed, self.session_window_secs);
        Ok((session, write))
    }

    /// Renew an expired session through its refresh credential
    ///
    /// Recovery path: skips the budget checks a normal validation would
    /// fail, but still requires a refresh credential the primary source
    /// accepts and an unexhausted absolute-age ceiling.
    ///
    /// # Errors
    ///
    /// `NoSession`/`MalformedSession` from the retrieval, `ExpiredSession`
    /// when the age ceiling is gone or no refresh credential exists, and
    /// verification errors from the primary source.
    pub async fn refresh_with_credential(
        &self,
        req: &HttpRequest,
    ) -> Result<(SessionData, CredentialWrite), AuthError> {
        let retrieved = self
            .chain
            .retrieve(req)
            .ok_or_else(|| AuthError::new(AuthErrorCode::NoSession))?;
        let mut envelope = self.store.open_envelope(&retrieved.sealed)?;

        let now = Utc::now();
        if envelope.issued_at + self.budgets.absolute_age <= now {
            return Err(AuthError::with_detail(
                AuthErrorCode::ExpiredSession,
                "absolute age ceiling reached, renewal not possible",
            ));
        }
        let refresh_credential = envelope.refresh_credential.clone().ok_or_else(|| {
            AuthError::with_detail(
                AuthErrorCode::ExpiredSession,
                "no refresh credential available",
            )
        })?;

        let claims = self.primary.verify(&refresh_credential).await?;
        if claims.subject_id != envelope.subject_id {
            return Err(AuthError::with_detail(
                AuthErrorCode::InvalidSession,
                "refresh credential subject does not match the session",
            ));
        }

        let mut session = SessionData {
            subject_id: claims.subject_id,
            email: claims.email,
            email_verified: claims.email_verified,
            role: claims.role,
            custom_claims: claims.custom_claims,
            session_id: envelope.session_id.clone(),
            created_at: envelope.issued_at,
            expires_at: envelope.expires_at,
            last_activity: now,
            refresh_credential: Some(refresh_credential),
        };
        let sealed = self.store.refresh_session(&mut session, &mut envelope)?;
        let write = self.chain.persist(req, &sealed, self.session_window_secs);
        Ok((session, write))
    }

    /// Establish a fresh session from the secondary source's credential
    ///
    /// Recovery path for an unreadable or unverifiable primary credential:
    /// the tampered envelope is discarded entirely and a new session is
    /// built from what the secondary source vouches for.
    ///
    /// # Errors
    ///
    /// `NoSession` when no secondary source or bearer credential exists,
    /// verification errors from the secondary source, and sealing errors.
    pub async fn validate_via_secondary(
        &self,
        req: &HttpRequest,
    ) -> Result<(SessionData, CredentialWrite), AuthError> {
        let secondary = self.secondary.as_ref().ok_or_else(|| {
            AuthError::with_detail(AuthErrorCode::NoSession, "no secondary source configured")
        })?;
        let token = extract_bearer_token(req).ok_or_else(|| {
            AuthError::with_detail(AuthErrorCode::NoSession, "no secondary credential present")
        })?;

        let claims = secondary.verify(&token).await?;
        let (session, sealed) = self.store.create_session(claims, token, None)?;
        let write = self.chain.persist(req, &sealed, self.session_window_secs);
        Ok((session, write))
    }

    /// Explicit invalidation: every storage slot cleared, cache evicted
    ///
    /// Tolerant of malformed or absent credentials; sign-out always clears.
    #[must_use]
    pub fn invalidate_session(&self, req: &HttpRequest) -> CredentialWrite {
        if let Some(retrieved) = self.chain.retrieve(req) {
            if let Ok(envelope) = self.store.open_envelope(&retrieved.sealed) {
                self.store.invalidate_local(
                    &envelope.session_id,
                    &envelope.subject_id,
                    SessionEventKind::Expired,
                );
            }
        }
        self.chain.clear_all(req)
    }
}
