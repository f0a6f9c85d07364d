//! HTTP surface of the session guard
//!
//! Collaborating services call these endpoints for authorization decisions
//! and session lifecycle operations. Every failed validation goes through
//! the recovery engine before a response leaves the process.

use std::sync::Arc;
use std::time::Instant;

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::{
    AuthError, AuthErrorCode, ErrorContext, ErrorHandler, RecoveryOutcome,
};
use crate::models::{Role, SessionData, TimeoutState};
use crate::monitoring::Monitoring;
use crate::session::storage::CredentialWrite;
use crate::session::validator::{SessionPolicy, SessionValidator};
use crate::timeout::TimeoutManager;
use crate::utils::headers::{apply_session_metadata, request_id, SessionMetadata};
use crate::utils::responses::ResponseBuilder;

/// Shared application state injected into every handler
pub struct GuardState {
    pub validator: Arc<SessionValidator>,
    pub error_handler: Arc<ErrorHandler>,
    pub timeout: Arc<TimeoutManager>,
    pub monitoring: Arc<Monitoring>,
    pub sign_in_path: String,
}

/// Route registration, mounted by `main` and the integration tests
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/session")
            .route("/validate", web::post().to(validate))
            .route("/refresh", web::post().to(refresh))
            .route("/heartbeat", web::post().to(heartbeat))
            .route("/sign_out", web::post().to(sign_out))
            .route("/info", web::get().to(info)),
    )
    .route("/ping", web::get().to(ping));
}

// ============================================================================
// Request/response bodies
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidatePayload {
    pub require_auth: bool,
    pub require_role: Vec<Role>,
    pub require_email_verified: bool,
    pub allow_anonymous: bool,
    /// Original request target, echoed into re-auth challenges
    pub target: Option<String>,
}

impl ValidatePayload {
    fn policy(&self) -> SessionPolicy {
        SessionPolicy {
            require_auth: self.require_auth,
            require_role: self.require_role.clone(),
            require_email_verified: self.require_email_verified,
            allow_anonymous: self.allow_anonymous,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionFacts {
    subject_id: String,
    email: String,
    email_verified: bool,
    role: Role,
    session_id: String,
    expires_at: chrono::DateTime<Utc>,
    last_activity: chrono::DateTime<Utc>,
}

impl SessionFacts {
    fn from_session(session: &SessionData) -> Self {
        Self {
            subject_id: session.subject_id.clone(),
            email: session.email.clone(),
            email_verified: session.email_verified,
            role: session.role,
            session_id: session.session_id.clone(),
            expires_at: session.expires_at,
            last_activity: session.last_activity,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionFacts>,
    needs_refresh: bool,
    refreshed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<TimeoutState>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Authorization decision endpoint
async fn validate(
    req: HttpRequest,
    state: web::Data<GuardState>,
    payload: web::Json<ValidatePayload>,
) -> HttpResponse {
    let started = Instant::now();
    let policy = payload.policy();
    let target = payload
        .target
        .clone()
        .unwrap_or_else(|| req.path().to_string());

    match state.validator.validate_request(&req, &policy).await {
        Ok(ctx) => {
            if let Some(session) = &ctx.session {
                state
                    .timeout
                    .start_monitoring(&session.session_id, &session.subject_id);
            }
            let body = ValidateResponse {
                valid: true,
                session: ctx.session.as_ref().map(SessionFacts::from_session),
                needs_refresh: ctx.needs_refresh,
                refreshed: ctx.refreshed,
                timeout: ctx.timeout,
            };
            success_response(&req, &body, ctx.session.as_ref(), ctx.timeout, ctx.write, started)
        }
        Err(err) => {
            recover(&state, &req, err, &target, started).await
        }
    }
}

/// Explicit renewal of the presented credential
async fn refresh(req: HttpRequest, state: web::Data<GuardState>) -> HttpResponse {
    let started = Instant::now();
    match state.validator.refresh_session(&req).await {
        Ok((session, write)) => {
            state
                .timeout
                .start_monitoring(&session.session_id, &session.subject_id);
            let timeout = TimeoutState::compute(&session, state.validator.budgets(), Utc::now());
            let body = ValidateResponse {
                valid: true,
                session: Some(SessionFacts::from_session(&session)),
                needs_refresh: false,
                refreshed: true,
                timeout: Some(timeout),
            };
            success_response(&req, &body, Some(&session), Some(timeout), Some(write), started)
        }
        Err(err) => {
            let target = req.path().to_string();
            recover(&state, &req, err, &target, started).await
        }
    }
}

/// Cheap activity bump; no verification, no policy
async fn heartbeat(req: HttpRequest, state: web::Data<GuardState>) -> HttpResponse {
    let Some(retrieved) = state.validator.chain().retrieve(&req) else {
        return ResponseBuilder::unauthorized();
    };
    let Ok(envelope) = state.validator.store().open_envelope(&retrieved.sealed) else {
        return ResponseBuilder::unauthorized();
    };

    let bumped = state.validator.store().update_activity(&envelope.session_id);
    ResponseBuilder::ok_with_write(
        &serde_json::json!({ "acknowledged": true, "tracked": bumped }),
        None,
    )
}

/// Explicit sign-out: clears every storage slot and stops monitoring
async fn sign_out(req: HttpRequest, state: web::Data<GuardState>) -> HttpResponse {
    if let Some(retrieved) = state.validator.chain().retrieve(&req) {
        if let Ok(envelope) = state.validator.store().open_envelope(&retrieved.sealed) {
            state.timeout.stop_monitoring(&envelope.session_id);
        }
    }
    let clear = state.validator.invalidate_session(&req);
    ResponseBuilder::ok_with_write(&serde_json::json!({ "signedOut": true }), Some(clear))
}

/// Identity facts for the current session
async fn info(req: HttpRequest, state: web::Data<GuardState>) -> HttpResponse {
    let started = Instant::now();
    match state.validator.validate_session(&req).await {
        Ok(result) => {
            let timeout =
                TimeoutState::compute(&result.session, state.validator.budgets(), Utc::now());
            let body = ValidateResponse {
                valid: true,
                session: Some(SessionFacts::from_session(&result.session)),
                needs_refresh: result.needs_refresh,
                refreshed: false,
                timeout: Some(timeout),
            };
            success_response(&req, &body, Some(&result.session), Some(timeout), None, started)
        }
        Err(err) => {
            let target = req.path().to_string();
            recover(&state, &req, err, &target, started).await
        }
    }
}

/// Health verdict from monitoring
async fn ping(state: web::Data<GuardState>) -> HttpResponse {
    let snapshot = state
        .monitoring
        .snapshot(state.validator.store().cached_count());
    let status = match snapshot.health {
        crate::monitoring::HealthVerdict::Unhealthy => {
            actix_web::http::StatusCode::SERVICE_UNAVAILABLE
        }
        _ => actix_web::http::StatusCode::OK,
    };
    actix_web::HttpResponseBuilder::new(status).json(snapshot)
}

// ============================================================================
// Shared plumbing
// ============================================================================

fn success_response<T: Serialize>(
    req: &HttpRequest,
    body: &T,
    session: Option<&SessionData>,
    timeout: Option<TimeoutState>,
    write: Option<CredentialWrite>,
    started: Instant,
) -> HttpResponse {
    let meta = SessionMetadata {
        user_id: session.map(|s| s.subject_id.clone()),
        role: session.map(|s| s.role.to_string()),
        valid: true,
        time_remaining_secs: timeout.map(|t| t.time_remaining_secs),
        time_until_warning_secs: timeout.map(|t| t.time_until_warning_secs),
        active: timeout.map(|t| t.is_active),
        warnings: 0,
        errors: 0,
    };

    let mut builder = HttpResponse::Ok();
    if let Some(write) = write {
        write.apply(&mut builder);
    }
    apply_session_metadata(&mut builder, &meta, &request_id(req), started);
    builder.json(body)
}

/// Feed a pipeline failure to the recovery engine and render the outcome
async fn recover(
    state: &web::Data<GuardState>,
    req: &HttpRequest,
    err: AuthError,
    target: &str,
    started: Instant,
) -> HttpResponse {
    let session = state
        .validator
        .chain()
        .retrieve(req)
        .and_then(|r| state.validator.store().open_envelope(&r.sealed).ok())
        .and_then(|e| state.validator.store().cached_stale(&e.session_id));

    let ctx = ErrorContext {
        code: err.code,
        detail: err.detail.clone(),
        identity: ErrorContext::identity_for(
            session.as_ref().map(|s| s.session_id.as_str()),
            session.as_ref().map(|s| s.subject_id.as_str()),
        ),
        session,
        request_id: request_id(req),
        target: target.to_string(),
        occurred_at: Utc::now(),
    };

    match state.error_handler.handle(req, &ctx).await {
        RecoveryOutcome::PassThrough { session, write } => {
            let timeout = TimeoutState::compute(&session, state.validator.budgets(), Utc::now());
            state
                .timeout
                .start_monitoring(&session.session_id, &session.subject_id);
            let body = ValidateResponse {
                valid: true,
                session: Some(SessionFacts::from_session(&session)),
                needs_refresh: false,
                refreshed: true,
                timeout: Some(timeout),
            };
            success_response(req, &body, Some(&session), Some(timeout), write, started)
        }
        RecoveryOutcome::Challenge { code, target, clear } => {
            ResponseBuilder::reauth_challenge(&state.sign_in_path, code, &target, clear)
        }
        RecoveryOutcome::RateLimited { retry_after } => {
            let limited = ErrorContext {
                code: AuthErrorCode::RateLimited,
                ..ctx
            };
            ResponseBuilder::error(&limited, Some(retry_after))
        }
        RecoveryOutcome::Unrecovered => ResponseBuilder::error(&ctx, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorRateLimiter;
    use crate::models::TimeoutBudgets;
    use crate::session::storage::StorageChain;
    use crate::session::store::SessionStore;
    use crate::testing::{constants, MockVerifier};
    use crate::utils::crypto;
    use actix_web::{test, App};

    fn guard_state() -> GuardState {
        let store = Arc::new(SessionStore::new(
            crypto::derive_encryption_key(constants::TEST_ENCRYPTION_KEY),
            chrono::Duration::hours(8),
            chrono::Duration::hours(12),
            chrono::Duration::minutes(5),
        ));
        let validator = Arc::new(SessionValidator::new(
            Arc::clone(&store),
            Arc::new(StorageChain::standard(false)),
            Arc::new(MockVerifier::accepting()),
            None,
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
        let error_handler = Arc::new(ErrorHandler::new(
            Arc::clone(&validator),
            ErrorRateLimiter::default(),
        ));
        let timeout = Arc::new(TimeoutManager::new(
            store,
            *validator.budgets(),
            chrono::Duration::minutes(30),
            std::time::Duration::from_secs(30),
        ));
        GuardState {
            validator,
            error_handler,
            timeout,
            monitoring: Arc::new(Monitoring::default()),
            sign_in_path: "/auth/sign_in".to_string(),
        }
    }

    #[actix_web::test]
    async fn test_ping_reports_health() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(guard_state()))
                .configure(configure),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/ping").to_request())
            .await;
        assert!(resp.status().is_success());
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["health"], "healthy");
        assert_eq!(body["active_sessions"], 0);
    }

    #[actix_web::test]
    async fn test_validate_anonymous_allowed() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(guard_state()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/session/validate")
            .insert_header(("User-Agent", constants::TEST_USER_AGENT))
            .set_json(serde_json::json!({ "allowAnonymous": true }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["valid"], true);
        assert!(body["session"].is_null());
    }

    #[actix_web::test]
    async fn test_validate_without_session_challenges() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(guard_state()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/session/validate")
            .insert_header(("User-Agent", constants::TEST_USER_AGENT))
            .set_json(serde_json::json!({ "requireAuth": true, "target": "/orders/42" }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), actix_web::http::StatusCode::FOUND);
        let location = resp
            .headers()
            .get(actix_web::http::header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with("/auth/sign_in"));
        assert!(location.contains("error=NO_SESSION"));
        assert!(location.contains("target=/orders/42"));
    }

    #[actix_web::test]
    async fn test_heartbeat_without_credential_is_unauthorized() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(guard_state()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/session/heartbeat")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::UNAUTHORIZED);
    }
}
