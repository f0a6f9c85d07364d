//! Mock collaborators

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{AuthError, AuthErrorCode};
use crate::models::Claims;
use crate::session::storage::{CredentialWrite, SessionStorageBackend};
use crate::testing::TestFixtures;
use crate::verifier::CredentialSource;

/// Credential source with scripted behavior and a call counter
pub struct MockVerifier {
    claims: Claims,
    fail_with: Option<AuthErrorCode>,
    calls: Arc<AtomicUsize>,
}

impl MockVerifier {
    /// Accepts any credential as the standard test subject
    #[must_use]
    pub fn accepting() -> Self {
        Self::returning(TestFixtures::claims())
    }

    /// Accepts any credential as the given claims
    #[must_use]
    pub fn returning(claims: Claims) -> Self {
        Self {
            claims,
            fail_with: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fails every verification with the given code
    #[must_use]
    pub fn failing(code: AuthErrorCode) -> Self {
        Self {
            claims: TestFixtures::claims(),
            fail_with: Some(code),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of verification calls
    #[must_use]
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl CredentialSource for MockVerifier {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn verify(&self, _raw: &str) -> Result<Claims, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(code) => Err(AuthError::new(code)),
            None => Ok(self.claims.clone()),
        }
    }
}

/// Storage backend that reports itself unavailable
///
/// Exercises the chain's fall-through on a broken primary slot.
pub struct UnavailableBackend;

impl SessionStorageBackend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn retrieve(&self, _req: &actix_web::HttpRequest) -> Option<String> {
        None
    }

    fn persist(
        &self,
        _req: &actix_web::HttpRequest,
        _sealed: &str,
        _max_age_secs: i64,
    ) -> CredentialWrite {
        CredentialWrite::default()
    }

    fn clear(&self, _req: &actix_web::HttpRequest) -> CredentialWrite {
        CredentialWrite::default()
    }
}
