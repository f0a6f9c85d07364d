//! Credential verification boundary
//!
//! Wraps calls to the external identity providers behind the
//! [`CredentialSource`] trait so the validator's cross-check logic is a
//! plain iteration over sources rather than type-specific branching. The
//! only network-bound operation in the pipeline lives here.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::{AuthError, AuthErrorCode};
use crate::models::{Claims, Role};

/// A source that can turn an opaque credential into a decoded claim set
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Source name for logging and cross-check reporting
    fn name(&self) -> &'static str;

    /// Verify a raw credential and decode the principal's claims
    ///
    /// # Errors
    ///
    /// Returns `VerificationFailed` for transport failures, timeouts, and
    /// undecodable responses; `RevokedSession` when the provider reports
    /// the credential as revoked.
    async fn verify(&self, raw: &str) -> Result<Claims, AuthError>;
}

/// Wire shape of a provider verification response
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    sub: String,
    email: String,
    #[serde(default)]
    email_verified: bool,
    role: String,
    #[serde(default)]
    claims: serde_json::Map<String, serde_json::Value>,
    /// Credential expiry as a unix timestamp, if the provider reports one
    exp: Option<i64>,
    #[serde(default)]
    revoked: bool,
}

/// HTTP verifier for a token-introspection style provider endpoint
///
/// Posts the raw credential and decodes the claim set from the JSON reply.
/// The request timeout is a hard bound; hitting it maps to
/// `VerificationFailed` rather than hanging the request pipeline.
pub struct HttpVerifier {
    name: &'static str,
    endpoint: url::Url,
    client: reqwest::Client,
}

impl HttpVerifier {
    /// Build a verifier against a provider endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint URL is invalid or the HTTP client
    /// cannot be constructed.
    pub fn new(name: &'static str, endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = url::Url::parse(endpoint)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            name,
            endpoint,
            client,
        })
    }

    fn decode(&self, body: VerifyResponse) -> Result<Claims, AuthError> {
        if body.revoked {
            return Err(AuthError::with_detail(
                AuthErrorCode::RevokedSession,
                format!("{} reported credential revoked", self.name),
            ));
        }

        // Unknown role strings fail closed at the boundary so Role stays a
        // closed enum everywhere downstream
        let role: Role = body.role.parse().map_err(|e: String| {
            AuthError::with_detail(AuthErrorCode::VerificationFailed, e)
        })?;

        let expires_at = body.exp.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

        Ok(Claims {
            subject_id: body.sub,
            email: body.email,
            email_verified: body.email_verified,
            role,
            custom_claims: body.claims,
            expires_at,
        })
    }
}

#[async_trait]
impl CredentialSource for HttpVerifier {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn verify(&self, raw: &str) -> Result<Claims, AuthError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&serde_json::json!({ "token": raw }))
            .send()
            .await
            .map_err(|e| {
                let detail = if e.is_timeout() {
                    format!("{} verification timed out", self.name)
                } else {
                    format!("{} verification transport error: {e}", self.name)
                };
                AuthError::with_detail(AuthErrorCode::VerificationFailed, detail)
            })?;

        let status = response.status();
        if !status.is_success() {
            log::warn!(
                "Credential verification against {} failed with status {status}",
                self.name
            );
            return Err(AuthError::with_detail(
                AuthErrorCode::VerificationFailed,
                format!("{} returned {status}", self.name),
            ));
        }

        let body: VerifyResponse = response.json().await.map_err(|e| {
            AuthError::with_detail(
                AuthErrorCode::VerificationFailed,
                format!("{} returned undecodable body: {e}", self.name),
            )
        })?;

        self.decode(body)
    }
}
