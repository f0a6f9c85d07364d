//! Canonical test data
//!
//! Sessions with non-default timing are built by shifting timestamps, not
//! by mocking clocks: a session "idle for 61 minutes" is simply one whose
//! `last_activity` lies 61 minutes in the past.

use chrono::{Duration, Utc};

use crate::models::{Claims, CredentialEnvelope, Role, SessionData};
use crate::testing::constants;

pub struct TestFixtures;

impl TestFixtures {
    /// Verified claims for the standard test subject
    #[must_use]
    pub fn claims() -> Claims {
        Claims {
            subject_id: constants::TEST_SUBJECT_ID.to_string(),
            email: constants::TEST_EMAIL.to_string(),
            email_verified: true,
            role: Role::Customer,
            custom_claims: serde_json::Map::new(),
            expires_at: None,
        }
    }

    /// A healthy session created just now with an 8-hour window
    #[must_use]
    pub fn session() -> SessionData {
        Self::session_with_offsets(0, 0, 8 * 60)
    }

    /// A session whose every budget is exhausted
    #[must_use]
    pub fn expired_session() -> SessionData {
        Self::session_with_offsets(13 * 60, 2 * 60, -60)
    }

    /// Session with timestamps shifted relative to now (all in minutes)
    #[must_use]
    pub fn session_with_offsets(
        created_mins_ago: i64,
        activity_mins_ago: i64,
        expires_in_mins: i64,
    ) -> SessionData {
        let now = Utc::now();
        let claims = Self::claims();
        SessionData {
            subject_id: claims.subject_id,
            email: claims.email,
            email_verified: claims.email_verified,
            role: claims.role,
            custom_claims: claims.custom_claims,
            session_id: format!("sess-{}", uuid::Uuid::new_v4().simple()),
            created_at: now - Duration::minutes(created_mins_ago),
            expires_at: now + Duration::minutes(expires_in_mins),
            last_activity: now - Duration::minutes(activity_mins_ago),
            refresh_credential: None,
        }
    }

    /// The envelope that would have sealed this session's credential
    #[must_use]
    pub fn envelope_for(session: &SessionData) -> CredentialEnvelope {
        CredentialEnvelope {
            credential: "raw-cred".to_string(),
            session_id: session.session_id.clone(),
            subject_id: session.subject_id.clone(),
            issued_at: session.created_at,
            expires_at: session.expires_at,
            refresh_credential: session.refresh_credential.clone(),
        }
    }
}
