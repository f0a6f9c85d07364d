use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Principal role attached to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Staff => "staff",
            Self::Admin => "admin",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Self::Customer),
            "staff" => Ok(Self::Staff),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded principal claim set returned by a credential source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub subject_id: String,
    pub email: String,
    pub email_verified: bool,
    pub role: Role,
    /// Opaque claims passed through from the identity provider
    #[serde(default)]
    pub custom_claims: serde_json::Map<String, serde_json::Value>,
    /// Credential expiry as reported by the provider, if any
    pub expires_at: Option<DateTime<Utc>>,
}

/// The canonical session entity
///
/// Created only after successful primary-credential verification. Mutated in
/// place by activity updates and refresh; destroyed by invalidation, expiry,
/// or inactivity. Invariants: `created_at <= last_activity`,
/// `expires_at > created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub subject_id: String,
    pub email: String,
    pub email_verified: bool,
    pub role: Role,
    #[serde(default)]
    pub custom_claims: serde_json::Map<String, serde_json::Value>,
    /// Opaque key derived from the stored credential; keys the cache and
    /// the timeout monitor
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_credential: Option<String>,
}

impl SessionData {
    /// Build a session from verified claims
    #[must_use]
    pub fn from_claims(claims: Claims, session_id: String, window: Duration) -> Self {
        let now = Utc::now();
        // The provider's own expiry caps the session window when shorter
        let expires_at = match claims.expires_at {
            Some(provider_expiry) if provider_expiry < now + window => provider_expiry,
            _ => now + window,
        };

        Self {
            subject_id: claims.subject_id,
            email: claims.email,
            email_verified: claims.email_verified,
            role: claims.role,
            custom_claims: claims.custom_claims,
            session_id,
            created_at: now,
            expires_at,
            last_activity: now,
            refresh_credential: None,
        }
    }

    /// Remaining time until explicit expiry; zero when already expired
    #[must_use]
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// Whether the session is inside the refresh window before expiry
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>, refresh_threshold: Duration) -> bool {
        self.expires_at - now <= refresh_threshold
    }

    /// Derive the opaque session id from the credential and creation instant
    ///
    /// The id is stable for the lifetime of the stored credential envelope,
    /// so cache entries and timeout monitors survive re-verification.
    #[must_use]
    pub fn derive_session_id(subject_id: &str, issued_at: DateTime<Utc>, nonce: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(subject_id.as_bytes());
        hasher.update(b"|");
        hasher.update(issued_at.timestamp_millis().to_le_bytes());
        hasher.update(b"|");
        hasher.update(nonce.as_bytes());
        let digest = hasher.finalize();
        use std::fmt::Write as _;
        let mut id = String::with_capacity(32);
        for byte in digest.iter().take(16) {
            let _ = write!(id, "{byte:02x}");
        }
        id
    }
}

/// Sealed contents of the opaque session credential
///
/// This is what gets AES-GCM encrypted and handed to the client through the
/// storage chain. The raw provider credential rides inside so validation can
/// re-verify it when the cache entry has aged out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEnvelope {
    pub credential: String,
    pub session_id: String,
    pub subject_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_credential: Option<String>,
}

/// Per-session timeout picture, derived on every poll and never persisted
///
/// The effective remaining time is the minimum of three independent budgets:
/// the inactivity window, the absolute-age ceiling, and the explicit expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeoutState {
    pub is_active: bool,
    /// Effective remaining time in seconds
    pub time_remaining_secs: i64,
    /// Seconds until the warning threshold is crossed; zero when already past
    pub time_until_warning_secs: i64,
}

/// The independent timeout budgets plus the warning threshold
#[derive(Debug, Clone, Copy)]
pub struct TimeoutBudgets {
    pub inactivity: Duration,
    pub absolute_age: Duration,
    pub warning_threshold: Duration,
}

impl TimeoutState {
    /// Recompute the timeout state from session data
    ///
    /// Level-triggered: each call derives the full state from scratch, so a
    /// missed poll cannot desynchronize anything.
    #[must_use]
    pub fn compute(session: &SessionData, budgets: &TimeoutBudgets, now: DateTime<Utc>) -> Self {
        let until_expiry = session.expires_at - now;
        let until_inactive = session.last_activity + budgets.inactivity - now;
        let until_max_age = session.created_at + budgets.absolute_age - now;

        let remaining = until_expiry.min(until_inactive).min(until_max_age);
        let is_active = remaining > Duration::zero();
        let until_warning = (remaining - budgets.warning_threshold).max(Duration::zero());

        Self {
            is_active,
            time_remaining_secs: remaining.num_seconds().max(0),
            time_until_warning_secs: until_warning.num_seconds(),
        }
    }
}

/// Lifecycle event kinds observed by monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEventKind {
    Created,
    Validated,
    Refreshed,
    Expired,
    Error,
    Timeout,
}

/// Append-only lifecycle event; feeds monitoring only and never drives
/// authorization decisions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session_id: String,
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl SessionEvent {
    #[must_use]
    pub fn new(kind: SessionEventKind, session_id: &str, subject_id: &str) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            subject_id: subject_id.to_string(),
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_offsets(
        created_mins_ago: i64,
        activity_mins_ago: i64,
        expires_in_mins: i64,
    ) -> SessionData {
        let now = Utc::now();
        SessionData {
            subject_id: "user-1".to_string(),
            email: "user@example.com".to_string(),
            email_verified: true,
            role: Role::Customer,
            custom_claims: serde_json::Map::new(),
            session_id: "sess-1".to_string(),
            created_at: now - Duration::minutes(created_mins_ago),
            expires_at: now + Duration::minutes(expires_in_mins),
            last_activity: now - Duration::minutes(activity_mins_ago),
            refresh_credential: None,
        }
    }

    fn default_budgets() -> TimeoutBudgets {
        TimeoutBudgets {
            inactivity: Duration::hours(1),
            absolute_age: Duration::hours(12),
            warning_threshold: Duration::minutes(5),
        }
    }

    #[test]
    fn test_role_round_trip() {
        for role in [Role::Customer, Role::Staff, Role::Admin] {
            let parsed: Role = role.as_str().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("superuser".parse::<Role>().is_err());
    }

    #[test]
    fn test_session_id_derivation_is_deterministic() {
        let at = Utc::now();
        let a = SessionData::derive_session_id("user-1", at, "nonce");
        let b = SessionData::derive_session_id("user-1", at, "nonce");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let c = SessionData::derive_session_id("user-2", at, "nonce");
        assert_ne!(a, c);
    }

    #[test]
    fn test_timeout_state_active_when_all_budgets_have_room() {
        let session = session_with_offsets(10, 1, 60);
        let state = TimeoutState::compute(&session, &default_budgets(), Utc::now());
        assert!(state.is_active);
        assert!(state.time_remaining_secs > 0);
    }

    #[test]
    fn test_timeout_state_effective_remaining_is_minimum_of_budgets() {
        // Expiry in 8h but inactivity budget leaves only ~30 minutes
        let session = session_with_offsets(60, 30, 480);
        let state = TimeoutState::compute(&session, &default_budgets(), Utc::now());
        assert!(state.is_active);
        assert!(state.time_remaining_secs <= 30 * 60);
        assert!(state.time_remaining_secs > 29 * 60);
    }

    #[test]
    fn test_timeout_state_inactive_iff_some_budget_exhausted() {
        let budgets = default_budgets();

        // Inactivity budget exhausted (61 minutes idle)
        let idle = session_with_offsets(70, 61, 60);
        assert!(!TimeoutState::compute(&idle, &budgets, Utc::now()).is_active);

        // Absolute age exhausted (created 13h ago, active otherwise)
        let ancient = session_with_offsets(13 * 60, 1, 60);
        assert!(!TimeoutState::compute(&ancient, &budgets, Utc::now()).is_active);

        // Explicit expiry exhausted
        let expired = session_with_offsets(10, 1, -1);
        assert!(!TimeoutState::compute(&expired, &budgets, Utc::now()).is_active);
    }

    #[test]
    fn test_timeout_state_randomized_clock_advancement() {
        // Property: is_active == false iff at least one budget is exhausted,
        // checked across a sweep of clock offsets
        let budgets = default_budgets();
        let session = session_with_offsets(0, 0, 8 * 60);
        let base = Utc::now();

        for advance_mins in [0_i64, 7, 31, 59, 60, 61, 119, 300, 721, 1000] {
            let now = base + Duration::minutes(advance_mins);
            let state = TimeoutState::compute(&session, &budgets, now);

            let expiry_gone = now >= session.expires_at;
            let inactivity_gone = now >= session.last_activity + budgets.inactivity;
            let age_gone = now >= session.created_at + budgets.absolute_age;
            let any_exhausted = expiry_gone || inactivity_gone || age_gone;

            assert_eq!(
                state.is_active, !any_exhausted,
                "mismatch at +{advance_mins}m"
            );
        }
    }

    #[test]
    fn test_needs_refresh_threshold() {
        let now = Utc::now();
        let mut session = session_with_offsets(0, 0, 8 * 60);

        assert!(!session.needs_refresh(now, Duration::minutes(30)));

        // 15 minutes of life left: inside the 30-minute refresh window
        session.expires_at = now + Duration::minutes(15);
        assert!(session.needs_refresh(now, Duration::minutes(30)));
    }

    #[test]
    fn test_from_claims_caps_window_at_provider_expiry() {
        let now = Utc::now();
        let claims = Claims {
            subject_id: "user-1".to_string(),
            email: "user@example.com".to_string(),
            email_verified: true,
            role: Role::Customer,
            custom_claims: serde_json::Map::new(),
            expires_at: Some(now + Duration::hours(1)),
        };

        let session = SessionData::from_claims(claims, "sess-1".to_string(), Duration::hours(8));
        assert!(session.expires_at <= now + Duration::hours(1) + Duration::seconds(1));
    }
}
