//! Session lifecycle operations
//!
//! [`SessionStore`] owns the encryption key, the verified-session cache, and
//! the lifecycle event channel. Everything that creates, renews, or destroys
//! a session goes through here so the cache, the sealed envelope, and the
//! event stream never disagree.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::broadcast;

use crate::errors::{AuthError, AuthErrorCode};
use crate::models::{
    Claims, CredentialEnvelope, SessionData, SessionEvent, SessionEventKind,
};
use crate::session::cache::SessionCache;
use crate::utils::crypto;

/// Lifecycle event channel capacity; laggy monitors drop old events rather
/// than backpressuring the request path
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct SessionStore {
    encryption_key: [u8; crypto::ENCRYPTION_KEY_SIZE],
    cache: SessionCache,
    /// Nominal session window granted at creation and on refresh
    window: Duration,
    /// Hard ceiling on total session age; refresh never extends past it
    absolute_age: Duration,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    #[must_use]
    pub fn new(
        encryption_key: [u8; crypto::ENCRYPTION_KEY_SIZE],
        window: Duration,
        absolute_age: Duration,
        cache_ttl: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            encryption_key,
            cache: SessionCache::new(cache_ttl),
            window,
            absolute_age,
            events,
        }
    }

    /// Subscribe to the lifecycle event stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Emit a lifecycle event; silently dropped when nobody listens
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a session from verified claims and seal its credential envelope
    ///
    /// The session id is derived from the subject and creation instant so it
    /// stays stable for the envelope's lifetime. The new session is cached
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if sealing the envelope fails.
    pub fn create_session(
        &self,
        claims: Claims,
        raw_credential: String,
        refresh_credential: Option<String>,
    ) -> Result<(SessionData, String), AuthError> {
        let now = Utc::now();
        let nonce = crypto::generate_nonce(16);
        let session_id = SessionData::derive_session_id(&claims.subject_id, now, &nonce);

        let mut session = SessionData::from_claims(claims, session_id.clone(), self.window);
        session.refresh_credential.clone_from(&refresh_credential);

        let envelope = CredentialEnvelope {
            credential: raw_credential,
            session_id: session_id.clone(),
            subject_id: session.subject_id.clone(),
            issued_at: session.created_at,
            expires_at: session.expires_at,
            refresh_credential,
        };
        let sealed = self.seal_envelope(&envelope)?;

        self.cache.insert(session.clone());
        self.emit(SessionEvent::new(
            SessionEventKind::Created,
            &session_id,
            &session.subject_id,
        ));
        log::info!(
            "Session created for subject {} (expires {})",
            session.subject_id,
            session.expires_at
        );

        Ok((session, sealed))
    }

    // ========================================================================
    // Envelope sealing
    // ========================================================================

    /// Seal an envelope into the opaque client-side token
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` when encryption fails; that is an internal
    /// fault, never the caller's.
    pub fn seal_envelope(&self, envelope: &CredentialEnvelope) -> Result<String, AuthError> {
        crypto::seal(envelope, &self.encryption_key).map_err(|e| {
            AuthError::with_detail(AuthErrorCode::ValidationError, format!("seal failed: {e}"))
        })
    }

    /// Open a sealed token back into its envelope
    ///
    /// # Errors
    ///
    /// Returns `MalformedSession` for anything that does not decrypt to a
    /// valid envelope: tampering, truncation, or a foreign key.
    pub fn open_envelope(&self, sealed: &str) -> Result<CredentialEnvelope, AuthError> {
        crypto::open(sealed, &self.encryption_key).map_err(|e| {
            AuthError::with_detail(
                AuthErrorCode::MalformedSession,
                format!("envelope rejected: {e}"),
            )
        })
    }

    // ========================================================================
    // Renewal
    // ========================================================================

    /// Extend a session's window and reseal its envelope
    ///
    /// The new expiry is `now + window`, capped by the absolute-age ceiling
    /// measured from creation. Renewal is monotonic: a concurrent refresh
    /// can never pull the expiry earlier than it already is.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if resealing fails.
    pub fn refresh_session(
        &self,
        session: &mut SessionData,
        envelope: &mut CredentialEnvelope,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let ceiling = session.created_at + self.absolute_age;
        let new_expiry = (now + self.window).min(ceiling).max(session.expires_at);

        session.expires_at = new_expiry;
        session.last_activity = now;
        envelope.expires_at = new_expiry;
        let sealed = self.seal_envelope(envelope)?;

        self.cache.insert(session.clone());
        self.emit(SessionEvent::new(
            SessionEventKind::Refreshed,
            &session.session_id,
            &session.subject_id,
        ));
        log::info!(
            "Session {} refreshed for subject {} (expires {})",
            session.session_id,
            session.subject_id,
            new_expiry
        );

        Ok(sealed)
    }

    // ========================================================================
    // Activity and teardown
    // ========================================================================

    /// Record caller activity against a cached session
    ///
    /// Returns false when the session is not cached; the caller decides
    /// whether that matters.
    pub fn update_activity(&self, session_id: &str) -> bool {
        self.cache.update_activity(session_id, Utc::now())
    }

    /// Drop the local footprint of a session: cache entry plus an event
    ///
    /// Client-side credential slots cannot be cleared from here; that
    /// happens on the next request that touches the storage chain.
    pub fn invalidate_local(&self, session_id: &str, subject_id: &str, kind: SessionEventKind) {
        self.cache.evict(session_id);
        self.emit(SessionEvent::new(kind, session_id, subject_id));
        log::info!("Session {session_id} invalidated locally for subject {subject_id}");
    }

    // ========================================================================
    // Cache access
    // ========================================================================

    /// Fresh cached session, if inside the cache TTL
    #[must_use]
    pub fn cached(&self, session_id: &str) -> Option<SessionData> {
        self.cache.get(session_id)
    }

    /// Cached session regardless of TTL, for the inactivity check
    #[must_use]
    pub fn cached_stale(&self, session_id: &str) -> Option<SessionData> {
        self.cache.get_stale(session_id)
    }

    /// Insert a re-verified session, resetting its cache TTL
    pub fn cache_session(&self, session: SessionData) {
        self.cache.insert(session);
    }

    /// Sweep dead sessions out of the cache
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Run the cache sweep on an interval until the handle is aborted
    pub fn spawn_purge_task(
        self: &Arc<Self>,
        every: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let purged = store.purge_expired();
                if purged > 0 {
                    log::debug!("Purged {purged} dead sessions from cache");
                }
            }
        })
    }

    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{constants, TestFixtures};

    fn store() -> SessionStore {
        SessionStore::new(
            crypto::derive_encryption_key(constants::TEST_ENCRYPTION_KEY),
            Duration::hours(8),
            Duration::hours(12),
            Duration::minutes(5),
        )
    }

    #[test]
    fn test_create_then_open_round_trip() {
        let store = store();
        let (session, sealed) = store
            .create_session(TestFixtures::claims(), "raw-cred".to_string(), None)
            .unwrap();

        let envelope = store.open_envelope(&sealed).unwrap();
        assert_eq!(envelope.session_id, session.session_id);
        assert_eq!(envelope.subject_id, session.subject_id);
        assert_eq!(envelope.credential, "raw-cred");

        // Created sessions are cached immediately
        assert!(store.cached(&session.session_id).is_some());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let store = store();
        let err = store.open_envelope("not-a-real-token").unwrap_err();
        assert_eq!(err.code, AuthErrorCode::MalformedSession);
    }

    #[test]
    fn test_refresh_extends_but_respects_age_ceiling() {
        let store = store();
        let mut session = TestFixtures::session();
        // Session created 11h ago: only 1h of ceiling headroom left
        session.created_at = Utc::now() - Duration::hours(11);
        session.expires_at = Utc::now() + Duration::minutes(10);
        let mut envelope = TestFixtures::envelope_for(&session);

        let _ = store.refresh_session(&mut session, &mut envelope).unwrap();

        let ceiling = session.created_at + Duration::hours(12);
        assert_eq!(session.expires_at, ceiling);
        assert_eq!(envelope.expires_at, ceiling);
    }

    #[test]
    fn test_refresh_is_monotonic() {
        let store = store();
        let mut session = TestFixtures::session();
        let mut envelope = TestFixtures::envelope_for(&session);

        let _ = store.refresh_session(&mut session, &mut envelope).unwrap();
        let first_expiry = session.expires_at;

        // A second immediate refresh may extend but never shrink
        let _ = store.refresh_session(&mut session, &mut envelope).unwrap();
        assert!(session.expires_at >= first_expiry);
    }

    #[tokio::test]
    async fn test_purge_task_sweeps_dead_sessions() {
        let store = Arc::new(store());
        store.cache_session(TestFixtures::expired_session());
        assert_eq!(store.cached_count(), 1);

        let handle = store.spawn_purge_task(std::time::Duration::from_millis(10));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.cached_count(), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_broadcast() {
        let store = store();
        let mut rx = store.subscribe();

        let (session, _) = store
            .create_session(TestFixtures::claims(), "raw-cred".to_string(), None)
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, SessionEventKind::Created);
        assert_eq!(event.session_id, session.session_id);

        store.invalidate_local(
            &session.session_id,
            &session.subject_id,
            SessionEventKind::Expired,
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, SessionEventKind::Expired);
        assert!(store.cached(&session.session_id).is_none());
    }
}
