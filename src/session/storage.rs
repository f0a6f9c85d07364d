//! Session credential storage chain
//!
//! The sealed credential travels to the client through an ordered chain of
//! backends: the session cookie first, a bearer-style header for cookie-less
//! clients, and finally a server-side volatile slot keyed by the client
//! fingerprint. Retrieval walks the same order and takes the first hit;
//! invalidation clears every slot so no backend can resurrect a dead
//! session.

use std::collections::HashMap;
use std::sync::Mutex;

use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::{HttpRequest, HttpResponseBuilder};
use chrono::{DateTime, Utc};

use crate::utils::headers::client_fingerprint;

/// Cookie slot for the sealed session credential
pub const SESSION_COOKIE_NAME: &str = "doorman_session";

/// Header slot for clients that cannot carry cookies
pub const SESSION_HEADER_NAME: &str = "x-doorman-token";

/// Response-side artifacts produced by a persist or clear operation
///
/// Backends never touch the response directly; they hand back cookies and
/// headers for the handler to apply once the outcome is known.
#[derive(Debug, Clone, Default)]
pub struct CredentialWrite {
    pub cookies: Vec<Cookie<'static>>,
    pub headers: Vec<(&'static str, String)>,
}

impl CredentialWrite {
    /// Merge another write's artifacts into this one
    pub fn merge(&mut self, other: Self) {
        self.cookies.extend(other.cookies);
        self.headers.extend(other.headers);
    }

    /// Attach all artifacts to a response under construction
    pub fn apply(&self, builder: &mut HttpResponseBuilder) {
        for cookie in &self.cookies {
            builder.cookie(cookie.clone());
        }
        for (name, value) in &self.headers {
            builder.insert_header((*name, value.as_str()));
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.headers.is_empty()
    }
}

/// One slot in the storage chain
pub trait SessionStorageBackend: Send + Sync {
    /// Backend name for logging and the retrieval-source response metadata
    fn name(&self) -> &'static str;

    /// Whether the backend can currently accept writes
    fn is_available(&self) -> bool {
        true
    }

    /// Pull the sealed credential for this request, if this slot holds one
    fn retrieve(&self, req: &HttpRequest) -> Option<String>;

    /// Produce the artifacts that persist the sealed credential client-side,
    /// or store it server-side and return nothing to write
    fn persist(&self, req: &HttpRequest, sealed: &str, max_age_secs: i64) -> CredentialWrite;

    /// Produce the artifacts that clear this slot
    fn clear(&self, req: &HttpRequest) -> CredentialWrite;
}

// ============================================================================
// Cookie backend
// ============================================================================

/// Primary slot: `HttpOnly` session cookie
pub struct CookieBackend {
    secure: bool,
    domain: Option<String>,
}

impl CookieBackend {
    #[must_use]
    pub const fn new(secure: bool) -> Self {
        Self {
            secure,
            domain: None,
        }
    }

    /// Scope the cookie to a domain so sibling subdomains share the session
    #[must_use]
    pub fn with_domain(secure: bool, domain: Option<String>) -> Self {
        Self { secure, domain }
    }

    fn build_cookie(&self, value: String, max_age_secs: i64) -> Cookie<'static> {
        let mut builder = Cookie::build(SESSION_COOKIE_NAME, value)
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(CookieDuration::seconds(max_age_secs));
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.finish()
    }
}

impl SessionStorageBackend for CookieBackend {
    fn name(&self) -> &'static str {
        "cookie"
    }

    fn retrieve(&self, req: &HttpRequest) -> Option<String> {
        req.cookie(SESSION_COOKIE_NAME)
            .map(|c| c.value().to_string())
    }

    fn persist(&self, _req: &HttpRequest, sealed: &str, max_age_secs: i64) -> CredentialWrite {
        CredentialWrite {
            cookies: vec![self.build_cookie(sealed.to_string(), max_age_secs)],
            headers: Vec::new(),
        }
    }

    fn clear(&self, _req: &HttpRequest) -> CredentialWrite {
        CredentialWrite {
            cookies: vec![self.build_cookie(String::new(), 0)],
            headers: Vec::new(),
        }
    }
}

// ============================================================================
// Header backend
// ============================================================================

/// Fallback slot: credential carried in a request/response header pair
pub struct HeaderBackend;

impl SessionStorageBackend for HeaderBackend {
    fn name(&self) -> &'static str {
        "header"
    }

    fn retrieve(&self, req: &HttpRequest) -> Option<String> {
        req.headers()
            .get(SESSION_HEADER_NAME)
            .and_then(|h| h.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(std::string::ToString::to_string)
    }

    fn persist(&self, _req: &HttpRequest, sealed: &str, _max_age_secs: i64) -> CredentialWrite {
        CredentialWrite {
            cookies: Vec::new(),
            headers: vec![(SESSION_HEADER_NAME, sealed.to_string())],
        }
    }

    fn clear(&self, _req: &HttpRequest) -> CredentialWrite {
        CredentialWrite {
            cookies: Vec::new(),
            headers: vec![(SESSION_HEADER_NAME, String::new())],
        }
    }
}

// ============================================================================
// Volatile backend
// ============================================================================

struct VolatileEntry {
    sealed: String,
    expires_at: DateTime<Utc>,
}

/// Last-resort slot: server-side map keyed by the client fingerprint
///
/// Nothing is written to the response; the entry only survives as long as
/// the process and its own expiry. Used when both client-side slots are
/// unusable for a caller.
pub struct VolatileBackend {
    entries: Mutex<HashMap<String, VolatileEntry>>,
}

impl VolatileBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live entries, for monitoring
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VolatileBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStorageBackend for VolatileBackend {
    fn name(&self) -> &'static str {
        "volatile"
    }

    fn retrieve(&self, req: &HttpRequest) -> Option<String> {
        let key = client_fingerprint(req);
        let mut entries = self.entries.lock().ok()?;
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Utc::now() => Some(entry.sealed.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    fn persist(&self, req: &HttpRequest, sealed: &str, max_age_secs: i64) -> CredentialWrite {
        let key = client_fingerprint(req);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key,
                VolatileEntry {
                    sealed: sealed.to_string(),
                    expires_at: Utc::now() + chrono::Duration::seconds(max_age_secs),
                },
            );
        }
        CredentialWrite::default()
    }

    fn clear(&self, req: &HttpRequest) -> CredentialWrite {
        let key = client_fingerprint(req);
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&key);
        }
        CredentialWrite::default()
    }
}

// ============================================================================
// Storage chain
// ============================================================================

/// Sealed credential retrieved from the chain, tagged with its source
pub struct RetrievedCredential {
    pub sealed: String,
    pub source: &'static str,
}

/// Ordered chain of storage backends
///
/// Order is fixed at construction: cookie, header, volatile. Retrieval takes
/// the first slot that yields a credential; persistence writes through the
/// first available slot; clearing hits every slot unconditionally.
pub struct StorageChain {
    backends: Vec<Box<dyn SessionStorageBackend>>,
}

impl StorageChain {
    #[must_use]
    pub fn new(backends: Vec<Box<dyn SessionStorageBackend>>) -> Self {
        Self { backends }
    }

    /// Standard chain: cookie, then header, then volatile
    #[must_use]
    pub fn standard(secure_cookies: bool) -> Self {
        Self::standard_with_domain(secure_cookies, None)
    }

    /// Standard chain with the cookie slot scoped to a domain
    #[must_use]
    pub fn standard_with_domain(secure_cookies: bool, cookie_domain: Option<String>) -> Self {
        Self::new(vec![
            Box::new(CookieBackend::with_domain(secure_cookies, cookie_domain)),
            Box::new(HeaderBackend),
            Box::new(VolatileBackend::new()),
        ])
    }

    /// Walk the chain and take the first credential found
    #[must_use]
    pub fn retrieve(&self, req: &HttpRequest) -> Option<RetrievedCredential> {
        for backend in &self.backends {
            if let Some(sealed) = backend.retrieve(req) {
                log::debug!("Session credential retrieved from {} slot", backend.name());
                return Some(RetrievedCredential {
                    sealed,
                    source: backend.name(),
                });
            }
        }
        None
    }

    /// Persist through the first available backend
    ///
    /// Unavailable backends are skipped with a warning; the chain degrades
    /// rather than failing the request.
    #[must_use]
    pub fn persist(&self, req: &HttpRequest, sealed: &str, max_age_secs: i64) -> CredentialWrite {
        for backend in &self.backends {
            if backend.is_available() {
                return backend.persist(req, sealed, max_age_secs);
            }
            log::warn!(
                "Storage backend {} unavailable, falling back to next slot",
                backend.name()
            );
        }
        log::error!("No storage backend available to persist session credential");
        CredentialWrite::default()
    }

    /// Clear every slot in the chain
    #[must_use]
    pub fn clear_all(&self, req: &HttpRequest) -> CredentialWrite {
        let mut write = CredentialWrite::default();
        for backend in &self.backends {
            write.merge(backend.clear(req));
        }
        write
    }
}
