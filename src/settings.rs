//! Configuration loading
//!
//! Layered in the usual order: compiled defaults, then `Settings.toml`,
//! then a secrets directory, then environment variables. Every knob the
//! guard exposes lives here; the rest of the crate receives plain values
//! and never reads the environment itself.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::models::TimeoutBudgets;
use crate::utils::crypto;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DoormanSettings {
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub timeout: TimeoutSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub verifier: VerifierSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    /// Origins accepted by the transport check and CORS layer
    pub allowed_origins: Vec<String>,
    /// Sign-in page re-auth challenges redirect to
    pub sign_in_path: String,
    pub cookie_secure: bool,
    /// Domain attribute for the session cookie; host-only when unset
    pub cookie_domain: Option<String>,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            sign_in_path: "/auth/sign_in".to_string(),
            cookie_secure: true,
            cookie_domain: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Key material for the credential envelope; generated when empty
    pub session_secret: String,
    pub window_secs: i64,
    pub refresh_threshold_secs: i64,
    pub cache_ttl_secs: i64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_secret: String::new(),
            window_secs: 8 * 3600,
            refresh_threshold_secs: 30 * 60,
            cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub inactivity_secs: i64,
    pub absolute_age_secs: i64,
    pub warning_threshold_secs: i64,
    pub poll_interval_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            inactivity_secs: 3600,
            absolute_age_secs: 12 * 3600,
            warning_threshold_secs: 300,
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_secs: i64,
    pub threshold: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 300,
            threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierSettings {
    pub primary_endpoint: String,
    pub secondary_endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            primary_endpoint: "http://localhost:9000/verify".to_string(),
            secondary_endpoint: None,
            timeout_secs: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DoormanSettings {
    /// Load settings through all layers
    ///
    /// # Errors
    ///
    /// Returns an error when `Settings.toml` exists but does not parse, or
    /// the secrets directory is unreadable.
    pub fn load() -> anyhow::Result<Self> {
        let mut settings = if Path::new("Settings.toml").exists() {
            Self::from_file("Settings.toml")?
        } else {
            Self::default()
        };

        settings.apply_secrets_dir()?;
        settings.apply_env_overrides();
        settings.ensure_session_secret();
        Ok(settings)
    }

    /// Parse one TOML file into settings, defaults filling the gaps
    ///
    /// # Errors
    ///
    /// Returns an error when the file is unreadable or not valid TOML.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        basic_toml::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    /// Pull the session secret from `DOORMAN_SECRETS_DIR/session_secret`
    fn apply_secrets_dir(&mut self) -> anyhow::Result<()> {
        let Ok(dir) = env::var("DOORMAN_SECRETS_DIR") else {
            return Ok(());
        };
        let secret_path = Path::new(&dir).join("session_secret");
        if secret_path.exists() {
            let secret = fs::read_to_string(&secret_path).with_context(|| {
                format!("Failed to read secret file {}", secret_path.display())
            })?;
            self.session.session_secret = secret.trim().to_string();
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("DOORMAN_HOST") {
            self.application.host = host;
        }
        if let Ok(port) = env::var("DOORMAN_PORT") {
            if let Ok(port) = port.parse() {
                self.application.port = port;
            }
        }
        if let Ok(origins) = env::var("DOORMAN_ALLOWED_ORIGINS") {
            self.application.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Ok(domain) = env::var("DOORMAN_COOKIE_DOMAIN") {
            self.application.cookie_domain = Some(domain);
        }
        if let Ok(secret) = env::var("DOORMAN_SESSION_SECRET") {
            self.session.session_secret = secret;
        }
        if let Ok(endpoint) = env::var("DOORMAN_PRIMARY_VERIFIER_URL") {
            self.verifier.primary_endpoint = endpoint;
        }
        if let Ok(endpoint) = env::var("DOORMAN_SECONDARY_VERIFIER_URL") {
            self.verifier.secondary_endpoint = Some(endpoint);
        }
        if let Ok(level) = env::var("DOORMAN_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Generate a session secret when none was configured
    ///
    /// Generated secrets do not survive a restart; every session dies with
    /// the process, which is acceptable for development only.
    fn ensure_session_secret(&mut self) {
        if self.session.session_secret.is_empty() {
            self.session.session_secret = crypto::generate_nonce(32);
            log::warn!(
                "DOORMAN_SESSION_SECRET not configured, generated an ephemeral secret; \
                 sessions will not survive a restart"
            );
        }
    }

    /// Point `RUST_LOG` at the configured level when the caller hasn't
    pub fn initialize_logging(&self) {
        if env::var("RUST_LOG").is_err() {
            // Safety contract of set_var: called before any logger threads
            env::set_var("RUST_LOG", &self.logging.level);
        }
    }

    // ========================================================================
    // Typed accessors
    // ========================================================================

    #[must_use]
    pub fn encryption_key(&self) -> [u8; crypto::ENCRYPTION_KEY_SIZE] {
        crypto::derive_encryption_key(self.session.session_secret.as_bytes())
    }

    #[must_use]
    pub fn session_window(&self) -> Duration {
        Duration::seconds(self.session.window_secs)
    }

    #[must_use]
    pub fn refresh_threshold(&self) -> Duration {
        Duration::seconds(self.session.refresh_threshold_secs)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::seconds(self.session.cache_ttl_secs)
    }

    #[must_use]
    pub fn budgets(&self) -> TimeoutBudgets {
        TimeoutBudgets {
            inactivity: Duration::seconds(self.timeout.inactivity_secs),
            absolute_age: Duration::seconds(self.timeout.absolute_age_secs),
            warning_threshold: Duration::seconds(self.timeout.warning_threshold_secs),
        }
    }

    #[must_use]
    pub const fn poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.timeout.poll_interval_secs)
    }

    #[must_use]
    pub const fn verifier_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.verifier.timeout_secs)
    }
}
