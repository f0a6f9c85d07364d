//! Session lifecycle, validation, timeout and error-recovery guard for an
//! order-and-account web application
//!
//! The guard sits between collaborating services and the identity
//! providers: it establishes sessions from verified credentials, answers
//! authorization decisions against per-route policies, watches each live
//! session's timeout budgets, and funnels every validation failure through
//! a recovery engine before an error ever reaches a caller.

pub mod errors;
pub mod handlers;
pub mod models;
pub mod monitoring;
pub mod session;
pub mod settings;
pub mod timeout;
pub mod utils;
pub mod verifier;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use errors::{AuthError, AuthErrorCode, ErrorHandler, ErrorRateLimiter};
pub use models::{Claims, Role, SessionData, TimeoutState};
pub use monitoring::Monitoring;
pub use session::{SessionPolicy, SessionStore, SessionValidator, StorageChain};
pub use settings::DoormanSettings;
pub use timeout::TimeoutManager;
