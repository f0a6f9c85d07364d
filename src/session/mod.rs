//! Session lifecycle, caching, storage, and validation

pub mod cache;
pub mod storage;
pub mod store;
pub mod validator;

pub use cache::SessionCache;
pub use storage::{CredentialWrite, SessionStorageBackend, StorageChain};
pub use store::SessionStore;
pub use validator::{SessionPolicy, SessionValidator, ValidationContext, ValidationResult};
