//! Shared test support
//!
//! Fixtures, request builders, and mocks used across unit and integration
//! tests. Compiled only for tests and the `testing` feature.

pub mod constants;
pub mod fixtures;
pub mod mock;
pub mod requests;

pub use fixtures::TestFixtures;
pub use mock::{MockVerifier, UnavailableBackend};
pub use requests::RequestBuilder;
