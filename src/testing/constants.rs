//! Shared test constants

/// 32-byte key material for envelope crypto in tests
pub const TEST_ENCRYPTION_KEY: &[u8] = b"test_encryption_key_32_bytes_ok!";

pub const TEST_SUBJECT_ID: &str = "user-1";
pub const TEST_EMAIL: &str = "user@example.com";

/// A browser user agent the transport checks accept
pub const TEST_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";
