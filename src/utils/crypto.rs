// Cryptographic utilities for sealing the opaque session credential

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};

/// Nonce size for AES-256-GCM encryption (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Encryption key size for AES-256 (256 bits)
pub const ENCRYPTION_KEY_SIZE: usize = 32;

/// Seal any serializable value into an opaque base64url token
///
/// The output is nonce + ciphertext, base64url encoded. This is what the
/// storage chain hands to the client; the client never sees plaintext
/// session state.
///
/// # Errors
///
/// Returns an error if:
/// - Serialization fails
/// - Key length is invalid
/// - AES encryption fails
pub fn seal<T: Serialize>(data: &T, key: &[u8]) -> Result<String> {
    if key.len() != ENCRYPTION_KEY_SIZE {
        return Err(anyhow!(
            "Invalid key length: expected {} bytes, got {}",
            ENCRYPTION_KEY_SIZE,
            key.len()
        ));
    }

    let json_data = serde_json::to_string(data).context("Failed to serialize data")?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ciphertext = cipher
        .encrypt(nonce, json_data.as_bytes())
        .map_err(|e| anyhow!("AES encryption failed: {e}"))?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(general_purpose::URL_SAFE_NO_PAD.encode(&combined))
}

/// Open a sealed token back into its typed contents
///
/// # Errors
///
/// Returns an error if:
/// - Key length is invalid
/// - Base64 decoding fails
/// - Data length is invalid
/// - AES decryption fails (tampered or foreign token)
/// - Deserialization fails
pub fn open<T: DeserializeOwned>(sealed: &str, key: &[u8]) -> Result<T> {
    if key.len() != ENCRYPTION_KEY_SIZE {
        return Err(anyhow!(
            "Invalid key length: expected {} bytes, got {}",
            ENCRYPTION_KEY_SIZE,
            key.len()
        ));
    }

    let combined = general_purpose::URL_SAFE_NO_PAD
        .decode(sealed)
        .context("Failed to decode base64 data")?;

    if combined.len() < NONCE_SIZE {
        return Err(anyhow!("Invalid data length"));
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow!("AES decryption failed: {e}"))?;

    let data: T = serde_json::from_slice(&plaintext)
        .context("Failed to deserialize data from decrypted JSON")?;

    Ok(data)
}

/// Derive a proper 32-byte encryption key from input key material
///
/// Keys shorter than 32 bytes are extended with a simple wrap-around
/// derivation; longer keys are truncated. For weak input keys prefer a
/// real KDF upstream.
#[must_use]
pub fn derive_encryption_key(input_key: &[u8]) -> [u8; ENCRYPTION_KEY_SIZE] {
    let mut encryption_key = [0u8; ENCRYPTION_KEY_SIZE];
    let key_len = std::cmp::min(input_key.len(), ENCRYPTION_KEY_SIZE);
    encryption_key[..key_len].copy_from_slice(&input_key[..key_len]);

    if key_len > 0 && key_len < ENCRYPTION_KEY_SIZE {
        for i in key_len..ENCRYPTION_KEY_SIZE {
            encryption_key[i] =
                encryption_key[i % key_len].wrapping_add(u8::try_from(i % 256).unwrap_or(0));
        }
    }

    encryption_key
}

/// Generate a cryptographically secure nonce of the given byte length
///
/// Used for session-id derivation salts and generated secrets.
#[must_use]
pub fn generate_nonce(length: usize) -> String {
    let mut nonce = vec![0u8; length];
    rand::rng().fill_bytes(&mut nonce);
    general_purpose::URL_SAFE_NO_PAD.encode(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const TEST_KEY: &[u8] = b"test_key_32_bytes_long_for_test_";

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        value: String,
        count: u32,
    }

    #[test]
    fn test_seal_open_round_trip() {
        let key = derive_encryption_key(TEST_KEY);
        let payload = Payload {
            value: "hello".to_string(),
            count: 7,
        };

        let sealed = seal(&payload, &key).unwrap();
        let opened: Payload = open(&sealed, &key).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_open_rejects_tampered_token() {
        let key = derive_encryption_key(TEST_KEY);
        let sealed = seal(
            &Payload {
                value: "hello".to_string(),
                count: 7,
            },
            &key,
        )
        .unwrap();

        let mut tampered = sealed.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();

        assert!(open::<Payload>(&tampered, &key).is_err());
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let key = derive_encryption_key(TEST_KEY);
        let other_key = derive_encryption_key(b"another_key_32_bytes_long_test__");
        let sealed = seal(
            &Payload {
                value: "hello".to_string(),
                count: 7,
            },
            &key,
        )
        .unwrap();

        assert!(open::<Payload>(&sealed, &other_key).is_err());
    }

    #[test]
    fn test_derive_key_extends_short_input() {
        let key = derive_encryption_key(b"short");
        assert_eq!(key.len(), ENCRYPTION_KEY_SIZE);
        // Extension must be deterministic
        assert_eq!(key, derive_encryption_key(b"short"));
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        let payload = Payload {
            value: "x".to_string(),
            count: 0,
        };
        assert!(seal(&payload, b"too_short").is_err());
        assert!(open::<Payload>("abcd", b"too_short").is_err());
    }
}
