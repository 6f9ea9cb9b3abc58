use base64::{engine::general_purpose::STANDARD as BASE64, engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

const SALT_LEN: usize = 16;
const TOKEN_LEN: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Malformed password hash")]
    MalformedHash,
}

pub struct PasswordHasher;

impl PasswordHasher {
    /// Salted SHA-256, stored as `salt$digest` in base64.
    pub fn hash(password: &str) -> String {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let digest = Self::digest(&salt, password);
        format!("{}${}", BASE64.encode(salt), BASE64.encode(digest))
    }

    pub fn verify(password: &str, stored: &str) -> Result<bool, CryptoError> {
        let (salt, digest) = stored.split_once('$').ok_or(CryptoError::MalformedHash)?;
        let salt = BASE64.decode(salt).map_err(|_| CryptoError::MalformedHash)?;
        let expected = BASE64.decode(digest).map_err(|_| CryptoError::MalformedHash)?;

        let actual = Self::digest(&salt, password);
        // constant-time compare
        let diff = actual
            .iter()
            .zip(expected.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        Ok(diff == 0 && actual.len() == expected.len())
    }

    fn digest(salt: &[u8], password: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(b":");
        hasher.update(password.as_bytes());
        hasher.finalize().to_vec()
    }
}

/// Random bearer token, safe to carry in a query string.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
