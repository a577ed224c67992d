//! Password and session-token primitives.
//!
//! Passwords are hashed with Argon2id into a 32-byte key alongside a random
//! 16-byte salt; verification is constant-time. Session tokens are 32 random
//! bytes, URL-safe base64 on the wire, and stored server-side only as their
//! SHA-256 hex digest.

use std::sync::LazyLock;

use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

const SALT_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const TOKEN_SIZE: usize = 32;
const MIN_PASSWORD_LEN: usize = 12;

static USERNAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]{3,64}$").unwrap());

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("password must be at least {MIN_PASSWORD_LEN} characters")]
    PasswordTooShort,
    #[error("password hashing failed: {0}")]
    Hash(String),
}

pub fn validate_username(username: &str) -> bool {
    USERNAME_REGEX.is_match(username)
}

pub fn validate_password(password: &str) -> Result<(), SecurityError> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(SecurityError::PasswordTooShort);
    }
    Ok(())
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_SIZE], SecurityError> {
    let mut key = [0u8; KEY_SIZE];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| SecurityError::Hash(e.to_string()))?;
    Ok(key)
}

/// Hash a password with a fresh random salt. Returns `(hash, salt)`.
pub fn hash_password(password: &str) -> Result<(Vec<u8>, Vec<u8>), SecurityError> {
    let mut salt = vec![0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = derive_key(password, &salt)?;
    Ok((key.to_vec(), salt))
}

pub fn verify_password(password: &str, hash: &[u8], salt: &[u8]) -> bool {
    match derive_key(password, salt) {
        Ok(derived) => derived.ct_eq(hash).into(),
        Err(_) => false,
    }
}

/// Fresh 32-byte session token, URL-safe base64 without padding.
pub fn new_session_token() -> String {
    let mut bytes = [0u8; TOKEN_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Stored form of a session token.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(validate_username("field-op_01"));
        assert!(validate_username("a.b"));
        assert!(!validate_username("ab"));
        assert!(!validate_username("has space"));
        assert!(!validate_username(&"x".repeat(65)));
    }

    #[test]
    fn password_length_rule() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough password").is_ok());
    }

    #[test]
    fn hash_and_verify_round_trip() {
        let (hash, salt) = hash_password("correct horse battery").unwrap();
        assert_eq!(hash.len(), KEY_SIZE);
        assert_eq!(salt.len(), SALT_SIZE);
        assert!(verify_password("correct horse battery", &hash, &salt));
        assert!(!verify_password("wrong horse battery", &hash, &salt));
    }

    #[test]
    fn salts_differ_between_calls() {
        let (h1, s1) = hash_password("correct horse battery").unwrap();
        let (h2, s2) = hash_password("correct horse battery").unwrap();
        assert_ne!(s1, s2);
        assert_ne!(h1, h2);
    }

    #[test]
    fn tokens_are_url_safe_and_hash_stably() {
        let token = new_session_token();
        assert!(token.len() >= 42);
        assert!(!token.contains('+') && !token.contains('/') && !token.contains('='));
        assert_eq!(token_hash(&token), token_hash(&token));
        assert_ne!(token_hash(&token), token_hash(&new_session_token()));
    }
}
