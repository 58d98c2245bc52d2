//! Stateless capability tokens.
//!
//! A token is the left part of `HMAC-SHA256(secret, name | size | mime | id)`
//! rendered as lowercase hex. It depends only on the file's identity, so any
//! holder of the link can stream the file and nothing is stored server side.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::FileDescriptor;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_HASH_LEN: usize = 6;
pub const MAX_HASH_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing hash parameter")]
    Missing,

    #[error("invalid hash")]
    Mismatch,

    #[error("token secret must not be empty")]
    InvalidSecret,
}

#[derive(Clone)]
pub struct AuthValidator {
    mac: HmacSha256,
    hash_len: usize,
}

impl fmt::Debug for AuthValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthValidator")
            .field("hash_len", &self.hash_len)
            .finish_non_exhaustive()
    }
}

impl AuthValidator {
    /// `hash_len` is the token length in hex characters. It is rounded down
    /// to an even number and kept within [`MIN_HASH_LEN`]..=[`MAX_HASH_LEN`].
    pub fn new(secret: &[u8], hash_len: usize) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::InvalidSecret);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::InvalidSecret)?;
        let hash_len = hash_len.clamp(MIN_HASH_LEN, MAX_HASH_LEN) & !1;
        Ok(AuthValidator { mac, hash_len })
    }

    pub fn hash_len(&self) -> usize {
        self.hash_len
    }

    /// Token to embed in share links for `file`.
    pub fn token_for(&self, file: &FileDescriptor) -> String {
        let digest = self.keyed(file).finalize().into_bytes();
        let mut token = hex::encode(digest);
        token.truncate(self.hash_len);
        token
    }

    /// Checks `token` against the one expected for `file` in constant time.
    pub fn verify(&self, token: Option<&str>, file: &FileDescriptor) -> Result<(), AuthError> {
        let token = match token {
            Some(token) if !token.is_empty() => token,
            _ => return Err(AuthError::Missing),
        };
        // the length is public, only the content is compared in constant time
        if token.len() != self.hash_len {
            return Err(AuthError::Mismatch);
        }
        let provided = hex::decode(token).map_err(|_| AuthError::Mismatch)?;
        self.keyed(file)
            .verify_truncated_left(&provided)
            .map_err(|_| AuthError::Mismatch)
    }

    fn keyed(&self, file: &FileDescriptor) -> HmacSha256 {
        let mut mac = self.mac.clone();
        update_field(&mut mac, file.name.as_bytes());
        mac.update(&file.size.to_be_bytes());
        update_field(&mut mac, file.mime_type.as_bytes());
        mac.update(&file.id.to_be_bytes());
        mac
    }
}

// length-prefixed so that adjacent string fields cannot be shifted into each other
fn update_field(mac: &mut HmacSha256, field: &[u8]) {
    mac.update(&(field.len() as u64).to_be_bytes());
    mac.update(field);
}
