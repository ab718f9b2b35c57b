//! Stateless session tokens.
//!
//! A token is a versioned envelope holding a random nonce and an
//! HMAC-SHA256 over the nonce and the account email, postcard-encoded and then
//! hex-encoded. Nothing is persisted; a token is valid for an email exactly
//! when its MAC checks out under the server secret.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

const TOKEN_VERSION: u8 = 1;
const NONCE_LENGTH: usize = 32;
const MAC_LENGTH: usize = 32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("entropy source failed: {0}")]
    Entropy(#[from] rand::Error),

    #[error("invalid session secret")]
    Key,

    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// Issues session tokens for authenticated emails.
pub trait TokenMinter: Send + Sync {
    fn mint(&self, email: &str) -> Result<String, TokenError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u8,
    nonce: [u8; NONCE_LENGTH],
    mac: [u8; MAC_LENGTH],
}

pub struct HmacTokenMinter {
    secret: Vec<u8>,
}

impl HmacTokenMinter {
    pub fn new<S: AsRef<[u8]>>(secret: S) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn keyed(&self, nonce: &[u8], email: &str) -> Result<HmacSha256, TokenError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Key)?;
        mac.update(nonce);
        mac.update(email.as_bytes());
        Ok(mac)
    }

    /// Checks that `token` was minted by this secret for `email`.
    pub fn verify(&self, email: &str, token: &str) -> bool {
        let bytes = match hex::decode(token) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let envelope: Envelope = match postcard::from_bytes(&bytes) {
            Ok(envelope) => envelope,
            Err(_) => return false,
        };
        if envelope.version != TOKEN_VERSION {
            return false;
        }
        match self.keyed(&envelope.nonce, email) {
            Ok(mac) => mac.verify_slice(&envelope.mac).is_ok(),
            Err(_) => false,
        }
    }
}

impl TokenMinter for HmacTokenMinter {
    fn mint(&self, email: &str) -> Result<String, TokenError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.try_fill_bytes(&mut nonce)?;

        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&self.keyed(&nonce, email)?.finalize().into_bytes());

        let envelope = Envelope {
            version: TOKEN_VERSION,
            nonce,
            mac,
        };
        let bytes =
            postcard::to_allocvec(&envelope).map_err(|err| TokenError::Encoding(err.to_string()))?;
        Ok(hex::encode(bytes))
    }
}
