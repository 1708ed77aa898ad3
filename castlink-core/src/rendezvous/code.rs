//! Pairing codes and the host's pairing session.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::stun::NatType;

/// Code characters: upper-case alphanumerics without `0 O 1 I`.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of characters in a pairing code.
pub const CODE_LEN: usize = 6;

// ── PairingCode ──────────────────────────────────────────────────

/// A short human-typeable code identifying one host's pairing session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairingCode(String);

impl PairingCode {
    /// Draw a fresh random code.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Validate user input. Surrounding whitespace is trimmed and
    /// lower-case letters are accepted.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let code = input.trim().to_ascii_uppercase();
        let valid = code.len() == CODE_LEN && code.bytes().all(|b| CODE_ALPHABET.contains(&b));
        if valid {
            Ok(Self(code))
        } else {
            Err(ConfigError::InvalidCode(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PairingCode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PairingCode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PairingCode> for String {
    fn from(code: PairingCode) -> Self {
        code.0
    }
}

// ── PairingSession ───────────────────────────────────────────────

/// State advertised while rendezvous is enabled.
///
/// The key travels to the client in the CONNECTED reply; the code is
/// unique only for the lifetime of this session.
#[derive(Clone)]
pub struct PairingSession {
    pub code: PairingCode,
    pub encryption_key: [u8; 32],
    pub created_at: Instant,
    pub nat_type: NatType,
    pub public_endpoint: Option<SocketAddr>,
}

impl PairingSession {
    pub fn new(nat_type: NatType, public_endpoint: Option<SocketAddr>) -> Self {
        let mut encryption_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut encryption_key);
        Self {
            code: PairingCode::generate(),
            encryption_key,
            created_at: Instant::now(),
            nat_type,
            public_endpoint,
        }
    }

    /// Session key in standard base64, as sent on the wire.
    pub fn key_base64(&self) -> String {
        STANDARD.encode(self.encryption_key)
    }
}

// Keep the key out of logs.
impl fmt::Debug for PairingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingSession")
            .field("code", &self.code)
            .field("created_at", &self.created_at)
            .field("nat_type", &self.nat_type)
            .field("public_endpoint", &self.public_endpoint)
            .finish_non_exhaustive()
    }
}
