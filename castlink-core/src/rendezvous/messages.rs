//! Rendezvous wire messages.
//!
//! ```text
//! Client ──[CONNECT:<code>]──────────────────► Host      (UDP text)
//! Host   ──[{"type":"CONNECTED",...}]────────► Client    (UDP JSON)
//! ```
//!
//! Any other datagram reaching the rendezvous port is ignored.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::RendezvousError;
use crate::rendezvous::code::PairingCode;

/// Prefix of a client connect request.
pub const CONNECT_PREFIX: &str = "CONNECT:";

/// Build the `CONNECT:<code>` datagram.
pub fn connect_request(code: &PairingCode) -> Vec<u8> {
    format!("{CONNECT_PREFIX}{code}").into_bytes()
}

/// Extract the code from a `CONNECT:<code>` datagram.
///
/// The code is returned verbatim; the host compares it exactly.
pub fn parse_connect(datagram: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(datagram).ok()?;
    let code = text.strip_prefix(CONNECT_PREFIX)?;
    Some(code.trim_end_matches(['\r', '\n']))
}

/// Ports the host exposes once paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPorts {
    pub datagram: u16,
    pub stream: u16,
}

/// Session parameters returned to a validated client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    /// HTTP port serving stats and the discovery descriptor.
    pub api_port: u16,
    pub stream_ports: StreamPorts,
    /// 256-bit session key, standard base64.
    pub key: String,
}

impl SessionParams {
    /// Decode the session key.
    pub fn key_bytes(&self) -> Result<[u8; 32], RendezvousError> {
        let raw = STANDARD
            .decode(&self.key)
            .map_err(|_| RendezvousError::InvalidKey)?;
        raw.try_into().map_err(|_| RendezvousError::InvalidKey)
    }
}

/// Host → client reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RendezvousReply {
    #[serde(rename = "CONNECTED")]
    Connected(SessionParams),
}

impl RendezvousReply {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
