//! Shareable pairing payload (the content of the host's QR code).
//!
//! JSON record, then standard base64, so a client can skip its own
//! discovery and go straight to the endpoints the host reported.

use std::net::SocketAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::RendezvousError;
use crate::rendezvous::code::PairingCode;
use crate::stun::NatType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharePayload {
    pub code: PairingCode,
    pub public_endpoint: Option<SocketAddr>,
    pub local_endpoint: Option<SocketAddr>,
    pub nat_type: NatType,
}

impl SharePayload {
    pub fn encode(&self) -> String {
        // Serializing plain data with string keys cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    pub fn decode(text: &str) -> Result<Self, RendezvousError> {
        let json = STANDARD
            .decode(text.trim())
            .map_err(|e| RendezvousError::Payload(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| RendezvousError::Payload(e.to_string()))
    }
}
