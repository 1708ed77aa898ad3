//! JSON control messages sent from host to client.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::types::Resolution;

/// Stream parameters announced once, before the first frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: String,
}

impl StreamInfo {
    pub fn new(resolution: Resolution, fps: u32, codec: impl Into<String>) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            fps,
            codec: codec.into(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Host → client control traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// The one-time stream handshake.
    Info(StreamInfo),
    /// Answer to a datagram `PING`.
    Pong,
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Result<Bytes, SinkError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| SinkError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_handshake_is_flat_json() {
        let msg = ControlMessage::Info(StreamInfo::new(Resolution::new(1280, 720), 60, "h264"));
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "info");
        assert_eq!(json["width"], 1280);
        assert_eq!(json["height"], 720);
        assert_eq!(json["fps"], 60);
        assert_eq!(json["codec"], "h264");
    }

    #[test]
    fn pong_and_garbage() {
        let pong = ControlMessage::Pong.to_bytes().unwrap();
        assert_eq!(&pong[..], br#"{"type":"pong"}"#);
        assert_eq!(ControlMessage::from_bytes(&pong), Some(ControlMessage::Pong));
        assert_eq!(ControlMessage::from_bytes(b"\x00\x01"), None);
    }
}
