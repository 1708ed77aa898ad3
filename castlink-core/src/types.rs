//! Small value types shared across the streaming pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ── Resolution ───────────────────────────────────────────────────

/// Output resolution requested from the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count.
    pub const fn pixels(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = ConfigError;

    /// Parses `"<width>x<height>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("resolution {s:?} is not WIDTHxHEIGHT"));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.parse().map_err(|_| invalid())?;
        let height: u32 = h.parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

// ── ClientId ─────────────────────────────────────────────────────

/// Identity of a connected client within one broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

// ── TransportKind ────────────────────────────────────────────────

/// The two ways a client can receive frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Connectionless UDP: no backpressure, loss preferred over staleness.
    Datagram,
    /// Connection-oriented TCP: bounded queue, slow peers are evicted.
    Stream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datagram => write!(f, "datagram"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_parses_and_displays() {
        let r: Resolution = "1280x720".parse().unwrap();
        assert_eq!(r, Resolution::new(1280, 720));
        assert_eq!(r.to_string(), "1280x720");
        assert_eq!(r.pixels(), 921_600);
    }

    #[test]
    fn resolution_rejects_garbage() {
        assert!("1280".parse::<Resolution>().is_err());
        assert!("0x720".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
    }
}
