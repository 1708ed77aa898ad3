//! The per-client delivery seam.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::broadcast::control::ControlMessage;
use crate::error::SinkError;
use crate::types::{ClientId, TransportKind};

/// Lifecycle of a client sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SinkState {
    Open = 0,
    /// Shutting down; no new frames are accepted.
    Closing = 1,
    Closed = 2,
}

impl SinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// [`SinkState`] shared between a sink and its background tasks.
#[derive(Debug)]
pub struct AtomicSinkState(AtomicU8);

impl AtomicSinkState {
    pub fn new(state: SinkState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> SinkState {
        SinkState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: SinkState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// `Open` → `Closing`; any later state is left as it is.
    pub fn begin_closing(&self) {
        let _ = self.0.compare_exchange(
            SinkState::Open as u8,
            SinkState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// One client's outbound path.
///
/// Implementations must never block the caller on a slow peer: a send
/// either completes promptly or fails, and the broadcaster evicts the
/// client.
#[async_trait]
pub trait FrameSink: Send + Sync {
    fn id(&self) -> ClientId;

    fn kind(&self) -> TransportKind;

    fn peer(&self) -> SocketAddr;

    fn state(&self) -> SinkState;

    fn is_open(&self) -> bool {
        self.state() == SinkState::Open
    }

    /// Deliver one encoded frame.
    async fn send_frame(&self, frame: Bytes) -> Result<(), SinkError>;

    /// Deliver a control message (the info handshake, pongs).
    async fn send_control(&self, message: &ControlMessage) -> Result<(), SinkError>;

    /// Stop accepting frames and release transport resources.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_atomic() {
        let s = AtomicSinkState::new(SinkState::Open);
        assert_eq!(s.load(), SinkState::Open);
        s.store(SinkState::Closing);
        assert_eq!(s.load(), SinkState::Closing);
        s.store(SinkState::Closed);
        assert_eq!(s.load(), SinkState::Closed);
    }

    #[test]
    fn closing_never_reopens_a_closed_sink() {
        let s = AtomicSinkState::new(SinkState::Open);
        s.begin_closing();
        assert_eq!(s.load(), SinkState::Closing);
        s.store(SinkState::Closed);
        s.begin_closing();
        assert_eq!(s.load(), SinkState::Closed);
    }
}
