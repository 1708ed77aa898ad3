//! The capture/encode collaborator seen from the session.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SessionError;
use crate::session::config::StreamConfig;
use crate::types::Resolution;

/// Timings the source measured for its most recent chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceTimings {
    pub capture: Duration,
    pub encode: Duration,
}

/// Pull source of encoded frames.
///
/// The session owns the source exclusively and calls it from the frame
/// loop only, so implementations need no internal locking.
#[async_trait]
pub trait FrameSource: Send {
    /// Acquire capture and encode resources. An error here aborts
    /// [`StreamSession::start`](super::StreamSession::start).
    async fn start(&mut self, config: &StreamConfig) -> Result<(), SessionError>;

    /// Next encoded frame. `Ok(None)` means nothing new was ready.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SessionError>;

    async fn reconfigure(
        &mut self,
        quality: u8,
        resolution: Resolution,
        fps: u32,
    ) -> Result<(), SessionError>;

    /// Release resources. Called once the frame loop exits.
    async fn stop(&mut self) {}

    /// Timings for the chunk most recently returned, if the source
    /// measures them.
    fn timings(&self) -> Option<SourceTimings> {
        None
    }
}
