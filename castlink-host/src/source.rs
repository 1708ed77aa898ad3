//! Synthetic frame source.
//!
//! Stands in for a capture + hardware encoder pipeline: every pull
//! yields one opaque "encoded" buffer whose size follows resolution and
//! quality the way a real encoder's output would, so the broadcaster,
//! the controller and the stats endpoint see realistic numbers.
//!
//! Frame layout:
//!
//! ```text
//! ┌──────────┬──────────┬─────────┬───────────────────────────┐
//! │ seq u64  │ w u16    │ h u16   │ pattern bytes (to length) │
//! │ LE       │ LE       │ LE      │                           │
//! └──────────┴──────────┴─────────┴───────────────────────────┘
//! ```

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, info};

use castlink_core::session::SourceTimings;
use castlink_core::{FrameSource, Resolution, SessionError, StreamConfig};

/// Bytes per pixel at quality 100 before "compression".
const BYTES_PER_PIXEL_AT_MAX: f64 = 0.02;

/// Smallest frame ever produced.
const MIN_FRAME: usize = 64;

const HEADER: usize = 12;

// ── SyntheticSource ──────────────────────────────────────────────

pub struct SyntheticSource {
    resolution: Resolution,
    quality: u8,
    fps: u32,
    sequence: u64,
    started: bool,
    last: Option<SourceTimings>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            resolution: Resolution::default(),
            quality: 50,
            fps: 60,
            sequence: 0,
            started: false,
            last: None,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Size of the next frame for the current settings.
    pub fn frame_len(&self) -> usize {
        let pixels = self.resolution.pixels() as f64;
        let scaled = pixels * BYTES_PER_PIXEL_AT_MAX * f64::from(self.quality) / 100.0;
        (scaled as usize).max(MIN_FRAME)
    }

    fn render(&mut self) -> Bytes {
        let len = self.frame_len();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u64_le(self.sequence);
        buf.put_u16_le(self.resolution.width.min(u32::from(u16::MAX)) as u16);
        buf.put_u16_le(self.resolution.height.min(u32::from(u16::MAX)) as u16);
        let shade = (self.sequence % 256) as u8;
        buf.put_bytes(shade, len - HEADER);
        buf.freeze()
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn start(&mut self, config: &StreamConfig) -> Result<(), SessionError> {
        self.resolution = config.resolution;
        self.quality = config.quality.initial_quality;
        self.fps = config.fps();
        self.started = true;
        info!(
            resolution = %self.resolution,
            fps = self.fps,
            quality = self.quality,
            "synthetic source started"
        );
        Ok(())
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SessionError> {
        if !self.started {
            return Err(SessionError::Source("source not started".into()));
        }
        let capture_start = Instant::now();
        self.sequence += 1;
        let encode_start = Instant::now();
        let frame = self.render();
        self.last = Some(SourceTimings {
            capture: encode_start - capture_start,
            encode: encode_start.elapsed(),
        });
        Ok(Some(frame))
    }

    async fn reconfigure(
        &mut self,
        quality: u8,
        resolution: Resolution,
        fps: u32,
    ) -> Result<(), SessionError> {
        debug!(quality, %resolution, fps, "synthetic source reconfigured");
        self.quality = quality;
        self.resolution = resolution;
        self.fps = fps;
        Ok(())
    }

    async fn stop(&mut self) {
        self.started = false;
        info!(frames = self.sequence, "synthetic source stopped");
    }

    fn timings(&self) -> Option<SourceTimings> {
        self.last
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamConfig {
        let mut config = StreamConfig::default();
        config.resolution = Resolution::new(1280, 720);
        config
    }

    #[tokio::test]
    async fn frames_carry_sequence_and_resolution() {
        let mut source = SyntheticSource::new();
        source.start(&config()).await.unwrap();

        let first = source.next_chunk().await.unwrap().unwrap();
        let second = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(u64::from_le_bytes(first[..8].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(second[..8].try_into().unwrap()), 2);
        assert_eq!(u16::from_le_bytes([first[8], first[9]]), 1280);
        assert_eq!(u16::from_le_bytes([first[10], first[11]]), 720);
        assert_eq!(first.len(), source.frame_len());
        assert!(source.timings().is_some());
    }

    #[tokio::test]
    async fn lower_quality_means_smaller_frames() {
        let mut source = SyntheticSource::new();
        source.start(&config()).await.unwrap();
        let at_50 = source.next_chunk().await.unwrap().unwrap().len();

        source.reconfigure(20, Resolution::new(1280, 720), 60).await.unwrap();
        assert_eq!(source.quality(), 20);
        let at_20 = source.next_chunk().await.unwrap().unwrap().len();
        assert!(at_20 < at_50);
    }

    #[tokio::test]
    async fn refuses_to_produce_before_start() {
        let mut source = SyntheticSource::new();
        assert!(matches!(source.next_chunk().await, Err(SessionError::Source(_))));

        source.start(&config()).await.unwrap();
        source.stop().await;
        assert!(source.next_chunk().await.is_err());
    }

    #[test]
    fn tiny_resolutions_still_fit_the_header() {
        let mut source = SyntheticSource::new();
        source.resolution = Resolution::new(1, 1);
        assert_eq!(source.frame_len(), MIN_FRAME);
    }
}
