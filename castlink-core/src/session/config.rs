//! Validated per-session stream settings.

use std::time::Duration;

use crate::broadcast::{DEFAULT_LIVENESS_TIMEOUT, StreamInfo};
use crate::error::ConfigError;
use crate::input::DEFAULT_INPUT_QUEUE;
use crate::quality::{DEFAULT_SAMPLE_WINDOW, QualityConfig};
use crate::types::Resolution;

/// Everything a [`StreamSession`](super::StreamSession) needs to know
/// about the stream it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub resolution: Resolution,
    pub codec: String,
    /// Bounds, target fps, gpu allocation and network-adaptive toggle.
    pub quality: QualityConfig,
    /// Run the quality controller at all. When off, quality stays at
    /// `quality.initial_quality`.
    pub adaptive_quality: bool,
    pub liveness_timeout: Duration,
    pub sample_window: Duration,
    pub input_queue: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            codec: "h264".into(),
            quality: QualityConfig::default(),
            adaptive_quality: true,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            sample_window: DEFAULT_SAMPLE_WINDOW,
            input_queue: DEFAULT_INPUT_QUEUE,
        }
    }
}

impl StreamConfig {
    pub fn fps(&self) -> u32 {
        self.quality.target_fps
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quality.validate()?;
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(ConfigError::OutOfRange {
                field: "resolution",
                value: self.resolution.to_string(),
                reason: "width and height must be non-zero",
            });
        }
        if self.codec.trim().is_empty() {
            return Err(ConfigError::Invalid("codec name is empty".into()));
        }
        if self.liveness_timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "liveness_timeout",
                value: format!("{:?}", self.liveness_timeout),
                reason: "must be positive",
            });
        }
        if self.sample_window.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "sample_window",
                value: format!("{:?}", self.sample_window),
                reason: "must be positive",
            });
        }
        if self.input_queue == 0 {
            return Err(ConfigError::OutOfRange {
                field: "input_queue",
                value: "0".into(),
                reason: "must hold at least one message",
            });
        }
        Ok(())
    }

    /// The `info` handshake sent to every new client.
    pub fn stream_info(&self) -> StreamInfo {
        StreamInfo::new(self.resolution, self.fps(), self.codec.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StreamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fps(), 60);
        let info = config.stream_info();
        assert_eq!((info.width, info.height, info.fps), (1920, 1080, 60));
    }

    #[test]
    fn rejects_out_of_range_fps_and_gpu() {
        let mut config = StreamConfig::default();
        config.quality.target_fps = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "target_fps", .. })
        ));

        config.quality.target_fps = 241;
        assert!(config.validate().is_err());

        config.quality.target_fps = 240;
        config.quality.gpu_allocation = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "gpu_allocation", .. })
        ));
    }

    #[test]
    fn rejects_empty_codec_and_zero_timeout() {
        let config = StreamConfig {
            codec: " ".into(),
            ..StreamConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = StreamConfig {
            liveness_timeout: Duration::ZERO,
            ..StreamConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
