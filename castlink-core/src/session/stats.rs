//! Per-window stream statistics for the presentation layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::quality::PerformanceSample;
use crate::types::Resolution;

/// Latest published numbers, served as JSON by the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub capture_ms: f64,
    pub encode_ms: f64,
    pub send_ms: f64,
    pub fps: f64,
    pub bitrate_kbps: u64,
    pub clients: usize,
    pub resolution: String,
    pub quality: u8,
}

/// Sums stage timings over one window.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    frames: u32,
    capture: Duration,
    encode: Duration,
    send: Duration,
}

impl StatsAccumulator {
    pub fn record(&mut self, capture: Duration, encode: Duration, send: Duration) {
        self.frames += 1;
        self.capture += capture;
        self.encode += encode;
        self.send += send;
    }

    /// Close the window into a snapshot and start over.
    pub fn snapshot(
        &mut self,
        sample: &PerformanceSample,
        window: Duration,
        clients: usize,
        resolution: Resolution,
        quality: u8,
    ) -> StatsSnapshot {
        let avg_ms = |total: Duration| {
            if self.frames == 0 {
                0.0
            } else {
                total.as_secs_f64() * 1000.0 / f64::from(self.frames)
            }
        };
        let secs = window.as_secs_f64().max(f64::EPSILON);
        let snapshot = StatsSnapshot {
            capture_ms: avg_ms(self.capture),
            encode_ms: avg_ms(self.encode),
            send_ms: avg_ms(self.send),
            fps: sample.achieved_fps,
            bitrate_kbps: (sample.bytes_sent as f64 * 8.0 / 1000.0 / secs).round() as u64,
            clients,
            resolution: resolution.to_string(),
            quality,
        };
        *self = Self::default();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn averages_per_frame_and_resets() {
        let mut acc = StatsAccumulator::default();
        acc.record(Duration::from_millis(4), Duration::from_millis(6), Duration::from_millis(1));
        acc.record(Duration::from_millis(2), Duration::from_millis(4), Duration::from_millis(3));
        let sample = PerformanceSample {
            window_start: Instant::now(),
            achieved_fps: 2.0,
            avg_rtt_ms: None,
            dropped_frame_count: 0,
            bytes_sent: 125_000,
        };
        let snap = acc.snapshot(&sample, Duration::from_secs(1), 3, Resolution::new(1280, 720), 55);
        assert!((snap.capture_ms - 3.0).abs() < 1e-9);
        assert!((snap.encode_ms - 5.0).abs() < 1e-9);
        assert!((snap.send_ms - 2.0).abs() < 1e-9);
        assert_eq!(snap.bitrate_kbps, 1000);
        assert_eq!(snap.resolution, "1280x720");

        let empty = acc.snapshot(&sample, Duration::from_secs(1), 0, Resolution::default(), 55);
        assert_eq!(empty.capture_ms, 0.0);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(StatsSnapshot::default()).unwrap();
        for key in ["captureMs", "encodeMs", "sendMs", "fps", "bitrateKbps", "clients", "resolution", "quality"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
