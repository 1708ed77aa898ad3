//! Hysteresis-gated quality controller.
//!
//! ```text
//!  PerformanceSample ──► RTT history (10) ──┐
//!                    └─► fps window (5)  ───┤
//!                                           ▼
//!                 gate (min interval) ─► RTT path ─► fps path ─► clamp ─► Adjustment
//! ```
//!
//! When network-adaptive mode is on and at least four RTT samples
//! exist, the RTT path owns the window, including its "hold" outcome.
//! Otherwise the fps path decides from the rolling average.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::quality::sample::PerformanceSample;
use crate::types::Resolution;

// ── Tuning constants ─────────────────────────────────────────────

const RTT_HISTORY: usize = 10;
const FPS_WINDOW: usize = 5;
const MIN_RTT_SAMPLES: usize = 4;
const MIN_FPS_SAMPLES: usize = 3;

const RTT_CRITICAL_MS: f64 = 100.0;
const RTT_HIGH_MS: f64 = 50.0;
const RTT_LOW_MS: f64 = 20.0;

const CUT_LARGE: i16 = 10;
const CUT_SMALL: i16 = 5;
const RAISE: i16 = 2;

const HEADROOM_RATIO: f64 = 0.95;
const FLOOR_RATIO: f64 = 0.80;
const FLOOR_RATIO_RELAXED: f64 = 0.70;

/// Ceiling for the per-frame GPU throttle delay.
pub const MAX_THROTTLE: Duration = Duration::from_millis(10);

// ── QualityConfig ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub min_quality: u8,
    pub max_quality: u8,
    pub initial_quality: u8,
    pub target_fps: u32,
    pub network_adaptive: bool,
    #[serde(with = "duration_secs")]
    pub min_adjustment_interval: Duration,
    /// Fraction of the GPU the stream may use, `0.0..=1.0`.
    pub gpu_allocation: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_quality: 20,
            max_quality: 70,
            initial_quality: 50,
            target_fps: 60,
            network_adaptive: true,
            min_adjustment_interval: Duration::from_secs(2),
            gpu_allocation: 0.25,
        }
    }
}

impl QualityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_quality > 100 {
            return Err(ConfigError::OutOfRange {
                field: "max_quality",
                value: self.max_quality.to_string(),
                reason: "must be at most 100",
            });
        }
        if self.min_quality > self.max_quality {
            return Err(ConfigError::OutOfRange {
                field: "min_quality",
                value: self.min_quality.to_string(),
                reason: "must not exceed max_quality",
            });
        }
        if !(self.min_quality..=self.max_quality).contains(&self.initial_quality) {
            return Err(ConfigError::OutOfRange {
                field: "initial_quality",
                value: self.initial_quality.to_string(),
                reason: "must lie within [min_quality, max_quality]",
            });
        }
        if !(1..=240).contains(&self.target_fps) {
            return Err(ConfigError::OutOfRange {
                field: "target_fps",
                value: self.target_fps.to_string(),
                reason: "must be within 1..=240",
            });
        }
        if !(0.0..=1.0).contains(&self.gpu_allocation) {
            return Err(ConfigError::OutOfRange {
                field: "gpu_allocation",
                value: self.gpu_allocation.to_string(),
                reason: "must be within 0..=1",
            });
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// ── Adjustments ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustReason {
    /// Average RTT above 100 ms.
    HighLatency,
    /// Frames were dropped in the last window.
    FrameDrops,
    /// Average RTT above 50 ms.
    ModerateLatency,
    /// Average fps below the adaptive floor.
    LowFps,
    /// Low latency / on-target fps leaves room to raise quality.
    Headroom,
}

impl fmt::Display for AdjustReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HighLatency => "high latency",
            Self::FrameDrops => "frame drops",
            Self::ModerateLatency => "moderate latency",
            Self::LowFps => "low fps",
            Self::Headroom => "headroom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub previous: u8,
    pub quality: u8,
    pub reason: AdjustReason,
}

/// Mutable controller state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityState {
    pub current_quality: u8,
    pub target_fps: u32,
    pub resolution: Resolution,
    pub last_adjustment_at: Option<Instant>,
}

// ── QualityController ────────────────────────────────────────────

pub struct QualityController {
    config: QualityConfig,
    state: QualityState,
    rtt_history: VecDeque<f64>,
    fps_window: VecDeque<f64>,
    consecutive_fps_cuts: u32,
}

impl QualityController {
    pub fn new(config: QualityConfig, resolution: Resolution) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: QualityState {
                current_quality: config.initial_quality,
                target_fps: config.target_fps,
                resolution,
                last_adjustment_at: None,
            },
            config,
            rtt_history: VecDeque::with_capacity(RTT_HISTORY),
            fps_window: VecDeque::with_capacity(FPS_WINDOW),
            consecutive_fps_cuts: 0,
        })
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn state(&self) -> &QualityState {
        &self.state
    }

    pub fn current_quality(&self) -> u8 {
        self.state.current_quality
    }

    /// Fold one sample in and decide whether quality should move.
    pub fn on_sample(&mut self, sample: &PerformanceSample, now: Instant) -> Option<Adjustment> {
        if let Some(rtt) = sample.avg_rtt_ms {
            push_bounded(&mut self.rtt_history, rtt, RTT_HISTORY);
        }
        push_bounded(&mut self.fps_window, sample.achieved_fps, FPS_WINDOW);

        if let Some(last) = self.state.last_adjustment_at {
            if now.saturating_duration_since(last) < self.config.min_adjustment_interval {
                return None;
            }
        }

        let (delta, reason) = self.decide(sample)?;
        let previous = self.state.current_quality;
        let target = (i16::from(previous) + delta).clamp(
            i16::from(self.config.min_quality),
            i16::from(self.config.max_quality),
        ) as u8;
        if target == previous {
            debug!(quality = previous, %reason, "adjustment clamped to a no-op");
            return None;
        }

        if reason == AdjustReason::LowFps {
            self.consecutive_fps_cuts += 1;
        } else {
            self.consecutive_fps_cuts = 0;
        }
        self.state.current_quality = target;
        self.state.last_adjustment_at = Some(now);
        info!(previous, quality = target, %reason, "quality adjusted");
        Some(Adjustment {
            previous,
            quality: target,
            reason,
        })
    }

    fn decide(&mut self, sample: &PerformanceSample) -> Option<(i16, AdjustReason)> {
        let target_fps = f64::from(self.state.target_fps);
        let avg_fps = mean(&self.fps_window);
        let drops = sample.dropped_frame_count;

        if self.config.network_adaptive && self.rtt_history.len() >= MIN_RTT_SAMPLES {
            let rtt = mean(&self.rtt_history);
            return if rtt > RTT_CRITICAL_MS {
                Some((-CUT_LARGE, AdjustReason::HighLatency))
            } else if drops > 0 {
                Some((-CUT_LARGE, AdjustReason::FrameDrops))
            } else if rtt > RTT_HIGH_MS {
                Some((-CUT_SMALL, AdjustReason::ModerateLatency))
            } else if rtt < RTT_LOW_MS && avg_fps >= HEADROOM_RATIO * target_fps {
                Some((RAISE, AdjustReason::Headroom))
            } else {
                None
            };
        }

        if self.fps_window.len() < MIN_FPS_SAMPLES {
            return None;
        }
        if avg_fps < self.fps_floor() {
            Some((-CUT_SMALL, AdjustReason::LowFps))
        } else {
            self.consecutive_fps_cuts = 0;
            (avg_fps >= HEADROOM_RATIO * target_fps && drops == 0)
                .then_some((RAISE, AdjustReason::Headroom))
        }
    }

    /// Fps below which the fallback path cuts quality. Relaxed after
    /// two consecutive cuts so a slow GPU does not ride quality down
    /// to the minimum.
    pub fn fps_floor(&self) -> f64 {
        let ratio = if self.consecutive_fps_cuts >= 2 {
            FLOOR_RATIO_RELAXED
        } else {
            FLOOR_RATIO
        };
        ratio * f64::from(self.state.target_fps)
    }

    /// Per-frame throttle for the current target fps and allocation.
    pub fn throttle_delay(&self) -> Duration {
        let base = Duration::from_secs_f64(1.0 / f64::from(self.state.target_fps.max(1)));
        gpu_throttle_delay(base, self.config.gpu_allocation)
    }
}

/// Per-frame delay ceding GPU time to a concurrently running game:
/// `clamp(base × (1 − allocation) × 0.3, 0, 10 ms)`.
pub fn gpu_throttle_delay(base_frame_time: Duration, gpu_allocation: f64) -> Duration {
    let allocation = gpu_allocation.clamp(0.0, 1.0);
    let secs = base_frame_time.as_secs_f64() * (1.0 - allocation) * 0.3;
    Duration::from_secs_f64(secs.max(0.0)).min(MAX_THROTTLE)
}

fn push_bounded(buf: &mut VecDeque<f64>, value: f64, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> QualityController {
        QualityController::new(QualityConfig::default(), Resolution::default()).unwrap()
    }

    fn sample(t: Instant, fps: f64, rtt: Option<f64>, drops: u32) -> PerformanceSample {
        PerformanceSample {
            window_start: t,
            achieved_fps: fps,
            avg_rtt_ms: rtt,
            dropped_frame_count: drops,
            bytes_sent: 0,
        }
    }

    #[test]
    fn congested_network_steps_down_to_floor() {
        let mut qc = controller();
        let t0 = Instant::now();
        let mut trace = Vec::new();
        for i in 0..10u64 {
            let now = t0 + Duration::from_secs(i);
            if let Some(adj) = qc.on_sample(&sample(now, 60.0, Some(120.0), 2), now) {
                trace.push((i, adj.quality));
            }
        }
        // First cut needs four RTT samples; then one cut per 2 s window,
        // clamped at the minimum.
        assert_eq!(trace, vec![(3, 40), (5, 30), (7, 20)]);
        assert_eq!(qc.current_quality(), 20);
    }

    #[test]
    fn never_adjusts_twice_within_interval_and_stays_in_bounds() {
        let mut qc = controller();
        let t0 = Instant::now();
        let mut last: Option<Instant> = None;
        for i in 0..200u64 {
            let now = t0 + Duration::from_millis(i * 300);
            let (fps, rtt, drops) = if (i / 20) % 2 == 0 {
                (60.0, 5.0, 0)
            } else {
                (20.0, 150.0, 3)
            };
            if qc.on_sample(&sample(now, fps, Some(rtt), drops), now).is_some() {
                if let Some(prev) = last {
                    assert!(now - prev >= Duration::from_secs(2));
                }
                last = Some(now);
            }
            let q = qc.current_quality();
            assert!((20..=70).contains(&q), "quality {q} out of bounds");
        }
        assert!(last.is_some());
    }

    #[test]
    fn moderate_latency_cuts_five_and_low_latency_raises() {
        let mut qc = controller();
        let t0 = Instant::now();
        // Until four RTT samples exist the fps path decides; 50 fps holds.
        for _ in 0..3 {
            assert!(qc.on_sample(&sample(t0, 50.0, Some(70.0), 0), t0).is_none());
        }
        let adj = qc.on_sample(&sample(t0, 50.0, Some(70.0), 0), t0).unwrap();
        assert_eq!(
            (adj.previous, adj.quality, adj.reason),
            (50, 45, AdjustReason::ModerateLatency)
        );

        let mut qc = controller();
        // A dropped frame keeps the fps path from raising early.
        for _ in 0..3 {
            assert!(qc.on_sample(&sample(t0, 58.0, Some(10.0), 1), t0).is_none());
        }
        let adj = qc.on_sample(&sample(t0, 58.0, Some(10.0), 0), t0).unwrap();
        assert_eq!(adj.quality, 52);
        assert_eq!(adj.reason, AdjustReason::Headroom);
    }

    #[test]
    fn rtt_hold_suppresses_fps_path() {
        let mut qc = controller();
        let t0 = Instant::now();
        // RTT between 20 and 50 ms: the RTT path holds even though fps is
        // far below the floor.
        for i in 0..8u64 {
            let now = t0 + Duration::from_secs(i * 3);
            let fps = if i < 3 { 50.0 } else { 10.0 };
            assert!(qc.on_sample(&sample(now, fps, Some(30.0), 0), now).is_none());
        }
        assert_eq!(qc.current_quality(), 50);
    }

    #[test]
    fn fps_fallback_without_rtt() {
        let mut qc = controller();
        let t0 = Instant::now();
        // Two samples are not enough.
        assert!(qc.on_sample(&sample(t0, 30.0, None, 0), t0).is_none());
        assert!(qc.on_sample(&sample(t0, 30.0, None, 0), t0).is_none());
        let adj = qc.on_sample(&sample(t0, 30.0, None, 0), t0).unwrap();
        assert_eq!((adj.quality, adj.reason), (45, AdjustReason::LowFps));

        assert!((qc.fps_floor() - 48.0).abs() < 1e-9);
        let t1 = t0 + Duration::from_secs(2);
        qc.on_sample(&sample(t1, 30.0, None, 0), t1).unwrap();
        // Two consecutive cuts relax the floor.
        assert!((qc.fps_floor() - 42.0).abs() < 1e-9);
    }

    #[test]
    fn fps_fallback_raise_requires_no_drops() {
        let mut qc = controller();
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(qc.on_sample(&sample(t0, 60.0, None, 1), t0).is_none());
        }
        let adj = qc.on_sample(&sample(t0, 60.0, None, 0), t0).unwrap();
        assert_eq!(adj.quality, 52);
    }

    #[test]
    fn clamped_no_op_does_not_restart_gate() {
        let config = QualityConfig {
            initial_quality: 70,
            ..QualityConfig::default()
        };
        let mut qc = QualityController::new(config, Resolution::default()).unwrap();
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(qc.on_sample(&sample(t0, 60.0, None, 0), t0).is_none());
        }
        assert_eq!(qc.state().last_adjustment_at, None);
        // A cut is still allowed right away.
        let adj = qc.on_sample(&sample(t0, 0.0, None, 0), t0).unwrap();
        assert_eq!(adj.quality, 65);
    }

    #[test]
    fn non_adaptive_mode_ignores_rtt() {
        let config = QualityConfig {
            network_adaptive: false,
            ..QualityConfig::default()
        };
        let mut qc = QualityController::new(config, Resolution::default()).unwrap();
        let t0 = Instant::now();
        for _ in 0..5 {
            assert!(qc.on_sample(&sample(t0, 50.0, Some(500.0), 0), t0).is_none());
        }
    }

    #[test]
    fn throttle_formula() {
        let base = Duration::from_micros(16_667);
        let d = gpu_throttle_delay(base, 0.25);
        // 16.667 ms × 0.75 × 0.3 ≈ 3.75 ms
        assert!((d.as_secs_f64() * 1000.0 - 3.75).abs() < 0.01, "{d:?}");
        assert_eq!(gpu_throttle_delay(base, 1.0), Duration::ZERO);
        assert_eq!(gpu_throttle_delay(Duration::from_millis(100), 0.0), MAX_THROTTLE);
        assert_eq!(
            controller().throttle_delay(),
            gpu_throttle_delay(Duration::from_secs_f64(1.0 / 60.0), 0.25)
        );
    }

    #[test]
    fn config_validation() {
        assert!(QualityConfig::default().validate().is_ok());
        let bad = QualityConfig {
            min_quality: 80,
            ..QualityConfig::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::OutOfRange {
                field: "min_quality",
                ..
            })
        ));
        let bad = QualityConfig {
            gpu_allocation: 1.5,
            ..QualityConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = QualityConfig {
            target_fps: 0,
            ..QualityConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
