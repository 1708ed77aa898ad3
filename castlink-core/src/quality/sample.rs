//! Per-window performance accounting.

use std::time::Duration;

use tokio::time::Instant;

/// Length of one accounting window.
pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// What the frame loop achieved during one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    pub window_start: Instant,
    pub achieved_fps: f64,
    /// Smoothed client RTT, if any client reported one this window.
    pub avg_rtt_ms: Option<f64>,
    pub dropped_frame_count: u32,
    pub bytes_sent: u64,
}

/// Accumulates frame, drop, byte and RTT counts and closes a
/// [`PerformanceSample`] once per window.
///
/// RTT is smoothed across windows with the usual TCP estimator
/// (srtt = 7/8 · srtt + 1/8 · sample).
#[derive(Debug)]
pub struct SampleWindow {
    window: Duration,
    started: Instant,
    frames: u32,
    dropped: u32,
    bytes: u64,
    smoothed_rtt_us: u64,
    rtt_in_window: bool,
}

impl SampleWindow {
    pub fn new(now: Instant) -> Self {
        Self::with_window(DEFAULT_SAMPLE_WINDOW, now)
    }

    pub fn with_window(window: Duration, now: Instant) -> Self {
        Self {
            window,
            started: now,
            frames: 0,
            dropped: 0,
            bytes: 0,
            smoothed_rtt_us: 0,
            rtt_in_window: false,
        }
    }

    /// A frame was published; `bytes` is what the sinks accepted.
    pub fn record_frame(&mut self, bytes: u64) {
        self.frames += 1;
        self.bytes += bytes;
    }

    /// The frame clock missed a deadline.
    pub fn record_drops(&mut self, count: u32) {
        self.dropped += count;
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as u64;
        if self.smoothed_rtt_us == 0 {
            self.smoothed_rtt_us = rtt_us;
        } else {
            self.smoothed_rtt_us = self.smoothed_rtt_us * 7 / 8 + rtt_us / 8;
        }
        self.rtt_in_window = true;
    }

    /// Smoothed RTT so far, zero before the first measurement.
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.smoothed_rtt_us)
    }

    /// Drop the open window's counts and start a fresh one at `now`.
    /// The smoothed RTT carries over.
    pub fn restart(&mut self, now: Instant) {
        self.started = now;
        self.frames = 0;
        self.dropped = 0;
        self.bytes = 0;
        self.rtt_in_window = false;
    }

    /// Close the window if it has elapsed and start the next one.
    pub fn poll(&mut self, now: Instant) -> Option<PerformanceSample> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.window {
            return None;
        }
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let sample = PerformanceSample {
            window_start: self.started,
            achieved_fps: f64::from(self.frames) / secs,
            avg_rtt_ms: self
                .rtt_in_window
                .then(|| self.smoothed_rtt_us as f64 / 1000.0),
            dropped_frame_count: self.dropped,
            bytes_sent: self.bytes,
        };
        self.started = now;
        self.frames = 0;
        self.dropped = 0;
        self.bytes = 0;
        self.rtt_in_window = false;
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closes_window_after_one_second() {
        let t0 = Instant::now();
        let mut w = SampleWindow::new(t0);
        for _ in 0..60 {
            w.record_frame(1000);
        }
        w.record_drops(2);
        assert!(w.poll(t0 + Duration::from_millis(500)).is_none());

        let s = w.poll(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(s.window_start, t0);
        assert!((s.achieved_fps - 60.0).abs() < 1e-9);
        assert_eq!(s.dropped_frame_count, 2);
        assert_eq!(s.bytes_sent, 60_000);
        assert_eq!(s.avg_rtt_ms, None);

        // Counters restart with the next window.
        let s = w.poll(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(s.achieved_fps, 0.0);
        assert_eq!(s.dropped_frame_count, 0);
    }

    #[test]
    fn rtt_is_smoothed_and_reported_only_when_measured() {
        let t0 = Instant::now();
        let mut w = SampleWindow::new(t0);
        w.record_rtt(Duration::from_millis(80));
        w.record_rtt(Duration::from_millis(160));
        // 80 * 7/8 + 160 / 8 = 90 ms
        assert_eq!(w.latency(), Duration::from_millis(90));
        let s = w.poll(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(s.avg_rtt_ms, Some(90.0));

        let s = w.poll(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(s.avg_rtt_ms, None);
        assert_eq!(w.latency(), Duration::from_millis(90));
    }

    #[test]
    fn restart_discards_the_open_window() {
        let t0 = Instant::now();
        let mut w = SampleWindow::new(t0);
        w.record_rtt(Duration::from_millis(40));
        w.record_drops(3);

        let t1 = t0 + Duration::from_secs(30);
        w.restart(t1);
        assert!(w.poll(t1 + Duration::from_millis(999)).is_none());
        for _ in 0..50 {
            w.record_frame(100);
        }
        let s = w.poll(t1 + Duration::from_secs(1)).unwrap();
        assert_eq!(s.window_start, t1);
        assert!((s.achieved_fps - 50.0).abs() < 1e-9);
        assert_eq!(s.dropped_frame_count, 0);
        assert_eq!(s.avg_rtt_ms, None);
        assert_eq!(w.latency(), Duration::from_millis(40));
    }
}
