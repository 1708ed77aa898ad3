//! Frame pacing.
//!
//! ```text
//!   now                       deadline - spin      deadline
//!    │─────── coarse sleep ─────────│──── spin ────│
//! ```
//!
//! Timer sleeps overshoot by up to a scheduler tick, so the last couple
//! of milliseconds are waited out by spinning. When the loop falls more
//! than one frame behind, the deadline moves to `now` instead of firing
//! a burst of catch-up frames.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Remaining time below which [`FrameClock`] stops sleeping and spins.
pub const DEFAULT_SPIN_THRESHOLD: Duration = Duration::from_millis(2);

// ── TimeSource ───────────────────────────────────────────────────

#[async_trait]
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);

    /// Busy-wait until `deadline`, staying cooperative with the runtime.
    async fn spin_until(&self, deadline: Instant);
}

/// The tokio clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTime;

#[async_trait]
impl TimeSource for TokioTime {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn spin_until(&self, deadline: Instant) {
        while Instant::now() < deadline {
            tokio::task::yield_now().await;
        }
    }
}

/// A clock that only moves when slept on or advanced. Records how
/// waiting was split between sleeping and spinning.
#[derive(Debug, Clone)]
pub struct ManualTime {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    now: Instant,
    slept: Duration,
    spun: Duration,
}

impl ManualTime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                now: Instant::now(),
                slept: Duration::ZERO,
                spun: Duration::ZERO,
            })),
        }
    }

    /// Move the clock forward, as if work took `by`.
    pub fn advance(&self, by: Duration) {
        self.state().now += by;
    }

    pub fn slept(&self) -> Duration {
        self.state().slept
    }

    pub fn spun(&self) -> Duration {
        self.state().spun
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManualState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ManualTime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSource for ManualTime {
    fn now(&self) -> Instant {
        self.state().now
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.state();
            state.now += duration;
            state.slept += duration;
        }
        tokio::task::yield_now().await;
    }

    async fn spin_until(&self, deadline: Instant) {
        let mut state = self.state();
        let now = state.now;
        if deadline > now {
            state.spun += deadline - now;
            state.now = deadline;
        }
    }
}

// ── FrameClock ───────────────────────────────────────────────────

pub struct FrameClock {
    interval: Duration,
    spin_threshold: Duration,
    deadline: Option<Instant>,
    time: Arc<dyn TimeSource>,
}

impl FrameClock {
    pub fn new(fps: u32, time: Arc<dyn TimeSource>) -> Self {
        Self {
            interval: frame_interval(fps),
            spin_threshold: DEFAULT_SPIN_THRESHOLD,
            deadline: None,
            time,
        }
    }

    pub fn with_spin_threshold(mut self, threshold: Duration) -> Self {
        self.spin_threshold = threshold;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Change the frame rate; takes effect from the next deadline.
    pub fn set_fps(&mut self, fps: u32) {
        self.interval = frame_interval(fps);
    }

    /// Forget the current schedule. The next [`wait_next`](Self::wait_next)
    /// returns immediately and anchors a fresh one.
    pub fn reset(&mut self) {
        self.deadline = None;
    }

    /// Wait for the next frame slot. Returns how many slots were missed
    /// because the caller was late.
    pub async fn wait_next(&mut self) -> u32 {
        let now = self.time.now();
        let Some(deadline) = self.deadline else {
            self.deadline = Some(now + self.interval);
            return 0;
        };

        if now > deadline + self.interval {
            let behind = now - deadline;
            let missed = behind.as_nanos() / self.interval.as_nanos().max(1);
            self.deadline = Some(now + self.interval);
            return u32::try_from(missed).unwrap_or(u32::MAX);
        }

        if now < deadline {
            let remaining = deadline - now;
            if remaining > self.spin_threshold {
                self.time.sleep(remaining - self.spin_threshold).await;
            }
            self.time.spin_until(deadline).await;
        }
        self.deadline = Some(deadline + self.interval);
        0
    }
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}
