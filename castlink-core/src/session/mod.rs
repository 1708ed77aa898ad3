//! Per-session orchestration.
//!
//! ```text
//!              ┌──────────────────── frame loop task ─────────────────────┐
//!  FrameSource ─► FrameClock ─► next_chunk ─► FrameBroadcaster ─► SampleWindow
//!              │                                    once per window:     │
//!              │     sweep dead clients ◄── QualityController ◄──────────┘
//!              │            reconfigure ─► FrameSource      stats ─► watch
//!              └──────────────────────────────────────────────────────────┘
//!
//!  InputQueue ─► InputDispatcher task ─► InjectionSink
//! ```
//!
//! | Module   | Purpose                                          |
//! |----------|--------------------------------------------------|
//! | `config` | [`StreamConfig`] and its validation              |
//! | `source` | [`FrameSource`] capture/encode collaborator      |
//! | `clock`  | [`FrameClock`] pacing over a [`TimeSource`]      |
//! | `stats`  | [`StatsSnapshot`] published on a watch channel   |
//!
//! The session owns no sockets. The host binds a
//! [`DatagramServer`](crate::broadcast::DatagramServer) and a
//! [`StreamServer`](crate::broadcast::StreamServer) against
//! [`StreamSession::broadcaster`] and [`StreamSession::input_queue`].

pub mod clock;
pub mod config;
pub mod source;
pub mod stats;

pub use clock::{DEFAULT_SPIN_THRESHOLD, FrameClock, ManualTime, TimeSource, TokioTime};
pub use config::StreamConfig;
pub use source::{FrameSource, SourceTimings};
pub use stats::{StatsAccumulator, StatsSnapshot};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::FrameBroadcaster;
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent};
use crate::input::{DispatchStats, InjectionSink, InputDispatcher, InputQueue, ProfileSlot};
use crate::quality::{QualityController, SampleWindow, gpu_throttle_delay};
use crate::types::Resolution;

/// How often the frame loop checks for clients while capture is paused.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Latency reports buffered between the dispatcher and the frame loop.
const LATENCY_QUEUE: usize = 32;

// ── StreamSession ────────────────────────────────────────────────

/// Wires a frame source, the broadcaster, the quality controller and
/// the input dispatcher together for one streaming session.
pub struct StreamSession {
    config: StreamConfig,
    broadcaster: Arc<FrameBroadcaster>,
    events: EventBus,
    profile: Arc<ProfileSlot>,
    input: InputQueue,
    time: Arc<dyn TimeSource>,
    spin_threshold: Duration,
    stats_tx: watch::Sender<StatsSnapshot>,
    idle: Option<Idle>,
    running: Option<Running>,
}

/// Parts parked while the session is stopped.
struct Idle {
    source: Box<dyn FrameSource>,
    dispatcher: InputDispatcher,
    latency_rx: mpsc::Receiver<Duration>,
}

struct Running {
    cancel: CancellationToken,
    frame_task: JoinHandle<(Box<dyn FrameSource>, mpsc::Receiver<Duration>)>,
    input_task: JoinHandle<(InputDispatcher, DispatchStats)>,
}

impl StreamSession {
    pub fn new(
        config: StreamConfig,
        source: Box<dyn FrameSource>,
        injector: Arc<dyn InjectionSink>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let events = EventBus::default();
        let broadcaster = Arc::new(FrameBroadcaster::new(
            config.stream_info(),
            config.liveness_timeout,
            events.clone(),
        ));
        let profile = Arc::new(ProfileSlot::default());
        let (input, input_rx) = InputQueue::channel(config.input_queue);
        let (latency_tx, latency_rx) = mpsc::channel(LATENCY_QUEUE);
        let dispatcher = InputDispatcher::new(input_rx, profile.clone(), injector, events.clone())
            .with_latency_reports(latency_tx);
        let (stats_tx, _) = watch::channel(StatsSnapshot {
            resolution: config.resolution.to_string(),
            quality: config.quality.initial_quality,
            ..StatsSnapshot::default()
        });

        Ok(Self {
            config,
            broadcaster,
            events,
            profile,
            input,
            time: Arc::new(TokioTime),
            spin_threshold: DEFAULT_SPIN_THRESHOLD,
            stats_tx,
            idle: Some(Idle {
                source,
                dispatcher,
                latency_rx,
            }),
            running: None,
        })
    }

    /// Share an existing profile slot, e.g. one the host reloads from disk.
    pub fn with_profile_slot(mut self, slot: Arc<ProfileSlot>) -> Self {
        if let Some(idle) = self.idle.take() {
            let Idle {
                source,
                dispatcher,
                latency_rx,
            } = idle;
            self.idle = Some(Idle {
                source,
                dispatcher: dispatcher.with_profile_slot(slot.clone()),
                latency_rx,
            });
        }
        self.profile = slot;
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn with_spin_threshold(mut self, threshold: Duration) -> Self {
        self.spin_threshold = threshold;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> Arc<FrameBroadcaster> {
        self.broadcaster.clone()
    }

    /// Producer end for the transports' inbound input.
    pub fn input_queue(&self) -> InputQueue {
        self.input.clone()
    }

    pub fn profile(&self) -> Arc<ProfileSlot> {
        self.profile.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> watch::Receiver<StatsSnapshot> {
        self.stats_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start the source, then spawn the frame loop and the input
    /// dispatcher. Both stop when `cancel` (or [`stop`](Self::stop))
    /// fires.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<(), SessionError> {
        if self.running.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        let controller = if self.config.adaptive_quality {
            Some(QualityController::new(
                self.config.quality.clone(),
                self.config.resolution,
            )?)
        } else {
            None
        };

        let Some(mut idle) = self.idle.take() else {
            return Err(SessionError::SourceUnavailable(
                "frame source lost after a failed run".into(),
            ));
        };

        if let Err(e) = idle.source.start(&self.config).await {
            warn!("frame source failed to start: {e}");
            self.idle = Some(idle);
            return Err(match e {
                SessionError::SourceUnavailable(_) => e,
                other => SessionError::SourceUnavailable(other.to_string()),
            });
        }

        let cancel = cancel.child_token();
        let Idle {
            source,
            mut dispatcher,
            latency_rx,
        } = idle;

        let frame_loop = FrameLoop {
            window: SampleWindow::with_window(self.config.sample_window, self.time.now()),
            clock: FrameClock::new(self.config.fps(), self.time.clone())
                .with_spin_threshold(self.spin_threshold),
            throttle: gpu_throttle_delay(
                Duration::from_secs(1) / self.config.fps().max(1),
                self.config.quality.gpu_allocation,
            ),
            source,
            latency_rx,
            controller,
            stats: StatsAccumulator::default(),
            broadcaster: self.broadcaster.clone(),
            events: self.events.clone(),
            stats_tx: self.stats_tx.clone(),
            time: self.time.clone(),
            resolution: self.config.resolution,
            fps: self.config.fps(),
            window_len: self.config.sample_window,
            quality: self.config.quality.initial_quality,
        };
        let frame_task = tokio::spawn(frame_loop.run(cancel.clone()));

        let input_cancel = cancel.clone();
        let input_task = tokio::spawn(async move {
            let stats = dispatcher.run(input_cancel).await;
            (dispatcher, stats)
        });

        self.running = Some(Running {
            cancel,
            frame_task,
            input_task,
        });
        info!(
            resolution = %self.config.resolution,
            fps = self.config.fps(),
            codec = %self.config.codec,
            "stream session started"
        );
        self.events.emit(SessionEvent::Started {
            resolution: self.config.resolution,
            fps: self.config.fps(),
        });
        Ok(())
    }

    /// Cancel both tasks and wait for them. The session can be started
    /// again afterwards.
    pub async fn stop(&mut self) -> Result<DispatchStats, SessionError> {
        let Some(running) = self.running.take() else {
            return Err(SessionError::NotRunning);
        };
        running.cancel.cancel();

        let frame = running.frame_task.await;
        let input = running.input_task.await;
        match (frame, input) {
            (Ok((source, latency_rx)), Ok((dispatcher, stats))) => {
                self.idle = Some(Idle {
                    source,
                    dispatcher,
                    latency_rx,
                });
                Ok(stats)
            }
            (frame, input) => {
                let reason = frame
                    .err()
                    .or(input.err())
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                Err(SessionError::Source(format!("session task failed: {reason}")))
            }
        }
    }
}

// ── Frame loop ───────────────────────────────────────────────────

struct FrameLoop {
    source: Box<dyn FrameSource>,
    latency_rx: mpsc::Receiver<Duration>,
    controller: Option<QualityController>,
    window: SampleWindow,
    clock: FrameClock,
    stats: StatsAccumulator,
    broadcaster: Arc<FrameBroadcaster>,
    events: EventBus,
    stats_tx: watch::Sender<StatsSnapshot>,
    time: Arc<dyn TimeSource>,
    throttle: Duration,
    resolution: Resolution,
    fps: u32,
    window_len: Duration,
    quality: u8,
}

impl FrameLoop {
    async fn run(mut self, cancel: CancellationToken) -> (Box<dyn FrameSource>, mpsc::Receiver<Duration>) {
        let mut paused = false;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.broadcaster.client_count() == 0 {
                if !paused {
                    debug!("no clients, capture paused");
                    paused = true;
                }
                self.clock.reset();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.time.sleep(IDLE_POLL) => {}
                }
                self.end_of_window(true).await;
                continue;
            }
            if paused {
                debug!("client connected, capture resumed");
                paused = false;
                self.window.restart(self.time.now());
                self.stats = StatsAccumulator::default();
            }

            let missed = tokio::select! {
                _ = cancel.cancelled() => break,
                missed = self.clock.wait_next() => missed,
            };
            if missed > 0 {
                self.window.record_drops(missed);
            }

            let pulled_at = self.time.now();
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = self.source.next_chunk() => chunk,
            };
            let pull_time = self.time.now().saturating_duration_since(pulled_at);

            match chunk {
                Ok(Some(frame)) => {
                    let sent_at = self.time.now();
                    let report = self.broadcaster.publish_frame(frame).await;
                    let send_time = self.time.now().saturating_duration_since(sent_at);
                    let (capture, encode) = match self.source.timings() {
                        Some(t) => (t.capture, t.encode),
                        None => (pull_time, Duration::ZERO),
                    };
                    self.stats.record(capture, encode, send_time);
                    self.window.record_frame(report.bytes);
                }
                Ok(None) => {}
                Err(e) => warn!("frame source error: {e}"),
            }

            self.end_of_window(false).await;

            if !self.throttle.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.time.sleep(self.throttle) => {}
                }
            }
        }

        self.source.stop().await;
        self.broadcaster.close_all();
        info!("stream session stopped");
        self.events.emit(SessionEvent::Stopped);
        (self.source, self.latency_rx)
    }

    /// Once per sample window: sweep, quality decision, stats.
    ///
    /// While capture is paused only stats are published; an idle window
    /// says nothing about what the encoder can sustain.
    async fn end_of_window(&mut self, paused: bool) {
        while let Ok(rtt) = self.latency_rx.try_recv() {
            if !paused {
                self.window.record_rtt(rtt);
            }
        }

        let now = self.time.now();
        let Some(sample) = self.window.poll(now) else {
            return;
        };

        // Liveness is tracked on the broadcaster's own clock.
        let swept = self.broadcaster.unregister_dead_clients(Instant::now());
        if swept > 0 {
            debug!(swept, "dead clients removed");
        }

        if let Some(controller) = self.controller.as_mut().filter(|_| !paused) {
            if let Some(adjustment) = controller.on_sample(&sample, now) {
                self.quality = adjustment.quality;
                if let Err(e) = self
                    .source
                    .reconfigure(adjustment.quality, self.resolution, self.fps)
                    .await
                {
                    warn!("reconfigure failed: {e}");
                }
                self.events.emit(SessionEvent::QualityChanged(adjustment));
            }
            self.throttle = controller.throttle_delay();
        }

        let snapshot = self.stats.snapshot(
            &sample,
            self.window_len,
            self.broadcaster.client_count(),
            self.resolution,
            self.quality,
        );
        self.stats_tx.send_replace(snapshot);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::StreamInfo;
    use crate::broadcast::broadcaster::tests::MockSink;
    use crate::error::InputError;
    use crate::input::{InputFrame, SpecialAction};
    use crate::quality::AdjustReason;
    use crate::types::ClientId;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct SourceLog {
        pulls: AtomicU32,
        reconfigures: Mutex<Vec<(u8, Resolution, u32)>>,
        stopped: AtomicBool,
    }

    struct TestSource {
        log: Arc<SourceLog>,
        fail_start: bool,
    }

    #[async_trait]
    impl FrameSource for TestSource {
        async fn start(&mut self, _config: &StreamConfig) -> Result<(), SessionError> {
            if self.fail_start {
                Err(SessionError::Source("no encoder".into()))
            } else {
                Ok(())
            }
        }

        async fn next_chunk(&mut self) -> Result<Option<Bytes>, SessionError> {
            self.log.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Bytes::from_static(&[0xAB; 64])))
        }

        async fn reconfigure(
            &mut self,
            quality: u8,
            resolution: Resolution,
            fps: u32,
        ) -> Result<(), SessionError> {
            self.log
                .reconfigures
                .lock()
                .unwrap()
                .push((quality, resolution, fps));
            Ok(())
        }

        async fn stop(&mut self) {
            self.log.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct NullInjector;

    impl InjectionSink for NullInjector {
        fn inject(&self, _frame: &InputFrame) -> Result<(), InputError> {
            Ok(())
        }

        fn special(&self, _action: SpecialAction) -> Result<(), InputError> {
            Ok(())
        }
    }

    fn config() -> StreamConfig {
        let mut config = StreamConfig::default();
        config.quality.target_fps = 50;
        config.quality.gpu_allocation = 1.0;
        config.liveness_timeout = Duration::from_secs(3600);
        config
    }

    fn session(config: StreamConfig, fail_start: bool) -> (StreamSession, Arc<SourceLog>) {
        let log = Arc::new(SourceLog::default());
        let source = TestSource {
            log: log.clone(),
            fail_start,
        };
        let session = StreamSession::new(config, Box::new(source), Arc::new(NullInjector))
            .unwrap()
            .with_spin_threshold(Duration::ZERO);
        (session, log)
    }

    fn info() -> StreamInfo {
        StreamInfo::new(Resolution::default(), 50, "h264")
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = config();
        config.quality.target_fps = 500;
        let result = StreamSession::new(
            config,
            Box::new(TestSource {
                log: Arc::default(),
                fail_start: false,
            }),
            Arc::new(NullInjector),
        );
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn failing_source_leaves_session_stopped() {
        let (mut session, log) = session(config(), true);
        let err = session.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::SourceUnavailable(_)));
        assert!(!session.is_running());
        assert_eq!(log.pulls.load(Ordering::SeqCst), 0);
        assert!(matches!(session.stop().await, Err(SessionError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn no_clients_means_no_pulls() {
        let (mut session, log) = session(config(), false);
        let mut events = session.subscribe();
        session.start(CancellationToken::new()).await.unwrap();
        assert!(matches!(
            session.start(CancellationToken::new()).await,
            Err(SessionError::AlreadyRunning)
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(log.pulls.load(Ordering::SeqCst), 0);
        // Stats still tick while paused.
        assert_eq!(session.stats().borrow().clients, 0);

        session.stop().await.unwrap();
        assert!(log.stopped.load(Ordering::SeqCst));
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Started { fps: 50, .. }));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_to_registered_client_and_publishes_stats() {
        let (mut session, log) = session(config(), false);
        let broadcaster = session.broadcaster();
        let sink = MockSink::healthy(1);
        broadcaster.register_client(sink.clone(), &info()).await.unwrap();

        let mut stats = session.stats();
        session.start(CancellationToken::new()).await.unwrap();

        stats.changed().await.unwrap();
        let snapshot = stats.borrow().clone();
        assert_eq!(snapshot.clients, 1);
        assert!(snapshot.fps > 40.0, "fps {}", snapshot.fps);
        assert!(snapshot.bitrate_kbps > 0);

        session.stop().await.unwrap();
        assert!(log.pulls.load(Ordering::SeqCst) >= 45);
        assert!(sink.frame_count() >= 45);
        // Stopping closes every client.
        assert_eq!(broadcaster.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_leaves_quality_alone() {
        let (mut session, log) = session(config(), false);
        let broadcaster = session.broadcaster();
        let mut stats = session.stats();
        session.start(CancellationToken::new()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(log.pulls.load(Ordering::SeqCst), 0);
        assert!(log.reconfigures.lock().unwrap().is_empty());
        assert_eq!(stats.borrow_and_update().quality, 50);

        // The first client after a long pause gets the quality the
        // session idled at, and a window measured from the resume.
        broadcaster
            .register_client(MockSink::healthy(1), &info())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let snapshot = stats.borrow_and_update().clone();
        assert_eq!(snapshot.clients, 1);
        assert!(snapshot.fps > 40.0, "fps {}", snapshot.fps);
        assert!(
            log.reconfigures.lock().unwrap().iter().all(|(q, _, _)| *q >= 50),
            "idle time leaked into quality decisions"
        );

        session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn latency_reports_drive_reconfiguration() {
        let mut config = config();
        config.quality.min_adjustment_interval = Duration::from_millis(500);
        let (mut session, log) = session(config, false);
        let broadcaster = session.broadcaster();
        broadcaster
            .register_client(MockSink::healthy(1), &info())
            .await
            .unwrap();
        let mut events = session.subscribe();
        let input = session.input_queue();
        session.start(CancellationToken::new()).await.unwrap();

        // Several reports per window; the latency path needs four windows
        // of history before it takes over from the fps path.
        for _ in 0..40 {
            input
                .try_push(ClientId(1), Bytes::from_static(br#"{"Type":"latency","RttMs":150}"#))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        session.stop().await.unwrap();

        let mut changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::QualityChanged(adj) = event {
                changes.push(adj);
            }
        }
        let reconfigured: Vec<u8> = log
            .reconfigures
            .lock()
            .unwrap()
            .iter()
            .map(|(q, _, _)| *q)
            .collect();
        assert_eq!(reconfigured, changes.iter().map(|a| a.quality).collect::<Vec<_>>());

        let cuts: Vec<_> = changes
            .iter()
            .filter(|a| a.reason == AdjustReason::HighLatency)
            .collect();
        assert!(!cuts.is_empty());
        for cut in &cuts {
            assert_eq!(cut.quality, cut.previous.saturating_sub(10).max(20));
        }
        assert_eq!(changes.last().map(|a| a.quality), Some(20));
    }
}
