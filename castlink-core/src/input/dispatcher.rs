//! Inbound input queue and the task that drains it.
//!
//! ```text
//!  datagram server ─┐
//!                   ├─ InputQueue (bounded, try_push) ─► InputDispatcher ─► InjectionSink
//!  stream server  ──┘                                         │
//!                                                             ├─► EventBus (Special)
//!                                                             └─► latency channel
//! ```
//!
//! Transports never wait on input: a full queue drops the message and
//! bumps a counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::InputError;
use crate::events::{EventBus, SessionEvent};
use crate::input::frame::InputFrame;
use crate::input::pipeline::process_input;
use crate::input::profile::{ProfileSlot, SpecialAction};
use crate::input::wire::ClientMessage;
use crate::types::ClientId;

/// Messages buffered between the transports and the dispatcher.
pub const DEFAULT_INPUT_QUEUE: usize = 256;

/// Where normalized input ends up. The real backend drives a virtual
/// controller; tests record.
pub trait InjectionSink: Send + Sync {
    fn inject(&self, frame: &InputFrame) -> Result<(), InputError>;
    fn special(&self, action: SpecialAction) -> Result<(), InputError>;
}

/// One undecoded input message and the client it came from.
#[derive(Debug, Clone)]
pub struct InboundInput {
    pub client: ClientId,
    pub payload: Bytes,
}

// ── Queue ────────────────────────────────────────────────────────

/// Producer side, cloned into each transport.
#[derive(Debug, Clone)]
pub struct InputQueue {
    tx: mpsc::Sender<InboundInput>,
    dropped: Arc<AtomicU64>,
}

impl InputQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InboundInput>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue without waiting.
    pub fn try_push(&self, client: ClientId, payload: Bytes) -> Result<(), InputError> {
        match self.tx.try_send(InboundInput { client, payload }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(InputError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(InputError::Injection("input dispatcher stopped".into()))
            }
        }
    }

    /// Messages refused because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ── Dispatcher ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub processed: u64,
    pub malformed: u64,
    pub injection_failures: u64,
    pub special_actions: u64,
    pub latency_reports: u64,
}

pub struct InputDispatcher {
    rx: mpsc::Receiver<InboundInput>,
    profile: Arc<ProfileSlot>,
    sink: Arc<dyn InjectionSink>,
    events: EventBus,
    latency: Option<mpsc::Sender<Duration>>,
}

impl InputDispatcher {
    pub fn new(
        rx: mpsc::Receiver<InboundInput>,
        profile: Arc<ProfileSlot>,
        sink: Arc<dyn InjectionSink>,
        events: EventBus,
    ) -> Self {
        Self {
            rx,
            profile,
            sink,
            events,
            latency: None,
        }
    }

    /// Read mappings from `slot` instead of the one given to [`new`](Self::new).
    pub fn with_profile_slot(mut self, slot: Arc<ProfileSlot>) -> Self {
        self.profile = slot;
        self
    }

    /// Forward client latency reports to `tx`.
    pub fn with_latency_reports(mut self, tx: mpsc::Sender<Duration>) -> Self {
        self.latency = Some(tx);
        self
    }

    /// Drain the queue until cancelled or every producer is gone.
    ///
    /// Borrows so the owner can run the dispatcher again after a stop.
    pub async fn run(&mut self, cancel: CancellationToken) -> DispatchStats {
        let mut stats = DispatchStats::default();
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.dispatch(msg, &mut stats);
            tokio::task::yield_now().await;
        }
        info!(
            processed = stats.processed,
            malformed = stats.malformed,
            "input dispatcher stopped"
        );
        stats
    }

    fn dispatch(&self, msg: InboundInput, stats: &mut DispatchStats) {
        let parsed = match ClientMessage::parse(&msg.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                stats.malformed += 1;
                debug!(client = %msg.client, "{e}");
                return;
            }
        };

        let raw = match parsed {
            ClientMessage::Latency(report) => {
                stats.latency_reports += 1;
                self.report_latency(report.rtt_ms);
                return;
            }
            other => match other.into_raw() {
                Some(raw) => raw,
                None => return,
            },
        };

        let profile = self.profile.current();
        let out = process_input(&raw, &profile);
        stats.processed += 1;

        if let Err(e) = self.sink.inject(&out.frame) {
            stats.injection_failures += 1;
            warn!(client = %msg.client, "injection failed: {e}");
        }
        for action in out.special {
            stats.special_actions += 1;
            if let Err(e) = self.sink.special(action) {
                stats.injection_failures += 1;
                warn!(client = %msg.client, %action, "special action failed: {e}");
            }
            self.events.emit(SessionEvent::Special {
                client: msg.client,
                action,
            });
        }
    }

    fn report_latency(&self, rtt_ms: f64) {
        let Some(tx) = &self.latency else { return };
        if !rtt_ms.is_finite() || rtt_ms < 0.0 {
            return;
        }
        // Dropped while the frame loop is behind on draining.
        let _ = tx.try_send(Duration::from_secs_f64(rtt_ms / 1000.0));
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::frame::GamepadButtons;
    use crate::input::profile::{ButtonAction, MappingProfile};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        frames: Mutex<Vec<InputFrame>>,
        specials: Mutex<Vec<SpecialAction>>,
    }

    impl InjectionSink for Recording {
        fn inject(&self, frame: &InputFrame) -> Result<(), InputError> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn special(&self, action: SpecialAction) -> Result<(), InputError> {
            self.specials.lock().unwrap().push(action);
            Ok(())
        }
    }

    fn pad_json(buttons: u32) -> Bytes {
        Bytes::from(format!(
            r#"{{"Type":"gamepad","Buttons":{buttons},"LeftX":0,"LeftY":0,"RightX":0,"RightY":0,"LeftTrigger":0,"RightTrigger":0}}"#
        ))
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (queue, _rx) = InputQueue::channel(2);
        queue.try_push(ClientId(1), pad_json(0)).unwrap();
        queue.try_push(ClientId(1), pad_json(0)).unwrap();
        assert!(matches!(
            queue.try_push(ClientId(1), pad_json(0)),
            Err(InputError::QueueFull)
        ));
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn routes_frames_specials_and_latency() {
        let (queue, rx) = InputQueue::channel(DEFAULT_INPUT_QUEUE);
        let profile = Arc::new(ProfileSlot::new(
            MappingProfile::identity("shots")
                .with_binding(GamepadButtons::A, ButtonAction::Special(SpecialAction::Screenshot))
                .unwrap(),
        ));
        let sink = Arc::new(Recording::default());
        let events = EventBus::default();
        let mut observer = events.subscribe();
        let (lat_tx, mut lat_rx) = mpsc::channel(4);

        let mut dispatcher = InputDispatcher::new(rx, profile, sink.clone(), events)
            .with_latency_reports(lat_tx);

        queue.try_push(ClientId(7), pad_json(GamepadButtons::A.bits())).unwrap();
        queue.try_push(ClientId(7), Bytes::from_static(b"{\"Type\":\"nope\"}")).unwrap();
        queue
            .try_push(ClientId(7), Bytes::from_static(br#"{"Type":"latency","RttMs":40}"#))
            .unwrap();
        queue
            .try_push(ClientId(7), Bytes::from_static(br#"{"Type":"keyboard","Key":65,"Down":true}"#))
            .unwrap();
        drop(queue);

        let stats = dispatcher.run(CancellationToken::new()).await;
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.latency_reports, 1);
        assert_eq!(stats.special_actions, 1);

        assert_eq!(*sink.specials.lock().unwrap(), vec![SpecialAction::Screenshot]);
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].gamepad.unwrap().buttons, GamepadButtons::empty());
        assert_eq!(frames[1].key_events.len(), 1);

        assert_eq!(
            observer.recv().await.unwrap(),
            SessionEvent::Special {
                client: ClientId(7),
                action: SpecialAction::Screenshot
            }
        );
        assert_eq!(lat_rx.recv().await.unwrap(), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn profile_swap_applies_to_next_message() {
        let (queue, rx) = InputQueue::channel(8);
        let slot = Arc::new(ProfileSlot::default());
        let sink = Arc::new(Recording::default());
        let cancel = CancellationToken::new();
        let mut dispatcher = InputDispatcher::new(rx, slot.clone(), sink.clone(), EventBus::default());
        let token = cancel.clone();
        let task = tokio::spawn(async move { dispatcher.run(token).await });

        let a = GamepadButtons::A.bits();
        queue.try_push(ClientId(1), pad_json(a)).unwrap();
        while sink.frames.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        slot.swap(
            MappingProfile::identity("alt")
                .with_binding(GamepadButtons::A, ButtonAction::Gamepad(GamepadButtons::B))
                .unwrap(),
        );
        queue.try_push(ClientId(1), pad_json(a)).unwrap();
        while sink.frames.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        let stats = task.await.unwrap();
        assert_eq!(stats.processed, 2);
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames[0].gamepad.unwrap().buttons, GamepadButtons::A);
        assert_eq!(frames[1].gamepad.unwrap().buttons, GamepadButtons::B);
    }
}
