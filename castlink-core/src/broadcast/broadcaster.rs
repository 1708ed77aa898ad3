//! Client registry and frame fan-out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broadcast::control::{ControlMessage, StreamInfo};
use crate::broadcast::sink::FrameSink;
use crate::error::SinkError;
use crate::events::{DisconnectReason, EventBus, SessionEvent};
use crate::types::{ClientId, Resolution, TransportKind};

/// Silence after which a client is considered gone.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

struct ClientEntry {
    sink: Arc<dyn FrameSink>,
    last_seen: Instant,
}

/// Snapshot of one registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub kind: TransportKind,
    pub peer: SocketAddr,
    pub last_seen: Instant,
}

/// Outcome of one [`FrameBroadcaster::publish_frame`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Clients removed because their send failed.
    pub evicted: Vec<ClientId>,
    /// Frame bytes handed to sinks that accepted them.
    pub bytes: u64,
}

/// Fans encoded frames out to every registered client sink.
///
/// The registry lock is held only to snapshot or mutate the map, never
/// across an `.await`. Sends run concurrently outside the lock, and a
/// failed client is removed after the pass without affecting the
/// others.
pub struct FrameBroadcaster {
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    next_id: AtomicU64,
    liveness_timeout: Duration,
    stream_info: RwLock<StreamInfo>,
    events: EventBus,
}

impl FrameBroadcaster {
    pub fn new(stream_info: StreamInfo, liveness_timeout: Duration, events: EventBus) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            liveness_timeout,
            stream_info: RwLock::new(stream_info),
            events,
        }
    }

    /// Allocate an id for a client about to be registered.
    pub fn next_client_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The handshake new clients receive.
    pub fn stream_info(&self) -> StreamInfo {
        match self.stream_info.read() {
            Ok(info) => info.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the handshake for clients registered from now on.
    pub fn set_stream_info(&self, info: StreamInfo) {
        match self.stream_info.write() {
            Ok(mut slot) => *slot = info,
            Err(poisoned) => *poisoned.into_inner() = info,
        }
    }

    pub fn set_resolution(&self, resolution: Resolution, fps: u32) {
        let mut info = self.stream_info();
        info.width = resolution.width;
        info.height = resolution.height;
        info.fps = fps;
        self.set_stream_info(info);
    }

    /// Send the info handshake, then add the sink.
    ///
    /// A sink whose handshake fails is never registered. Registering an
    /// id that already exists replaces (and closes) the old sink.
    pub async fn register_client(
        &self,
        sink: Arc<dyn FrameSink>,
        handshake: &StreamInfo,
    ) -> Result<(), SinkError> {
        let id = sink.id();
        if let Err(e) = sink
            .send_control(&ControlMessage::Info(handshake.clone()))
            .await
        {
            warn!(%id, peer = %sink.peer(), "handshake failed: {e}");
            sink.close();
            return Err(e);
        }

        let kind = sink.kind();
        let peer = sink.peer();
        let replaced = self.lock().insert(
            id,
            ClientEntry {
                sink,
                last_seen: Instant::now(),
            },
        );
        if let Some(old) = replaced {
            old.sink.close();
            self.events.emit(SessionEvent::ClientDisconnected {
                id,
                reason: DisconnectReason::Replaced,
            });
        }

        info!(%id, %kind, %peer, "client registered");
        self.events.emit(SessionEvent::ClientConnected { id, kind, peer });
        Ok(())
    }

    /// Remove a client explicitly (goodbye, connection closed).
    pub fn unregister(&self, id: ClientId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(entry) => {
                entry.sink.close();
                info!(%id, "client unregistered");
                self.events.emit(SessionEvent::ClientDisconnected {
                    id,
                    reason: DisconnectReason::Closed,
                });
                true
            }
            None => false,
        }
    }

    /// Deliver one frame to every registered client.
    pub async fn publish_frame(&self, frame: Bytes) -> PublishReport {
        if frame.is_empty() {
            return PublishReport::default();
        }

        let targets: Vec<(ClientId, Arc<dyn FrameSink>)> = self
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.sink.clone()))
            .collect();
        if targets.is_empty() {
            return PublishReport::default();
        }

        let results = join_all(targets.iter().map(|(_, sink)| {
            let frame = frame.clone();
            async move {
                if !sink.is_open() {
                    return Err(SinkError::Closed);
                }
                sink.send_frame(frame).await
            }
        }))
        .await;

        let mut report = PublishReport::default();
        let mut failed = Vec::new();
        for ((id, sink), result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    report.bytes += frame.len() as u64;
                }
                Err(e) => {
                    debug!(%id, "send failed: {e}");
                    failed.push((id, sink));
                }
            }
        }

        if !failed.is_empty() {
            let mut clients = self.lock();
            for (id, sink) in failed {
                // Only remove the sink we actually sent to; a newer
                // registration under the same id stays.
                let same = clients
                    .get(&id)
                    .is_some_and(|entry| std::ptr::addr_eq(Arc::as_ptr(&entry.sink), Arc::as_ptr(&sink)));
                if same {
                    clients.remove(&id);
                    report.evicted.push(id);
                }
                sink.close();
            }
        }
        for id in &report.evicted {
            warn!(%id, "client evicted after failed send");
            self.events.emit(SessionEvent::ClientDisconnected {
                id: *id,
                reason: DisconnectReason::SendFailed,
            });
        }
        report
    }

    /// Remove closed sinks and clients silent for longer than the
    /// liveness timeout. Returns how many were removed.
    pub fn unregister_dead_clients(&self, now: Instant) -> usize {
        let mut dead = Vec::new();
        {
            let mut clients = self.lock();
            clients.retain(|id, entry| {
                let timed_out = now.saturating_duration_since(entry.last_seen) > self.liveness_timeout;
                if !entry.sink.is_open() {
                    dead.push((*id, entry.sink.clone(), DisconnectReason::Closed));
                    false
                } else if timed_out {
                    dead.push((*id, entry.sink.clone(), DisconnectReason::Timeout));
                    false
                } else {
                    true
                }
            });
        }

        for (id, sink, reason) in &dead {
            sink.close();
            info!(%id, ?reason, "removed dead client");
            self.events.emit(SessionEvent::ClientDisconnected {
                id: *id,
                reason: *reason,
            });
        }
        dead.len()
    }

    /// Refresh a client's liveness. Returns `false` for unknown ids.
    pub fn touch(&self, id: ClientId) -> bool {
        self.touch_at(id, Instant::now())
    }

    pub fn touch_at(&self, id: ClientId, now: Instant) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_registered(&self, id: ClientId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut list: Vec<ClientInfo> = self
            .lock()
            .iter()
            .map(|(id, entry)| ClientInfo {
                id: *id,
                kind: entry.sink.kind(),
                peer: entry.sink.peer(),
                last_seen: entry.last_seen,
            })
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    /// Close and drop every client.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (id, entry) in drained {
            entry.sink.close();
            self.events.emit(SessionEvent::ClientDisconnected {
                id,
                reason: DisconnectReason::Closed,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, ClientEntry>> {
        // A panic while holding the lock leaves the map itself intact.
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::broadcast::sink::{AtomicSinkState, SinkState};

    /// In-memory sink recording what it was sent.
    pub(crate) struct MockSink {
        id: ClientId,
        fail_frames: bool,
        fail_control: bool,
        state: AtomicSinkState,
        pub frames: Mutex<Vec<Bytes>>,
        pub controls: Mutex<Vec<ControlMessage>>,
        pub closes: AtomicUsize,
    }

    impl MockSink {
        pub(crate) fn healthy(id: u64) -> Arc<Self> {
            Self::build(id, false, false)
        }

        pub(crate) fn failing(id: u64) -> Arc<Self> {
            Self::build(id, true, false)
        }

        fn build(id: u64, fail_frames: bool, fail_control: bool) -> Arc<Self> {
            Arc::new(Self {
                id: ClientId(id),
                fail_frames,
                fail_control,
                state: AtomicSinkState::new(SinkState::Open),
                frames: Mutex::new(Vec::new()),
                controls: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            })
        }

        pub(crate) fn frame_count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl FrameSink for MockSink {
        fn id(&self) -> ClientId {
            self.id
        }
        fn kind(&self) -> TransportKind {
            TransportKind::Stream
        }
        fn peer(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 40000 + self.id.0 as u16))
        }
        fn state(&self) -> SinkState {
            self.state.load()
        }
        async fn send_frame(&self, frame: Bytes) -> Result<(), SinkError> {
            if self.fail_frames {
                return Err(SinkError::Backpressure);
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
        async fn send_control(&self, message: &ControlMessage) -> Result<(), SinkError> {
            if self.fail_control {
                return Err(SinkError::Closed);
            }
            // The handshake must precede any frame.
            assert!(self.frames.lock().unwrap().is_empty());
            self.controls.lock().unwrap().push(message.clone());
            Ok(())
        }
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.state.store(SinkState::Closed);
        }
    }

    pub(crate) fn info() -> StreamInfo {
        StreamInfo::new(Resolution::new(1280, 720), 60, "h264")
    }

    fn broadcaster() -> FrameBroadcaster {
        FrameBroadcaster::new(info(), DEFAULT_LIVENESS_TIMEOUT, EventBus::default())
    }

    #[tokio::test]
    async fn handshake_precedes_registration() {
        let b = broadcaster();
        let sink = MockSink::healthy(1);
        b.register_client(sink.clone(), &info()).await.unwrap();
        assert_eq!(b.client_count(), 1);
        assert_eq!(
            sink.controls.lock().unwrap().as_slice(),
            &[ControlMessage::Info(info())]
        );

        let refused = MockSink::build(2, false, true);
        assert!(b.register_client(refused.clone(), &info()).await.is_err());
        assert_eq!(b.client_count(), 1);
        assert_eq!(refused.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_client_removed_healthy_still_served() {
        let b = broadcaster();
        let mut events = b.events.subscribe();
        let good = MockSink::healthy(1);
        let bad = MockSink::failing(2);
        b.register_client(good.clone(), &info()).await.unwrap();
        b.register_client(bad.clone(), &info()).await.unwrap();

        let report = b.publish_frame(Bytes::from_static(b"frame-1")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![ClientId(2)]);
        assert_eq!(report.bytes, 7);
        assert!(!b.is_registered(ClientId(2)));
        assert_eq!(good.frame_count(), 1);

        // The next frame only goes to the survivor.
        let report = b.publish_frame(Bytes::from_static(b"frame-2")).await;
        assert_eq!(report.delivered, 1);
        assert!(report.evicted.is_empty());
        assert_eq!(good.frame_count(), 2);

        let mut saw_eviction = false;
        while let Ok(ev) = events.try_recv() {
            if ev
                == (SessionEvent::ClientDisconnected {
                    id: ClientId(2),
                    reason: DisconnectReason::SendFailed,
                })
            {
                saw_eviction = true;
            }
        }
        assert!(saw_eviction);
    }

    #[tokio::test]
    async fn empty_frame_and_no_clients_are_no_ops() {
        let b = broadcaster();
        assert_eq!(b.publish_frame(Bytes::from_static(b"x")).await, PublishReport::default());

        let sink = MockSink::healthy(1);
        b.register_client(sink.clone(), &info()).await.unwrap();
        assert_eq!(b.publish_frame(Bytes::new()).await, PublishReport::default());
        assert_eq!(sink.frame_count(), 0);
    }

    #[tokio::test]
    async fn reregistering_replaces_old_sink() {
        let b = broadcaster();
        let old = MockSink::healthy(5);
        let new = MockSink::healthy(5);
        b.register_client(old.clone(), &info()).await.unwrap();
        b.register_client(new.clone(), &info()).await.unwrap();
        assert_eq!(b.client_count(), 1);
        assert_eq!(old.closes.load(Ordering::SeqCst), 1);

        b.publish_frame(Bytes::from_static(b"f")).await;
        assert_eq!(new.frame_count(), 1);
        assert_eq!(old.frame_count(), 0);
    }

    #[tokio::test]
    async fn dead_client_sweep_is_idempotent() {
        tokio::time::pause();
        let b = broadcaster();
        let fresh = MockSink::healthy(1);
        let stale = MockSink::healthy(2);
        let closed = MockSink::healthy(3);
        for s in [&fresh, &stale, &closed] {
            b.register_client(s.clone(), &info()).await.unwrap();
        }
        closed.close();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(b.touch(ClientId(1)));

        assert_eq!(b.unregister_dead_clients(Instant::now()), 2);
        assert_eq!(b.unregister_dead_clients(Instant::now()), 0);
        assert_eq!(b.client_count(), 1);
        assert!(b.is_registered(ClientId(1)));
        assert!(!b.touch(ClientId(2)));
    }

    #[tokio::test]
    async fn unregister_and_close_all() {
        let b = broadcaster();
        let a = MockSink::healthy(1);
        let c = MockSink::healthy(2);
        b.register_client(a.clone(), &info()).await.unwrap();
        b.register_client(c.clone(), &info()).await.unwrap();

        assert!(b.unregister(ClientId(1)));
        assert!(!b.unregister(ClientId(1)));
        assert!(!a.is_open());

        b.close_all();
        assert_eq!(b.client_count(), 0);
        assert!(!c.is_open());
    }

    #[test]
    fn client_ids_are_unique_per_broadcaster() {
        let b = broadcaster();
        let a = b.next_client_id();
        let c = b.next_client_id();
        assert_ne!(a, c);
        // A second broadcaster starts its own sequence.
        assert_eq!(broadcaster().next_client_id(), a);
    }
}
