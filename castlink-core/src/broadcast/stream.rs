//! TCP transport: queued per-client sinks and the accept loop.
//!
//! Every message on the wire is length-delimited (u32 big-endian length
//! prefix). Host → client: the JSON info handshake first, then one
//! message per encoded frame. Client → host: input JSON, or an empty
//! message as a heartbeat.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::broadcaster::FrameBroadcaster;
use crate::broadcast::control::ControlMessage;
use crate::broadcast::sink::{AtomicSinkState, FrameSink, SinkState};
use crate::error::SinkError;
use crate::input::InputQueue;
use crate::types::{ClientId, TransportKind};

/// Frames buffered per stream client before it counts as too slow.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Largest single message accepted in either direction.
pub const MAX_STREAM_MESSAGE: usize = 16 * 1024 * 1024;

/// The codec used on both ends of the stream transport.
pub fn stream_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_STREAM_MESSAGE)
        .new_codec()
}

// ── StreamSink ───────────────────────────────────────────────────

/// Queues frames for one TCP peer; a writer task drains the queue.
///
/// `send_frame` never waits: a full queue means the peer cannot keep
/// up, and the send fails so the broadcaster evicts it.
pub struct StreamSink {
    id: ClientId,
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    state: Arc<AtomicSinkState>,
    cancel: CancellationToken,
}

impl StreamSink {
    /// Start the writer task for `writer`.
    pub fn spawn<W>(id: ClientId, peer: SocketAddr, writer: W, depth: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(depth.max(1));
        let state = Arc::new(AtomicSinkState::new(SinkState::Open));
        let cancel = CancellationToken::new();

        let task_state = state.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut framed = FramedWrite::new(writer, stream_codec());
            loop {
                let next = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    next = rx.recv() => next,
                };
                let Some(message) = next else { break };
                // A peer that stops reading parks the write; closing the
                // sink must still end the task.
                let sent = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    sent = framed.send(message) => sent,
                };
                if let Err(e) = sent {
                    debug!(%id, "stream write failed: {e}");
                    break;
                }
            }
            task_state.store(SinkState::Closed);
            if !task_cancel.is_cancelled() {
                let _ = SinkExt::<Bytes>::close(&mut framed).await;
            }
        });

        Self {
            id,
            peer,
            tx,
            state,
            cancel,
        }
    }

    /// Fires when the sink is closed or evicted.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn enqueue(&self, message: Bytes) -> Result<(), SinkError> {
        if !self.is_open() {
            return Err(SinkError::Closed);
        }
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Backpressure,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

#[async_trait]
impl FrameSink for StreamSink {
    fn id(&self) -> ClientId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn state(&self) -> SinkState {
        if self.tx.is_closed() {
            SinkState::Closed
        } else {
            self.state.load()
        }
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), SinkError> {
        self.enqueue(frame)
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<(), SinkError> {
        self.enqueue(message.to_bytes()?)
    }

    fn close(&self) {
        self.state.begin_closing();
        self.cancel.cancel();
    }
}

// ── StreamServer ─────────────────────────────────────────────────

/// Accepts TCP clients and registers a [`StreamSink`] for each.
pub struct StreamServer {
    listener: TcpListener,
    broadcaster: Arc<FrameBroadcaster>,
    input: InputQueue,
    depth: usize,
}

impl StreamServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        broadcaster: Arc<FrameBroadcaster>,
        input: InputQueue,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            broadcaster,
            input,
            depth: DEFAULT_QUEUE_DEPTH,
        })
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> std::io::Result<()> {
        info!("stream server listening on {}", self.local_addr()?);
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("stream accept failed: {e}");
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, "set_nodelay failed: {e}");
            }
            self.accept(stream, peer, cancel.child_token()).await;
        }
        info!("stream server stopped");
        Ok(())
    }

    async fn accept(&self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let id = self.broadcaster.next_client_id();
        let (read_half, write_half) = stream.into_split();
        let sink = Arc::new(StreamSink::spawn(id, peer, write_half, self.depth));
        let closed = sink.closed_token();
        let handshake = self.broadcaster.stream_info();
        if let Err(e) = self.broadcaster.register_client(sink, &handshake).await {
            warn!(%peer, "stream client registration failed: {e}");
            return;
        }

        tokio::spawn(read_client(
            id,
            read_half,
            self.broadcaster.clone(),
            self.input.clone(),
            cancel,
            closed,
        ));
    }
}

/// Forward a stream client's messages until it disconnects, the server
/// stops, or its sink is closed.
async fn read_client<R>(
    id: ClientId,
    reader: R,
    broadcaster: Arc<FrameBroadcaster>,
    input: InputQueue,
    cancel: CancellationToken,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(reader, stream_codec());
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = closed.cancelled() => {
                debug!(%id, "sink closed, reader stopping");
                return;
            }
            next = framed.next() => next,
        };
        match next {
            Some(Ok(message)) => {
                if !broadcaster.touch(id) {
                    // Evicted while we were reading.
                    return;
                }
                if message.is_empty() {
                    continue;
                }
                if let Err(e) = input.try_push(id, message.freeze()) {
                    debug!(%id, "input dropped: {e}");
                }
            }
            Some(Err(e)) => {
                debug!(%id, "stream read failed: {e}");
                break;
            }
            None => break,
        }
    }
    broadcaster.unregister(id);
}

// ── Tests ────────────────────────────────────────────────────────
