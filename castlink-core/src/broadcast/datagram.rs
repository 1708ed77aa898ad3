//! UDP transport: per-client datagram sinks and the listening server.
//!
//! Client → host datagrams on the stream port:
//!
//! | Datagram    | Meaning                                            |
//! |-------------|----------------------------------------------------|
//! | `HELLO`     | Register (or re-register) and receive the handshake |
//! | `PING`      | Liveness refresh; answered with a `pong` control   |
//! | `BYE`       | Unregister                                          |
//! | `{...}`     | Input JSON, forwarded to the input queue            |
//!
//! Datagrams from peers that never said `HELLO` are ignored.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::broadcaster::FrameBroadcaster;
use crate::broadcast::control::ControlMessage;
use crate::broadcast::framing::{DEFAULT_MTU, control_packet, frame_packets};
use crate::broadcast::sink::{AtomicSinkState, FrameSink, SinkState};
use crate::error::SinkError;
use crate::input::InputQueue;
use crate::types::{ClientId, TransportKind};

pub const HELLO: &[u8] = b"HELLO";
pub const PING: &[u8] = b"PING";
pub const BYE: &[u8] = b"BYE";

/// A classified client → host datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientDatagram<'a> {
    Hello,
    Ping,
    Bye,
    Json(&'a [u8]),
    Unknown,
}

impl<'a> ClientDatagram<'a> {
    pub fn classify(data: &'a [u8]) -> Self {
        let trimmed = data.trim_ascii();
        match trimmed {
            HELLO => Self::Hello,
            PING => Self::Ping,
            BYE => Self::Bye,
            _ if trimmed.first() == Some(&b'{') => Self::Json(trimmed),
            _ => Self::Unknown,
        }
    }
}

// ── DatagramSink ─────────────────────────────────────────────────

/// Sends chunked frames to one UDP peer over a shared socket.
///
/// There is no queue: each frame is written out immediately and loss
/// is left to the network. A chunk the socket cannot take right away
/// is dropped along with the rest of its frame, so one slow peer never
/// stalls a broadcast.
pub struct DatagramSink {
    id: ClientId,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    mtu: usize,
    sequence: AtomicU32,
    epoch: Instant,
    state: AtomicSinkState,
    dropped: AtomicU64,
}

impl DatagramSink {
    pub fn new(id: ClientId, peer: SocketAddr, socket: Arc<UdpSocket>) -> Self {
        Self {
            id,
            peer,
            socket,
            mtu: DEFAULT_MTU,
            sequence: AtomicU32::new(0),
            epoch: Instant::now(),
            state: AtomicSinkState::new(SinkState::Open),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Chunks discarded because the socket buffer was full.
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Push `packets` through a non-blocking `send`, stopping at the first
/// `WouldBlock`. Returns how many packets were left unsent.
fn transmit<F>(packets: &[Bytes], mut send: F) -> io::Result<u64>
where
    F: FnMut(&[u8]) -> io::Result<usize>,
{
    for (idx, packet) in packets.iter().enumerate() {
        match send(packet) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok((packets.len() - idx) as u64);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(0)
}

#[async_trait]
impl FrameSink for DatagramSink {
    fn id(&self) -> ClientId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn state(&self) -> SinkState {
        self.state.load()
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), SinkError> {
        if !self.is_open() {
            return Err(SinkError::Closed);
        }
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp_us = self.epoch.elapsed().as_micros() as u64;
        let packets = frame_packets(seq, timestamp_us, &frame, self.mtu);
        let dropped = transmit(&packets, |packet| self.socket.try_send_to(packet, self.peer))?;
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            debug!(id = %self.id, seq, dropped, "socket buffer full, frame truncated");
        }
        Ok(())
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<(), SinkError> {
        if !self.is_open() {
            return Err(SinkError::Closed);
        }
        let packet = control_packet(&message.to_bytes()?);
        self.socket.send_to(&packet, self.peer).await?;
        Ok(())
    }

    fn close(&self) {
        self.state.store(SinkState::Closed);
    }
}

// ── DatagramServer ───────────────────────────────────────────────

/// Owns the UDP stream port: registers clients, answers pings, and
/// forwards input JSON.
pub struct DatagramServer {
    socket: Arc<UdpSocket>,
    broadcaster: Arc<FrameBroadcaster>,
    input: InputQueue,
    peers: HashMap<SocketAddr, ClientId>,
    mtu: usize,
}

impl DatagramServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        broadcaster: Arc<FrameBroadcaster>,
        input: InputQueue,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::new(Arc::new(socket), broadcaster, input))
    }

    pub fn new(socket: Arc<UdpSocket>, broadcaster: Arc<FrameBroadcaster>, input: InputQueue) -> Self {
        Self {
            socket,
            broadcaster,
            input,
            peers: HashMap::new(),
            mtu: DEFAULT_MTU,
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> std::io::Result<()> {
        info!("datagram server listening on {}", self.local_addr()?);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        // ICMP errors from departed peers surface here on some platforms.
                        debug!("datagram recv error: {e}");
                        continue;
                    }
                },
            };
            self.handle(&buf[..len], from).await;
        }

        for id in self.peers.into_values() {
            self.broadcaster.unregister(id);
        }
        info!("datagram server stopped");
        Ok(())
    }

    async fn handle(&mut self, data: &[u8], from: SocketAddr) {
        match ClientDatagram::classify(data) {
            ClientDatagram::Hello => self.register(from).await,
            ClientDatagram::Ping => {
                if self.known(from).is_some() {
                    self.pong(from).await;
                }
            }
            ClientDatagram::Bye => {
                if let Some(id) = self.peers.remove(&from) {
                    self.broadcaster.unregister(id);
                }
            }
            ClientDatagram::Json(payload) => {
                if let Some(id) = self.known(from) {
                    if let Err(e) = self.input.try_push(id, Bytes::copy_from_slice(payload)) {
                        debug!(%id, "input dropped: {e}");
                    }
                }
            }
            ClientDatagram::Unknown => debug!(%from, "ignoring unknown datagram"),
        }
    }

    async fn register(&mut self, from: SocketAddr) {
        let id = match self.peers.get(&from) {
            Some(id) => *id,
            None => self.broadcaster.next_client_id(),
        };
        let sink = DatagramSink::new(id, from, self.socket.clone()).with_mtu(self.mtu);
        let handshake = self.broadcaster.stream_info();
        match self.broadcaster.register_client(Arc::new(sink), &handshake).await {
            Ok(()) => {
                self.peers.insert(from, id);
            }
            Err(e) => {
                warn!(%from, "datagram client registration failed: {e}");
                self.peers.remove(&from);
            }
        }
    }

    /// The id of a registered peer, refreshing its liveness.
    ///
    /// Peers the broadcaster already evicted are forgotten; they must
    /// say `HELLO` again.
    fn known(&mut self, from: SocketAddr) -> Option<ClientId> {
        let id = *self.peers.get(&from)?;
        if self.broadcaster.touch(id) {
            Some(id)
        } else {
            self.peers.remove(&from);
            None
        }
    }

    async fn pong(&self, to: SocketAddr) {
        let packet = match ControlMessage::Pong.to_bytes() {
            Ok(json) => control_packet(&json),
            Err(e) => {
                warn!("failed to encode pong: {e}");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&packet, to).await {
            debug!(%to, "pong failed: {e}");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broadcast::broadcaster::DEFAULT_LIVENESS_TIMEOUT;
    use crate::broadcast::control::StreamInfo;
    use crate::broadcast::framing::{FrameReassembler, Inbound};
    use crate::events::EventBus;
    use crate::types::Resolution;

    #[test]
    fn classifies_client_datagrams() {
        assert_eq!(ClientDatagram::classify(b"HELLO"), ClientDatagram::Hello);
        assert_eq!(ClientDatagram::classify(b"PING\n"), ClientDatagram::Ping);
        assert_eq!(ClientDatagram::classify(b"BYE"), ClientDatagram::Bye);
        assert_eq!(
            ClientDatagram::classify(br#"{"Type":"keyboard"}"#),
            ClientDatagram::Json(br#"{"Type":"keyboard"}"#)
        );
        assert_eq!(ClientDatagram::classify(b"hello"), ClientDatagram::Unknown);
    }

    #[test]
    fn would_block_drops_the_rest_of_the_frame() {
        let packets: Vec<Bytes> = (0u8..5).map(|i| Bytes::from(vec![i; 4])).collect();
        let mut sent = Vec::new();
        let dropped = transmit(&packets, |p| {
            if sent.len() == 2 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            sent.push(p[0]);
            Ok(p.len())
        })
        .unwrap();
        assert_eq!(dropped, 3);
        assert_eq!(sent, vec![0, 1]);
    }

    #[test]
    fn other_socket_errors_propagate() {
        let packets = vec![Bytes::from_static(b"x")];
        let err = transmit(&packets, |_| Err(io::ErrorKind::ConnectionRefused.into())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    async fn recv_inbound(sock: &UdpSocket, rx: &mut FrameReassembler) -> Inbound {
        let mut buf = [0u8; 2048];
        loop {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
                .await
                .expect("datagram within 2s")
                .unwrap();
            if let Some(inbound) = rx.push(&buf[..len]) {
                return inbound;
            }
        }
    }

    #[tokio::test]
    async fn hello_registers_and_frames_arrive_chunked() {
        let info = StreamInfo::new(Resolution::new(640, 480), 30, "h264");
        let broadcaster = Arc::new(FrameBroadcaster::new(
            info.clone(),
            DEFAULT_LIVENESS_TIMEOUT,
            EventBus::default(),
        ));
        let (queue, mut inputs) = InputQueue::channel(16);
        let server = DatagramServer::bind("127.0.0.1:0", broadcaster.clone(), queue)
            .await
            .unwrap()
            .with_mtu(500);
        let server_addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut rx = FrameReassembler::new();
        client.send_to(HELLO, server_addr).await.unwrap();
        assert_eq!(
            recv_inbound(&client, &mut rx).await,
            Inbound::Control(ControlMessage::Info(info))
        );
        assert_eq!(broadcaster.client_count(), 1);

        let frame: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let report = broadcaster.publish_frame(Bytes::from(frame.clone())).await;
        assert_eq!(report.delivered, 1);
        let Inbound::Frame(got) = recv_inbound(&client, &mut rx).await else {
            panic!("expected a frame");
        };
        assert_eq!(&got.data[..], &frame[..]);

        client.send_to(PING, server_addr).await.unwrap();
        assert_eq!(
            recv_inbound(&client, &mut rx).await,
            Inbound::Control(ControlMessage::Pong)
        );

        client
            .send_to(br#"{"Type":"keyboard","Key":65,"Down":true}"#, server_addr)
            .await
            .unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), inputs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.client, ClientId(1));

        client.send_to(BYE, server_addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while broadcaster.client_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn strangers_are_ignored() {
        let broadcaster = Arc::new(FrameBroadcaster::new(
            StreamInfo::new(Resolution::default(), 60, "h264"),
            DEFAULT_LIVENESS_TIMEOUT,
            EventBus::default(),
        ));
        let (queue, mut inputs) = InputQueue::channel(4);
        let mut server = DatagramServer::bind("127.0.0.1:0", broadcaster.clone(), queue)
            .await
            .unwrap();
        let stranger: SocketAddr = "127.0.0.1:9".parse().unwrap();
        server.handle(br#"{"Type":"mouse"}"#, stranger).await;
        server.handle(PING, stranger).await;
        server.handle(BYE, stranger).await;
        assert_eq!(broadcaster.client_count(), 0);
        assert!(inputs.try_recv().is_err());
    }
}
