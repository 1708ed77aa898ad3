//! Client ends of the two transports.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::broadcast::control::{ControlMessage, StreamInfo};
use crate::broadcast::datagram::{BYE, HELLO, PING};
use crate::broadcast::framing::{FrameReassembler, Inbound, ReceivedFrame};
use crate::broadcast::stream::stream_codec;
use crate::error::CastError;

/// What a datagram client observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// The host's info handshake (sent again after every `HELLO`).
    Info(StreamInfo),
    Frame(ReceivedFrame),
    /// Round trip of the last `PING`.
    Rtt(Duration),
}

// ── DatagramReceiver ─────────────────────────────────────────────

pub struct DatagramReceiver {
    socket: UdpSocket,
    host: SocketAddr,
    reassembler: FrameReassembler,
    ping_sent: Option<Instant>,
}

impl DatagramReceiver {
    /// Bind an ephemeral socket and say `HELLO` to `host`.
    pub async fn connect(host: SocketAddr) -> std::io::Result<Self> {
        let local = if host.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        let receiver = Self {
            socket,
            host,
            reassembler: FrameReassembler::new(),
            ping_sent: None,
        };
        receiver.hello().await?;
        Ok(receiver)
    }

    pub fn host(&self) -> SocketAddr {
        self.host
    }

    /// Frames lost to missing chunks so far.
    pub fn abandoned_frames(&self) -> u64 {
        self.reassembler.abandoned()
    }

    pub async fn hello(&self) -> std::io::Result<()> {
        self.socket.send_to(HELLO, self.host).await.map(|_| ())
    }

    pub async fn ping(&mut self) -> std::io::Result<()> {
        self.socket.send_to(PING, self.host).await?;
        self.ping_sent = Some(Instant::now());
        Ok(())
    }

    pub async fn bye(&self) -> std::io::Result<()> {
        self.socket.send_to(BYE, self.host).await.map(|_| ())
    }

    pub async fn send_input(&self, json: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(json, self.host).await.map(|_| ())
    }

    /// Wait for the next handshake, frame or RTT measurement.
    ///
    /// Datagrams from other sources are dropped.
    pub async fn recv(&mut self) -> std::io::Result<ReceiverEvent> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.host {
                continue;
            }
            match self.reassembler.push(&buf[..len]) {
                Some(Inbound::Frame(frame)) => return Ok(ReceiverEvent::Frame(frame)),
                Some(Inbound::Control(ControlMessage::Info(info))) => {
                    return Ok(ReceiverEvent::Info(info));
                }
                Some(Inbound::Control(ControlMessage::Pong)) => {
                    if let Some(sent) = self.ping_sent.take() {
                        return Ok(ReceiverEvent::Rtt(sent.elapsed()));
                    }
                }
                None => {}
            }
        }
    }
}

// ── StreamReceiver ───────────────────────────────────────────────

pub struct StreamReceiver {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    info: StreamInfo,
}

impl StreamReceiver {
    /// Connect and read the mandatory info handshake.
    pub async fn connect(host: SocketAddr) -> Result<Self, CastError> {
        let stream = TcpStream::connect(host).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, stream_codec());
        let first = framed
            .next()
            .await
            .ok_or(CastError::ChannelClosed)??;
        match ControlMessage::from_bytes(&first) {
            Some(ControlMessage::Info(info)) => Ok(Self { framed, info }),
            _ => Err(CastError::Encoding(
                "stream did not start with an info handshake".into(),
            )),
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Next encoded frame; `None` once the host closed the stream.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, CastError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    pub async fn send_input(&mut self, json: Bytes) -> Result<(), CastError> {
        self.framed.send(json).await?;
        Ok(())
    }

    /// Keep the host's liveness timer fresh without sending input.
    pub async fn heartbeat(&mut self) -> Result<(), CastError> {
        self.framed.send(Bytes::new()).await?;
        Ok(())
    }
}
