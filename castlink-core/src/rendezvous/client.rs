//! Client side of rendezvous: turn a code into a paired host.
//!
//! ```text
//!  public endpoint ──(N attempts × timeout)──┐
//!                                            ├─► CONNECTED → PeerSession
//!  local endpoint  ──(N attempts × timeout)──┤
//!                                            └─► relay hook (optional) → failure reason
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ConnectFailure;
use crate::rendezvous::code::PairingCode;
use crate::rendezvous::messages::{RendezvousReply, SessionParams, connect_request};
use crate::rendezvous::payload::SharePayload;
use crate::stun::NatType;

// ── Inputs ───────────────────────────────────────────────────────

/// Where the host might be reachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KnownEndpoints {
    pub public: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    /// NAT type the host reported for `public`.
    pub nat_type: NatType,
}

impl KnownEndpoints {
    pub fn is_empty(&self) -> bool {
        self.public.is_none() && self.local.is_none()
    }
}

impl From<&SharePayload> for KnownEndpoints {
    fn from(payload: &SharePayload) -> Self {
        Self {
            public: payload.public_endpoint,
            local: payload.local_endpoint,
            nat_type: payload.nat_type,
        }
    }
}

/// Retry policy per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousClientConfig {
    pub attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for RendezvousClientConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(1),
        }
    }
}

// ── Outputs ──────────────────────────────────────────────────────

/// A host that accepted our code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    /// Address the CONNECTED reply came from.
    pub host: SocketAddr,
    pub params: SessionParams,
}

impl PeerSession {
    /// Address of the host's datagram stream port.
    pub fn datagram_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host.ip(), self.params.stream_ports.datagram)
    }

    /// Address of the host's stream (TCP) port.
    pub fn stream_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host.ip(), self.params.stream_ports.stream)
    }

    /// Address of the host's HTTP API.
    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host.ip(), self.params.api_port)
    }
}

/// Fallback used after every direct attempt failed.
///
/// No implementation ships with castlink; deployments that run a relay
/// attach one with [`RendezvousClient::with_relay`].
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn relay(&self, code: &PairingCode) -> Result<PeerSession, ConnectFailure>;
}

// ── RendezvousClient ─────────────────────────────────────────────

pub struct RendezvousClient {
    config: RendezvousClientConfig,
    relay: Option<Arc<dyn RelayConnector>>,
}

impl RendezvousClient {
    pub fn new(config: RendezvousClientConfig) -> Self {
        Self {
            config,
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn RelayConnector>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Pair with the host advertising `code`.
    ///
    /// The public endpoint is tried first, then the local one, each with
    /// the configured number of attempts. Only then is the relay hook
    /// consulted.
    pub async fn connect(
        &self,
        code: &str,
        known: &KnownEndpoints,
    ) -> Result<PeerSession, ConnectFailure> {
        let code = PairingCode::parse(code).map_err(|_| ConnectFailure::InvalidCode)?;

        if known.is_empty() && self.relay.is_none() {
            return Err(ConnectFailure::ServerUnreachable);
        }

        if !known.is_empty() {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                .await
                .map_err(|e| {
                    warn!("cannot bind rendezvous socket: {e}");
                    ConnectFailure::ServerUnreachable
                })?;
            let request = connect_request(&code);

            for (label, target) in [("public", known.public), ("local", known.local)] {
                let Some(target) = target else { continue };
                if let Some(session) = self.try_endpoint(&socket, &request, target).await {
                    info!(host = %session.host, via = label, "rendezvous succeeded");
                    return Ok(session);
                }
                debug!(%target, via = label, "no reply from endpoint");
            }
        }

        if let Some(relay) = &self.relay {
            info!("direct rendezvous failed, trying relay");
            return relay.relay(&code).await;
        }

        if known.public.is_some() && known.nat_type == NatType::Symmetric {
            Err(ConnectFailure::NatIncompatible)
        } else {
            Err(ConnectFailure::Timeout)
        }
    }

    async fn try_endpoint(
        &self,
        socket: &UdpSocket,
        request: &[u8],
        target: SocketAddr,
    ) -> Option<PeerSession> {
        for attempt in 1..=self.config.attempts {
            if let Err(e) = socket.send_to(request, target).await {
                debug!(%target, attempt, "connect request send failed: {e}");
                tokio::time::sleep(self.config.attempt_timeout).await;
                continue;
            }
            if let Some(params) = wait_for_reply(socket, target, self.config.attempt_timeout).await
            {
                return Some(PeerSession {
                    host: target,
                    params,
                });
            }
            debug!(%target, attempt, "connect attempt timed out");
        }
        None
    }
}

impl Default for RendezvousClient {
    fn default() -> Self {
        Self::new(RendezvousClientConfig::default())
    }
}

/// Wait up to `timeout` for a CONNECTED reply from `target`.
///
/// Datagrams from other peers and anything that is not a CONNECTED
/// reply are skipped.
async fn wait_for_reply(
    socket: &UdpSocket,
    target: SocketAddr,
    timeout: Duration,
) -> Option<SessionParams> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1500];
    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .ok()?;
        let (len, from) = match received {
            Ok(pair) => pair,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                continue;
            }
            Err(e) => {
                debug!("rendezvous recv failed: {e}");
                return None;
            }
        };
        if from != target {
            continue;
        }
        match RendezvousReply::from_bytes(&buf[..len]) {
            Ok(RendezvousReply::Connected(params)) => return Some(params),
            Err(e) => debug!(%from, "ignoring unexpected rendezvous reply: {e}"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
