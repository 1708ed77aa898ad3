//! Host side of rendezvous: advertise a code, answer matching requests.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RendezvousError;
use crate::rendezvous::code::PairingSession;
use crate::rendezvous::messages::{RendezvousReply, SessionParams, StreamPorts, parse_connect};
use crate::rendezvous::payload::SharePayload;
use crate::stun::{DiscoveredEndpoint, NatType, StunClient};

/// Interval between NAT keep-alive packets.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(25);

// ── HostPhase ────────────────────────────────────────────────────

/// Rendezvous lifecycle of the host.
///
/// ```text
///  Idle ──► Discovering ──► Advertising ──► PeerValidated ──► Established
///   ▲                                             ▲                │
///   │                                             └────────────────┘
///   └──────────────── disable() from any phase
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostPhase {
    #[default]
    Idle,
    /// STUN discovery in flight.
    Discovering,
    /// Code generated, listening for requests.
    Advertising,
    /// A request carried the right code.
    PeerValidated { peer: SocketAddr },
    /// Session parameters were sent to `peer`.
    Established { peer: SocketAddr, since: Instant },
}

impl HostPhase {
    /// Whether a `CONNECT` request is considered in this phase.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, Self::Advertising | Self::Established { .. })
    }

    fn begin_discovery(&mut self) -> Result<(), RendezvousError> {
        match self {
            Self::Idle => {
                *self = Self::Discovering;
                Ok(())
            }
            _ => Err(RendezvousError::InvalidTransition(
                "cannot discover: rendezvous already enabled",
            )),
        }
    }

    fn advertise(&mut self) -> Result<(), RendezvousError> {
        match self {
            Self::Discovering => {
                *self = Self::Advertising;
                Ok(())
            }
            _ => Err(RendezvousError::InvalidTransition(
                "cannot advertise: not in Discovering state",
            )),
        }
    }

    fn validate_peer(&mut self, peer: SocketAddr) -> Result<(), RendezvousError> {
        if self.accepts_requests() {
            *self = Self::PeerValidated { peer };
            Ok(())
        } else {
            Err(RendezvousError::InvalidTransition(
                "cannot validate peer: not advertising",
            ))
        }
    }

    fn establish(&mut self) -> Result<(), RendezvousError> {
        match *self {
            Self::PeerValidated { peer } => {
                *self = Self::Established {
                    peer,
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(RendezvousError::InvalidTransition(
                "cannot establish: no validated peer",
            )),
        }
    }
}

// ── RendezvousHost ───────────────────────────────────────────────

/// Owns the single [`PairingSession`] of a host process.
pub struct RendezvousHost {
    phase: HostPhase,
    session: Option<PairingSession>,
    stun: StunClient,
    api_port: u16,
    stream_ports: StreamPorts,
    keepalive_interval: Duration,
    keepalive_server: Option<SocketAddr>,
}

impl RendezvousHost {
    pub fn new(api_port: u16, stream_ports: StreamPorts) -> Self {
        Self {
            phase: HostPhase::Idle,
            session: None,
            stun: StunClient::new(),
            api_port,
            stream_ports,
            keepalive_interval: DEFAULT_KEEPALIVE,
            keepalive_server: None,
        }
    }

    pub fn with_stun_client(mut self, stun: StunClient) -> Self {
        self.stun = stun;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn phase(&self) -> &HostPhase {
        &self.phase
    }

    pub fn session(&self) -> Option<&PairingSession> {
        self.session.as_ref()
    }

    /// Enable rendezvous: discover the public mapping of `socket` and
    /// create the pairing session.
    ///
    /// STUN failure is not fatal: the session is created with
    /// [`NatType::Unknown`] and no public endpoint.
    pub async fn enable(
        &mut self,
        socket: &UdpSocket,
        stun_servers: &[String],
    ) -> Result<&PairingSession, RendezvousError> {
        self.phase.begin_discovery()?;
        let discovered = match self.stun.discover_with_socket(socket, stun_servers).await {
            Ok(found) => Some(found),
            Err(e) => {
                warn!("STUN discovery failed: {e}; advertising with unknown NAT type");
                None
            }
        };
        self.finish_enable(discovered)
    }

    /// Enable rendezvous from an already completed (or skipped) discovery.
    pub fn enable_with(
        &mut self,
        discovered: Option<DiscoveredEndpoint>,
    ) -> Result<&PairingSession, RendezvousError> {
        self.phase.begin_discovery()?;
        self.finish_enable(discovered)
    }

    fn finish_enable(
        &mut self,
        discovered: Option<DiscoveredEndpoint>,
    ) -> Result<&PairingSession, RendezvousError> {
        let (nat_type, public) = match discovered {
            Some(found) => (found.nat_type, Some(found.public)),
            None => (NatType::Unknown, None),
        };
        self.keepalive_server = discovered.map(|d| d.server);
        self.phase.advertise()?;
        let session = self.session.insert(PairingSession::new(nat_type, public));
        info!(code = %session.code, %nat_type, "rendezvous advertising");
        Ok(session)
    }

    /// Disable rendezvous and destroy the session.
    pub fn disable(&mut self) {
        if self.session.take().is_some() {
            info!("rendezvous disabled");
        }
        self.keepalive_server = None;
        self.phase = HostPhase::Idle;
    }

    /// Handle one inbound datagram; returns the reply to send, if any.
    ///
    /// Non-matching codes and unrelated traffic (including STUN
    /// keep-alive responses) are ignored without a reply.
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        let code = parse_connect(data)?;
        let session = self.session.as_ref()?;
        if !self.phase.accepts_requests() {
            return None;
        }
        if code != session.code.as_str() {
            debug!(%from, "ignoring connect request with wrong code");
            return None;
        }

        let reply = RendezvousReply::Connected(SessionParams {
            api_port: self.api_port,
            stream_ports: self.stream_ports,
            key: session.key_base64(),
        });
        let bytes = match reply.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to encode CONNECTED reply: {e}");
                return None;
            }
        };

        self.phase.validate_peer(from).ok()?;
        self.phase.establish().ok()?;
        info!(peer = %from, "rendezvous peer established");
        Some(bytes)
    }

    /// Payload a client can scan instead of typing the code.
    pub fn share_payload(&self, local_endpoint: Option<SocketAddr>) -> Option<SharePayload> {
        let session = self.session.as_ref()?;
        Some(SharePayload {
            code: session.code.clone(),
            public_endpoint: session.public_endpoint,
            local_endpoint,
            nat_type: session.nat_type,
        })
    }

    /// Serve rendezvous requests on `socket` until `cancel` fires.
    ///
    /// A keep-alive binding request is re-sent every keep-alive
    /// interval on the same socket to hold the NAT mapping open.
    pub async fn run(
        &mut self,
        socket: &UdpSocket,
        cancel: CancellationToken,
    ) -> Result<(), RendezvousError> {
        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; discovery just refreshed the mapping.
        keepalive.tick().await;

        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = keepalive.tick() => {
                    if let Some(server) = self.keepalive_server {
                        if let Err(e) = StunClient::keepalive(socket, server).await {
                            debug!("NAT keep-alive failed: {e}");
                        }
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("rendezvous recv error: {e}");
                            continue;
                        }
                    };
                    if let Some(reply) = self.handle_datagram(&buf[..len], from) {
                        if let Err(e) = socket.send_to(&reply, from).await {
                            warn!("failed to reply to {from}: {e}");
                        }
                    }
                }
            }
        }

        debug!("rendezvous responder stopped");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
