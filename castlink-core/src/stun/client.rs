//! Public-endpoint discovery over STUN.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::StunError;
use crate::stun::message::{BindingRequest, parse_binding_response};
use crate::stun::nat::NatType;

/// Public servers tried when the configuration names none.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Per-server response deadline.
pub const DEFAULT_STUN_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of a successful discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    /// Address/port the outside world sees for the local socket.
    pub public: SocketAddr,
    /// The local socket the mapping belongs to.
    pub local: SocketAddr,
    /// Best-effort NAT classification.
    pub nat_type: NatType,
    /// Server that produced `public`; later keep-alives go here.
    pub server: SocketAddr,
}

/// STUN binding client.
///
/// Holds no socket itself: callers pass the socket whose mapping they
/// want to learn, so the same port can later carry rendezvous traffic.
#[derive(Debug, Clone)]
pub struct StunClient {
    timeout: Duration,
}

impl StunClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_STUN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Bind `local_port` (0 = ephemeral) and discover its public mapping.
    pub async fn discover_endpoint(
        &self,
        servers: &[String],
        local_port: u16,
    ) -> Result<DiscoveredEndpoint, StunError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port)).await?;
        self.discover_with_socket(&socket, servers).await
    }

    /// Discover the public mapping of an existing socket.
    ///
    /// Servers are tried in order; the first that answers provides the
    /// endpoint. NAT type is then checked through a *different* server
    /// from the same socket: identical mapping means cone, a different
    /// mapping means symmetric. The result is a hint, not a full
    /// RFC 3489 classification.
    pub async fn discover_with_socket(
        &self,
        socket: &UdpSocket,
        servers: &[String],
    ) -> Result<DiscoveredEndpoint, StunError> {
        let mut first = None;
        for (idx, server) in servers.iter().enumerate() {
            match self.query(socket, server).await {
                Ok((public, resolved)) => {
                    first = Some((idx, public, resolved));
                    break;
                }
                Err(e) => warn!("STUN server {server} failed: {e}"),
            }
        }
        let (idx, public, server) = first.ok_or(StunError::AllServersFailed)?;

        let mut nat_type = NatType::Unknown;
        for other in &servers[idx + 1..] {
            match self.query(socket, other).await {
                Ok((second, _)) => {
                    nat_type = NatType::from_mappings(public, second);
                    break;
                }
                Err(e) => debug!("NAT check via {other} failed: {e}"),
            }
        }

        debug!(%public, %nat_type, "STUN discovery complete");
        Ok(DiscoveredEndpoint {
            public,
            local: socket.local_addr()?,
            nat_type,
            server,
        })
    }

    /// One binding transaction against `server`.
    ///
    /// Returns the mapped address and the resolved server address.
    /// Name resolution and the exchange share one deadline. Datagrams
    /// from other sources or for other transactions are skipped until
    /// it passes.
    pub async fn query(
        &self,
        socket: &UdpSocket,
        server: &str,
    ) -> Result<(SocketAddr, SocketAddr), StunError> {
        self.bounded(socket, resolve(server)).await
    }

    async fn bounded<R>(
        &self,
        socket: &UdpSocket,
        target: R,
    ) -> Result<(SocketAddr, SocketAddr), StunError>
    where
        R: Future<Output = Result<SocketAddr, StunError>>,
    {
        tokio::time::timeout(self.timeout, async {
            let target = target.await?;
            self.exchange(socket, target).await
        })
        .await
        .map_err(|_| StunError::Timeout(self.timeout))?
    }

    async fn exchange(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
    ) -> Result<(SocketAddr, SocketAddr), StunError> {
        let request = BindingRequest::new();
        socket.send_to(&request.encode(), target).await?;

        let mut buf = [0u8; 576];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from != target {
                continue;
            }
            match parse_binding_response(&buf[..len], request.transaction_id()) {
                Ok(mapped) => return Ok((mapped, target)),
                Err(StunError::TransactionMismatch) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a binding request purely to keep the NAT mapping alive.
    ///
    /// The response, if any, is not awaited.
    pub async fn keepalive(socket: &UdpSocket, server: SocketAddr) -> Result<(), StunError> {
        socket.send_to(&BindingRequest::new().encode(), server).await?;
        Ok(())
    }
}

impl Default for StunClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn resolve(server: &str) -> Result<SocketAddr, StunError> {
    tokio::net::lookup_host(server)
        .await
        .map_err(|_| StunError::Resolve(server.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| StunError::Resolve(server.to_string()))
}

// ── Tests ────────────────────────────────────────────────────────
