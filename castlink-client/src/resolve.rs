//! Turning what the user knows into host endpoints.
//!
//! Precedence:
//!
//! | Known                  | Route                                             |
//! |------------------------|---------------------------------------------------|
//! | share payload          | rendezvous against the payload's endpoints        |
//! | code + host IP         | rendezvous against `host:rendezvous_port`         |
//! | code only              | discover LAN hosts, rendezvous against each       |
//! | host IP                | configured ports on that IP                       |
//! | nothing                | first host found by LAN discovery                 |

use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info, warn};

use castlink_core::discovery::{
    DEFAULT_SCAN_CONCURRENCY, DEFAULT_SCAN_TIMEOUT, DiscoveredHost, local_ipv4, discover_lan,
    scan_subnet,
};
use castlink_core::{
    CastError, ConfigError, ConnectFailure, KnownEndpoints, PeerSession, RendezvousClient,
    SharePayload,
};

use crate::config::{ClientConfig, NetworkConfig};

/// How the endpoints were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Share,
    Code,
    Direct,
    Discovered,
}

/// Where a host's transports and API live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEndpoints {
    pub datagram: SocketAddr,
    pub stream: SocketAddr,
    pub api: SocketAddr,
    pub route: Route,
}

impl HostEndpoints {
    /// Configured default ports on `ip`.
    pub fn from_ip(ip: IpAddr, network: &NetworkConfig, route: Route) -> Self {
        Self {
            datagram: SocketAddr::new(ip, network.datagram_port),
            stream: SocketAddr::new(ip, network.stream_port),
            api: SocketAddr::new(ip, network.api_port),
            route,
        }
    }

    /// Ports the host announced in its CONNECTED reply.
    pub fn from_peer(peer: &PeerSession, route: Route) -> Self {
        Self {
            datagram: peer.datagram_addr(),
            stream: peer.stream_addr(),
            api: peer.api_addr(),
            route,
        }
    }
}

/// Resolve `config` to a host, pairing first when a code is given.
pub async fn resolve(config: &ClientConfig) -> Result<HostEndpoints, CastError> {
    let host_ip = config.host_ip().map_err(ConfigError::Invalid)?;
    let rendezvous = RendezvousClient::new(config.rendezvous());

    let share = config.pairing.share.trim();
    if !share.is_empty() {
        let payload = SharePayload::decode(share)?;
        let known = KnownEndpoints::from(&payload);
        info!(code = %payload.code, nat = %payload.nat_type, "pairing from share payload");
        let peer = rendezvous.connect(payload.code.as_str(), &known).await?;
        return Ok(HostEndpoints::from_peer(&peer, Route::Share));
    }

    let code = config.pairing.code.trim();
    if !code.is_empty() {
        let candidates: Vec<IpAddr> = match host_ip {
            Some(ip) => vec![ip],
            None => discover(config).await?.into_iter().map(|h| h.addr.ip()).collect(),
        };
        return pair_with_candidates(&rendezvous, code, &candidates, config.network.rendezvous_port)
            .await
            .map(|peer| HostEndpoints::from_peer(&peer, Route::Code));
    }

    if let Some(ip) = host_ip {
        return Ok(HostEndpoints::from_ip(ip, &config.network, Route::Direct));
    }

    let host = discover(config)
        .await?
        .into_iter()
        .next()
        .ok_or(CastError::Connect(ConnectFailure::ServerUnreachable))?;
    info!(hostname = %host.descriptor.hostname, addr = %host.addr, "using discovered host");
    Ok(HostEndpoints::from_ip(host.addr.ip(), &config.network, Route::Discovered))
}

/// Send the code to each candidate in turn; the first CONNECTED wins.
///
/// The failure reported is the most specific one seen: an invalid code
/// beats NAT incompatibility, which beats a plain timeout.
pub async fn pair_with_candidates(
    rendezvous: &RendezvousClient,
    code: &str,
    candidates: &[IpAddr],
    rendezvous_port: u16,
) -> Result<PeerSession, CastError> {
    let mut failure = ConnectFailure::ServerUnreachable;
    for ip in candidates {
        let known = KnownEndpoints {
            local: Some(SocketAddr::new(*ip, rendezvous_port)),
            ..KnownEndpoints::default()
        };
        match rendezvous.connect(code, &known).await {
            Ok(peer) => return Ok(peer),
            Err(ConnectFailure::InvalidCode) => return Err(ConnectFailure::InvalidCode.into()),
            Err(e) => {
                debug!(%ip, "pairing attempt failed: {e}");
                failure = e;
            }
        }
    }
    Err(failure.into())
}

/// LAN broadcast, then the /24 HTTP scan if nothing answered.
pub async fn discover(config: &ClientConfig) -> Result<Vec<DiscoveredHost>, CastError> {
    let hosts = discover_lan(config.network.discovery_port, config.listen_window()).await?;
    if !hosts.is_empty() || !config.network.scan_fallback {
        return Ok(hosts);
    }

    let Some(local) = local_ipv4().await else {
        warn!("no IPv4 route; skipping subnet scan");
        return Ok(hosts);
    };
    info!(%local, "broadcast found nothing; scanning subnet");
    Ok(scan_subnet(
        local,
        config.network.api_port,
        DEFAULT_SCAN_TIMEOUT,
        DEFAULT_SCAN_CONCURRENCY,
    )
    .await)
}

// ── Tests ────────────────────────────────────────────────────────
