//! LAN host discovery.
//!
//! A host answers the literal UDP datagram `CASTLINK_DISCOVER` with a
//! JSON [`HostDescriptor`]. Clients broadcast the request with
//! [`discover_lan`] and collect answers for a short window. Where
//! broadcast is filtered, [`scan_subnet`] asks every address of the
//! local /24 over HTTP (`GET /castlink/discover`) instead.
//!
//! ```text
//!  client ── "CASTLINK_DISCOVER" ──► 255.255.255.255:47990
//!  host   ── {"hostname":…,"port":…,"capabilities":[…],"requiresAuth":…,"version":…} ──► client
//! ```

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::{Request, StatusCode, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CastError;

/// UDP port hosts listen on for discovery requests.
pub const DISCOVERY_PORT: u16 = 47990;

/// Request datagram, sent verbatim.
pub const DISCOVER_REQUEST: &[u8] = b"CASTLINK_DISCOVER";

/// HTTP path serving the same descriptor.
pub const DISCOVER_PATH: &str = "/castlink/discover";

/// How long [`discover_lan`] listens for answers by default.
pub const DEFAULT_LISTEN_WINDOW: Duration = Duration::from_secs(2);

/// Per-address timeout and parallelism for [`scan_subnet`].
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(300);
pub const DEFAULT_SCAN_CONCURRENCY: usize = 32;

/// Largest descriptor body accepted from a scanned address.
const MAX_DESCRIPTOR_BODY: usize = 16 * 1024;

type HttpClient = Client<HttpConnector, Empty<Bytes>>;

// ── Descriptor ───────────────────────────────────────────────────

/// What a host says about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDescriptor {
    pub hostname: String,
    /// Port of the host's control API.
    pub port: u16,
    pub capabilities: Vec<String>,
    pub requires_auth: bool,
    pub version: String,
}

impl HostDescriptor {
    pub fn to_json(&self) -> Result<Vec<u8>, CastError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CastError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A descriptor and the address it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    /// Responder IP with the descriptor's API port.
    pub addr: SocketAddr,
    pub descriptor: HostDescriptor,
}

impl DiscoveredHost {
    fn new(from: SocketAddr, descriptor: HostDescriptor) -> Self {
        Self {
            addr: SocketAddr::new(from.ip(), descriptor.port),
            descriptor,
        }
    }
}

// ── Responder ────────────────────────────────────────────────────

/// Host side: answers discovery datagrams until cancelled.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    reply: Vec<u8>,
}

impl DiscoveryResponder {
    pub async fn bind(addr: SocketAddr, descriptor: &HostDescriptor) -> Result<Self, CastError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            reply: descriptor.to_json()?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self, cancel: CancellationToken) -> std::io::Result<()> {
        info!(addr = %self.socket.local_addr()?, "discovery responder listening");
        let mut buf = [0u8; 512];
        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok(pair) => pair,
                    Err(e) if is_transient(&e) => continue,
                    Err(e) => return Err(e),
                },
            };
            if buf[..len].trim_ascii() != DISCOVER_REQUEST {
                debug!(%from, "ignoring non-discovery datagram");
                continue;
            }
            debug!(%from, "discovery request");
            if let Err(e) = self.socket.send_to(&self.reply, from).await {
                warn!(%from, "discovery reply failed: {e}");
            }
        }
        info!("discovery responder stopped");
        Ok(())
    }
}

// ── Broadcast query ──────────────────────────────────────────────

/// Broadcast a discovery request on `port` and collect answers for
/// `window`.
pub async fn discover_lan(port: u16, window: Duration) -> Result<Vec<DiscoveredHost>, CastError> {
    let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port));
    query_targets(&[target], window).await
}

/// Send a discovery request to each target and collect answers for
/// `window`. Duplicate answers from one responder are folded.
pub async fn query_targets(
    targets: &[SocketAddr],
    window: Duration,
) -> Result<Vec<DiscoveredHost>, CastError> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    socket.set_broadcast(true)?;
    for target in targets {
        if let Err(e) = socket.send_to(DISCOVER_REQUEST, target).await {
            warn!(%target, "discovery request failed: {e}");
        }
    }

    let deadline = Instant::now() + window;
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) if is_transient(&e) => continue,
            Ok(Err(e)) => return Err(e.into()),
        };
        match HostDescriptor::from_json(&buf[..len]) {
            Ok(descriptor) => {
                let host = DiscoveredHost::new(from, descriptor);
                if seen.insert(host.addr) {
                    info!(addr = %host.addr, hostname = %host.descriptor.hostname, "host discovered");
                    hosts.push(host);
                }
            }
            Err(e) => debug!(%from, "bad discovery reply: {e}"),
        }
    }
    Ok(hosts)
}

// ── Subnet scan ──────────────────────────────────────────────────

/// Ask every address of `local`'s /24 for a descriptor over HTTP on
/// `port`, at most `concurrency` at a time.
pub async fn scan_subnet(
    local: Ipv4Addr,
    port: u16,
    per_host_timeout: Duration,
    concurrency: usize,
) -> Vec<DiscoveredHost> {
    let [a, b, c, _] = local.octets();
    let candidates = (1..=254u8).map(move |d| SocketAddr::from((Ipv4Addr::new(a, b, c, d), port)));

    let client = http_client();
    let mut hosts: Vec<DiscoveredHost> = futures::stream::iter(candidates)
        .map(|addr| {
            let client = client.clone();
            async move {
                fetch_with(&client, addr, per_host_timeout)
                    .await
                    .ok()
                    .map(|descriptor| DiscoveredHost::new(addr, descriptor))
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|host| async move { host })
        .collect()
        .await;
    hosts.sort_by_key(|h| h.addr);
    info!(subnet = %format!("{a}.{b}.{c}.0/24"), found = hosts.len(), "subnet scan finished");
    hosts
}

/// `GET /castlink/discover` from one address.
pub async fn fetch_descriptor(addr: SocketAddr, limit: Duration) -> Result<HostDescriptor, CastError> {
    fetch_with(&http_client(), addr, limit).await
}

/// Plain HTTP/1 client without idle pooling; every scanned address is
/// asked once.
fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(0)
        .build_http()
}

async fn fetch_with(
    client: &HttpClient,
    addr: SocketAddr,
    limit: Duration,
) -> Result<HostDescriptor, CastError> {
    let request = Request::get(format!("http://{addr}{DISCOVER_PATH}"))
        .header(header::ACCEPT, "application/json")
        .body(Empty::<Bytes>::new())
        .map_err(|e| CastError::Other(format!("{addr}: {e}")))?;

    let body = timeout(limit, async {
        let response = client
            .request(request)
            .await
            .map_err(|e| CastError::Other(format!("{addr}: {e}")))?;
        if response.status() != StatusCode::OK {
            return Err(CastError::Other(format!("{addr}: HTTP {}", response.status())));
        }
        Limited::new(response.into_body(), MAX_DESCRIPTOR_BODY)
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| CastError::Other(format!("{addr}: {e}")))
    })
    .await
    .map_err(|_| CastError::Timeout(limit))??;

    HostDescriptor::from_json(&body)
}

/// The IPv4 address this machine would use for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only asks the OS to pick
/// a route.
pub async fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await.ok()?;
    socket.connect(SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 9))).await.ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionRefused
    )
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn descriptor() -> HostDescriptor {
        HostDescriptor {
            hostname: "den-pc".into(),
            port: 47989,
            capabilities: vec!["datagram".into(), "stream".into()],
            requires_auth: false,
            version: "0.1.0".into(),
        }
    }

    #[test]
    fn descriptor_wire_names() {
        let json: serde_json::Value = serde_json::from_slice(&descriptor().to_json().unwrap()).unwrap();
        assert_eq!(json["hostname"], "den-pc");
        assert_eq!(json["requiresAuth"], false);
        assert_eq!(json["capabilities"][1], "stream");
    }

    #[tokio::test]
    async fn responder_answers_broadcast_query() {
        let responder = DiscoveryResponder::bind("127.0.0.1:0".parse().unwrap(), &descriptor())
            .await
            .unwrap();
        let addr = responder.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(responder.run(cancel.clone()));

        let hosts = query_targets(&[addr, addr], Duration::from_millis(300)).await.unwrap();
        assert_eq!(hosts.len(), 1, "duplicate replies are folded");
        assert_eq!(hosts[0].descriptor, descriptor());
        assert_eq!(hosts[0].addr, "127.0.0.1:47989".parse().unwrap());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn responder_ignores_other_datagrams() {
        let responder = DiscoveryResponder::bind("127.0.0.1:0".parse().unwrap(), &descriptor())
            .await
            .unwrap();
        let addr = responder.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(responder.run(cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"HELLO", addr).await.unwrap();
        let mut buf = [0u8; 64];
        let got = timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await;
        assert!(got.is_err());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    /// Answers every request on a fresh loopback port with `response`.
    async fn canned_response(response: String) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    async fn canned_http(body: &'static str, status: &'static str) -> SocketAddr {
        canned_response(format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        ))
        .await
    }

    #[tokio::test]
    async fn fetches_descriptor_over_http() {
        let body = r#"{"hostname":"den-pc","port":47989,"capabilities":["datagram","stream"],"requiresAuth":false,"version":"0.1.0"}"#;
        let addr = canned_http(body, "200 OK").await;
        let got = fetch_descriptor(addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, descriptor());
    }

    #[tokio::test]
    async fn chunked_descriptor_is_decoded() {
        let body = r#"{"hostname":"den-pc","port":47989,"capabilities":["datagram","stream"],"requiresAuth":false,"version":"0.1.0"}"#;
        let (head, tail) = body.split_at(40);
        let response = format!(
            "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{head}\r\n{:x}\r\n{tail}\r\n0\r\n\r\n",
            head.len(),
            tail.len()
        );
        let addr = canned_response(response).await;
        let got = fetch_descriptor(addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, descriptor());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let padding = " ".repeat(MAX_DESCRIPTOR_BODY + 1);
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{padding}",
            padding.len()
        );
        let addr = canned_response(response).await;
        let err = fetch_descriptor(addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CastError::Other(_)), "{err}");
    }

    #[tokio::test]
    async fn non_200_is_an_error() {
        let addr = canned_http("{}", "404 Not Found").await;
        assert!(fetch_descriptor(addr, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn scan_finds_the_loopback_host() {
        let body = r#"{"hostname":"den-pc","port":47989,"capabilities":[],"requiresAuth":true,"version":"0.1.0"}"#;
        let addr = canned_http(body, "200 OK").await;
        let hosts = scan_subnet(Ipv4Addr::LOCALHOST, addr.port(), Duration::from_millis(200), 64).await;
        let found: Vec<_> = hosts.iter().filter(|h| h.descriptor.hostname == "den-pc").collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].addr.ip(), std::net::IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(found[0].descriptor.requires_auth);
    }
}
