//! Host service core logic.
//!
//! Binds every listener up front, then runs the stream session and
//! the network tasks around it until stopped:
//!
//! ```text
//!                 ┌──────────────────────── HostService ─────────────────────────┐
//!  UDP discovery ─┤ DiscoveryResponder                                           │
//!  UDP rendezvous ┤ RendezvousHost (STUN enable, CONNECT:<code>, keep-alive)     │
//!  UDP frames    ─┤ DatagramServer ─┐                                            │
//!  TCP frames    ─┤ StreamServer  ──┼─ StreamSession (source → broadcaster,      │
//!                 │                 │   controller, input dispatcher → injector) │
//!  HTTP          ─┤ axum API ◄──────┘ stats watch                                │
//!                 └──────────────────────────────────────────────────────────────┘
//! ```

use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use castlink_core::discovery::local_ipv4;
use castlink_core::rendezvous::StreamPorts;
use castlink_core::{
    CastError, DatagramServer, DiscoveryResponder, HostDescriptor, InjectionSink, ProfileSlot,
    RendezvousHost, SessionEvent, StreamServer, StreamSession,
};

use crate::config::HostConfig;
use crate::http::{self, ApiState};
use crate::source::SyntheticSource;

/// How long stopped tasks get to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Addresses the service actually bound (ports may have been 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    pub discovery: Option<SocketAddr>,
    pub rendezvous: Option<SocketAddr>,
    pub datagram: SocketAddr,
    pub stream: SocketAddr,
    pub http: SocketAddr,
}

// ── HostService ──────────────────────────────────────────────────

/// The top-level host service.
///
/// Owns the stream session and all listeners. Construct with
/// [`HostService::bind`], then [`run`](HostService::run) until the
/// stop handle fires.
pub struct HostService {
    config: HostConfig,
    session: StreamSession,
    datagram: DatagramServer,
    stream: StreamServer,
    discovery: Option<DiscoveryResponder>,
    rendezvous: Option<UdpSocket>,
    http: TcpListener,
    addrs: BoundAddrs,
    descriptor: HostDescriptor,
    pairing_tx: watch::Sender<Option<String>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

impl HostService {
    /// Build the session around the synthetic source and bind every
    /// listener named in `config`.
    pub async fn bind(config: HostConfig, injector: Arc<dyn InjectionSink>) -> Result<Self, CastError> {
        let stream_config = config.to_stream_config()?;
        let profile = config.mapping_profile()?;
        info!(profile = %profile.name, "mapping profile loaded");

        let session = StreamSession::new(stream_config, Box::new(SyntheticSource::new()), injector)?
            .with_profile_slot(Arc::new(ProfileSlot::new(profile)));

        let net = &config.network;
        let datagram = DatagramServer::bind(
            config.addr(net.datagram_port),
            session.broadcaster(),
            session.input_queue(),
        )
        .await?;
        let stream = StreamServer::bind(
            config.addr(net.stream_port),
            session.broadcaster(),
            session.input_queue(),
        )
        .await?;
        let http = TcpListener::bind(config.addr(net.http_port)).await?;
        let http_addr = http.local_addr()?;

        let descriptor = HostDescriptor {
            hostname: hostname(&config),
            port: http_addr.port(),
            capabilities: vec![
                config.stream.codec.clone(),
                "datagram".into(),
                "stream".into(),
                "gamepad".into(),
                "mouse".into(),
                "keyboard".into(),
            ],
            requires_auth: false,
            version: env!("CARGO_PKG_VERSION").into(),
        };
        let discovery = match DiscoveryResponder::bind(config.addr(net.discovery_port), &descriptor).await {
            Ok(responder) => Some(responder),
            Err(e) => {
                warn!("LAN discovery disabled: {e}");
                None
            }
        };

        let rendezvous = if config.rendezvous.enabled {
            Some(UdpSocket::bind(config.addr(net.rendezvous_port)).await?)
        } else {
            None
        };

        let addrs = BoundAddrs {
            discovery: discovery.as_ref().map(|d| d.local_addr()).transpose()?,
            rendezvous: rendezvous.as_ref().map(|s| s.local_addr()).transpose()?,
            datagram: datagram.local_addr()?,
            stream: stream.local_addr()?,
            http: http_addr,
        };
        let (pairing_tx, _) = watch::channel(None);

        Ok(Self {
            config,
            session,
            datagram,
            stream,
            discovery,
            rendezvous,
            http,
            addrs,
            descriptor,
            pairing_tx,
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn addrs(&self) -> BoundAddrs {
        self.addrs
    }

    /// Encoded share payload once rendezvous is advertising.
    pub fn pairing(&self) -> watch::Receiver<Option<String>> {
        self.pairing_tx.subscribe()
    }

    /// Obtain a handle that stops the service from another task.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until stopped.
    ///
    /// 1. Starts the stream session.
    /// 2. Spawns the frame transports, discovery responder and HTTP API.
    /// 3. Enables rendezvous (STUN, then the pairing code) and serves it.
    /// 4. On stop, halts the session and waits for the tasks to exit.
    pub async fn run(mut self) -> Result<(), CastError> {
        let cancel = self.cancel.clone();
        let api = ApiState::new(self.session.stats(), self.descriptor.clone(), self.pairing());
        self.session.start(cancel.child_token()).await?;
        self.running.store(true, Ordering::SeqCst);

        let mut tasks = JoinSet::new();
        tasks.spawn(log_exit("datagram server", self.datagram.run(cancel.clone())));
        tasks.spawn(log_exit("stream server", self.stream.run(cancel.clone())));
        tasks.spawn(log_exit("HTTP API", http::serve(self.http, api, cancel.clone())));
        if let Some(responder) = self.discovery.take() {
            tasks.spawn(log_exit("discovery responder", responder.run(cancel.clone())));
        }
        if let Some(socket) = self.rendezvous.take() {
            let host = RendezvousHost::new(
                self.addrs.http.port(),
                StreamPorts {
                    datagram: self.addrs.datagram.port(),
                    stream: self.addrs.stream.port(),
                },
            )
            .with_keepalive(self.config.keepalive());
            tasks.spawn(log_exit(
                "rendezvous",
                serve_rendezvous(
                    host,
                    socket,
                    self.config.rendezvous.stun_servers.clone(),
                    self.pairing_tx.clone(),
                    cancel.clone(),
                ),
            ));
        }
        tasks.spawn(log_events(self.session.subscribe(), cancel.clone()));

        info!(
            datagram = %self.addrs.datagram,
            stream = %self.addrs.stream,
            http = %self.addrs.http,
            "castlink host running"
        );
        cancel.cancelled().await;

        info!("stopping");
        match self.session.stop().await {
            Ok(stats) => info!(
                processed = stats.processed,
                malformed = stats.malformed,
                special = stats.special_actions,
                "input dispatcher stopped"
            ),
            Err(e) => warn!("session stop: {e}"),
        }
        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("tasks still running after {SHUTDOWN_GRACE:?}; aborting");
            tasks.abort_all();
        }

        self.running.store(false, Ordering::SeqCst);
        info!("castlink host stopped");
        Ok(())
    }
}

// ── Internal ─────────────────────────────────────────────────────

/// Discover the public endpoint, publish the pairing payload, then
/// answer connect requests until cancelled.
async fn serve_rendezvous(
    mut host: RendezvousHost,
    socket: UdpSocket,
    stun_servers: Vec<String>,
    pairing: watch::Sender<Option<String>>,
    cancel: CancellationToken,
) -> Result<(), CastError> {
    let enabled = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        enabled = host.enable(&socket, &stun_servers) => enabled,
    };
    let code = enabled?.code.clone();

    let local = match local_ipv4().await {
        Some(ip) => Some(SocketAddr::new(ip.into(), socket.local_addr()?.port())),
        None => None,
    };
    if let Some(payload) = host.share_payload(local) {
        let encoded = payload.encode();
        info!(%code, nat = %payload.nat_type, share = %encoded, "pairing code ready");
        pairing.send_replace(Some(encoded));
    }

    let result = host.run(&socket, cancel).await;
    host.disable();
    pairing.send_replace(None);
    Ok(result?)
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SessionEvent::ClientConnected { id, kind, peer }) => {
                info!(%id, %kind, %peer, "client connected");
            }
            Ok(SessionEvent::ClientDisconnected { id, reason }) => {
                info!(%id, ?reason, "client disconnected");
            }
            Ok(SessionEvent::QualityChanged(adjustment)) => {
                info!(
                    from = adjustment.previous,
                    to = adjustment.quality,
                    reason = %adjustment.reason,
                    "quality adjusted"
                );
            }
            Ok(event) => debug!(?event, "session event"),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("event log lagged by {n}"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_exit<E: Display>(name: &'static str, task: impl Future<Output = Result<(), E>>) {
    match task.await {
        Ok(()) => debug!("{name} exited"),
        Err(e) => error!("{name} failed: {e}"),
    }
}

fn hostname(config: &HostConfig) -> String {
    if !config.network.hostname.trim().is_empty() {
        return config.network.hostname.clone();
    }
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "castlink-host".into())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use castlink_core::discovery::{fetch_descriptor, query_targets};
    use castlink_core::rendezvous::RendezvousClientConfig;
    use castlink_core::{KnownEndpoints, RendezvousClient, SharePayload, StreamReceiver};
    use tokio_test::assert_ok;

    use crate::injector::LoggingInjector;

    /// Every listener on an ephemeral loopback port, no STUN servers.
    fn loopback_config() -> HostConfig {
        let mut config = HostConfig::default();
        config.network.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.network.discovery_port = 0;
        config.network.rendezvous_port = 0;
        config.network.datagram_port = 0;
        config.network.stream_port = 0;
        config.network.http_port = 0;
        config.network.hostname = "test-host".into();
        config.stream.width = 640;
        config.stream.height = 360;
        config.stream.fps = 30;
        config.rendezvous.stun_servers.clear();
        config
    }

    #[tokio::test]
    async fn invalid_config_fails_to_bind() {
        let mut config = loopback_config();
        config.quality.min_quality = 90;
        let result = HostService::bind(config, Arc::new(LoggingInjector::new())).await;
        assert!(matches!(result, Err(CastError::Config(_))));
    }

    #[tokio::test]
    async fn stop_before_run_returns_promptly() {
        let service = HostService::bind(loopback_config(), Arc::new(LoggingInjector::new()))
            .await
            .unwrap();
        assert!(!service.is_running());
        service.stop();
        tokio::time::timeout(Duration::from_secs(5), service.run())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn serves_discovery_pairing_and_frames() {
        let service = HostService::bind(loopback_config(), Arc::new(LoggingInjector::new()))
            .await
            .unwrap();
        let addrs = service.addrs();
        let mut pairing = service.pairing();
        let stop = service.stop_handle();
        let running = tokio::spawn(service.run());

        // LAN discovery and the HTTP descriptor agree.
        let found = query_targets(&[addrs.discovery.unwrap()], Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].descriptor.hostname, "test-host");
        assert_eq!(found[0].addr.port(), addrs.http.port());
        let descriptor = fetch_descriptor(addrs.http, Duration::from_secs(2)).await.unwrap();
        assert_eq!(descriptor, found[0].descriptor);

        // STUN has nothing to try, so the code is advertised right away.
        let encoded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(encoded) = pairing.borrow_and_update().clone() {
                    break encoded;
                }
                pairing.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        let payload = SharePayload::decode(&encoded).unwrap();
        let known = KnownEndpoints {
            local: addrs.rendezvous,
            ..KnownEndpoints::default()
        };
        let client = RendezvousClient::new(RendezvousClientConfig {
            attempts: 3,
            attempt_timeout: Duration::from_millis(500),
        });
        let peer = assert_ok!(client.connect(payload.code.as_str(), &known).await);
        assert_eq!(peer.stream_addr(), addrs.stream);
        assert_eq!(peer.api_addr(), addrs.http);

        let mut receiver = StreamReceiver::connect(peer.stream_addr()).await.unwrap();
        assert_eq!((receiver.info().width, receiver.info().height), (640, 360));
        let frame = tokio::time::timeout(Duration::from_secs(5), receiver.next_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!frame.is_empty());

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
