//! Thin client configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use castlink_core::discovery::DISCOVERY_PORT;
use castlink_core::rendezvous::RendezvousClientConfig;

/// Top-level configuration for the thin client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Where the host is and how to reach it.
    pub network: NetworkConfig,
    /// Pairing by code or share payload.
    pub pairing: PairingConfig,
    /// Stats and latency reporting.
    pub stats: StatsConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Which frame transport to receive on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Chunked UDP: lowest latency, loss tolerated.
    #[default]
    Datagram,
    /// Length-delimited TCP: reliable, in order.
    Stream,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host IP. Empty means discover on the LAN.
    pub host: String,
    pub transport: Transport,
    /// Host ports used when only the host IP is known.
    pub datagram_port: u16,
    pub stream_port: u16,
    pub rendezvous_port: u16,
    pub api_port: u16,
    /// Connection timeout in milliseconds.
    pub timeout_ms: u64,
    /// UDP port hosts answer discovery broadcasts on.
    pub discovery_port: u16,
    /// How long to collect discovery replies, in milliseconds.
    pub listen_window_ms: u64,
    /// Scan the local /24 over HTTP when the broadcast finds nothing.
    pub scan_fallback: bool,
}

/// Pairing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Six-character pairing code shown by the host.
    pub code: String,
    /// Encoded share payload (QR content). Takes precedence over `code`.
    pub share: String,
    /// Connect requests per endpoint.
    pub attempts: u32,
    /// Wait per connect request, in milliseconds.
    pub attempt_timeout_ms: u64,
}

/// Stats and latency reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Seconds between stats log lines.
    pub interval_secs: u64,
    /// Milliseconds between liveness pings (RTT samples on datagram).
    pub ping_interval_ms: u64,
    /// Report measured RTT to the host for quality control.
    pub report_latency: bool,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            transport: Transport::Datagram,
            datagram_port: 47992,
            stream_port: 47993,
            rendezvous_port: 47991,
            api_port: 47989,
            timeout_ms: 5000,
            discovery_port: DISCOVERY_PORT,
            listen_window_ms: 2000,
            scan_fallback: true,
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code: String::new(),
            share: String::new(),
            attempts: 3,
            attempt_timeout_ms: 1000,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            ping_interval_ms: 1000,
            report_latency: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ClientConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write default config to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// The configured host IP, if any. Accepts a bare IP or `ip:port`.
    pub fn host_ip(&self) -> Result<Option<IpAddr>, String> {
        let host = self.network.host.trim();
        if host.is_empty() {
            return Ok(None);
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Some(ip));
        }
        host.parse::<SocketAddr>()
            .map(|addr| Some(addr.ip()))
            .map_err(|_| format!("invalid host address {host:?}"))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.network.timeout_ms.max(1))
    }

    pub fn listen_window(&self) -> Duration {
        Duration::from_millis(self.network.listen_window_ms)
    }

    pub fn rendezvous(&self) -> RendezvousClientConfig {
        RendezvousClientConfig {
            attempts: self.pairing.attempts.max(1),
            attempt_timeout: Duration::from_millis(self.pairing.attempt_timeout_ms.max(1)),
        }
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats.interval_secs.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.stats.ping_interval_ms.max(10))
    }
}

// ── Tests ────────────────────────────────────────────────────────
