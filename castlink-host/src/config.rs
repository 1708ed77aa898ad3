//! Configuration for the castlink host.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use castlink_core::discovery::DISCOVERY_PORT;
use castlink_core::error::ConfigError;
use castlink_core::stun::DEFAULT_STUN_SERVERS;
use castlink_core::{MappingProfile, QualityConfig, Resolution, StreamConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Listening ports.
    pub network: NetworkConfig,
    /// What the frame source produces.
    pub stream: StreamSection,
    /// Quality controller bounds and toggles.
    pub quality: QualitySection,
    /// Pairing-code rendezvous.
    pub rendezvous: RendezvousSection,
    /// Input mapping.
    pub input: InputSection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address every listener binds to.
    pub bind_address: IpAddr,
    /// UDP port answering LAN discovery broadcasts.
    pub discovery_port: u16,
    /// UDP port for `CONNECT:<code>` requests and NAT keep-alives.
    pub rendezvous_port: u16,
    /// UDP port for chunked frames and datagram input.
    pub datagram_port: u16,
    /// TCP port for length-delimited frames and stream input.
    pub stream_port: u16,
    /// HTTP port for `/stats` and the discovery descriptor.
    pub http_port: u16,
    /// Name announced to discovering clients. Empty means the OS host name.
    pub hostname: String,
}

/// Stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// Target frames per second.
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Codec name announced in the `info` handshake.
    pub codec: String,
    /// Seconds without traffic before a client is dropped.
    pub liveness_timeout_secs: u64,
}

/// Quality controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySection {
    pub min_quality: u8,
    pub max_quality: u8,
    pub initial_quality: u8,
    /// Fraction of the GPU the encoder may use (0.0 - 1.0).
    pub gpu_allocation: f64,
    /// Run the controller at all.
    pub adaptive: bool,
    /// React to client-reported round-trip times.
    pub network_adaptive: bool,
    /// Minimum seconds between two adjustments.
    pub min_adjustment_interval_secs: f64,
}

/// Rendezvous configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousSection {
    /// Generate a pairing code and answer connect requests.
    pub enabled: bool,
    /// STUN servers tried in order, as `host:port`.
    pub stun_servers: Vec<String>,
    /// Seconds between NAT keep-alive binding requests.
    pub keepalive_secs: u64,
}

/// Input configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSection {
    /// Mapping profile TOML. Empty selects the identity profile.
    pub profile: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_port: DISCOVERY_PORT,
            rendezvous_port: 47991,
            datagram_port: 47992,
            stream_port: 47993,
            http_port: 47989,
            hostname: String::new(),
        }
    }
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            fps: 60,
            width: 1920,
            height: 1080,
            codec: "h264".into(),
            liveness_timeout_secs: 10,
        }
    }
}

impl Default for QualitySection {
    fn default() -> Self {
        let q = QualityConfig::default();
        Self {
            min_quality: q.min_quality,
            max_quality: q.max_quality,
            initial_quality: q.initial_quality,
            gpu_allocation: q.gpu_allocation,
            adaptive: true,
            network_adaptive: q.network_adaptive,
            min_adjustment_interval_secs: q.min_adjustment_interval.as_secs_f64(),
        }
    }
}

impl Default for RendezvousSection {
    fn default() -> Self {
        Self {
            enabled: true,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            keepalive_secs: 25,
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

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
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

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Convert into a validated [`StreamConfig`].
    pub fn to_stream_config(&self) -> Result<StreamConfig, ConfigError> {
        let secs = self.quality.min_adjustment_interval_secs;
        let interval = Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::OutOfRange {
            field: "min_adjustment_interval_secs",
            value: secs.to_string(),
            reason: "must be a non-negative number of seconds",
        })?;

        let config = StreamConfig {
            resolution: Resolution::new(self.stream.width, self.stream.height),
            codec: self.stream.codec.clone(),
            quality: QualityConfig {
                min_quality: self.quality.min_quality,
                max_quality: self.quality.max_quality,
                initial_quality: self.quality.initial_quality,
                target_fps: self.stream.fps,
                network_adaptive: self.quality.network_adaptive,
                min_adjustment_interval: interval,
                gpu_allocation: self.quality.gpu_allocation,
            },
            adaptive_quality: self.quality.adaptive,
            liveness_timeout: Duration::from_secs(self.stream.liveness_timeout_secs),
            ..StreamConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// The configured mapping profile, or identity when none is set.
    pub fn mapping_profile(&self) -> Result<MappingProfile, ConfigError> {
        if self.input.profile.trim().is_empty() {
            return Ok(MappingProfile::default());
        }
        MappingProfile::load(Path::new(&self.input.profile))
    }

    pub fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.network.bind_address, port)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.rendezvous.keepalive_secs.max(1))
    }
}

// ── Tests ────────────────────────────────────────────────────────
