//! # castlink-core
//!
//! Core library for castlink, a host-to-thin-client game streaming link.
//!
//! This crate contains:
//! - **STUN**: binding request/response codec, public endpoint and NAT type discovery
//! - **Rendezvous**: pairing codes, host advertisement state machine, client connect with fallback
//! - **Broadcast**: `FrameBroadcaster` fan-out over chunked UDP and length-delimited TCP
//! - **Quality**: per-second `PerformanceSample`s and the hysteresis-gated `QualityController`
//! - **Input**: JSON input messages, mapping profiles, deadzones, the dispatcher task
//! - **Session**: `StreamSession` wiring a frame source, broadcaster, controller and input together
//! - **Discovery**: LAN broadcast query, responder and /24 HTTP scan
//! - **Error**: `CastError`, a typed, `thiserror`-based error hierarchy

pub mod broadcast;
pub mod discovery;
pub mod error;
pub mod events;
pub mod input;
pub mod quality;
pub mod rendezvous;
pub mod session;
pub mod stun;
pub mod types;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use broadcast::{
    ControlMessage, DatagramReceiver, DatagramServer, FrameBroadcaster, FrameSink, ReceiverEvent,
    StreamInfo, StreamReceiver, StreamServer,
};
pub use discovery::{DISCOVERY_PORT, DiscoveredHost, DiscoveryResponder, HostDescriptor};
pub use error::{
    CastError, ConfigError, ConnectFailure, InputError, RendezvousError, SessionError, SinkError,
    StunError,
};
pub use events::{DisconnectReason, EventBus, SessionEvent};
pub use input::{
    ClientMessage, InjectionSink, InputFrame, InputQueue, MappingProfile, ProfileSlot, SpecialAction,
};
pub use quality::{Adjustment, PerformanceSample, QualityConfig, QualityController};
pub use rendezvous::{
    KnownEndpoints, PairingCode, PeerSession, RendezvousClient, RendezvousHost, SharePayload,
};
pub use session::{FrameSource, StatsSnapshot, StreamConfig, StreamSession};
pub use stun::{NatType, StunClient};
pub use types::{ClientId, Resolution, TransportKind};
