//! Domain-specific error types for castlink.
//!
//! Each subsystem has its own typed error; all of them fold into
//! [`CastError`] so callers that do not care about the origin can use
//! a single `Result<T, CastError>`.

use std::time::Duration;

use thiserror::Error;

/// The canonical error type for castlink.
#[derive(Debug, Error)]
pub enum CastError {
    /// Public-endpoint discovery failed.
    #[error(transparent)]
    Stun(#[from] StunError),

    /// Pairing state machine or payload error.
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    /// A rendezvous connection attempt gave up.
    #[error("connection failed: {0}")]
    Connect(#[from] ConnectFailure),

    /// A client sink refused a write.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// A setting was rejected at the boundary.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An inbound input message could not be used.
    #[error(transparent)]
    Input(#[from] InputError),

    /// Session lifecycle failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The socket layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Encoding or decoding of a JSON payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── StunError ────────────────────────────────────────────────────

/// Failures while building, sending or parsing STUN binding messages.
#[derive(Debug, Error)]
pub enum StunError {
    /// The datagram ended before a header or attribute was complete.
    #[error("STUN message truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// The message type was not a binding success response.
    #[error("not a binding response: message type {0:#06x}")]
    NotBindingResponse(u16),

    /// The magic cookie did not match `0x2112A442`.
    #[error("bad magic cookie: {0:#010x}")]
    BadCookie(u32),

    /// The response belongs to a different request.
    #[error("transaction id mismatch")]
    TransactionMismatch,

    /// Neither XOR-MAPPED-ADDRESS nor MAPPED-ADDRESS was present.
    #[error("response carries no mapped address")]
    NoMappedAddress,

    /// Address family byte was neither IPv4 nor IPv6.
    #[error("unsupported address family: {0:#04x}")]
    UnsupportedFamily(u8),

    /// The server name did not resolve to an IPv4 address.
    #[error("cannot resolve STUN server {0}")]
    Resolve(String),

    /// No response within the per-server deadline.
    #[error("STUN server did not answer within {0:?}")]
    Timeout(Duration),

    /// Every candidate server failed.
    #[error("all STUN servers failed")]
    AllServersFailed,

    /// Socket failure.
    #[error("STUN I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── RendezvousError ──────────────────────────────────────────────

/// Failures of the pairing state machine and shareable payloads.
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// A state transition was requested from the wrong phase.
    #[error("invalid rendezvous transition: {0}")]
    InvalidTransition(&'static str),

    /// A share payload could not be decoded.
    #[error("invalid share payload: {0}")]
    Payload(String),

    /// The session key in a reply was not 32 bytes of base64.
    #[error("invalid session key")]
    InvalidKey,

    /// Socket failure.
    #[error("rendezvous I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── ConnectFailure ───────────────────────────────────────────────

/// User-visible reason a rendezvous connection attempt failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectFailure {
    /// No reply from any endpoint within the retry budget.
    #[error("timeout")]
    Timeout,

    /// The host sits behind a symmetric NAT and direct attempts failed.
    #[error("NAT incompatible")]
    NatIncompatible,

    /// The code is not a well-formed pairing code.
    #[error("invalid code")]
    InvalidCode,

    /// No endpoint to try, or the local socket could not be used.
    #[error("server unreachable")]
    ServerUnreachable,
}

// ── SinkError ────────────────────────────────────────────────────

/// Failure delivering bytes to a single client.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink is not open anymore.
    #[error("sink closed")]
    Closed,

    /// The per-client queue is full; the peer is too slow.
    #[error("client queue full")]
    Backpressure,

    /// Socket failure.
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Control message serialization failed.
    #[error("sink encoding error: {0}")]
    Encoding(String),
}

// ── ConfigError ──────────────────────────────────────────────────

/// A setting rejected at the configuration boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// A numeric setting fell outside its allowed range.
    #[error("{field} = {value} is out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    /// A pairing code did not match the code alphabet or length.
    #[error("invalid pairing code {0:?}")]
    InvalidCode(String),

    /// Any other invalid setting.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── InputError ───────────────────────────────────────────────────

/// Failure handling an inbound client message.
#[derive(Debug, Error)]
pub enum InputError {
    /// The JSON did not match any known message schema.
    #[error("malformed input message: {0}")]
    Malformed(String),

    /// The input queue is full; the message was dropped.
    #[error("input queue full")]
    QueueFull,

    /// The injection backend rejected the frame.
    #[error("injection failed: {0}")]
    Injection(String),
}

// ── SessionError ─────────────────────────────────────────────────

/// Session lifecycle failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The capture/encode collaborator could not be started.
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),

    /// The collaborator failed while producing or reconfiguring.
    #[error("frame source error: {0}")]
    Source(String),

    /// `start` was called on a running session.
    #[error("session already running")]
    AlreadyRunning,

    /// `stop` was called on a session that is not running.
    #[error("session not running")]
    NotRunning,

    /// The session configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for CastError {
    fn from(s: String) -> Self {
        CastError::Other(s)
    }
}

impl From<&str> for CastError {
    fn from(s: &str) -> Self {
        CastError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CastError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CastError::ChannelClosed
    }
}

impl From<serde_json::Error> for CastError {
    fn from(e: serde_json::Error) -> Self {
        CastError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failure_reasons_are_user_facing() {
        assert_eq!(ConnectFailure::Timeout.to_string(), "timeout");
        assert_eq!(ConnectFailure::NatIncompatible.to_string(), "NAT incompatible");
        assert_eq!(ConnectFailure::InvalidCode.to_string(), "invalid code");
        assert_eq!(
            ConnectFailure::ServerUnreachable.to_string(),
            "server unreachable"
        );
    }

    #[test]
    fn out_of_range_names_the_field() {
        let e = ConfigError::OutOfRange {
            field: "gpu_allocation",
            value: "1.5".into(),
            reason: "must be within 0..=1",
        };
        let text = e.to_string();
        assert!(text.contains("gpu_allocation"));
        assert!(text.contains("1.5"));
    }

    #[test]
    fn from_string() {
        let e: CastError = "something broke".into();
        assert!(matches!(e, CastError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: CastError = io_err.into();
        assert!(matches!(e, CastError::Connection(_)));
    }

    #[test]
    fn subsystem_errors_fold_into_cast_error() {
        let e: CastError = StunError::AllServersFailed.into();
        assert!(matches!(e, CastError::Stun(_)));
        let e: CastError = ConnectFailure::Timeout.into();
        assert_eq!(e.to_string(), "connection failed: timeout");
    }
}
