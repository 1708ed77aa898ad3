//! Pairing-code rendezvous between a host and a client.
//!
//! | Module     | Purpose                                               |
//! |------------|-------------------------------------------------------|
//! | `code`     | [`PairingCode`] alphabet and the host's session        |
//! | `messages` | `CONNECT:<code>` request and CONNECTED reply           |
//! | `payload`  | Base64 share payload (QR content)                      |
//! | `host`     | [`HostPhase`] state machine and UDP responder          |
//! | `client`   | Retry policy, failure reasons, relay hook              |

pub mod client;
pub mod code;
pub mod host;
pub mod messages;
pub mod payload;

pub use client::{
    KnownEndpoints, PeerSession, RelayConnector, RendezvousClient, RendezvousClientConfig,
};
pub use code::{CODE_ALPHABET, CODE_LEN, PairingCode, PairingSession};
pub use host::{DEFAULT_KEEPALIVE, HostPhase, RendezvousHost};
pub use messages::{RendezvousReply, SessionParams, StreamPorts};
pub use payload::SharePayload;
