//! STUN subset used for public-endpoint discovery.
//!
//! | Module    | Purpose                                        |
//! |-----------|------------------------------------------------|
//! | `message` | Binding request / response wire format          |
//! | `client`  | Server iteration, NAT check, keep-alive       |
//! | `nat`     | [`NatType`] classification                      |

pub mod client;
pub mod message;
pub mod nat;

pub use client::{DEFAULT_STUN_SERVERS, DiscoveredEndpoint, StunClient};
pub use message::{
    BindingRequest, MAGIC_COOKIE, TransactionId, encode_binding_response, parse_binding_response,
};
pub use nat::NatType;
