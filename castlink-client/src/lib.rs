//! # castlink-client: thin streaming client
//!
//! Finds a castlink host (share payload, pairing code, explicit
//! address or LAN discovery), receives its frames over the datagram or
//! stream transport and sends input back as JSON.
//!
//! Decoding and presenting frames is left to the embedding
//! application; this crate measures and reports what it receives.

pub mod config;
pub mod connection;
pub mod resolve;
