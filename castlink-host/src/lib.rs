//! # castlink-host: streaming host service
//!
//! Runs a [`StreamSession`](castlink_core::StreamSession) and exposes it
//! to thin clients: chunked UDP and length-delimited TCP frame
//! transports, pairing-code rendezvous, LAN discovery and an HTTP API
//! with live stats.
//!
//! Frames come from a synthetic source and input is logged rather than
//! injected; capture encoders and virtual-device backends plug in
//! behind `FrameSource` and `InjectionSink`.

pub mod config;
pub mod http;
pub mod injector;
pub mod service;
pub mod source;
