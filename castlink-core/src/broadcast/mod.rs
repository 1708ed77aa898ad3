//! Frame fan-out to connected clients over two transports.
//!
//! ```text
//!                     ┌──► DatagramSink ──(chunked UDP)──► client A
//!  publish_frame ──► FrameBroadcaster
//!                     └──► StreamSink ──(queue ─► writer task ─► TCP)──► client B
//! ```
//!
//! | Module        | Purpose                                              |
//! |---------------|------------------------------------------------------|
//! | `broadcaster` | Client registry, fan-out, liveness sweep             |
//! | `sink`        | [`FrameSink`] trait and [`SinkState`]                 |
//! | `datagram`    | UDP sink and server (`HELLO` / `PING` / `BYE`)         |
//! | `stream`      | TCP sink with bounded queue, accept loop             |
//! | `framing`     | Chunked datagram wire format and reassembly          |
//! | `control`     | JSON `info` handshake and `pong`                      |
//! | `receiver`    | Client ends of both transports                       |

pub mod broadcaster;
pub mod control;
pub mod datagram;
pub mod framing;
pub mod receiver;
pub mod sink;
pub mod stream;

pub use broadcaster::{ClientInfo, DEFAULT_LIVENESS_TIMEOUT, FrameBroadcaster, PublishReport};
pub use control::{ControlMessage, StreamInfo};
pub use datagram::{DatagramServer, DatagramSink};
pub use framing::{FrameReassembler, Inbound, ReceivedFrame};
pub use receiver::{DatagramReceiver, ReceiverEvent, StreamReceiver};
pub use sink::{FrameSink, SinkState};
pub use stream::{DEFAULT_QUEUE_DEPTH, StreamServer, StreamSink};
