//! Chunked datagram framing for the UDP transport.
//!
//! Frames are split into MTU-sized datagrams so they never rely on IP
//! fragmentation. Every host → client datagram starts with a one-byte
//! packet kind:
//!
//! ```text
//! 0x01 CONTROL  kind(1) | JSON ControlMessage
//! 0x02 FRAME    kind(1) | sequence u32 | timestamp_us u64 | frame_len u32 | total_chunks u32
//! 0x03 CHUNK    kind(1) | sequence u32 | chunk_index u32 | chunk_size u32 | data
//! ```
//!
//! All integers are little-endian. A frame is one FRAME packet followed
//! by `total_chunks` CHUNK packets sharing its sequence number.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::broadcast::control::ControlMessage;

// ── Constants ────────────────────────────────────────────────────

/// Payload budget per datagram: 1500 minus IP/UDP headers and slack.
pub const DEFAULT_MTU: usize = 1400;

pub const PACKET_CONTROL: u8 = 0x01;
pub const PACKET_FRAME: u8 = 0x02;
pub const PACKET_CHUNK: u8 = 0x03;

// ── FrameHeader ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u32,
    /// Microseconds since the sending sink was created.
    pub timestamp_us: u64,
    pub frame_len: u32,
    pub total_chunks: u32,
}

impl FrameHeader {
    /// Encoded size without the kind byte.
    pub const SIZE: usize = 20;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..12].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[12..16].copy_from_slice(&self.frame_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.total_chunks.to_le_bytes());
        buf
    }

    pub fn decode(mut data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            sequence: data.get_u32_le(),
            timestamp_us: data.get_u64_le(),
            frame_len: data.get_u32_le(),
            total_chunks: data.get_u32_le(),
        })
    }
}

// ── ChunkHeader ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub sequence: u32,
    pub chunk_index: u32,
    pub chunk_size: u32,
}

impl ChunkHeader {
    /// Encoded size without the kind byte.
    pub const SIZE: usize = 12;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..8].copy_from_slice(&self.chunk_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf
    }

    pub fn decode(mut data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            sequence: data.get_u32_le(),
            chunk_index: data.get_u32_le(),
            chunk_size: data.get_u32_le(),
        })
    }
}

// ── Packet building ──────────────────────────────────────────────

/// Maximum frame bytes carried by one CHUNK packet.
pub fn chunk_payload_max(mtu: usize) -> usize {
    mtu.saturating_sub(1 + ChunkHeader::SIZE).max(1)
}

/// Wrap an encoded control message.
pub fn control_packet(json: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + json.len());
    buf.put_u8(PACKET_CONTROL);
    buf.put_slice(json);
    buf.freeze()
}

/// Split `frame` into its FRAME packet and CHUNK packets.
pub fn frame_packets(sequence: u32, timestamp_us: u64, frame: &[u8], mtu: usize) -> Vec<Bytes> {
    let max = chunk_payload_max(mtu);
    let total_chunks = frame.len().div_ceil(max);
    let mut packets = Vec::with_capacity(total_chunks + 1);

    let header = FrameHeader {
        sequence,
        timestamp_us,
        frame_len: frame.len() as u32,
        total_chunks: total_chunks as u32,
    };
    let mut buf = BytesMut::with_capacity(1 + FrameHeader::SIZE);
    buf.put_u8(PACKET_FRAME);
    buf.put_slice(&header.encode());
    packets.push(buf.freeze());

    for (idx, data) in frame.chunks(max).enumerate() {
        let ch = ChunkHeader {
            sequence,
            chunk_index: idx as u32,
            chunk_size: data.len() as u32,
        };
        let mut buf = BytesMut::with_capacity(1 + ChunkHeader::SIZE + data.len());
        buf.put_u8(PACKET_CHUNK);
        buf.put_slice(&ch.encode());
        buf.put_slice(data);
        packets.push(buf.freeze());
    }
    packets
}

// ── Packet parsing ───────────────────────────────────────────────

/// A parsed host → client datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum DatagramPacket<'a> {
    Control(&'a [u8]),
    Frame(FrameHeader),
    Chunk(ChunkHeader, &'a [u8]),
}

impl<'a> DatagramPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let (&kind, rest) = data.split_first()?;
        match kind {
            PACKET_CONTROL => Some(Self::Control(rest)),
            PACKET_FRAME => FrameHeader::decode(rest).map(Self::Frame),
            PACKET_CHUNK => {
                let header = ChunkHeader::decode(rest)?;
                let payload = &rest[ChunkHeader::SIZE..];
                (payload.len() == header.chunk_size as usize).then_some(Self::Chunk(header, payload))
            }
            _ => None,
        }
    }
}

// ── FrameReassembler ─────────────────────────────────────────────

/// A frame put back together by [`FrameReassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub sequence: u32,
    pub timestamp_us: u64,
    pub data: Bytes,
}

/// Something the client learned from one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    Frame(ReceivedFrame),
}

struct Pending {
    header: FrameHeader,
    chunks: Vec<Option<Bytes>>,
    received: usize,
}

/// Client-side reassembly of chunked frames.
///
/// Only one frame is in flight at a time: a new FRAME packet abandons
/// an incomplete predecessor, and chunks from other sequences are
/// dropped. Loss is preferred over latency.
#[derive(Default)]
pub struct FrameReassembler {
    pending: Option<Pending>,
    abandoned: u64,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames abandoned because a chunk never arrived.
    pub fn abandoned(&self) -> u64 {
        self.abandoned
    }

    /// Feed one datagram; returns a control message or a completed frame.
    pub fn push(&mut self, datagram: &[u8]) -> Option<Inbound> {
        match DatagramPacket::parse(datagram)? {
            DatagramPacket::Control(json) => ControlMessage::from_bytes(json).map(Inbound::Control),
            DatagramPacket::Frame(header) => {
                if self.pending.take().is_some() {
                    self.abandoned += 1;
                }
                if header.total_chunks == 0 {
                    return Some(Inbound::Frame(ReceivedFrame {
                        sequence: header.sequence,
                        timestamp_us: header.timestamp_us,
                        data: Bytes::new(),
                    }));
                }
                self.pending = Some(Pending {
                    header,
                    chunks: vec![None; header.total_chunks as usize],
                    received: 0,
                });
                None
            }
            DatagramPacket::Chunk(ch, payload) => {
                let pending = self.pending.as_mut()?;
                if ch.sequence != pending.header.sequence {
                    return None;
                }
                let slot = pending.chunks.get_mut(ch.chunk_index as usize)?;
                if slot.is_some() {
                    return None;
                }
                *slot = Some(Bytes::copy_from_slice(payload));
                pending.received += 1;
                if pending.received < pending.chunks.len() {
                    return None;
                }

                let done = self.pending.take()?;
                let mut data = BytesMut::with_capacity(done.header.frame_len as usize);
                for chunk in done.chunks.into_iter().flatten() {
                    data.put(chunk);
                }
                Some(Inbound::Frame(ReceivedFrame {
                    sequence: done.header.sequence,
                    timestamp_us: done.header.timestamp_us,
                    data: data.freeze(),
                }))
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
