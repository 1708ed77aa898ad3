//! STUN binding request/response wire format (RFC 5389 subset).
//!
//! ## Header (20 bytes, big-endian)
//! ```text
//! message type:    u16  (0x0001 request, 0x0101 success response)
//! message length:  u16  (attribute bytes after the header)
//! magic cookie:    u32  (0x2112A442)
//! transaction id:  [u8; 12]
//! ```
//!
//! ## Attribute (TLV, padded to 4 bytes)
//! ```text
//! type:    u16
//! length:  u16  (unpadded value length)
//! value:   [u8] (length bytes, then 0-3 padding bytes)
//! ```
//!
//! Only MAPPED-ADDRESS (`0x0001`) and XOR-MAPPED-ADDRESS (`0x0020`) are
//! interpreted; every other attribute is skipped.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::StunError;

// ── Constants ────────────────────────────────────────────────────

/// Fixed magic cookie present in every STUN message.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Size of the fixed STUN header.
pub const HEADER_SIZE: usize = 20;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// 96-bit transaction identifier.
pub type TransactionId = [u8; 12];

// ── BindingRequest ───────────────────────────────────────────────

/// A binding request with no attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingRequest {
    transaction_id: TransactionId,
}

impl BindingRequest {
    /// New request with a random transaction id.
    pub fn new() -> Self {
        Self::with_transaction_id(rand::random())
    }

    /// New request with an explicit transaction id (fixtures, tests).
    pub fn with_transaction_id(transaction_id: TransactionId) -> Self {
        Self { transaction_id }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Serialize to the 20-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
        // length stays 0: no attributes
        buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf[8..20].copy_from_slice(&self.transaction_id);
        buf
    }

    /// Parse a request header, as a STUN server would.
    pub fn decode(data: &[u8]) -> Result<Self, StunError> {
        let header = Header::decode(data)?;
        if header.message_type != BINDING_REQUEST {
            return Err(StunError::NotBindingResponse(header.message_type));
        }
        Ok(Self::with_transaction_id(header.transaction_id))
    }
}

impl Default for BindingRequest {
    fn default() -> Self {
        Self::new()
    }
}

// ── BindingResponse ──────────────────────────────────────────────

/// Encode a binding success response carrying `mapped` as
/// XOR-MAPPED-ADDRESS.
///
/// Used by the in-process STUN responder in tests and by hosts that
/// want to answer reflexive queries themselves.
pub fn encode_binding_response(transaction_id: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
    let value = encode_address(mapped, true, transaction_id);
    let mut buf = Vec::with_capacity(HEADER_SIZE + 4 + value.len());
    buf.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    buf.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(&value);
    buf
}

/// Parse a binding success response and return the reflexive address.
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when both are present.
pub fn parse_binding_response(
    data: &[u8],
    expected: &TransactionId,
) -> Result<SocketAddr, StunError> {
    let header = Header::decode(data)?;
    if header.message_type != BINDING_SUCCESS {
        return Err(StunError::NotBindingResponse(header.message_type));
    }
    if header.transaction_id != *expected {
        return Err(StunError::TransactionMismatch);
    }

    let body_end = HEADER_SIZE + header.length as usize;
    if data.len() < body_end {
        return Err(StunError::Truncated {
            needed: body_end,
            actual: data.len(),
        });
    }
    let body = &data[HEADER_SIZE..body_end];

    let mut xor_mapped = None;
    let mut mapped = None;
    let mut offset = 0usize;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > body.len() {
            return Err(StunError::Truncated {
                needed: HEADER_SIZE + value_end,
                actual: data.len(),
            });
        }
        let value = &body[value_start..value_end];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                xor_mapped = Some(decode_address(value, true, &header.transaction_id)?)
            }
            ATTR_MAPPED_ADDRESS => {
                mapped = Some(decode_address(value, false, &header.transaction_id)?)
            }
            _ => {}
        }
        offset = value_end + padding(attr_len);
    }

    xor_mapped.or(mapped).ok_or(StunError::NoMappedAddress)
}

// ── Internal ─────────────────────────────────────────────────────

struct Header {
    message_type: u16,
    length: u16,
    transaction_id: TransactionId,
}

impl Header {
    fn decode(data: &[u8]) -> Result<Self, StunError> {
        if data.len() < HEADER_SIZE {
            return Err(StunError::Truncated {
                needed: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::BadCookie(cookie));
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);
        Ok(Self {
            message_type: u16::from_be_bytes([data[0], data[1]]),
            length: u16::from_be_bytes([data[2], data[3]]),
            transaction_id,
        })
    }
}

/// Bytes of padding after a value of `len` bytes.
fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..16].copy_from_slice(transaction_id);
    key
}

fn decode_address(
    value: &[u8],
    xor: bool,
    transaction_id: &TransactionId,
) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::Truncated {
            needed: 4,
            actual: value.len(),
        });
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    let key = xor_key(transaction_id);

    let ip = match family {
        FAMILY_IPV4 => {
            if value.len() < 8 {
                return Err(StunError::Truncated {
                    needed: 8,
                    actual: value.len(),
                });
            }
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xor {
                for (o, k) in octets.iter_mut().zip(&key[..4]) {
                    *o ^= k;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(StunError::Truncated {
                    needed: 20,
                    actual: value.len(),
                });
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xor {
                for (o, k) in octets.iter_mut().zip(&key) {
                    *o ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(StunError::UnsupportedFamily(other)),
    };
    Ok(SocketAddr::new(ip, port))
}

fn encode_address(addr: SocketAddr, xor: bool, transaction_id: &TransactionId) -> Vec<u8> {
    let key = xor_key(transaction_id);
    let port = if xor {
        addr.port() ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        addr.port()
    };
    let mut out = vec![0u8];
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(FAMILY_IPV4);
            out.extend_from_slice(&port.to_be_bytes());
            let octets = ip.octets();
            out.extend(
                octets
                    .iter()
                    .zip(&key[..4])
                    .map(|(o, k)| if xor { o ^ k } else { *o }),
            );
        }
        IpAddr::V6(ip) => {
            out.push(FAMILY_IPV6);
            out.extend_from_slice(&port.to_be_bytes());
            let octets = ip.octets();
            out.extend(
                octets
                    .iter()
                    .zip(&key)
                    .map(|(o, k)| if xor { o ^ k } else { *o }),
            );
        }
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────
