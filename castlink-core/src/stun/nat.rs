//! NAT behaviour classification.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// How the local NAT maps internal endpoints to external ones.
///
/// Derived from STUN queries, never stored. The two-server check cannot
/// tell the cone variants apart, so it only ever reports [`FullCone`],
/// [`Symmetric`] or [`Unknown`]; the other variants exist for payloads
/// produced by peers with a richer classifier.
///
/// [`FullCone`]: NatType::FullCone
/// [`Symmetric`]: NatType::Symmetric
/// [`Unknown`]: NatType::Unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NatType {
    #[default]
    Unknown,
    FullCone,
    RestrictedCone,
    PortRestricted,
    Symmetric,
}

impl NatType {
    /// Classify from the mappings two different servers observed for
    /// the same local socket.
    pub fn from_mappings(first: SocketAddr, second: SocketAddr) -> Self {
        if first == second {
            NatType::FullCone
        } else {
            NatType::Symmetric
        }
    }

    /// Whether a direct connection attempt is worth making before
    /// falling back to a relay or manual setup.
    pub fn allows_direct(self) -> bool {
        !matches!(self, NatType::Symmetric)
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::FullCone => "full cone",
            Self::RestrictedCone => "restricted cone",
            Self::PortRestricted => "port restricted",
            Self::Symmetric => "symmetric",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_mapping_is_cone() {
        let a: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        assert_eq!(NatType::from_mappings(a, a), NatType::FullCone);
        assert!(NatType::FullCone.allows_direct());
    }

    #[test]
    fn different_port_is_symmetric() {
        let a: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let b: SocketAddr = "203.0.113.5:40007".parse().unwrap();
        assert_eq!(NatType::from_mappings(a, b), NatType::Symmetric);
        assert!(!NatType::Symmetric.allows_direct());
        assert!(NatType::Unknown.allows_direct());
    }
}
