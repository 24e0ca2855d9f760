//! Negotiated peer capabilities and protocol version compatibility
//!
//! The device daemon reports a capability level (a bitmask) once per
//! session. Bits gate optional protocol behaviors: the generalized
//! hash-based package scheme, per-role open/close, checksummed retry,
//! and so on. The level is cached per session and invalidated on
//! reconnect.

use serde::{Deserialize, Serialize};

/// Protocol version this host speaks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest peer protocol version this host can talk to.
pub const MIN_PEER_VERSION: u32 = 2;

/// Whether a peer protocol version is compatible with this host.
///
/// Peers newer than us are accepted; the handshake only carries fields
/// both sides understand. Peers older than [`MIN_PEER_VERSION`] are not.
pub fn version_compatible(peer: u32) -> bool {
    peer >= MIN_PEER_VERSION
}

/// Capability bitmask negotiated with the device daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityLevel(pub u32);

impl CapabilityLevel {
    /// Per-role open/close/status over the heterogeneous interface.
    pub const HETEROGENEOUS: u32 = 1 << 0;
    /// Builtin-UDF sub-process support.
    pub const BUILTIN_UDF: u32 = 1 << 1;
    /// Device-side profiling daemon (adprof) support.
    pub const ADPROF: u32 = 1 << 2;
    /// Checksummed package-check retry round trip.
    pub const CHECKSUM_RETRY: u32 = 1 << 3;
    /// Batched close-list messages.
    pub const CLOSE_LIST: u32 = 1 << 4;
    /// Generalized hash-based ("common sink") package scheme.
    pub const COMMON_SINK: u32 = 1 << 5;
    /// Extension kernel package support.
    pub const EXTEND_PACKAGE: u32 = 1 << 6;
    /// Multiple network-service (HCCP) instances.
    pub const MULTI_NET_SERVICE: u32 = 1 << 7;

    /// A level with no negotiated bits; legacy paths are selected.
    pub fn unknown() -> Self {
        Self(0)
    }

    pub fn supports(self, bit: u32) -> bool {
        (self.0 & bit) != 0
    }

    /// Capability bits the host itself advertises in open messages.
    pub fn host_level() -> Self {
        Self(Self::CHECKSUM_RETRY | Self::CLOSE_LIST | Self::COMMON_SINK)
    }

    /// Capability bit required before opening the given role, if any.
    pub fn required_for(role: crate::device::SubProcessRole) -> Option<u32> {
        use crate::device::SubProcessRole;
        match role {
            SubProcessRole::Udf => Some(Self::HETEROGENEOUS),
            SubProcessRole::BuiltinUdf => Some(Self::BUILTIN_UDF),
            SubProcessRole::Adprof => Some(Self::ADPROF),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SubProcessRole;

    #[test]
    fn test_version_compatibility() {
        assert!(version_compatible(PROTOCOL_VERSION));
        assert!(version_compatible(MIN_PEER_VERSION));
        assert!(version_compatible(PROTOCOL_VERSION + 1));
        assert!(!version_compatible(MIN_PEER_VERSION - 1));
    }

    #[test]
    fn test_capability_bits() {
        let level = CapabilityLevel(CapabilityLevel::HETEROGENEOUS | CapabilityLevel::ADPROF);
        assert!(level.supports(CapabilityLevel::HETEROGENEOUS));
        assert!(level.supports(CapabilityLevel::ADPROF));
        assert!(!level.supports(CapabilityLevel::COMMON_SINK));
        assert!(!CapabilityLevel::unknown().supports(CapabilityLevel::HETEROGENEOUS));
    }

    #[test]
    fn test_role_capability_gates() {
        assert_eq!(
            CapabilityLevel::required_for(SubProcessRole::BuiltinUdf),
            Some(CapabilityLevel::BUILTIN_UDF)
        );
        assert_eq!(CapabilityLevel::required_for(SubProcessRole::Compute), None);
        assert_eq!(CapabilityLevel::required_for(SubProcessRole::Hccp), None);
    }
}
