//! Error taxonomy shared across the control plane
//!
//! The variants mirror the failure classes a caller can act on:
//! configuration/precondition errors (no retry), transport errors
//! (retried only during initial session creation), protocol/version
//! errors (fatal per operation), peer-reported failures (mapped from the
//! structured error code the device sends), and consistency errors from
//! package verification.

use crate::device::{DeviceId, SubProcessRole};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Status {
    #[error("device id {0} is not supported (valid range 0..{max})", max = crate::device::MAX_DEVICES_PER_HOST)]
    InvalidDevice(u32),

    #[error("failed to create transport session to device {0} after {1} attempts")]
    SessionCreateFailed(DeviceId, u32),

    #[error("sub-session id pool exhausted for device {0}")]
    NoSessionIdAvailable(DeviceId),

    #[error("handshake with device {0} failed: {1}")]
    HandshakeFailed(DeviceId, String),

    #[error("peer protocol version {peer} is incompatible with host version {host}")]
    VersionMismatch { host: u32, peer: u32 },

    #[error("peer does not support role {0}")]
    NotSupported(SubProcessRole),

    #[error("peer lacks the capability for {0}")]
    CapabilityMissing(&'static str),

    #[error("parameter list has {count} entries, cap is {max}")]
    TooManyParameters { count: usize, max: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out waiting for response")]
    Timeout,

    #[error("transport receive failed")]
    RecvError,

    #[error("transport session closed by peer")]
    SocketClosed,

    #[error("session is not connected")]
    NotConnected,

    #[error("device reported open failure: {0}")]
    OpenFailed(String),

    #[error("device reported close failure: {0}")]
    CloseFailed(String),

    #[error("package {0} identifier still disagrees after transfer")]
    PackageSyncMismatch(String),

    #[error("device sub-process limit exceeded")]
    ResourceLimitExceeded,

    #[error("sub-process binary damaged on device")]
    BinaryDamaged,

    #[error("package verification failed on device")]
    VerifyFailed,

    #[error("device failed to attach sub-process to control group")]
    CgroupAttachFailed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Status {
    /// Map a structured peer error-code string to a caller-visible status.
    ///
    /// Unknown codes fall back to a generic open failure carrying the
    /// device's message.
    pub fn from_peer_code(code: &str, message: &str) -> Self {
        match code {
            "E30003" => Status::ResourceLimitExceeded,
            "E30004" => Status::BinaryDamaged,
            "E30006" => Status::VerifyFailed,
            "E30007" => Status::CgroupAttachFailed,
            _ => Status::OpenFailed(message.to_string()),
        }
    }
}
