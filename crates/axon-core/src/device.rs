//! Device identity and sub-process types

use serde::{Deserialize, Serialize};

/// Maximum number of accelerator devices addressable on one host.
pub const MAX_DEVICES_PER_HOST: u32 = 128;

/// Identifier of one accelerator device attached to this host.
///
/// A small integer in `[0, MAX_DEVICES_PER_HOST)`. The registry rejects
/// out-of-range ids with [`crate::Status::InvalidDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Whether this id is within the supported device range.
    pub fn is_valid(self) -> bool {
        self.0 < MAX_DEVICES_PER_HOST
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service channel kind between host and device daemon.
///
/// One transport session exists per (device, service role) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// Process lifecycle and package synchronization traffic.
    Control,
    /// Profiling-mode updates.
    Profiling,
}

/// Named sub-process kind hosted on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProcessRole {
    /// The compute scheduler process. Tracked host-side only.
    Compute,
    /// Collective-communication helper process.
    Hccp,
    /// User-defined-function host process.
    Udf,
    /// Builtin UDF process (capability-gated).
    BuiltinUdf,
    /// Queue scheduler process.
    QueueScheduler,
    /// Device-side profiling daemon (capability-gated).
    Adprof,
    /// Host proxy process. Tracked host-side only.
    Proxy,
}

impl SubProcessRole {
    /// Roles whose lifecycle is tracked purely on the host; closing or
    /// querying them never produces a device round trip.
    pub fn is_host_tracked(self) -> bool {
        matches!(self, SubProcessRole::Compute | SubProcessRole::Proxy)
    }
}

impl std::fmt::Display for SubProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubProcessRole::Compute => "compute",
            SubProcessRole::Hccp => "hccp",
            SubProcessRole::Udf => "udf",
            SubProcessRole::BuiltinUdf => "builtin_udf",
            SubProcessRole::QueueScheduler => "queue_scheduler",
            SubProcessRole::Adprof => "adprof",
            SubProcessRole::Proxy => "proxy",
        };
        f.write_str(name)
    }
}

/// State of a device-side sub-process as reported by a status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Process is running normally.
    Normal,
    /// Process has exited.
    Exited,
    /// State could not be determined.
    Unknown,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::Unknown
    }
}

/// One entry of a sub-process status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubProcessStatus {
    pub role: SubProcessRole,
    pub pid: u32,
    pub state: ProcessState,
}
