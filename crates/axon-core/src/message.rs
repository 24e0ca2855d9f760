//! Transport-agnostic protocol message envelope
//!
//! Every request and response between the host and the device daemon is
//! one [`Message`]: a small envelope (sequence id, device ids, response
//! code, structured error info) around a typed [`Body`]. How the
//! envelope is framed on the wire is the transport's business; the
//! control plane only ever sees these types.
//!
//! Responses are correlated to the blocking caller by `seq`. The
//! responder echoes the request's `seq` and sets `real_device_id` to the
//! physical device that handled it, which may differ from `device_id`
//! under virtualization.

use crate::device::{SubProcessRole, SubProcessStatus};
use serde::{Deserialize, Serialize};

/// Structured error details attached to a failed response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable failure summary.
    pub message: String,
    /// Device-side error stack, if any.
    pub log: String,
    /// Structured error code string (e.g. "E30004").
    pub code: String,
}

/// One environment variable forwarded to a device sub-process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// (role, pid) pair addressed by close/status operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRef {
    pub role: SubProcessRole,
    pub pid: u32,
}

/// Package name plus its content hash, for the generalized sync scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageHash {
    pub name: String,
    pub hash: String,
}

/// One package manifest entry pushed to the device before config-driven
/// synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfigEntry {
    pub name: String,
    pub device_subdir: String,
    pub optional: bool,
}

/// Typed message payloads. Request/response pairs are adjacent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Body {
    // Handshake and capability negotiation
    ConnectivityTest { protocol_version: u32 },
    ConnectivityTestRsp { protocol_version: u32 },
    GetCapability,
    CapabilityRsp { level: u32 },
    GetAdprofSupport,
    AdprofSupportRsp { supported: bool },

    // Legacy whole-session lifecycle
    StartAll {
        rank_size: u32,
        start_compute: bool,
        start_hccp: bool,
        profiling_mode: u32,
        host_pid: u32,
        host_capability: u32,
        device_log_level: Option<String>,
        kernel_checkcode: u32,
        extend_checkcode: u32,
    },
    StartAllRsp,
    StopAll { host_pid: u32, rank_size: u32 },
    StopAllRsp,
    StartQueueScheduler {
        host_pid: u32,
        group: String,
        sched_policy: u64,
        install_path: Option<String>,
    },
    StartQueueSchedulerRsp,
    UpdateProfiling { mode: u32 },
    UpdateProfilingRsp,

    // Per-role lifecycle
    OpenSubProcess {
        role: SubProcessRole,
        host_pid: u32,
        file_path: Option<String>,
        env: Vec<EnvVar>,
        params: Vec<String>,
    },
    OpenSubProcessRsp { pid: u32 },
    CloseSubProcess { pid: u32 },
    CloseSubProcessRsp,
    CloseSubProcessList { entries: Vec<ProcessRef> },
    CloseSubProcessListRsp,
    QuerySubProcessStatus { queries: Vec<ProcessRef> },
    SubProcessStatusRsp { statuses: Vec<SubProcessStatus> },

    // Package synchronization
    CheckPackage {
        package_kind: u32,
        checkcode: u32,
        before_send: bool,
    },
    CheckPackageRsp { package_kind: u32, checkcode: u32 },
    QueryPackageHash {
        packages: Vec<PackageHash>,
        max_process_secs: u32,
    },
    PackageHashRsp { packages: Vec<PackageHash> },
    UpdatePackageConfig { entries: Vec<PackageConfigEntry> },
    UpdatePackageConfigRsp,
    RemoveFile { path: String },
    RemoveFileRsp,
}

/// Discriminant of [`Body`], used for dispatcher registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ConnectivityTest,
    ConnectivityTestRsp,
    GetCapability,
    CapabilityRsp,
    GetAdprofSupport,
    AdprofSupportRsp,
    StartAll,
    StartAllRsp,
    StopAll,
    StopAllRsp,
    StartQueueScheduler,
    StartQueueSchedulerRsp,
    UpdateProfiling,
    UpdateProfilingRsp,
    OpenSubProcess,
    OpenSubProcessRsp,
    CloseSubProcess,
    CloseSubProcessRsp,
    CloseSubProcessList,
    CloseSubProcessListRsp,
    QuerySubProcessStatus,
    SubProcessStatusRsp,
    CheckPackage,
    CheckPackageRsp,
    QueryPackageHash,
    PackageHashRsp,
    UpdatePackageConfig,
    UpdatePackageConfigRsp,
    RemoveFile,
    RemoveFileRsp,
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::ConnectivityTest { .. } => MessageKind::ConnectivityTest,
            Body::ConnectivityTestRsp { .. } => MessageKind::ConnectivityTestRsp,
            Body::GetCapability => MessageKind::GetCapability,
            Body::CapabilityRsp { .. } => MessageKind::CapabilityRsp,
            Body::GetAdprofSupport => MessageKind::GetAdprofSupport,
            Body::AdprofSupportRsp { .. } => MessageKind::AdprofSupportRsp,
            Body::StartAll { .. } => MessageKind::StartAll,
            Body::StartAllRsp => MessageKind::StartAllRsp,
            Body::StopAll { .. } => MessageKind::StopAll,
            Body::StopAllRsp => MessageKind::StopAllRsp,
            Body::StartQueueScheduler { .. } => MessageKind::StartQueueScheduler,
            Body::StartQueueSchedulerRsp => MessageKind::StartQueueSchedulerRsp,
            Body::UpdateProfiling { .. } => MessageKind::UpdateProfiling,
            Body::UpdateProfilingRsp => MessageKind::UpdateProfilingRsp,
            Body::OpenSubProcess { .. } => MessageKind::OpenSubProcess,
            Body::OpenSubProcessRsp { .. } => MessageKind::OpenSubProcessRsp,
            Body::CloseSubProcess { .. } => MessageKind::CloseSubProcess,
            Body::CloseSubProcessRsp => MessageKind::CloseSubProcessRsp,
            Body::CloseSubProcessList { .. } => MessageKind::CloseSubProcessList,
            Body::CloseSubProcessListRsp => MessageKind::CloseSubProcessListRsp,
            Body::QuerySubProcessStatus { .. } => MessageKind::QuerySubProcessStatus,
            Body::SubProcessStatusRsp { .. } => MessageKind::SubProcessStatusRsp,
            Body::CheckPackage { .. } => MessageKind::CheckPackage,
            Body::CheckPackageRsp { .. } => MessageKind::CheckPackageRsp,
            Body::QueryPackageHash { .. } => MessageKind::QueryPackageHash,
            Body::PackageHashRsp { .. } => MessageKind::PackageHashRsp,
            Body::UpdatePackageConfig { .. } => MessageKind::UpdatePackageConfig,
            Body::UpdatePackageConfigRsp => MessageKind::UpdatePackageConfigRsp,
            Body::RemoveFile { .. } => MessageKind::RemoveFile,
            Body::RemoveFileRsp => MessageKind::RemoveFileRsp,
        }
    }
}

/// The message envelope exchanged with the device daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Per-call correlation id. Responses echo the request's value.
    pub seq: u64,
    /// Logical device id the caller addressed.
    pub device_id: u32,
    /// Physical device id, set by the responder.
    pub real_device_id: u32,
    /// 0 = success. Non-zero responses usually carry [`Message::error`].
    pub response_code: u32,
    pub error: Option<ErrorInfo>,
    pub body: Body,
}

impl Message {
    /// Build a request addressed to `device_id`.
    pub fn request(seq: u64, device_id: u32, body: Body) -> Self {
        Self {
            seq,
            device_id,
            real_device_id: device_id,
            response_code: 0,
            error: None,
            body,
        }
    }

    /// Build a successful response to this message.
    pub fn reply(&self, body: Body) -> Self {
        Self {
            seq: self.seq,
            device_id: self.device_id,
            real_device_id: self.real_device_id,
            response_code: 0,
            error: None,
            body,
        }
    }

    /// Build a failed response to this message with a structured error.
    pub fn reply_error(&self, body: Body, code: &str, message: &str) -> Self {
        Self {
            seq: self.seq,
            device_id: self.device_id,
            real_device_id: self.real_device_id,
            response_code: 1,
            error: Some(ErrorInfo {
                message: message.to_string(),
                log: String::new(),
                code: code.to_string(),
            }),
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn is_success(&self) -> bool {
        self.response_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_echoes_seq() {
        let req = Message::request(42, 3, Body::GetCapability);
        let rsp = req.reply(Body::CapabilityRsp { level: 0x7 });
        assert_eq!(rsp.seq, 42);
        assert_eq!(rsp.device_id, 3);
        assert!(rsp.is_success());
        assert_eq!(rsp.kind(), MessageKind::CapabilityRsp);
    }

    #[test]
    fn test_reply_error_carries_code() {
        let req = Message::request(1, 0, Body::CloseSubProcess { pid: 99 });
        let rsp = req.reply_error(Body::CloseSubProcessRsp, "E30004", "binary damaged");
        assert!(!rsp.is_success());
        let err = rsp.error.unwrap();
        assert_eq!(err.code, "E30004");
        assert_eq!(err.message, "binary damaged");
    }

    #[test]
    fn test_envelope_round_trips_through_json() {
        let msg = Message::request(
            7,
            1,
            Body::QueryPackageHash {
                packages: vec![PackageHash {
                    name: "udf-compat.tar.gz".into(),
                    hash: "abc123".into(),
                }],
                max_process_secs: 140,
            },
        );
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }
}
