//! Host-side configuration, from environment variables and defaults
//!
//! Nothing here is required: every knob has a default, and the control
//! plane works with a default-constructed [`HostConfig`]. Environment
//! variables override the defaults at construction time and are read
//! exactly once.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How host sub-processes are launched, forwarded in open messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Direct host processes.
    Process,
    /// Processes confined to a container.
    Container,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Process
    }
}

impl RunMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "process" => Some(RunMode::Process),
            "container" | "docker" => Some(RunMode::Container),
            _ => None,
        }
    }
}

/// Per-operation deadlines and connect retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_handshake")]
    pub handshake_secs: u64,
    #[serde(default = "default_open")]
    pub open_secs: u64,
    #[serde(default = "default_open_extended")]
    pub open_extended_secs: u64,
    #[serde(default = "default_close")]
    pub close_secs: u64,
    #[serde(default = "default_package_check")]
    pub package_check_secs: u64,
    #[serde(default = "default_hash_verify")]
    pub hash_verify_secs: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_interval")]
    pub connect_retry_interval_ms: u64,
}

fn default_handshake() -> u64 {
    10
}
fn default_open() -> u64 {
    60
}
fn default_open_extended() -> u64 {
    120
}
fn default_close() -> u64 {
    30
}
fn default_package_check() -> u64 {
    10
}
fn default_hash_verify() -> u64 {
    140
}
fn default_connect_retries() -> u32 {
    10
}
fn default_connect_interval() -> u64 {
    1000
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake_secs: default_handshake(),
            open_secs: default_open(),
            open_extended_secs: default_open_extended(),
            close_secs: default_close(),
            package_check_secs: default_package_check(),
            hash_verify_secs: default_hash_verify(),
            connect_retries: default_connect_retries(),
            connect_retry_interval_ms: default_connect_interval(),
        }
    }
}

impl Timeouts {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn open(&self) -> Duration {
        Duration::from_secs(self.open_secs)
    }

    pub fn open_extended(&self) -> Duration {
        Duration::from_secs(self.open_extended_secs)
    }

    pub fn close(&self) -> Duration {
        Duration::from_secs(self.close_secs)
    }

    pub fn package_check(&self) -> Duration {
        Duration::from_secs(self.package_check_secs)
    }

    pub fn hash_verify(&self) -> Duration {
        Duration::from_secs(self.hash_verify_secs)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }
}

/// Host-side settings for one control plane instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Root of the host software install; package paths resolve against
    /// this unless absolute.
    pub install_path: Option<PathBuf>,
    /// Overridden kernel-package cache directory.
    pub kernel_path: Option<PathBuf>,
    #[serde(default)]
    pub run_mode: RunMode,
    /// Log level forwarded to the device daemon in open messages.
    pub device_log_level: Option<String>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl HostConfig {
    /// Build a config from process environment variables.
    ///
    /// `AXON_INSTALL_PATH` names the install root, with `AXON_HOME` as a
    /// fallback. `AXON_KERNEL_PATH`, `AXON_RUN_MODE` and
    /// `AXON_DEVICE_LOG_LEVEL` override their respective fields.
    /// Unrecognized run-mode values are ignored with a warning.
    pub fn from_env() -> Self {
        let install_path = std::env::var_os("AXON_INSTALL_PATH")
            .or_else(|| std::env::var_os("AXON_HOME"))
            .map(PathBuf::from);
        let kernel_path = std::env::var_os("AXON_KERNEL_PATH").map(PathBuf::from);
        let run_mode = match std::env::var("AXON_RUN_MODE") {
            Ok(raw) => RunMode::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "unrecognized AXON_RUN_MODE, using default");
                RunMode::default()
            }),
            Err(_) => RunMode::default(),
        };
        let device_log_level = std::env::var("AXON_DEVICE_LOG_LEVEL").ok();
        Self {
            install_path,
            kernel_path,
            run_mode,
            device_log_level,
            timeouts: Timeouts::default(),
        }
    }

    /// Directory searched for the kernel package: the explicit kernel
    /// path if set, otherwise `<install>/kernels`.
    pub fn kernel_dir(&self) -> Option<PathBuf> {
        self.kernel_path
            .clone()
            .or_else(|| self.install_path.as_ref().map(|p| p.join("kernels")))
    }
}
