//! Top-level device manager
//!
//! A [`DeviceManager`] owns a session registry, per-device lifecycle
//! bookkeeping, and the host configuration. All public operations are
//! synchronous round trips against the device daemon and take `&mut
//! self`, so one manager serializes its callers for the duration of
//! each round trip. Threads that must drive different devices
//! concurrently each own a manager; managers share only the transport
//! factory behind them.

use crate::dispatch::Dispatcher;
use crate::handshake;
use crate::lifecycle::{DeviceLifecycle, RoleState};
use crate::reconnect::{self, Health};
use crate::sync;
use axon_core::message::{EnvVar, PackageConfigEntry, ProcessRef};
use axon_core::package::discover_one;
use axon_core::{
    Body, CapabilityLevel, DeviceId, HostConfig, PackageKind, PackageManifest, ServiceRole,
    Status, SubProcessRole, SubProcessStatus,
};
use axon_link::{ConnectionStatus, Session, SessionRegistry, TransportFactory};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// File name of the package manifest under the install root.
const MANIFEST_FILE: &str = "packages.toml";

/// Kernel package name patterns searched in the kernel directory.
const KERNEL_PATTERN: &str = "kernel-*.tar.gz";
const EXTEND_KERNEL_PATTERN: &str = "kernel-ext-*.tar.gz";

/// Longest path accepted by the remove-file operation.
const REMOVE_PATH_MAX: usize = 4096;

/// Options for the legacy open-everything call.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub rank_size: u32,
    pub start_compute: bool,
    pub start_hccp: bool,
    pub profiling_mode: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            rank_size: 1,
            start_compute: true,
            start_hccp: true,
            profiling_mode: 0,
        }
    }
}

/// Close behavior flags, parsed from a caller-supplied bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseFlags {
    /// Tear down host-side state only; no device round trip.
    pub quick: bool,
}

impl CloseFlags {
    const QUICK: u32 = 1 << 0;

    pub fn from_bits(bits: u32) -> Self {
        Self {
            quick: (bits & Self::QUICK) != 0,
        }
    }
}

pub struct DeviceManager {
    registry: SessionRegistry,
    dispatcher: Arc<Dispatcher>,
    config: HostConfig,
    host_pid: u32,
    manifest: PackageManifest,
    lifecycles: HashMap<DeviceId, DeviceLifecycle>,
    manifest_pushed: HashSet<DeviceId>,
    rank_sizes: HashMap<DeviceId, u32>,
}

/// Fetch the session for (device, role) and make sure out-of-band
/// traffic on it feeds the dispatcher.
fn session_with_sink<'a>(
    registry: &'a mut SessionRegistry,
    dispatcher: &Arc<Dispatcher>,
    device: DeviceId,
    role: ServiceRole,
) -> Result<&'a mut Session, Status> {
    let session = registry.session(device, role)?;
    if !session.has_sink() {
        let dispatcher = Arc::clone(dispatcher);
        session.set_sink(Box::new(move |msg| {
            dispatcher.dispatch(msg);
        }));
    }
    Ok(session)
}

impl DeviceManager {
    /// Build a manager around a transport factory and host config.
    ///
    /// The package manifest is loaded once from the install root;
    /// a missing or unreadable manifest leaves config-driven sync
    /// disabled rather than failing construction.
    pub fn new(factory: Box<dyn TransportFactory>, config: HostConfig) -> Self {
        let manifest = config
            .install_path
            .as_ref()
            .map(|root| root.join(MANIFEST_FILE))
            .filter(|p| p.is_file())
            .and_then(|p| match PackageManifest::load(&p) {
                Ok(m) => Some(m),
                Err(err) => {
                    warn!(path = %p.display(), %err, "ignoring package manifest");
                    None
                }
            })
            .unwrap_or_default();
        let mut registry = SessionRegistry::new(factory);
        registry = registry.with_retry_policy(
            config.timeouts.connect_retries,
            config.timeouts.connect_retry_interval(),
        );
        Self {
            registry,
            dispatcher: Arc::new(Dispatcher::with_defaults()),
            config,
            host_pid: std::process::id(),
            manifest,
            lifecycles: HashMap::new(),
            manifest_pushed: HashSet::new(),
            rank_sizes: HashMap::new(),
        }
    }

    fn control(&mut self, device: DeviceId) -> Result<&mut Session, Status> {
        let timeouts = self.config.timeouts.clone();
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
        handshake::capability(session, &timeouts)?;
        Ok(session)
    }

    /// Negotiated capability level of the device's control session.
    pub fn capability(&mut self, device: DeviceId) -> Result<CapabilityLevel, Status> {
        let timeouts = self.config.timeouts.clone();
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
        handshake::capability(session, &timeouts)
    }

    pub fn connection_status(&self, device: DeviceId, role: ServiceRole) -> ConnectionStatus {
        self.registry.connection_status(device, role)
    }

    /// Whether the device daemon carries the profiling daemon.
    pub fn adprof_supported(&mut self, device: DeviceId) -> Result<bool, Status> {
        let timeouts = self.config.timeouts.clone();
        let session = self.control(device)?;
        let rsp = session.call(Body::GetAdprofSupport, timeouts.package_check())?;
        match rsp.body {
            Body::AdprofSupportRsp { supported } => Ok(supported),
            other => Err(Status::Internal(format!(
                "unexpected adprof response kind {:?}",
                other.kind()
            ))),
        }
    }

    /// Legacy open-everything call: negotiate, push the package
    /// manifest, sync kernel packages, run config-driven sync, then
    /// start the device-side processes in one message.
    pub fn open_device(&mut self, device: DeviceId, opts: &OpenOptions) -> Result<(), Status> {
        let timeouts = self.config.timeouts.clone();
        let started = Instant::now();
        let level = self.capability(device)?;
        let negotiate_ms = started.elapsed().as_millis() as u64;

        let phase = Instant::now();
        self.push_manifest(device, level)?;
        let manifest_ms = phase.elapsed().as_millis() as u64;

        let phase = Instant::now();
        let (kernel_checkcode, extend_checkcode) = self.sync_kernels(device, level)?;
        let kernel_ms = phase.elapsed().as_millis() as u64;

        let phase = Instant::now();
        if level.supports(CapabilityLevel::COMMON_SINK) {
            if let Some(root) = self.config.install_path.clone() {
                let packages = self.manifest.resolve(&root);
                let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
                sync::sync_common(session, &packages, &timeouts)?;
            }
        }
        let packages_ms = phase.elapsed().as_millis() as u64;

        let phase = Instant::now();
        let body = Body::StartAll {
            rank_size: opts.rank_size,
            start_compute: opts.start_compute,
            start_hccp: opts.start_hccp,
            profiling_mode: opts.profiling_mode,
            host_pid: self.host_pid,
            host_capability: CapabilityLevel::host_level().0,
            device_log_level: self.config.device_log_level.clone(),
            kernel_checkcode,
            extend_checkcode,
        };
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
        session.call(body, timeouts.open())?;
        let start_ms = phase.elapsed().as_millis() as u64;

        let lifecycle = self.lifecycles.entry(device).or_default();
        if opts.start_compute {
            lifecycle.mark_open(SubProcessRole::Compute, self.host_pid);
        }
        if opts.start_hccp {
            lifecycle.mark_open(SubProcessRole::Hccp, 0);
        }
        self.rank_sizes.insert(device, opts.rank_size);

        info!(
            device = %device,
            negotiate_ms,
            manifest_ms,
            kernel_ms,
            packages_ms,
            start_ms,
            total_ms = started.elapsed().as_millis() as u64,
            "device opened"
        );
        Ok(())
    }

    /// Legacy whole-device close.
    ///
    /// With the quick flag only host-side state is torn down. Otherwise
    /// a stop message is sent first (over a reconnected session if
    /// needed), then the sessions are destroyed. Idempotent either way.
    pub fn close_device(&mut self, device: DeviceId, flags: CloseFlags) -> Result<(), Status> {
        let timeouts = self.config.timeouts.clone();
        if !flags.quick && self.registry.existing(device, ServiceRole::Control).is_some() {
            reconnect::detect_and_reconnect(
                &mut self.registry,
                device,
                ServiceRole::Control,
                true,
                &timeouts,
            )?;
            let rank_size = self.rank_sizes.get(&device).copied().unwrap_or(0);
            let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
            session.call(
                Body::StopAll {
                    host_pid: self.host_pid,
                    rank_size,
                },
                timeouts.close(),
            )?;
        }
        self.registry.close_session(device, ServiceRole::Control);
        self.registry.close_session(device, ServiceRole::Profiling);
        if let Some(lifecycle) = self.lifecycles.get_mut(&device) {
            lifecycle.reset();
        }
        self.rank_sizes.remove(&device);
        info!(device = %device, quick = flags.quick, "device closed");
        Ok(())
    }

    /// Open one sub-process role on the device.
    pub fn open(
        &mut self,
        device: DeviceId,
        role: SubProcessRole,
        file_path: Option<String>,
        env: Vec<EnvVar>,
        params: Vec<String>,
    ) -> Result<(), Status> {
        let timeouts = self.config.timeouts.clone();
        let host_pid = self.host_pid;
        self.control(device)?;
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
        self.lifecycles.entry(device).or_default().open(
            session,
            role,
            host_pid,
            file_path,
            env,
            params,
            &timeouts,
        )
    }

    /// Close one sub-process role.
    pub fn close(&mut self, device: DeviceId, role: SubProcessRole) -> Result<(), Status> {
        let timeouts = self.config.timeouts.clone();
        if role.is_host_tracked() {
            self.lifecycles.entry(device).or_default().mark_closed(role);
            return Ok(());
        }
        reconnect::detect_and_reconnect(
            &mut self.registry,
            device,
            ServiceRole::Control,
            true,
            &timeouts,
        )?;
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
        self.lifecycles
            .entry(device)
            .or_default()
            .close(session, role, &timeouts)
    }

    /// Close a batch of sub-processes, reconnecting first if needed.
    pub fn close_list(&mut self, device: DeviceId, entries: &[ProcessRef]) -> Result<(), Status> {
        let timeouts = self.config.timeouts.clone();
        if entries.is_empty() {
            return Err(Status::InvalidArgument("empty close list".to_string()));
        }
        if entries.iter().all(|e| e.role.is_host_tracked()) {
            let lifecycle = self.lifecycles.entry(device).or_default();
            for entry in entries {
                lifecycle.mark_closed(entry.role);
            }
            return Ok(());
        }
        reconnect::detect_and_reconnect(
            &mut self.registry,
            device,
            ServiceRole::Control,
            true,
            &timeouts,
        )?;
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
        self.lifecycles
            .entry(device)
            .or_default()
            .close_list(session, entries, &timeouts)
    }

    /// Query sub-process status for the given roles.
    ///
    /// Host-tracked roles are answered locally even when the session is
    /// down; anything else engages the reconnect supervisor first.
    pub fn query_status(
        &mut self,
        device: DeviceId,
        roles: &[SubProcessRole],
    ) -> Result<Vec<SubProcessStatus>, Status> {
        let timeouts = self.config.timeouts.clone();
        let lifecycle = self.lifecycles.entry(device).or_default();
        if roles.iter().all(|r| r.is_host_tracked()) {
            return Ok(lifecycle.local_status(roles));
        }
        reconnect::detect_and_reconnect(
            &mut self.registry,
            device,
            ServiceRole::Control,
            true,
            &timeouts,
        )?;
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
        self.lifecycles
            .entry(device)
            .or_default()
            .query_status(session, roles, &timeouts)
    }

    /// Passive health probe: never reconnects, never creates sessions.
    pub fn probe_health(&mut self, device: DeviceId, role: ServiceRole) -> Result<Health, Status> {
        let timeouts = self.config.timeouts.clone();
        reconnect::detect_and_reconnect(&mut self.registry, device, role, false, &timeouts)
    }

    /// Update the device-side profiling mode.
    ///
    /// A device that was never opened has nothing to update; that case
    /// is a logged no-op, not an error.
    pub fn update_profiling(&mut self, device: DeviceId, mode: u32) -> Result<(), Status> {
        let timeouts = self.config.timeouts.clone();
        if self.registry.existing(device, ServiceRole::Control).is_none() {
            debug!(device = %device, "profiling update before open, skipping");
            return Ok(());
        }
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Profiling)?;
        handshake::capability(session, &timeouts)?;
        session.call(Body::UpdateProfiling { mode }, timeouts.close())?;
        info!(device = %device, mode, "profiling mode updated");
        Ok(())
    }

    /// Start the queue scheduler on the device. Idempotent once started.
    pub fn init_queue_scheduler(
        &mut self,
        device: DeviceId,
        group: &str,
        sched_policy: u64,
    ) -> Result<(), Status> {
        let timeouts = self.config.timeouts.clone();
        if self.lifecycles.get(&device).map(|lc| lc.state(SubProcessRole::QueueScheduler))
            == Some(RoleState::Open)
        {
            debug!(device = %device, "queue scheduler already started, skip");
            return Ok(());
        }
        let host_pid = self.host_pid;
        let install_path = self
            .config
            .install_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let session = self.control(device)?;
        session.call(
            Body::StartQueueScheduler {
                host_pid,
                group: group.to_string(),
                sched_policy,
                install_path,
            },
            timeouts.open(),
        )?;
        self.lifecycles
            .entry(device)
            .or_default()
            .mark_open(SubProcessRole::QueueScheduler, 0);
        info!(device = %device, group, "queue scheduler started");
        Ok(())
    }

    /// Delete a previously transferred artifact on the device.
    pub fn remove_file(&mut self, device: DeviceId, path: &str) -> Result<(), Status> {
        if path.is_empty() || path.len() > REMOVE_PATH_MAX {
            return Err(Status::InvalidArgument(format!(
                "remove path length {} out of bounds",
                path.len()
            )));
        }
        if path.split('/').any(|part| part == "..") {
            return Err(Status::InvalidArgument(
                "remove path must not traverse upward".to_string(),
            ));
        }
        let timeouts = self.config.timeouts.clone();
        let level = self.capability(device)?;
        if !level.supports(CapabilityLevel::COMMON_SINK) {
            return Err(Status::CapabilityMissing("file removal"));
        }
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
        session.call(
            Body::RemoveFile {
                path: path.to_string(),
            },
            timeouts.close(),
        )?;
        info!(device = %device, path, "device file removed");
        Ok(())
    }

    /// Synchronize one legacy package kind explicitly.
    pub fn sync_package(&mut self, device: DeviceId, kind: PackageKind) -> Result<bool, Status> {
        let timeouts = self.config.timeouts.clone();
        let dir = match self.config.kernel_dir() {
            Some(dir) => dir,
            None => return Ok(false),
        };
        let pattern = match kind {
            PackageKind::Kernel => KERNEL_PATTERN,
            PackageKind::ExtendKernel => EXTEND_KERNEL_PATTERN,
        };
        let package = match discover_one(&dir, pattern, "kernels") {
            Some(p) => p,
            None => return Ok(false),
        };
        self.control(device)?;
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
        sync::sync_legacy(session, kind, &package, &timeouts)
    }

    /// Push the package manifest once per device. Legacy peers without
    /// the generalized package scheme never see the config message.
    fn push_manifest(&mut self, device: DeviceId, level: CapabilityLevel) -> Result<(), Status> {
        if !level.supports(CapabilityLevel::COMMON_SINK) {
            return Ok(());
        }
        if self.manifest.packages.is_empty() || self.manifest_pushed.contains(&device) {
            return Ok(());
        }
        let timeouts = self.config.timeouts.clone();
        let entries: Vec<PackageConfigEntry> = self
            .manifest
            .packages
            .iter()
            .map(|e| PackageConfigEntry {
                name: e.pattern.clone(),
                device_subdir: e.device_subdir.clone(),
                optional: e.optional,
            })
            .collect();
        let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
        session.call(Body::UpdatePackageConfig { entries }, timeouts.close())?;
        self.manifest_pushed.insert(device);
        debug!(device = %device, "package manifest pushed");
        Ok(())
    }

    /// Kernel package sync run inside device open. Returns the host
    /// checkcodes announced in the start message (0 when absent).
    fn sync_kernels(
        &mut self,
        device: DeviceId,
        level: CapabilityLevel,
    ) -> Result<(u32, u32), Status> {
        let timeouts = self.config.timeouts.clone();
        let dir = match self.config.kernel_dir() {
            Some(dir) => dir,
            None => return Ok((0, 0)),
        };

        let mut kernel_checkcode = 0;
        if let Some(package) = discover_one(&dir, KERNEL_PATTERN, "kernels") {
            kernel_checkcode = package.checkcode()?;
            let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
            sync::sync_legacy(session, PackageKind::Kernel, &package, &timeouts)?;
        }

        let mut extend_checkcode = 0;
        if level.supports(CapabilityLevel::EXTEND_PACKAGE) {
            if let Some(package) = discover_one(&dir, EXTEND_KERNEL_PATTERN, "kernels") {
                extend_checkcode = package.checkcode()?;
                let session = session_with_sink(&mut self.registry, &self.dispatcher, device, ServiceRole::Control)?;
                sync::sync_legacy(session, PackageKind::ExtendKernel, &package, &timeouts)?;
            }
        }
        Ok((kernel_checkcode, extend_checkcode))
    }
}
