//! Per-role sub-process lifecycle
//!
//! Tracks one state machine per sub-process role on a device:
//! `Unopened -> Opening -> Open -> Closing -> Closed`, with `Unknown`
//! entered when an open, close, or status probe fails mid-flight and
//! resolved to `Open | Closed` by the next successful probe. Host-tracked roles (compute, proxy) close
//! and answer status locally, without a device round trip.

use axon_core::message::{EnvVar, ProcessRef};
use axon_core::{
    Body, CapabilityLevel, ProcessState, Status, SubProcessRole, SubProcessStatus, Timeouts,
};
use axon_link::Session;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Upper bound on the parameter list of one open message.
pub const MAX_OPEN_PARAMS: usize = 128;

/// Entries per batched close message; longer lists are chunked.
pub const CLOSE_CHUNK: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Unopened,
    Opening,
    Open,
    Closing,
    Closed,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct RoleEntry {
    state: RoleState,
    pid: u32,
}

/// Lifecycle bookkeeping for every sub-process role on one device.
#[derive(Debug, Default)]
pub struct DeviceLifecycle {
    roles: HashMap<SubProcessRole, RoleEntry>,
}

impl DeviceLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, role: SubProcessRole) -> RoleState {
        self.roles
            .get(&role)
            .map(|e| e.state)
            .unwrap_or(RoleState::Unopened)
    }

    pub fn pid(&self, role: SubProcessRole) -> Option<u32> {
        self.roles.get(&role).map(|e| e.pid)
    }

    /// Record a role as open without a round trip. The legacy
    /// open-everything path uses this for the roles it starts in bulk.
    pub fn mark_open(&mut self, role: SubProcessRole, pid: u32) {
        self.roles.insert(
            role,
            RoleEntry {
                state: RoleState::Open,
                pid,
            },
        );
    }

    /// Record a role as closed without a round trip.
    pub fn mark_closed(&mut self, role: SubProcessRole) {
        self.set_state(role, RoleState::Closed);
    }

    /// Forget all per-role state, e.g. after a quick close.
    pub fn reset(&mut self) {
        self.roles.clear();
    }

    /// Status of the given roles from local bookkeeping only.
    pub fn local_status(&self, roles: &[SubProcessRole]) -> Vec<SubProcessStatus> {
        roles
            .iter()
            .map(|&role| {
                let state = match self.state(role) {
                    RoleState::Open => ProcessState::Normal,
                    RoleState::Unopened | RoleState::Closed => ProcessState::Exited,
                    _ => ProcessState::Unknown,
                };
                SubProcessStatus {
                    role,
                    pid: self.pid(role).unwrap_or(0),
                    state,
                }
            })
            .collect()
    }

    fn set_state(&mut self, role: SubProcessRole, state: RoleState) {
        self.roles
            .entry(role)
            .or_insert(RoleEntry {
                state: RoleState::Unopened,
                pid: 0,
            })
            .state = state;
    }

    /// Open one sub-process role on the device.
    ///
    /// Skips without any traffic when the role is already open. Rejects
    /// roles the peer's capability level does not support and parameter
    /// lists beyond [`MAX_OPEN_PARAMS`] before sending anything.
    pub fn open(
        &mut self,
        session: &mut Session,
        role: SubProcessRole,
        host_pid: u32,
        file_path: Option<String>,
        env: Vec<EnvVar>,
        params: Vec<String>,
        timeouts: &Timeouts,
    ) -> Result<(), Status> {
        if self.state(role) == RoleState::Open {
            debug!(device = %session.device(), %role, "already opened, skip");
            return Ok(());
        }
        if let Some(bit) = CapabilityLevel::required_for(role) {
            let level = session.capability().unwrap_or_else(CapabilityLevel::unknown);
            if !level.supports(bit) {
                return Err(Status::NotSupported(role));
            }
        }
        if params.len() > MAX_OPEN_PARAMS {
            return Err(Status::TooManyParameters {
                count: params.len(),
                max: MAX_OPEN_PARAMS,
            });
        }

        // UDF processes load user code on the device and start slowly.
        let timeout = match role {
            SubProcessRole::Udf | SubProcessRole::BuiltinUdf => timeouts.open_extended(),
            _ => timeouts.open(),
        };

        self.set_state(role, RoleState::Opening);
        let result = session.call(
            Body::OpenSubProcess {
                role,
                host_pid,
                file_path,
                env,
                params,
            },
            timeout,
        );
        match result {
            Ok(rsp) => {
                let pid = match rsp.body {
                    Body::OpenSubProcessRsp { pid } => pid,
                    other => {
                        self.set_state(role, RoleState::Unknown);
                        return Err(Status::Internal(format!(
                            "unexpected open response kind {:?}",
                            other.kind()
                        )));
                    }
                };
                self.roles.insert(
                    role,
                    RoleEntry {
                        state: RoleState::Open,
                        pid,
                    },
                );
                info!(device = %session.device(), %role, pid, "sub-process opened");
                Ok(())
            }
            Err(err) => {
                // The device may have completed the open even though the
                // reply never arrived; only a status probe can tell.
                self.set_state(role, RoleState::Unknown);
                Err(err)
            }
        }
    }

    /// Close one sub-process role.
    ///
    /// Idempotent: a role that is closed or was never opened is a no-op.
    /// Host-tracked roles transition locally without device traffic.
    pub fn close(
        &mut self,
        session: &mut Session,
        role: SubProcessRole,
        timeouts: &Timeouts,
    ) -> Result<(), Status> {
        match self.state(role) {
            RoleState::Unopened | RoleState::Closed => return Ok(()),
            _ => {}
        }
        if role.is_host_tracked() {
            self.set_state(role, RoleState::Closed);
            debug!(device = %session.device(), %role, "host-tracked role closed locally");
            return Ok(());
        }
        let pid = self.pid(role).unwrap_or(0);
        self.set_state(role, RoleState::Closing);
        match session.call(Body::CloseSubProcess { pid }, timeouts.close()) {
            Ok(_) => {
                self.set_state(role, RoleState::Closed);
                info!(device = %session.device(), %role, pid, "sub-process closed");
                Ok(())
            }
            Err(err) => {
                self.set_state(role, RoleState::Unknown);
                Err(err)
            }
        }
    }

    /// Close a batch of sub-processes.
    ///
    /// Host-tracked entries are handled locally. The rest go out as
    /// batched close-list messages in chunks of [`CLOSE_CHUNK`] when the
    /// peer supports them, or as per-entry close messages otherwise. A
    /// failed chunk does not stop later chunks; the first error is
    /// reported after everything has been attempted.
    pub fn close_list(
        &mut self,
        session: &mut Session,
        entries: &[ProcessRef],
        timeouts: &Timeouts,
    ) -> Result<(), Status> {
        if entries.is_empty() {
            return Err(Status::InvalidArgument("empty close list".to_string()));
        }
        let mut remote = Vec::new();
        for entry in entries {
            if entry.role.is_host_tracked() {
                self.set_state(entry.role, RoleState::Closed);
            } else {
                remote.push(*entry);
            }
        }
        if remote.is_empty() {
            return Ok(());
        }

        let batched = session
            .capability()
            .unwrap_or_else(CapabilityLevel::unknown)
            .supports(CapabilityLevel::CLOSE_LIST);

        let mut first_err = None;
        if batched {
            for chunk in remote.chunks(CLOSE_CHUNK) {
                let result = session.call(
                    Body::CloseSubProcessList {
                        entries: chunk.to_vec(),
                    },
                    timeouts.close(),
                );
                match result {
                    Ok(_) => {
                        for entry in chunk {
                            self.set_state(entry.role, RoleState::Closed);
                        }
                    }
                    Err(err) => {
                        warn!(device = %session.device(), %err, "close chunk failed");
                        for entry in chunk {
                            self.set_state(entry.role, RoleState::Unknown);
                        }
                        first_err.get_or_insert(err);
                    }
                }
            }
        } else {
            // Peer predates close lists; degrade to one message each.
            for entry in &remote {
                let result = session.call(Body::CloseSubProcess { pid: entry.pid }, timeouts.close());
                match result {
                    Ok(_) => self.set_state(entry.role, RoleState::Closed),
                    Err(err) => {
                        warn!(device = %session.device(), role = %entry.role, %err, "close failed");
                        self.set_state(entry.role, RoleState::Unknown);
                        first_err.get_or_insert(err);
                    }
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Query the status of the given roles.
    ///
    /// Host-tracked roles are answered from local state. The rest are
    /// batched into one status-query message; its outcome feeds the
    /// state machine (a failed probe moves open roles to `Unknown`, a
    /// successful one resolves `Unknown` either way).
    pub fn query_status(
        &mut self,
        session: &mut Session,
        roles: &[SubProcessRole],
        timeouts: &Timeouts,
    ) -> Result<Vec<SubProcessStatus>, Status> {
        let mut statuses = Vec::with_capacity(roles.len());
        let mut remote = Vec::new();
        for &role in roles {
            if role.is_host_tracked() {
                statuses.extend(self.local_status(&[role]));
            } else {
                remote.push(ProcessRef {
                    role,
                    pid: self.pid(role).unwrap_or(0),
                });
            }
        }
        if remote.is_empty() {
            return Ok(statuses);
        }

        let result = session.call(
            Body::QuerySubProcessStatus {
                queries: remote.clone(),
            },
            timeouts.close(),
        );
        match result {
            Ok(rsp) => {
                let reported = match rsp.body {
                    Body::SubProcessStatusRsp { statuses } => statuses,
                    other => {
                        return Err(Status::Internal(format!(
                            "unexpected status response kind {:?}",
                            other.kind()
                        )))
                    }
                };
                for status in &reported {
                    let state = match status.state {
                        ProcessState::Normal => RoleState::Open,
                        ProcessState::Exited => RoleState::Closed,
                        ProcessState::Unknown => RoleState::Unknown,
                    };
                    self.set_state(status.role, state);
                }
                statuses.extend(reported);
                Ok(statuses)
            }
            Err(err) => {
                for entry in &remote {
                    if self.state(entry.role) == RoleState::Open {
                        self.set_state(entry.role, RoleState::Unknown);
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::{DeviceId, Message, ServiceRole};
    use axon_link::loopback::LoopbackEndpoint;
    use axon_link::Transport;
    use std::time::Duration;

    fn fast() -> Timeouts {
        Timeouts {
            open_secs: 1,
            open_extended_secs: 1,
            close_secs: 1,
            ..Default::default()
        }
    }

    fn session_with_daemon<F>(level: u32, serve: F) -> Session
    where
        F: Fn(Message) -> Option<Message> + Send + 'static,
    {
        let (host, mut dev) = LoopbackEndpoint::pair();
        std::thread::spawn(move || {
            while let Ok(req) = dev.recv_timeout(Duration::from_secs(5)) {
                if let Some(rsp) = serve(req) {
                    if dev.send(&rsp).is_err() {
                        break;
                    }
                }
            }
        });
        let mut session = Session::new(DeviceId(0), ServiceRole::Control, 0, Box::new(host));
        session.set_capability(CapabilityLevel(level));
        session
    }

    #[test]
    fn test_open_transitions_and_skips_reopen() {
        let mut session = session_with_daemon(0, |req| match req.body {
            Body::OpenSubProcess { .. } => Some(req.reply(Body::OpenSubProcessRsp { pid: 77 })),
            _ => None,
        });
        let mut lc = DeviceLifecycle::new();
        assert_eq!(lc.state(SubProcessRole::Compute), RoleState::Unopened);
        lc.open(
            &mut session,
            SubProcessRole::Compute,
            100,
            None,
            vec![],
            vec![],
            &fast(),
        )
        .unwrap();
        assert_eq!(lc.state(SubProcessRole::Compute), RoleState::Open);
        assert_eq!(lc.pid(SubProcessRole::Compute), Some(77));
        // Second open must not send: a daemon reply would desync seq.
        lc.open(
            &mut session,
            SubProcessRole::Compute,
            100,
            None,
            vec![],
            vec![],
            &fast(),
        )
        .unwrap();
    }

    #[test]
    fn test_open_rejects_param_overflow_without_sending() {
        let mut session = session_with_daemon(0, |_| panic!("no message expected"));
        let mut lc = DeviceLifecycle::new();
        let params = vec![String::from("p"); MAX_OPEN_PARAMS + 1];
        let err = lc
            .open(
                &mut session,
                SubProcessRole::Hccp,
                1,
                None,
                vec![],
                params,
                &fast(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Status::TooManyParameters { count, max } if count == MAX_OPEN_PARAMS + 1 && max == MAX_OPEN_PARAMS
        ));
    }

    #[test]
    fn test_open_gated_on_capability() {
        let mut session = session_with_daemon(0, |_| panic!("no message expected"));
        let mut lc = DeviceLifecycle::new();
        let err = lc
            .open(
                &mut session,
                SubProcessRole::BuiltinUdf,
                1,
                None,
                vec![],
                vec![],
                &fast(),
            )
            .unwrap_err();
        assert!(matches!(err, Status::NotSupported(SubProcessRole::BuiltinUdf)));
    }

    #[test]
    fn test_open_timeout_leaves_role_unknown() {
        let mut session = session_with_daemon(0, |req| match req.body {
            Body::OpenSubProcess { .. } => None, // never answer
            _ => None,
        });
        let mut lc = DeviceLifecycle::new();
        let t = Timeouts {
            open_secs: 0,
            ..fast()
        };
        let err = lc
            .open(&mut session, SubProcessRole::Hccp, 1, None, vec![], vec![], &t)
            .unwrap_err();
        assert!(matches!(err, Status::Timeout));
        // The device may have acted on the request; only a probe can say.
        assert_eq!(lc.state(SubProcessRole::Hccp), RoleState::Unknown);
    }

    #[test]
    fn test_host_tracked_close_is_local() {
        let mut session = session_with_daemon(0, |_| panic!("no message expected"));
        let mut lc = DeviceLifecycle::new();
        lc.mark_open(SubProcessRole::Proxy, 5);
        lc.close(&mut session, SubProcessRole::Proxy, &fast()).unwrap();
        assert_eq!(lc.state(SubProcessRole::Proxy), RoleState::Closed);
    }

    #[test]
    fn test_empty_close_list_rejected_without_traffic() {
        let mut session = session_with_daemon(0, |_| panic!("no message expected"));
        let mut lc = DeviceLifecycle::new();
        let err = lc.close_list(&mut session, &[], &fast()).unwrap_err();
        assert!(matches!(err, Status::InvalidArgument(_)));
    }

    #[test]
    fn test_close_list_chunks_at_fifty() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let batches = Arc::new(AtomicUsize::new(0));
        let batches2 = Arc::clone(&batches);
        let mut session = session_with_daemon(CapabilityLevel::CLOSE_LIST, move |req| {
            match &req.body {
                Body::CloseSubProcessList { entries } => {
                    assert!(entries.len() <= CLOSE_CHUNK);
                    batches2.fetch_add(1, Ordering::SeqCst);
                    Some(req.reply(Body::CloseSubProcessListRsp))
                }
                _ => None,
            }
        });
        let mut lc = DeviceLifecycle::new();
        let entries: Vec<ProcessRef> = (0..120)
            .map(|i| ProcessRef {
                role: SubProcessRole::Hccp,
                pid: i,
            })
            .collect();
        lc.close_list(&mut session, &entries, &fast()).unwrap();
        assert_eq!(batches.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_close_list_falls_back_per_entry() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let singles = Arc::new(AtomicUsize::new(0));
        let singles2 = Arc::clone(&singles);
        let mut session = session_with_daemon(0, move |req| match req.body {
            Body::CloseSubProcess { .. } => {
                singles2.fetch_add(1, Ordering::SeqCst);
                Some(req.reply(Body::CloseSubProcessRsp))
            }
            Body::CloseSubProcessList { .. } => panic!("peer lacks close-list"),
            _ => None,
        });
        let mut lc = DeviceLifecycle::new();
        let entries: Vec<ProcessRef> = (0..3)
            .map(|i| ProcessRef {
                role: SubProcessRole::Hccp,
                pid: i,
            })
            .collect();
        lc.close_list(&mut session, &entries, &fast()).unwrap();
        assert_eq!(singles.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_status_probe_failure_marks_unknown() {
        let mut session = session_with_daemon(0, |req| match req.body {
            Body::QuerySubProcessStatus { .. } => None, // never answer
            _ => None,
        });
        let mut lc = DeviceLifecycle::new();
        lc.mark_open(SubProcessRole::Hccp, 9);
        let t = Timeouts {
            close_secs: 0,
            ..fast()
        };
        let err = lc
            .query_status(&mut session, &[SubProcessRole::Hccp], &t)
            .unwrap_err();
        assert!(matches!(err, Status::Timeout));
        assert_eq!(lc.state(SubProcessRole::Hccp), RoleState::Unknown);
    }

    #[test]
    fn test_status_resolves_unknown() {
        let mut session = session_with_daemon(0, |req| match &req.body {
            Body::QuerySubProcessStatus { queries } => {
                let statuses = queries
                    .iter()
                    .map(|q| SubProcessStatus {
                        role: q.role,
                        pid: q.pid,
                        state: ProcessState::Normal,
                    })
                    .collect();
                Some(req.reply(Body::SubProcessStatusRsp { statuses }))
            }
            _ => None,
        });
        let mut lc = DeviceLifecycle::new();
        lc.mark_open(SubProcessRole::Hccp, 9);
        lc.set_state(SubProcessRole::Hccp, RoleState::Unknown);
        let statuses = lc
            .query_status(&mut session, &[SubProcessRole::Hccp], &fast())
            .unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(lc.state(SubProcessRole::Hccp), RoleState::Open);
    }

    #[test]
    fn test_host_tracked_status_answered_locally() {
        let mut session = session_with_daemon(0, |_| panic!("no message expected"));
        let mut lc = DeviceLifecycle::new();
        lc.mark_open(SubProcessRole::Compute, 3);
        let statuses = lc
            .query_status(&mut session, &[SubProcessRole::Compute], &fast())
            .unwrap();
        assert_eq!(statuses[0].state, ProcessState::Normal);
        assert_eq!(statuses[0].pid, 3);
    }
}
