//! Session registry
//!
//! Owns every live session, keyed by (device, service role). Creation is
//! lazy with bounded connect retries; destruction is idempotent and
//! returns the sub-session id to the per-device pool.
//!
//! The registry is not internally synchronized: operations take `&mut
//! self`, so one registry serializes its callers. For per-device
//! concurrency, run one registry per device; registries share nothing.

use crate::session::{Session, SessionIdPool};
use crate::transport::{ConnectionStatus, TransportFactory};
use axon_core::{DeviceId, ServiceRole, Status};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

pub struct SessionRegistry {
    factory: Box<dyn TransportFactory>,
    sessions: HashMap<(DeviceId, ServiceRole), Session>,
    pools: HashMap<DeviceId, SessionIdPool>,
    connect_retries: u32,
    connect_retry_interval: Duration,
}

impl SessionRegistry {
    pub fn new(factory: Box<dyn TransportFactory>) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
            pools: HashMap::new(),
            connect_retries: 10,
            connect_retry_interval: Duration::from_secs(1),
        }
    }

    /// Override the connect retry policy.
    pub fn with_retry_policy(mut self, retries: u32, interval: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_retry_interval = interval;
        self
    }

    /// Get the session for (device, role), creating it on first use.
    ///
    /// Repeated calls for the same pair return the same session. Invalid
    /// device ids are rejected before any connect attempt.
    pub fn session(
        &mut self,
        device: DeviceId,
        role: ServiceRole,
    ) -> Result<&mut Session, Status> {
        if !device.is_valid() {
            return Err(Status::InvalidDevice(device.as_u32()));
        }
        if !self.sessions.contains_key(&(device, role)) {
            let session = self.create_session(device, role)?;
            self.sessions.insert((device, role), session);
        }
        Ok(self.sessions.get_mut(&(device, role)).unwrap())
    }

    /// The session for (device, role) if one already exists.
    pub fn existing(&mut self, device: DeviceId, role: ServiceRole) -> Option<&mut Session> {
        self.sessions.get_mut(&(device, role))
    }

    /// Destroy the session for (device, role). Idempotent: destroying a
    /// session that does not exist is a no-op.
    pub fn close_session(&mut self, device: DeviceId, role: ServiceRole) {
        if let Some(session) = self.sessions.remove(&(device, role)) {
            if let Some(pool) = self.pools.get_mut(&device) {
                pool.release(session.sub_id());
            }
            info!(device = %device, role = ?role, "session destroyed");
        }
    }

    /// Observed liveness of the session for (device, role).
    pub fn connection_status(&self, device: DeviceId, role: ServiceRole) -> ConnectionStatus {
        match self.sessions.get(&(device, role)) {
            Some(session) => session.status(),
            None => ConnectionStatus::Disconnected,
        }
    }

    fn create_session(&mut self, device: DeviceId, role: ServiceRole) -> Result<Session, Status> {
        let pool = self.pools.entry(device).or_default();
        let sub_id = pool.acquire().ok_or(Status::NoSessionIdAvailable(device))?;

        for attempt in 1..=self.connect_retries {
            match self.factory.connect(device, role) {
                Ok(transport) => {
                    info!(device = %device, role = ?role, sub_id, attempt, "session created");
                    return Ok(Session::new(device, role, sub_id, transport));
                }
                Err(err) => {
                    warn!(device = %device, role = ?role, attempt, %err, "connect failed");
                    if attempt < self.connect_retries {
                        std::thread::sleep(self.connect_retry_interval);
                    }
                }
            }
        }
        // Hand the id back so a later attempt can reuse it.
        if let Some(pool) = self.pools.get_mut(&device) {
            pool.release(sub_id);
        }
        Err(Status::SessionCreateFailed(device, self.connect_retries))
    }
}
