//! Reconnect supervisor
//!
//! The only component that recovers locally instead of surfacing the
//! failure: when a session looks dead and the caller requires a
//! connection, the session is destroyed and recreated from scratch,
//! including a fresh handshake and capability cache. Passive callers
//! (status-only queries) get the unhealthy verdict reported upward
//! without the side effect of reopening anything.

use crate::handshake;
use axon_core::{DeviceId, ServiceRole, Status, Timeouts};
use axon_link::{ConnectionStatus, SessionRegistry};
use tracing::{debug, info};

/// Outcome of a reconnect check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Session is alive (possibly just recreated).
    Healthy,
    /// Session is down and `require_connect` was false.
    Down,
}

/// Check the session for (device, role) and reconnect if required.
///
/// With `require_connect` the dead session is destroyed, a new one
/// created and negotiated; errors from that path are the caller's.
/// Without it the function never mutates anything.
pub fn detect_and_reconnect(
    registry: &mut SessionRegistry,
    device: DeviceId,
    role: ServiceRole,
    require_connect: bool,
    timeouts: &Timeouts,
) -> Result<Health, Status> {
    if registry.connection_status(device, role) == ConnectionStatus::Connected {
        return Ok(Health::Healthy);
    }
    if !require_connect {
        debug!(device = %device, ?role, "session down, reporting only");
        return Ok(Health::Down);
    }

    info!(device = %device, ?role, "session down, reconnecting");
    registry.close_session(device, role);
    let session = registry.session(device, role)?;
    handshake::negotiate(session, timeouts)?;
    Ok(Health::Healthy)
}
