//! Version handshake and capability negotiation
//!
//! Runs once per session, before any other traffic. The connectivity
//! test carries the host's protocol version; an incompatible peer is
//! fatal for the session. The capability level is fetched with an
//! explicit round trip afterwards and cached on the session; a peer that
//! cannot answer it is treated as capability-less and gets the legacy
//! code paths.

use axon_core::capability::{version_compatible, PROTOCOL_VERSION};
use axon_core::{Body, CapabilityLevel, Status, Timeouts};
use axon_link::Session;
use tracing::{debug, info, warn};

/// Handshake with the peer on a fresh session and cache its capability
/// level.
pub fn negotiate(session: &mut Session, timeouts: &Timeouts) -> Result<CapabilityLevel, Status> {
    let device = session.device();
    let rsp = session
        .call(
            Body::ConnectivityTest {
                protocol_version: PROTOCOL_VERSION,
            },
            timeouts.handshake(),
        )
        .map_err(|err| Status::HandshakeFailed(device, err.to_string()))?;

    let peer_version = match rsp.body {
        Body::ConnectivityTestRsp { protocol_version } => protocol_version,
        other => {
            return Err(Status::HandshakeFailed(
                device,
                format!("unexpected response kind {:?}", other.kind()),
            ))
        }
    };
    if !version_compatible(peer_version) {
        return Err(Status::VersionMismatch {
            host: PROTOCOL_VERSION,
            peer: peer_version,
        });
    }
    debug!(device = %device, peer_version, "handshake complete");

    let level = match session.call(Body::GetCapability, timeouts.handshake()) {
        Ok(rsp) => match rsp.body {
            Body::CapabilityRsp { level } => CapabilityLevel(level),
            other => {
                warn!(device = %device, kind = ?other.kind(), "unexpected capability response");
                CapabilityLevel::unknown()
            }
        },
        // Old daemons do not answer capability queries. Not fatal; all
        // capability-gated paths degrade to legacy behavior.
        Err(err) => {
            warn!(device = %device, %err, "capability query failed, assuming none");
            CapabilityLevel::unknown()
        }
    };
    session.set_capability(level);
    info!(device = %device, capability = %level, "session negotiated");
    Ok(level)
}

/// Capability level cached on the session, negotiating first if needed.
pub fn capability(session: &mut Session, timeouts: &Timeouts) -> Result<CapabilityLevel, Status> {
    match session.capability() {
        Some(level) => Ok(level),
        None => negotiate(session, timeouts),
    }
}
