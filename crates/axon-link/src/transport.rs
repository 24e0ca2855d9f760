//! Transport abstraction between the control plane and a device daemon
//!
//! A [`Transport`] is one bidirectional message channel plus a file-push
//! side channel. Implementations decide framing and the physical medium;
//! the control plane only sends envelopes, receives envelopes with a
//! deadline, and pushes package files.

use axon_core::{DeviceId, Message, ServiceRole, Status};
use std::path::Path;
use std::time::Duration;

/// Liveness of a transport as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// One message channel to a device daemon.
///
/// `recv_timeout` distinguishes the three failure classes callers react
/// to differently: [`Status::Timeout`] (deadline passed, channel still
/// usable), [`Status::SocketClosed`] (peer went away, session must be
/// recreated) and [`Status::RecvError`] (transport fault).
pub trait Transport: Send {
    fn send(&mut self, msg: &Message) -> Result<(), Status>;

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Message, Status>;

    /// Push a file to the device, landing under `device_subdir` relative
    /// to the device's install root.
    fn send_file(&mut self, local: &Path, device_subdir: &str) -> Result<(), Status>;

    fn status(&self) -> ConnectionStatus;
}

/// Creates transports on demand, one per (device, service role) pair.
///
/// The registry calls this when a session is first requested and again
/// after a reconnect destroys the old session.
pub trait TransportFactory: Send {
    fn connect(
        &self,
        device: DeviceId,
        role: ServiceRole,
    ) -> Result<Box<dyn Transport>, Status>;
}
