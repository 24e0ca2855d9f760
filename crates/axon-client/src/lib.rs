//! Axon Client - host-side control plane for accelerator devices
//!
//! The client drives device daemons over transport sessions from
//! `axon-link`: version/capability negotiation, sub-process lifecycle
//! (open/close/status with a per-role state machine), package
//! synchronization (legacy checkcode and generalized hash schemes), and
//! a reconnect supervisor. [`DeviceManager`] is the top-level entry
//! point owning the session registry and per-device state.

pub mod dispatch;
pub mod handshake;
pub mod lifecycle;
pub mod manager;
pub mod reconnect;
pub mod sync;

pub use dispatch::Dispatcher;
pub use lifecycle::{DeviceLifecycle, RoleState, MAX_OPEN_PARAMS};
pub use manager::{CloseFlags, DeviceManager, OpenOptions};
pub use reconnect::Health;
