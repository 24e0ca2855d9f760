//! Axon Link - transport sessions for the Axon control plane
//!
//! This crate owns everything between the typed message envelope and the
//! wire: the [`Transport`] abstraction, the in-process loopback transport
//! used by tests, per-session sequence correlation, the sub-session id
//! pool, and the [`SessionRegistry`] that creates and destroys sessions
//! per (device, service role) pair.

pub mod loopback;
pub mod registry;
pub mod session;
pub mod transport;

pub use loopback::{LoopbackEndpoint, LoopbackFactory};
pub use registry::SessionRegistry;
pub use session::{Session, SessionIdPool, SUB_SESSION_POOL_SIZE};
pub use transport::{ConnectionStatus, Transport, TransportFactory};
