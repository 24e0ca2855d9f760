//! Axon Core - shared types for the Axon control plane
//!
//! This crate provides the foundational types for the Axon system:
//! - Device identity and sub-process role/status types
//! - The transport-agnostic protocol message envelope
//! - Capability levels and protocol version compatibility
//! - Package descriptors, discovery, and content identifiers
//! - The error taxonomy shared by all crates

pub mod capability;
pub mod config;
pub mod device;
pub mod error;
pub mod message;
pub mod package;

pub use capability::{CapabilityLevel, PROTOCOL_VERSION};
pub use config::{HostConfig, RunMode, Timeouts};
pub use device::{DeviceId, ProcessState, ServiceRole, SubProcessRole, SubProcessStatus};
pub use error::Status;
pub use message::{Body, ErrorInfo, Message, MessageKind};
pub use package::{PackageDescriptor, PackageIdent, PackageKind, PackageManifest};
