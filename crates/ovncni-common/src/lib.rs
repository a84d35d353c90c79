//! # ovncni-common
//!
//! Shared types and errors for the ovncni attachment plugin.
//!
//! This crate provides functionality used by every other ovncni crate:
//! - Workload identity and deterministic host interface naming
//! - Lease and hardware address types
//! - Network configuration read from the container runtime
//! - The common error taxonomy

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod id;
pub mod lease;

pub use config::{IpamConfig, KubernetesConfig, NetConf, Timeouts};
pub use error::{CniError, CniResult, PartialLink};
pub use id::{AttachmentRequest, HostInterfaceName, WorkloadIdentity, validate_ifname};
pub use lease::{IpFamily, Lease, MacAddr};
