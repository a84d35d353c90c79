//! # ovncni-network
//!
//! Kernel-side plumbing for the attachment pipeline.
//!
//! This crate provides:
//! - Scoped network namespace switching on dedicated worker threads
//! - Waiting for a namespace path handed over by the runtime
//! - Veth pair creation and removal through rtnetlink

#![warn(missing_docs)]

pub mod netns;
pub mod veth;

pub use netns::{NetnsGuard, NetnsHandle, run_in_netns, wait_for_netns};
pub use veth::{LinkAttachment, LinkFabricator, LinkSpec, NetlinkFabricator};
