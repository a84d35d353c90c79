//! # ovncni-ovsdb
//!
//! OVSDB access for the attachment pipeline.
//!
//! The crate exposes a small capability interface ([`OvsdbClient`]) with two
//! implementations, a JSON-RPC client for real servers and an in-memory
//! database, and the two registrars that build atomic transactions on top
//! of it:
//! - [`SwitchPortRegistrar`] for Port/Interface rows on the local switch
//! - [`LogicalPortRegistrar`] for logical switch ports in the northbound database

#![warn(missing_docs)]

pub mod client;
pub mod jsonrpc;
pub mod logical;
pub mod memory;
pub mod operation;
pub mod schema;
pub mod switch;

pub use client::{OvsdbClient, UnreachableDb, check_results};
pub use jsonrpc::{Endpoint, JsonRpcClient};
pub use logical::{LogicalAddresses, LogicalPortRegistrar};
pub use memory::MemoryDb;
pub use operation::{Condition, Mutation, Operation, OperationResult, Row};
pub use switch::{MANAGED_TAP_TYPE, PortKind, SwitchPortRegistrar};
