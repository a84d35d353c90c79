//! # ovncni
//!
//! A CNI plugin that attaches container and VM workloads to an OVN logical
//! switch.
//!
//! One ADD runs four stages in order:
//!
//! 1. Ask the address broker for an IP/MAC lease
//! 2. Create a veth pair and move its peer into the workload namespace
//! 3. Register the host side as a port on the local integration bridge
//! 4. Register a logical switch port in the OVN northbound database
//!
//! Every artifact is named after the workload, so DEL needs no stored
//! state to find and remove them.
//!
//! ## Usage
//!
//! ```no_run
//! use ovncni::{Orchestrator, HttpAddressBroker};
//! use ovncni_common::{AttachmentRequest, NetConf, WorkloadIdentity};
//! use ovncni_network::NetlinkFabricator;
//! use ovncni_ovsdb::MemoryDb;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conf = NetConf::default().with_ipam_endpoint("http://127.0.0.1:8080/lease");
//! let broker = HttpAddressBroker::new(&conf.ipam.endpoint, conf.timeouts.database())?;
//! let links = NetlinkFabricator::new();
//! let (switch_db, northbound_db) = (MemoryDb::open_vswitch(), MemoryDb::ovn_northbound());
//!
//! let orchestrator = Orchestrator::new(&conf, &broker, &links, &switch_db, &northbound_db);
//! let request = AttachmentRequest::new(
//!     WorkloadIdentity::new("team-a", "vm-1"),
//!     "/var/run/netns/vm-1",
//!     "eth0",
//! );
//! let attachment = orchestrator.add(&request).await?;
//! println!("{} -> {}", attachment.host, attachment.lease.network());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod ipam;
pub mod metadata;
pub mod orchestrator;
pub mod result;

pub use cli::{CniArgs, CniCommand, Services, Store, broker_for, execute};
pub use ipam::{AddressBroker, HttpAddressBroker, LeaseRequest, LeaseResponse, NoAddressBroker};
pub use metadata::{KubeApiMetadata, MetadataSource, StaticMetadata, resolve_workload};
pub use orchestrator::{
    AttachFailure, AttachState, Attachment, DetachFailure, DetachStep, FailedStage, Orchestrator,
};
pub use result::{AttachmentResult, ErrorEnvelope, VersionResult};
