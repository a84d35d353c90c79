//! The ADD/DEL/CHECK pipeline.
//!
//! ADD walks `Start -> LeaseAcquired -> LinkCreated -> SwitchRegistered ->
//! LogicalRegistered -> Done` and stops at the first failing stage without
//! undoing earlier ones. DEL sweeps every stage in reverse, keyed only on
//! the deterministic host interface name, and keeps going past failures.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use ovncni_common::{
    AttachmentRequest, CniError, CniResult, HostInterfaceName, IpFamily, Lease, MacAddr, NetConf,
    WorkloadIdentity,
};
use ovncni_network::{LinkAttachment, LinkFabricator, LinkSpec, wait_for_netns};
use ovncni_ovsdb::{LogicalAddresses, LogicalPortRegistrar, OvsdbClient, SwitchPortRegistrar};
use thiserror::Error;

use crate::ipam::AddressBroker;

/// Pause between lease attempts.
const LEASE_BACKOFF: Duration = Duration::from_millis(200);

/// Progress of an ADD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttachState {
    /// Nothing done yet.
    Start,
    /// The allocator handed out an address.
    LeaseAcquired,
    /// The link pair exists and is up.
    LinkCreated,
    /// The host side is a port on the integration bridge.
    SwitchRegistered,
    /// The logical port exists on the logical switch.
    LogicalRegistered,
    /// The result is ready.
    Done,
}

impl AttachState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::LeaseAcquired => "lease acquired",
            Self::LinkCreated => "link created",
            Self::SwitchRegistered => "switch registered",
            Self::LogicalRegistered => "logical registered",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage an ADD failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    /// Lease request.
    Lease,
    /// Namespace wait or link creation.
    Link,
    /// Switch port registration.
    Switch,
    /// Logical port registration.
    Logical,
}

impl fmt::Display for FailedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lease => "lease",
            Self::Link => "link",
            Self::Switch => "switch",
            Self::Logical => "logical",
        })
    }
}

/// A failed ADD: where it stopped, how far it got, and why.
///
/// Everything up to `reached` is left in place for DEL.
#[derive(Debug, Error)]
#[error("ADD failed at {stage} stage after reaching {reached}: {error}")]
pub struct AttachFailure {
    /// Stage that failed.
    pub stage: FailedStage,
    /// Last state completed.
    pub reached: AttachState,
    /// The underlying error.
    #[source]
    pub error: CniError,
}

/// One step of the DEL sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachStep {
    /// Logical port removal.
    LogicalPort,
    /// Switch port removal.
    SwitchPort,
    /// Host link removal.
    HostLink,
}

impl fmt::Display for DetachStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LogicalPort => "logical port",
            Self::SwitchPort => "switch port",
            Self::HostLink => "host link",
        })
    }
}

/// A DEL that could not remove everything.
#[derive(Debug, Error)]
#[error("DEL failed in {} step(s): {}", .errors.len(), summarize(.errors))]
pub struct DetachFailure {
    /// Every failed step, in sweep order.
    pub errors: Vec<(DetachStep, CniError)>,
}

fn summarize(errors: &[(DetachStep, CniError)]) -> String {
    errors
        .iter()
        .map(|(step, error)| format!("{step}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A completed attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Host-side interface, also the switch and logical port name.
    pub host: HostInterfaceName,
    /// Interface name inside the namespace.
    pub interface: String,
    /// Namespace the interface lives in.
    pub netns: PathBuf,
    /// The lease the interface was configured with.
    pub lease: Lease,
    /// MAC of the host side.
    pub host_mac: MacAddr,
    /// MAC of the container side.
    pub container_mac: MacAddr,
}

/// Runs the pipeline against injected collaborators.
///
/// The orchestrator owns nothing: clients are built once by the caller and
/// borrowed for the length of one invocation.
#[derive(Clone, Copy)]
pub struct Orchestrator<'a> {
    conf: &'a NetConf,
    broker: &'a dyn AddressBroker,
    links: &'a dyn LinkFabricator,
    switch_db: &'a dyn OvsdbClient,
    northbound_db: &'a dyn OvsdbClient,
}

impl fmt::Debug for Orchestrator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("bridge", &self.conf.bridge)
            .field("logical_switch", &self.conf.logical_switch)
            .finish_non_exhaustive()
    }
}

impl<'a> Orchestrator<'a> {
    /// Wire up an orchestrator.
    pub fn new(
        conf: &'a NetConf,
        broker: &'a dyn AddressBroker,
        links: &'a dyn LinkFabricator,
        switch_db: &'a dyn OvsdbClient,
        northbound_db: &'a dyn OvsdbClient,
    ) -> Self {
        Self {
            conf,
            broker,
            links,
            switch_db,
            northbound_db,
        }
    }

    /// Attach the workload described by `request`.
    ///
    /// # Errors
    ///
    /// Returns an [`AttachFailure`] naming the failed stage. Nothing created
    /// by earlier stages is removed.
    pub async fn add(&self, request: &AttachmentRequest) -> Result<Attachment, AttachFailure> {
        let host = request.host_interface();
        tracing::debug!(workload = %request.identity, host = %host, netns = %request.netns.display(), "ADD");
        let mut reached = AttachState::Start;
        let fail = |stage, reached, error| AttachFailure {
            stage,
            reached,
            error,
        };

        let family = request.ip_family.unwrap_or(self.conf.ip_family);
        let lease = acquire_lease(
            self.broker,
            &request.identity,
            &request.interface,
            family,
            self.conf.lease_attempts,
        )
        .await
        .map_err(|e| fail(FailedStage::Lease, reached, e))?;
        reached = AttachState::LeaseAcquired;

        let link = self
            .create_link(request, &host, &lease)
            .await
            .map_err(|e| fail(FailedStage::Link, reached, e))?;
        reached = AttachState::LinkCreated;

        SwitchPortRegistrar::new(self.switch_db)
            .register_port(
                &self.conf.bridge,
                host.as_str(),
                &self.conf.interface_type,
                Some(&link.host_mac),
            )
            .await
            .map_err(|e| fail(FailedStage::Switch, reached, e))?;
        reached = AttachState::SwitchRegistered;

        let addresses = LogicalAddresses::MacIp(link.container_mac, lease.address);
        LogicalPortRegistrar::new(self.northbound_db)
            .register_logical_port(&self.conf.logical_switch, host.as_str(), &addresses)
            .await
            .map_err(|e| fail(FailedStage::Logical, reached, e))?;
        reached = AttachState::LogicalRegistered;

        tracing::info!(workload = %request.identity, host = %host, state = %reached, address = %lease.network(), mac = %link.container_mac, "Attached");
        Ok(Attachment {
            host,
            interface: request.interface.clone(),
            netns: request.netns.clone(),
            lease,
            host_mac: link.host_mac,
            container_mac: link.container_mac,
        })
    }

    async fn create_link(
        &self,
        request: &AttachmentRequest,
        host: &HostInterfaceName,
        lease: &Lease,
    ) -> CniResult<LinkAttachment> {
        wait_for_netns(&request.netns, self.conf.timeouts.netns_wait()).await?;
        let mut spec = LinkSpec::new(host.clone(), request.interface.clone())
            .with_mac(lease.mac)
            .with_address(lease.network())
            .with_mtu(self.conf.mtu)
            .with_mac_wait(self.conf.timeouts.mac_wait());
        if let Some(gateway) = self.conf.gateway {
            spec = spec.with_gateway(gateway);
        }
        self.links.create_attachment(&spec, &request.netns).await
    }

    /// Remove everything ADD may have created for `interface` of `identity`.
    ///
    /// Absent pieces count as removed. Every step runs even if an earlier
    /// one failed.
    ///
    /// # Errors
    ///
    /// Returns a [`DetachFailure`] listing each step that failed.
    pub async fn del(&self, identity: &WorkloadIdentity, interface: &str) -> Result<(), DetachFailure> {
        let host = HostInterfaceName::derive(identity, interface);
        tracing::debug!(workload = %identity, host = %host, "DEL");
        let mut errors = Vec::new();

        if let Err(e) = LogicalPortRegistrar::new(self.northbound_db)
            .unregister_logical_port(&self.conf.logical_switch, host.as_str())
            .await
        {
            tracing::warn!(host = %host, error = %e, "Failed to remove logical port");
            errors.push((DetachStep::LogicalPort, e));
        }

        if let Err(e) = SwitchPortRegistrar::new(self.switch_db)
            .unregister_port(&self.conf.bridge, host.as_str())
            .await
        {
            tracing::warn!(host = %host, error = %e, "Failed to remove switch port");
            errors.push((DetachStep::SwitchPort, e));
        }

        match self.links.remove_host_link(&host).await {
            Ok(removed) => tracing::debug!(host = %host, removed, "Host link swept"),
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "Failed to remove host link");
                errors.push((DetachStep::HostLink, e));
            }
        }

        if errors.is_empty() {
            tracing::info!(workload = %identity, host = %host, "Detached");
            Ok(())
        } else {
            Err(DetachFailure { errors })
        }
    }

    /// Verify that every piece of the attachment is still present.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::AttachmentMissing`] for the first missing piece,
    /// or the lookup error.
    pub async fn check(&self, identity: &WorkloadIdentity, interface: &str) -> CniResult<()> {
        let host = HostInterfaceName::derive(identity, interface);
        let missing = |missing| CniError::AttachmentMissing {
            host: host.to_string(),
            missing,
        };

        if !self.links.host_link_exists(&host).await? {
            return Err(missing("host link"));
        }
        if !SwitchPortRegistrar::new(self.switch_db)
            .port_exists(host.as_str())
            .await?
        {
            return Err(missing("switch port"));
        }
        if !LogicalPortRegistrar::new(self.northbound_db)
            .logical_port_exists(&self.conf.logical_switch, host.as_str())
            .await?
        {
            return Err(missing("logical port"));
        }
        tracing::debug!(workload = %identity, host = %host, "Attachment intact");
        Ok(())
    }
}

/// Request a lease, retrying transport failures up to `attempts` times.
///
/// A malformed lease is returned at once: asking again yields the same
/// answer.
async fn acquire_lease(
    broker: &dyn AddressBroker,
    identity: &WorkloadIdentity,
    interface: &str,
    family: IpFamily,
    attempts: u32,
) -> CniResult<Lease> {
    let mut attempt = 1;
    loop {
        match broker.request_lease(identity, interface, family).await {
            Ok(lease) => return Ok(lease),
            Err(e @ CniError::Allocation { .. }) if attempt < attempts => {
                tracing::warn!(attempt, attempts, error = %e, "Lease request failed, retrying");
                attempt += 1;
                tokio::time::sleep(LEASE_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    /// Fails with an allocation error `failures` times, then leases.
    struct FlakyBroker {
        failures: u32,
        calls: AtomicU32,
        malformed: bool,
    }

    impl FlakyBroker {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                malformed: false,
            }
        }
    }

    #[async_trait]
    impl AddressBroker for FlakyBroker {
        async fn request_lease(
            &self,
            _identity: &WorkloadIdentity,
            interface: &str,
            _family: IpFamily,
        ) -> CniResult<Lease> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.malformed {
                return Lease::parse("10.0.1.500", "02:aa:bb:cc:dd:01", interface);
            }
            if call < self.failures {
                return Err(CniError::Allocation {
                    message: "connection refused".to_string(),
                });
            }
            Lease::parse("10.0.1.5", "02:aa:bb:cc:dd:01", interface)
        }
    }

    fn identity() -> WorkloadIdentity {
        WorkloadIdentity::new("team-a", "vm-1")
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried() {
        let broker = FlakyBroker::new(2);
        let lease = acquire_lease(&broker, &identity(), "eth0", IpFamily::V4, 3)
            .await
            .unwrap();
        assert_eq!(lease.address.to_string(), "10.0.1.5");
        assert_eq!(broker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let broker = FlakyBroker::new(5);
        let err = acquire_lease(&broker, &identity(), "eth0", IpFamily::V4, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, CniError::Allocation { .. }));
        assert_eq!(broker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_lease_is_not_retried() {
        let broker = FlakyBroker {
            malformed: true,
            ..FlakyBroker::new(0)
        };
        let err = acquire_lease(&broker, &identity(), "eth0", IpFamily::V4, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, CniError::MalformedLease { .. }));
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn states_are_ordered() {
        assert!(AttachState::Start < AttachState::LeaseAcquired);
        assert!(AttachState::SwitchRegistered < AttachState::LogicalRegistered);
        assert_eq!(AttachState::LinkCreated.to_string(), "link created");
    }

    #[test]
    fn detach_failure_lists_steps() {
        let failure = DetachFailure {
            errors: vec![(
                DetachStep::SwitchPort,
                CniError::Database {
                    message: "closed".to_string(),
                },
            )],
        };
        assert_eq!(
            failure.to_string(),
            "DEL failed in 1 step(s): switch port: Database error: closed"
        );
    }
}
