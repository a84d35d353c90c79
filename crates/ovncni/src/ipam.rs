//! Address broker client.
//!
//! Asks the external allocator for the IP and MAC of one workload
//! interface. Retries are the orchestrator's business, not this module's.

use std::time::Duration;

use async_trait::async_trait;
use ovncni_common::{CniError, CniResult, IpFamily, Lease, WorkloadIdentity};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Body of a lease request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRequest {
    /// Workload namespace.
    pub namespace: String,
    /// Workload name.
    pub name: String,
    /// Interface inside the workload.
    pub container_interface: String,
    /// Requested family.
    pub ip_family: IpFamily,
}

/// Body of a lease response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaseResponse {
    /// Assigned address, bare or CIDR.
    pub address: String,
    /// Assigned MAC.
    pub mac_address: String,
    /// Interface the lease belongs to.
    pub container_interface: String,
    /// Family of `address`.
    pub ip_family: String,
    /// Pool the address came from.
    pub public_ip_pool_name: String,
    /// Kind of the owning resource.
    pub resource_kind: String,
    /// Namespace of the owning resource.
    pub resource_namespace: String,
    /// Name of the owning resource.
    pub resource_name: String,
}

impl LeaseResponse {
    /// Validate the raw fields into a [`Lease`].
    ///
    /// # Errors
    ///
    /// Returns [`CniError::MalformedLease`] if the address or MAC does not
    /// parse.
    pub fn into_lease(self, requested_interface: &str) -> CniResult<Lease> {
        let interface = if self.container_interface.is_empty() {
            requested_interface.to_string()
        } else {
            self.container_interface
        };
        Lease::parse(&self.address, &self.mac_address, interface)
    }
}

/// Source of IP/MAC leases.
#[async_trait]
pub trait AddressBroker: Send + Sync {
    /// Request a lease for `interface` of `identity`.
    async fn request_lease(
        &self,
        identity: &WorkloadIdentity,
        interface: &str,
        family: IpFamily,
    ) -> CniResult<Lease>;
}

/// Broker reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAddressBroker {
    client: Client,
    endpoint: String,
}

impl HttpAddressBroker {
    /// Create a client posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Config`] if the endpoint is empty or the HTTP
    /// client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> CniResult<Self> {
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            return Err(CniError::Config {
                message: "ipam.endpoint is required".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CniError::Config {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl AddressBroker for HttpAddressBroker {
    async fn request_lease(
        &self,
        identity: &WorkloadIdentity,
        interface: &str,
        family: IpFamily,
    ) -> CniResult<Lease> {
        let body = LeaseRequest {
            namespace: identity.namespace.clone(),
            name: identity.name.clone(),
            container_interface: interface.to_string(),
            ip_family: family,
        };
        tracing::debug!(endpoint = %self.endpoint, workload = %identity, interface, "Requesting lease");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| CniError::Allocation {
                message: format!("request to {} failed: {e}", self.endpoint),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CniError::Allocation {
                message: format!("allocator returned {status}: {}", text.trim()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| CniError::Allocation {
            message: format!("failed to read allocator response: {e}"),
        })?;
        let parsed: LeaseResponse =
            serde_json::from_slice(&bytes).map_err(|e| CniError::Allocation {
                message: format!("undecodable allocator response: {e}"),
            })?;

        let lease = parsed.into_lease(interface)?;
        tracing::info!(workload = %identity, address = %lease.network(), mac = %lease.mac, "Lease acquired");
        Ok(lease)
    }
}

/// Broker for commands that never allocate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAddressBroker;

#[async_trait]
impl AddressBroker for NoAddressBroker {
    async fn request_lease(
        &self,
        identity: &WorkloadIdentity,
        _interface: &str,
        _family: IpFamily,
    ) -> CniResult<Lease> {
        Err(CniError::Config {
            message: format!("no address broker configured for {identity}"),
        })
    }
}
