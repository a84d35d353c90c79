//! Network configuration passed by the container runtime.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CniError, CniResult};
use crate::lease::IpFamily;

/// Network configuration read from the runtime on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// CNI version the configuration was written for.
    #[serde(default = "default_cni_version")]
    pub cni_version: String,
    /// Network name.
    #[serde(default)]
    pub name: String,
    /// Plugin type.
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Integration bridge on the local switch.
    #[serde(default = "default_bridge")]
    pub bridge: String,
    /// Logical switch in the northbound database.
    #[serde(default = "default_logical_switch")]
    pub logical_switch: String,
    /// Local switch database endpoint.
    #[serde(default = "default_ovs_db")]
    pub ovs_db: String,
    /// Northbound database endpoint.
    #[serde(default = "default_ovn_nb")]
    pub ovn_nb: String,
    /// Interface type recorded on the local switch.
    #[serde(default = "default_interface_type")]
    pub interface_type: String,
    /// MTU reported for the container interface.
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// Address family requested from the allocator.
    #[serde(default)]
    pub ip_family: IpFamily,
    /// Gateway for the workload interface. When set it gets an on-link
    /// host route and becomes the default route inside the namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Address allocator settings.
    #[serde(default)]
    pub ipam: IpamConfig,
    /// Cluster API settings for workload metadata.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    /// Bounded waits.
    #[serde(default)]
    pub timeouts: Timeouts,
    /// How many times a failed lease request is attempted.
    #[serde(default = "default_lease_attempts")]
    pub lease_attempts: u32,
    /// Log file; stdout is reserved for the result.
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

/// Address allocator settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConfig {
    /// URL the lease request is posted to.
    #[serde(default)]
    pub endpoint: String,
}

/// Cluster API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// API server URL; when unset the pod name is used as workload name.
    #[serde(default)]
    pub api_server: Option<String>,
    /// Bearer token file.
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    /// CA bundle for the API server.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Label carrying the logical workload name.
    #[serde(default = "default_workload_label")]
    pub workload_label: String,
}

/// Bounded waits, in the units their names say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// Whole ADD or DEL invocation.
    #[serde(default = "default_invocation_secs")]
    pub invocation_secs: u64,
    /// Waiting for the namespace path to appear.
    #[serde(default = "default_netns_wait_secs")]
    pub netns_wait_secs: u64,
    /// Waiting for a MAC to appear on an interface after link up.
    #[serde(default = "default_mac_wait_millis")]
    pub mac_wait_millis: u64,
    /// A single database request.
    #[serde(default = "default_database_secs")]
    pub database_secs: u64,
}

fn default_cni_version() -> String {
    "1.0.0".to_string()
}

fn default_bridge() -> String {
    "br-int".to_string()
}

fn default_logical_switch() -> String {
    "public".to_string()
}

fn default_ovs_db() -> String {
    "unix:/var/run/openvswitch/db.sock".to_string()
}

fn default_ovn_nb() -> String {
    "tcp:127.0.0.1:6641".to_string()
}

fn default_interface_type() -> String {
    "system".to_string()
}

const fn default_mtu() -> u32 {
    1500
}

const fn default_lease_attempts() -> u32 {
    3
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/ovn-cni.log")
}

fn default_token_file() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}

fn default_workload_label() -> String {
    "vm.kubevirt.io/name".to_string()
}

const fn default_invocation_secs() -> u64 {
    30
}

const fn default_netns_wait_secs() -> u64 {
    10
}

const fn default_mac_wait_millis() -> u64 {
    2000
}

const fn default_database_secs() -> u64 {
    10
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: None,
            token_file: default_token_file(),
            ca_file: None,
            workload_label: default_workload_label(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            invocation_secs: default_invocation_secs(),
            netns_wait_secs: default_netns_wait_secs(),
            mac_wait_millis: default_mac_wait_millis(),
            database_secs: default_database_secs(),
        }
    }
}

impl Timeouts {
    /// Whole-invocation deadline.
    #[must_use]
    pub const fn invocation(&self) -> Duration {
        Duration::from_secs(self.invocation_secs)
    }

    /// Namespace readiness deadline.
    #[must_use]
    pub const fn netns_wait(&self) -> Duration {
        Duration::from_secs(self.netns_wait_secs)
    }

    /// MAC readiness deadline.
    #[must_use]
    pub const fn mac_wait(&self) -> Duration {
        Duration::from_millis(self.mac_wait_millis)
    }

    /// Per-request database deadline.
    #[must_use]
    pub const fn database(&self) -> Duration {
        Duration::from_secs(self.database_secs)
    }
}

impl Default for NetConf {
    fn default() -> Self {
        Self {
            cni_version: default_cni_version(),
            name: String::new(),
            plugin_type: String::new(),
            bridge: default_bridge(),
            logical_switch: default_logical_switch(),
            ovs_db: default_ovs_db(),
            ovn_nb: default_ovn_nb(),
            interface_type: default_interface_type(),
            mtu: default_mtu(),
            ip_family: IpFamily::default(),
            gateway: None,
            ipam: IpamConfig::default(),
            kubernetes: KubernetesConfig::default(),
            timeouts: Timeouts::default(),
            lease_attempts: default_lease_attempts(),
            log_file: default_log_file(),
        }
    }
}

impl NetConf {
    /// Parse the configuration bytes the runtime wrote to stdin.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_slice(bytes: &[u8]) -> CniResult<Self> {
        let conf: Self = serde_json::from_slice(bytes)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Check values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Config`] naming the first bad field.
    pub fn validate(&self) -> CniResult<()> {
        let bad = |message: &str| {
            Err(CniError::Config {
                message: message.to_string(),
            })
        };

        if self.bridge.is_empty() {
            return bad("bridge must not be empty");
        }
        if self.logical_switch.is_empty() {
            return bad("logicalSwitch must not be empty");
        }
        if self.mtu == 0 {
            return bad("mtu must be greater than zero");
        }
        if self.lease_attempts == 0 {
            return bad("leaseAttempts must be at least 1");
        }
        Ok(())
    }

    /// Set the integration bridge.
    #[must_use]
    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = bridge.into();
        self
    }

    /// Set the logical switch.
    #[must_use]
    pub fn with_logical_switch(mut self, switch: impl Into<String>) -> Self {
        self.logical_switch = switch.into();
        self
    }

    /// Set the allocator endpoint.
    #[must_use]
    pub fn with_ipam_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ipam.endpoint = endpoint.into();
        self
    }

    /// Set the workload gateway.
    #[must_use]
    pub const fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the number of lease attempts.
    #[must_use]
    pub const fn with_lease_attempts(mut self, attempts: u32) -> Self {
        self.lease_attempts = attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_minimal_json() {
        let conf = NetConf::from_slice(br#"{"cniVersion":"1.0.0","name":"vm-net","type":"ovn-cni"}"#)
            .unwrap();
        assert_eq!(conf.bridge, "br-int");
        assert_eq!(conf.logical_switch, "public");
        assert_eq!(conf.interface_type, "system");
        assert_eq!(conf.mtu, 1500);
        assert_eq!(conf.ip_family, IpFamily::V4);
        assert_eq!(conf.timeouts.netns_wait(), Duration::from_secs(10));
        assert_eq!(conf.kubernetes.workload_label, "vm.kubevirt.io/name");
        assert_eq!(conf.gateway, None);
    }

    #[test]
    fn full_json() {
        let conf = NetConf::from_slice(
            br#"{
                "cniVersion": "1.0.0",
                "name": "vm-net",
                "type": "ovn-cni",
                "bridge": "br-vm",
                "logicalSwitch": "ls-vm-net",
                "ovnNb": "tcp:192.0.2.10:6641",
                "ipFamily": "IPv6",
                "gateway": "fd00:10::1",
                "ipam": {"endpoint": "http://ipam.local/assign"},
                "timeouts": {"macWaitMillis": 500}
            }"#,
        )
        .unwrap();
        assert_eq!(conf.bridge, "br-vm");
        assert_eq!(conf.logical_switch, "ls-vm-net");
        assert_eq!(conf.ovn_nb, "tcp:192.0.2.10:6641");
        assert_eq!(conf.ip_family, IpFamily::V6);
        assert_eq!(conf.gateway, Some("fd00:10::1".parse().unwrap()));
        assert_eq!(conf.ipam.endpoint, "http://ipam.local/assign");
        assert_eq!(conf.timeouts.mac_wait(), Duration::from_millis(500));
        assert_eq!(conf.timeouts.invocation_secs, 30);
    }

    #[test]
    fn validation_rejects_empty_bridge() {
        let err = NetConf::default().with_bridge("").validate().unwrap_err();
        assert!(matches!(err, CniError::Config { .. }));
    }

    #[test]
    fn builder_pattern() {
        let conf = NetConf::default()
            .with_bridge("br-test")
            .with_logical_switch("ls-test")
            .with_ipam_endpoint("http://127.0.0.1:8000")
            .with_lease_attempts(1);
        assert_eq!(conf.bridge, "br-test");
        assert_eq!(conf.logical_switch, "ls-test");
        assert_eq!(conf.lease_attempts, 1);
        assert!(conf.validate().is_ok());
    }
}
