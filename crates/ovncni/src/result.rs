//! Documents written to stdout for the container runtime.

use ipnet::IpNet;
use miette::Diagnostic;
use ovncni_common::CniError;
use serde::{Deserialize, Serialize};

use crate::orchestrator::{AttachFailure, Attachment, DetachFailure};

/// CNI versions this plugin can answer in.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Successful ADD result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentResult {
    /// Version of the result format.
    pub cni_version: String,
    /// Interfaces created.
    pub interfaces: Vec<InterfaceResult>,
    /// Addresses assigned.
    pub ips: Vec<IpResult>,
}

/// One created interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceResult {
    /// Name inside the sandbox.
    pub name: String,
    /// Hardware address.
    pub mac: String,
    /// MTU.
    pub mtu: u32,
    /// Namespace path.
    pub sandbox: String,
}

/// One assigned address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpResult {
    /// Index into `interfaces`.
    pub interface: usize,
    /// Address with prefix.
    pub address: IpNet,
}

impl AttachmentResult {
    /// Describe a finished attachment.
    #[must_use]
    pub fn new(cni_version: impl Into<String>, attachment: &Attachment, mtu: u32) -> Self {
        Self {
            cni_version: cni_version.into(),
            interfaces: vec![InterfaceResult {
                name: attachment.interface.clone(),
                mac: attachment.container_mac.to_string(),
                mtu,
                sandbox: attachment.netns.display().to_string(),
            }],
            ips: vec![IpResult {
                interface: 0,
                address: attachment.lease.network(),
            }],
        }
    }
}

/// Error result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// Version of the result format.
    pub cni_version: String,
    /// Numeric error code.
    pub code: u32,
    /// Short message.
    pub msg: String,
    /// Longer explanation, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorEnvelope {
    /// Wrap a pipeline error.
    #[must_use]
    pub fn from_error(cni_version: impl Into<String>, error: &CniError) -> Self {
        Self {
            cni_version: cni_version.into(),
            code: error.cni_code(),
            msg: error.to_string(),
            details: error.help().map(|h| h.to_string()).unwrap_or_default(),
        }
    }

    /// Wrap a failed ADD, keeping the stage it stopped at.
    #[must_use]
    pub fn from_attach(cni_version: impl Into<String>, failure: &AttachFailure) -> Self {
        Self {
            cni_version: cni_version.into(),
            code: failure.error.cni_code(),
            msg: failure.to_string(),
            details: format!(
                "stage={} reached={} retryable={}",
                failure.stage,
                failure.reached,
                failure.error.is_retryable()
            ),
        }
    }

    /// Wrap a failed DEL. The code is the one of the first failed step.
    #[must_use]
    pub fn from_detach(cni_version: impl Into<String>, failure: &DetachFailure) -> Self {
        Self {
            cni_version: cni_version.into(),
            code: failure.errors.first().map_or(11, |(_, e)| e.cni_code()),
            msg: failure.to_string(),
            details: String::new(),
        }
    }
}

/// VERSION result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    /// Version of the result format.
    pub cni_version: String,
    /// Every version accepted.
    pub supported_versions: Vec<String>,
}

impl Default for VersionResult {
    fn default() -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(ToString::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{AttachState, FailedStage};
    use ovncni_common::{HostInterfaceName, Lease, WorkloadIdentity};
    use serde_json::json;

    fn attachment() -> Attachment {
        let lease = Lease::parse("10.0.1.5", "02:aa:bb:cc:dd:01", "eth0").unwrap();
        Attachment {
            host: HostInterfaceName::derive(&WorkloadIdentity::new("team-a", "vm-1"), "eth0"),
            interface: "eth0".to_string(),
            netns: "/var/run/netns/vm-1".into(),
            host_mac: "02:00:00:00:00:aa".parse().unwrap(),
            container_mac: lease.mac,
            lease,
        }
    }

    #[test]
    fn result_document() {
        let result = AttachmentResult::new("1.0.0", &attachment(), 1500);
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "cniVersion": "1.0.0",
                "interfaces": [{
                    "name": "eth0",
                    "mac": "02:aa:bb:cc:dd:01",
                    "mtu": 1500,
                    "sandbox": "/var/run/netns/vm-1"
                }],
                "ips": [{"interface": 0, "address": "10.0.1.5/32"}]
            })
        );
    }

    #[test]
    fn attach_failure_envelope() {
        let failure = AttachFailure {
            stage: FailedStage::Logical,
            reached: AttachState::SwitchRegistered,
            error: CniError::LogicalSwitchNotFound {
                switch: "public".to_string(),
            },
        };
        let envelope = ErrorEnvelope::from_attach("1.0.0", &failure);
        assert_eq!(envelope.code, 105);
        assert!(envelope.msg.contains("logical stage"));
        assert_eq!(envelope.details, "stage=logical reached=switch registered retryable=false");
    }

    #[test]
    fn error_envelope_omits_empty_details() {
        let envelope = ErrorEnvelope::from_error(
            "1.0.0",
            &CniError::Config {
                message: "bad".to_string(),
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["code"], 7);
        assert!(value.get("details").is_none());
    }

    #[test]
    fn version_document() {
        let value = serde_json::to_value(VersionResult::default()).unwrap();
        assert_eq!(value["cniVersion"], "1.0.0");
        assert_eq!(value["supportedVersions"][3], "1.0.0");
    }
}
