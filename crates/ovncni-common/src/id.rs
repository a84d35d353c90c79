//! Workload identity and deterministic interface naming.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CniError, CniResult};
use crate::lease::IpFamily;

/// Maximum length of a Linux interface name (IFNAMSIZ - 1).
pub const IFNAME_MAX: usize = 15;

/// Number of hex characters of the identity hash kept in derived names.
const HASH_CHARS: usize = 13;

/// Prefix of the host side of a link pair.
const HOST_PREFIX: &str = "v-";

/// Prefix of the peer while it still lives in the host namespace.
const PEER_PREFIX: &str = "t-";

/// Validate an interface name before handing it to the kernel.
///
/// # Errors
///
/// Returns [`CniError::InvalidInterfaceName`] if the kernel would reject it.
pub fn validate_ifname(name: &str) -> CniResult<()> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.len() > IFNAME_MAX {
        "longer than 15 bytes"
    } else if name == "." || name == ".." {
        "reserved"
    } else if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        "contains '/', ':' or whitespace"
    } else {
        return Ok(());
    };

    Err(CniError::InvalidInterfaceName {
        name: name.to_string(),
        reason,
    })
}

/// The workload an attachment belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    /// Cluster namespace of the workload.
    pub namespace: String,
    /// Logical workload name (the VM name for KubeVirt pods).
    pub name: String,
}

impl WorkloadIdentity {
    /// Create a new identity.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Host-side interface name derived from the workload identity.
///
/// The same `(namespace, name, interface)` triple always yields the same
/// name, so DEL can find what ADD created without any stored state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostInterfaceName(String);

impl HostInterfaceName {
    /// Derive the host interface name for an interface of a workload.
    #[must_use]
    pub fn derive(identity: &WorkloadIdentity, interface: &str) -> Self {
        Self(format!("{HOST_PREFIX}{}", Self::token(identity, interface)))
    }

    /// Temporary name of the peer before it is moved and renamed.
    #[must_use]
    pub fn peer_temp_name(&self) -> String {
        format!("{PEER_PREFIX}{}", &self.0[HOST_PREFIX.len()..])
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn token(identity: &WorkloadIdentity, interface: &str) -> String {
        let input = format!("{}/{}/{}", identity.namespace, identity.name, interface);
        let hash = Sha256::digest(input.as_bytes());
        let mut hex = hex::encode(hash);
        hex.truncate(HASH_CHARS);
        hex
    }
}

impl fmt::Display for HostInterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for HostInterfaceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One ADD, DEL or CHECK invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRequest {
    /// Workload the interface belongs to.
    pub identity: WorkloadIdentity,
    /// Path of the target network namespace.
    pub netns: PathBuf,
    /// Interface name inside the namespace.
    pub interface: String,
    /// Requested address family, `None` for the allocator default.
    pub ip_family: Option<IpFamily>,
}

impl AttachmentRequest {
    /// Create a new request.
    pub fn new(
        identity: WorkloadIdentity,
        netns: impl Into<PathBuf>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            netns: netns.into(),
            interface: interface.into(),
            ip_family: None,
        }
    }

    /// Request a specific address family.
    #[must_use]
    pub const fn with_ip_family(mut self, family: IpFamily) -> Self {
        self.ip_family = Some(family);
        self
    }

    /// Host interface name for this request.
    #[must_use]
    pub fn host_interface(&self) -> HostInterfaceName {
        HostInterfaceName::derive(&self.identity, &self.interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn derived_name_matches_hash_prefix() {
        let identity = WorkloadIdentity::new("team-a", "vm-1");
        let name = HostInterfaceName::derive(&identity, "eth0");

        let expected = hex::encode(Sha256::digest(b"team-a/vm-1/eth0"));
        assert_eq!(name.as_str(), format!("v-{}", &expected[..13]));
        assert_eq!(name.as_str().len(), IFNAME_MAX);
        assert_eq!(name.peer_temp_name(), format!("t-{}", &expected[..13]));
    }

    #[test]
    fn different_interfaces_get_different_names() {
        let identity = WorkloadIdentity::new("team-a", "vm-1");
        assert_ne!(
            HostInterfaceName::derive(&identity, "eth0"),
            HostInterfaceName::derive(&identity, "eth1")
        );
    }

    #[test]
    fn ifname_validation() {
        assert!(validate_ifname("eth0").is_ok());
        assert!(validate_ifname("v-0123456789abc").is_ok());
        assert!(validate_ifname("").is_err());
        assert!(validate_ifname("a-name-that-is-too-long").is_err());
        assert!(validate_ifname("eth/0").is_err());
        assert!(validate_ifname("eth 0").is_err());
        assert!(validate_ifname("..").is_err());
    }

    proptest! {
        #[test]
        fn derivation_is_deterministic_and_bounded(
            namespace in "[a-z0-9-]{1,63}",
            name in "[a-z0-9.-]{1,253}",
            interface in "[a-z0-9]{1,15}",
        ) {
            let identity = WorkloadIdentity::new(namespace, name);
            let first = HostInterfaceName::derive(&identity, &interface);
            let second = HostInterfaceName::derive(&identity.clone(), &interface);
            prop_assert_eq!(&first, &second);
            prop_assert!(first.as_str().len() <= IFNAME_MAX);
            prop_assert!(validate_ifname(first.as_str()).is_ok());
            prop_assert!(validate_ifname(&first.peer_temp_name()).is_ok());
        }
    }
}
