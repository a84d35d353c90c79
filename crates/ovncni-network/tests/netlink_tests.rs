//! Link pair tests against the real kernel.
//!
//! Need root: `cargo test -p ovncni-network --features integration`.

#![cfg(feature = "integration")]

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use ovncni_common::{HostInterfaceName, MacAddr, WorkloadIdentity};
use ovncni_network::{LinkFabricator, LinkSpec, NetlinkFabricator, NetnsHandle, run_in_netns};

/// A named namespace removed on drop.
struct TestNetns {
    name: String,
}

impl TestNetns {
    fn create(name: &str) -> Self {
        let status = Command::new("ip").args(["netns", "add", name]).status().unwrap();
        assert!(status.success(), "ip netns add {name} failed");
        Self {
            name: name.to_string(),
        }
    }

    fn path(&self) -> PathBuf {
        PathBuf::from("/var/run/netns").join(&self.name)
    }
}

impl Drop for TestNetns {
    fn drop(&mut self) {
        let _ = Command::new("ip").args(["netns", "delete", &self.name]).status();
    }
}

#[test_log::test(tokio::test)]
async fn test_create_and_remove_attachment() {
    let netns = TestNetns::create("ovncni-test-a");
    let host = HostInterfaceName::derive(&WorkloadIdentity::new("team-a", "vm-1"), "eth0");
    let mac: MacAddr = "02:aa:bb:cc:dd:01".parse().unwrap();
    let spec = LinkSpec::new(host.clone(), "eth0")
        .with_mac(mac)
        .with_address("10.0.1.5/24".parse().unwrap())
        .with_mtu(1400)
        .with_mac_wait(Duration::from_secs(2));

    let fabricator = NetlinkFabricator::new();
    let attachment = fabricator.create_attachment(&spec, &netns.path()).await.unwrap();
    assert_eq!(attachment.container_mac, mac);
    assert!(!attachment.host_mac.is_zero());
    assert!(fabricator.host_link_exists(&host).await.unwrap());

    assert!(fabricator.remove_host_link(&host).await.unwrap());
    assert!(!fabricator.remove_host_link(&host).await.unwrap());
    assert!(!fabricator.host_link_exists(&host).await.unwrap());
}

#[test_log::test(tokio::test)]
async fn test_gateway_routes_installed_in_namespace() {
    let netns = TestNetns::create("ovncni-test-d");
    let host = HostInterfaceName::derive(&WorkloadIdentity::new("team-a", "vm-3"), "eth0");
    let spec = LinkSpec::new(host.clone(), "eth0")
        .with_address("10.0.1.5/32".parse().unwrap())
        .with_gateway("10.0.1.1".parse().unwrap());
    let fabricator = NetlinkFabricator::new();

    fabricator.create_attachment(&spec, &netns.path()).await.unwrap();
    let output = Command::new("ip")
        .args(["-n", &netns.name, "-4", "route", "show"])
        .output()
        .unwrap();
    let routes = String::from_utf8(output.stdout).unwrap();
    assert!(routes.contains("default via 10.0.1.1 dev eth0"), "{routes}");
    assert!(routes.contains("10.0.1.1 dev eth0 scope link"), "{routes}");

    fabricator.remove_host_link(&host).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_existing_host_link_fails_with_partial_state() {
    let netns = TestNetns::create("ovncni-test-b");
    let host = HostInterfaceName::derive(&WorkloadIdentity::new("team-a", "vm-2"), "eth0");
    let spec = LinkSpec::new(host.clone(), "eth0");
    let fabricator = NetlinkFabricator::new();

    fabricator.create_attachment(&spec, &netns.path()).await.unwrap();
    let err = fabricator
        .create_attachment(&spec, &netns.path())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ovncni_common::CniError::LinkCreation { step: "create pair", ref partial, .. } if partial.is_empty()
    ));

    fabricator.remove_host_link(&host).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_run_in_netns_sees_target_namespace() {
    let netns = TestNetns::create("ovncni-test-c");
    let handle = NetnsHandle::open(netns.path()).unwrap();
    let outside = std::fs::read_link("/proc/thread-self/ns/net").unwrap();

    let inside = run_in_netns(&handle, || async {
        Ok(std::fs::read_link("/proc/thread-self/ns/net")?)
    })
    .await
    .unwrap();

    assert_ne!(inside, outside);
    assert_eq!(std::fs::read_link("/proc/thread-self/ns/net").unwrap(), outside);
}
