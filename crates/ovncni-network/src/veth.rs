//! Virtual ethernet pair management.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use ovncni_common::{CniError, CniResult, HostInterfaceName, MacAddr, PartialLink, validate_ifname};
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::packet_route::route::{RouteMessage, RouteScope};
use rtnetlink::{Handle, LinkUnspec, LinkVeth, RouteMessageBuilder, new_connection};
use tokio::time::Instant;

use crate::netns::{NetnsHandle, run_in_netns};

/// Interval between host MAC polls.
const MAC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to build for one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    /// Host-side name.
    pub host: HostInterfaceName,
    /// Name inside the target namespace.
    pub container: String,
    /// MAC for the container side; `None` keeps the kernel's.
    pub mac: Option<MacAddr>,
    /// Address for the container side; `None` assigns nothing.
    pub address: Option<IpNet>,
    /// MTU for both sides; `None` keeps the kernel default.
    pub mtu: Option<u32>,
    /// Default gateway inside the namespace; `None` installs no routes.
    pub gateway: Option<IpAddr>,
    /// How long to wait for the host side to report a MAC.
    pub mac_wait: Duration,
}

impl LinkSpec {
    /// A spec with no MAC, address or MTU override.
    pub fn new(host: HostInterfaceName, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            mac: None,
            address: None,
            mtu: None,
            gateway: None,
            mac_wait: Duration::from_secs(2),
        }
    }

    /// Set the container-side MAC.
    #[must_use]
    pub const fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }

    /// Set the container-side address.
    #[must_use]
    pub const fn with_address(mut self, address: IpNet) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the MTU.
    #[must_use]
    pub const fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Route through `gateway` inside the namespace.
    #[must_use]
    pub const fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the host MAC wait.
    #[must_use]
    pub const fn with_mac_wait(mut self, wait: Duration) -> Self {
        self.mac_wait = wait;
        self
    }

    /// Reject names the kernel would refuse before touching it.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::InvalidInterfaceName`] for the first bad name
    /// and [`CniError::Config`] for a gateway of the wrong family.
    pub fn validate(&self) -> CniResult<()> {
        validate_ifname(self.host.as_str())?;
        validate_ifname(&self.host.peer_temp_name())?;
        validate_ifname(&self.container)?;
        if let (Some(address), Some(gateway)) = (self.address, self.gateway) {
            if address.addr().is_ipv4() != gateway.is_ipv4() {
                return Err(CniError::Config {
                    message: format!("gateway {gateway} does not match address {address}"),
                });
            }
        }
        Ok(())
    }
}

/// MACs of a completed link pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAttachment {
    /// Host side.
    pub host_mac: MacAddr,
    /// Container side.
    pub container_mac: MacAddr,
}

/// Creates and removes link pairs between the host and a target namespace.
#[async_trait]
pub trait LinkFabricator: Send + Sync {
    /// Create the pair, move the peer into `netns`, configure both sides.
    ///
    /// Nothing is rolled back on failure; the returned
    /// [`CniError::LinkCreation`] records what exists.
    async fn create_attachment(&self, spec: &LinkSpec, netns: &Path) -> CniResult<LinkAttachment>;

    /// Delete the host side (and with it the peer). Returns `false` if it
    /// did not exist.
    async fn remove_host_link(&self, host: &HostInterfaceName) -> CniResult<bool>;

    /// Whether the host side exists.
    async fn host_link_exists(&self, host: &HostInterfaceName) -> CniResult<bool>;
}

/// [`LinkFabricator`] backed by rtnetlink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetlinkFabricator;

impl NetlinkFabricator {
    /// Create a fabricator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn netlink_error(e: impl std::fmt::Display) -> CniError {
    CniError::Io(std::io::Error::other(e.to_string()))
}

fn connect() -> std::io::Result<Handle> {
    let (connection, handle, _) = new_connection()?;
    tokio::spawn(connection);
    Ok(handle)
}

async fn link_by_name(handle: &Handle, name: &str) -> Result<Option<LinkMessage>, rtnetlink::Error> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
        Err(e) => Err(e),
    }
}

async fn link_index(handle: &Handle, name: &str) -> CniResult<u32> {
    link_by_name(handle, name)
        .await
        .map_err(netlink_error)?
        .map(|link| link.header.index)
        .ok_or_else(|| netlink_error(format!("link {name} not found")))
}

fn link_mac(link: &LinkMessage) -> Option<MacAddr> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) => MacAddr::from_slice(bytes),
        _ => None,
    })
}

/// An on-link host route to `gateway` and a default route through it.
///
/// The host route lets a `/32` or `/128` address reach its gateway at all.
fn gateway_routes(index: u32, gateway: IpAddr) -> Vec<RouteMessage> {
    match gateway {
        IpAddr::V4(gw) => vec![
            RouteMessageBuilder::<Ipv4Addr>::default()
                .destination_prefix(gw, 32)
                .output_interface(index)
                .scope(RouteScope::Link)
                .build(),
            RouteMessageBuilder::<Ipv4Addr>::default()
                .output_interface(index)
                .gateway(gw)
                .build(),
        ],
        IpAddr::V6(gw) => vec![
            RouteMessageBuilder::<Ipv6Addr>::default()
                .destination_prefix(gw, 128)
                .output_interface(index)
                .scope(RouteScope::Link)
                .build(),
            RouteMessageBuilder::<Ipv6Addr>::default()
                .output_interface(index)
                .gateway(gw)
                .build(),
        ],
    }
}

/// Rename, address, bring up and route the peer. Runs inside the target
/// namespace.
async fn configure_peer(
    temp: String,
    name: String,
    mac: Option<MacAddr>,
    address: Option<IpNet>,
    mtu: Option<u32>,
    gateway: Option<IpAddr>,
) -> CniResult<MacAddr> {
    let handle = connect()?;
    let index = link_index(&handle, &temp).await?;
    let mut request = LinkUnspec::new_with_index(index).name(name.clone());
    if let Some(mac) = mac {
        request = request.address(mac.octets().to_vec());
    }
    if let Some(mtu) = mtu {
        request = request.mtu(mtu);
    }
    handle.link().set(request.build()).execute().await.map_err(netlink_error)?;

    if let Some(net) = address {
        handle
            .address()
            .add(index, net.addr(), net.prefix_len())
            .execute()
            .await
            .map_err(netlink_error)?;
    }

    handle
        .link()
        .set(LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await
        .map_err(netlink_error)?;

    if let Some(gateway) = gateway {
        for route in gateway_routes(index, gateway) {
            handle.route().add(route).execute().await.map_err(netlink_error)?;
        }
        tracing::debug!(link = %name, %gateway, "Installed gateway routes");
    }

    let link = link_by_name(&handle, &name)
        .await
        .map_err(netlink_error)?
        .ok_or_else(|| netlink_error(format!("link {name} vanished")))?;
    link_mac(&link).ok_or_else(|| netlink_error(format!("link {name} has no MAC")))
}

#[async_trait]
impl LinkFabricator for NetlinkFabricator {
    async fn create_attachment(&self, spec: &LinkSpec, netns: &Path) -> CniResult<LinkAttachment> {
        spec.validate()?;
        let target = NetnsHandle::open(netns)?;

        let host = spec.host.as_str();
        let temp = spec.host.peer_temp_name();
        let mut partial = PartialLink::new(host);
        let failed = |step: &'static str, partial: &PartialLink, message: String| {
            CniError::LinkCreation {
                step,
                message,
                partial: partial.clone(),
            }
        };

        let handle = connect().map_err(|e| failed("connect", &partial, e.to_string()))?;

        tracing::debug!(host, peer = %temp, "Creating veth pair");
        handle
            .link()
            .add(LinkVeth::new(host, &temp).build())
            .execute()
            .await
            .map_err(|e| failed("create pair", &partial, e.to_string()))?;
        partial.pair_created = true;

        tracing::debug!(peer = %temp, netns = %netns.display(), "Moving peer into namespace");
        let peer_index = link_index(&handle, &temp)
            .await
            .map_err(|e| failed("move peer", &partial, e.to_string()))?;
        handle
            .link()
            .set(
                LinkUnspec::new_with_index(peer_index)
                    .setns_by_fd(target.as_raw_fd())
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| failed("move peer", &partial, e.to_string()))?;
        partial.peer_moved = true;

        let (name, mac, address, mtu, gateway) =
            (spec.container.clone(), spec.mac, spec.address, spec.mtu, spec.gateway);
        let container_mac =
            run_in_netns(&target, move || configure_peer(temp, name, mac, address, mtu, gateway))
            .await
            .map_err(|e| failed("configure peer", &partial, e.to_string()))?;
        partial.peer_configured = true;

        let mut up = LinkUnspec::new_with_index(
            link_index(&handle, host)
                .await
                .map_err(|e| failed("host up", &partial, e.to_string()))?,
        )
        .up();
        if let Some(mtu) = spec.mtu {
            up = up.mtu(mtu);
        }
        handle
            .link()
            .set(up.build())
            .execute()
            .await
            .map_err(|e| failed("host up", &partial, e.to_string()))?;
        partial.host_up = true;

        let host_mac = wait_for_link_mac(&handle, host, spec.mac_wait).await?;
        tracing::info!(host, container = %spec.container, %host_mac, %container_mac, "Link pair ready");
        Ok(LinkAttachment {
            host_mac,
            container_mac,
        })
    }

    async fn remove_host_link(&self, host: &HostInterfaceName) -> CniResult<bool> {
        let handle = connect()?;
        let Some(link) = link_by_name(&handle, host.as_str()).await.map_err(netlink_error)? else {
            tracing::debug!(host = %host, "Host link already absent");
            return Ok(false);
        };
        match handle.link().del(link.header.index).execute().await {
            Ok(()) => {
                tracing::info!(host = %host, "Removed host link");
                Ok(true)
            }
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(false),
            Err(e) => Err(netlink_error(e)),
        }
    }

    async fn host_link_exists(&self, host: &HostInterfaceName) -> CniResult<bool> {
        let handle = connect()?;
        Ok(link_by_name(&handle, host.as_str())
            .await
            .map_err(netlink_error)?
            .is_some())
    }
}

/// Poll until `name` reports a non-zero MAC.
async fn wait_for_link_mac(handle: &Handle, name: &str, timeout: Duration) -> CniResult<MacAddr> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(Some(link)) = link_by_name(handle, name).await {
            if let Some(mac) = link_mac(&link).filter(|mac| !mac.is_zero()) {
                return Ok(mac);
            }
        }
        if Instant::now() >= deadline {
            return Err(CniError::Timeout {
                operation: format!("MAC on {name}"),
                after: timeout,
            });
        }
        tokio::time::sleep(MAC_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovncni_common::WorkloadIdentity;

    fn host() -> HostInterfaceName {
        HostInterfaceName::derive(&WorkloadIdentity::new("team-a", "vm-1"), "eth0")
    }

    #[test]
    fn spec_builder() {
        let mac: MacAddr = "02:aa:bb:cc:dd:01".parse().unwrap();
        let spec = LinkSpec::new(host(), "eth0")
            .with_mac(mac)
            .with_address("10.0.1.5/24".parse().unwrap())
            .with_mtu(1400);
        assert_eq!(spec.mac, Some(mac));
        assert_eq!(spec.address.unwrap().prefix_len(), 24);
        assert_eq!(spec.mtu, Some(1400));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn gateway_family_must_match_address() {
        let spec = LinkSpec::new(host(), "eth0")
            .with_address("10.0.1.5/32".parse().unwrap())
            .with_gateway("fd00::1".parse().unwrap());
        assert!(matches!(spec.validate(), Err(CniError::Config { .. })));
        let spec = spec.with_gateway("10.0.1.1".parse().unwrap());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn gateway_routes_v4() {
        use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};

        let gw = Ipv4Addr::new(10, 0, 1, 1);
        let routes = gateway_routes(7, IpAddr::V4(gw));
        assert_eq!(routes.len(), 2);

        let onlink = &routes[0];
        assert_eq!(onlink.header.destination_prefix_length, 32);
        assert_eq!(onlink.header.scope, RouteScope::Link);
        assert!(onlink.attributes.contains(&RouteAttribute::Oif(7)));
        assert!(onlink
            .attributes
            .contains(&RouteAttribute::Destination(RouteAddress::Inet(gw))));

        let default = &routes[1];
        assert_eq!(default.header.destination_prefix_length, 0);
        assert!(default.attributes.contains(&RouteAttribute::Oif(7)));
        assert!(default
            .attributes
            .contains(&RouteAttribute::Gateway(RouteAddress::Inet(gw))));
    }

    #[test]
    fn gateway_routes_v6() {
        let routes = gateway_routes(3, "fd00:10::1".parse().unwrap());
        assert_eq!(routes[0].header.destination_prefix_length, 128);
        assert_eq!(routes[0].header.scope, RouteScope::Link);
        assert_eq!(routes[1].header.destination_prefix_length, 0);
    }

    #[tokio::test]
    async fn long_container_name_rejected_before_kernel() {
        let spec = LinkSpec::new(host(), "an-interface-name-too-long");
        // The namespace path does not exist: validation must fail first.
        let err = NetlinkFabricator::new()
            .create_attachment(&spec, Path::new("/nonexistent/netns"))
            .await
            .unwrap_err();
        assert!(matches!(err, CniError::InvalidInterfaceName { .. }));
    }

    #[tokio::test]
    async fn missing_namespace_is_namespace_error() {
        let spec = LinkSpec::new(host(), "eth0");
        let err = NetlinkFabricator::new()
            .create_attachment(&spec, Path::new("/nonexistent/netns"))
            .await
            .unwrap_err();
        assert!(matches!(err, CniError::Namespace { .. }));
    }
}
