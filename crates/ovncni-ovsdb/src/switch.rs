//! Port registration on the local switch's integration bridge.

use std::time::Duration;

use ovncni_common::{CniError, CniResult, MacAddr};
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::client::{OvsdbClient, check_results};
use crate::operation::{Condition, Mutation, Operation, Row, value};
use crate::schema::{BRIDGE_TABLE, Bridge, INTERFACE_TABLE, Interface, PORT_TABLE, Port};

/// Interval between `mac_in_use` polls.
const MAC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interface type the switch creates and manages a tap for.
pub const MANAGED_TAP_TYPE: &str = "managedtap";

/// Shape of the Interface row behind a registered port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind<'a> {
    /// An existing kernel interface of `iface_type`, with its MAC if known.
    Interface {
        /// Interface type column, usually `system`.
        iface_type: &'a str,
        /// Host-side MAC recorded as `attached-mac`.
        mac: Option<&'a MacAddr>,
    },
    /// A tap the switch creates itself, marked installed for ovn-controller.
    ManagedTap,
}

impl PortKind<'_> {
    /// Value of the Interface `type` column.
    #[must_use]
    pub const fn iface_type(&self) -> &str {
        match self {
            Self::Interface { iface_type, .. } => *iface_type,
            Self::ManagedTap => MANAGED_TAP_TYPE,
        }
    }

    fn interface_row(&self, port: &str) -> Row {
        let mut row = Row::new();
        row.insert("name".into(), Value::from(port));
        row.insert("type".into(), Value::from(self.iface_type()));
        match self {
            Self::Interface { mac, .. } => {
                let mac = mac.map(ToString::to_string);
                let mut external_ids = vec![("iface-id", port)];
                if let Some(mac) = &mac {
                    external_ids.push(("attached-mac", mac.as_str()));
                }
                row.insert("external_ids".into(), value::string_map(external_ids));
                if let Some(mac) = mac {
                    row.insert("mac".into(), Value::from(mac));
                }
            }
            Self::ManagedTap => {
                row.insert(
                    "external_ids".into(),
                    value::string_map(vec![("iface-id", port), ("ovn-installed", "true")]),
                );
            }
        }
        row
    }
}

fn port_row(port: &str) -> Row {
    let mut row = Row::new();
    row.insert("name".into(), Value::from(port));
    row.insert(
        "interfaces".into(),
        value::set(vec![value::named_uuid("new_iface")]),
    );
    row
}

/// Registers host interfaces as ports of a bridge in the `Open_vSwitch`
/// database.
#[derive(Clone, Copy)]
pub struct SwitchPortRegistrar<'a> {
    db: &'a dyn OvsdbClient,
}

impl<'a> SwitchPortRegistrar<'a> {
    /// Create a registrar over an `Open_vSwitch` database client.
    pub fn new(db: &'a dyn OvsdbClient) -> Self {
        Self { db }
    }

    /// Add `port` to `bridge`, backed by an interface of `iface_type`.
    ///
    /// The Interface row, the Port row and the bridge membership are
    /// written in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::BridgeNotFound`] if the bridge does not exist and
    /// [`CniError::Registration`] if any operation of the transaction fails.
    pub async fn register_port(
        &self,
        bridge: &str,
        port: &str,
        iface_type: &str,
        mac: Option<&MacAddr>,
    ) -> CniResult<()> {
        self.register_port_kind(bridge, port, &PortKind::Interface { iface_type, mac })
            .await
    }

    /// Add `port` to `bridge` with an interface shaped by `kind`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::register_port`].
    pub async fn register_port_kind(&self, bridge: &str, port: &str, kind: &PortKind<'_>) -> CniResult<()> {
        let bridge_row = self
            .db
            .get::<Bridge>(Condition::name(bridge))
            .await?
            .ok_or_else(|| CniError::BridgeNotFound {
                bridge: bridge.to_string(),
            })?;

        let ops = vec![
            Operation::insert(INTERFACE_TABLE, kind.interface_row(port)).with_uuid_name("new_iface"),
            Operation::insert(PORT_TABLE, port_row(port)).with_uuid_name("new_port"),
            Operation::mutate(
                BRIDGE_TABLE,
                vec![Condition::uuid(&bridge_row.uuid)],
                vec![Mutation::insert(
                    "ports",
                    value::set(vec![value::named_uuid("new_port")]),
                )],
            ),
        ];

        check_results(&self.db.transact(ops).await?)?;
        tracing::info!(bridge, port, iface_type = kind.iface_type(), "Registered switch port");
        Ok(())
    }

    /// Remove `port` from `bridge` together with its interfaces.
    ///
    /// A port that does not exist is already unregistered; nothing is
    /// written in that case.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Registration`] if the delete transaction fails.
    pub async fn unregister_port(&self, bridge: &str, port: &str) -> CniResult<()> {
        let Some(port_row) = self.db.get::<Port>(Condition::name(port)).await? else {
            tracing::debug!(bridge, port, "Switch port already absent");
            return Ok(());
        };

        let mut ops = Vec::with_capacity(port_row.interfaces.len() + 2);
        match self.db.get::<Bridge>(Condition::name(bridge)).await? {
            Some(bridge_row) => ops.push(Operation::mutate(
                BRIDGE_TABLE,
                vec![Condition::uuid(&bridge_row.uuid)],
                vec![Mutation::delete(
                    "ports",
                    value::set(vec![value::uuid(&port_row.uuid)]),
                )],
            )),
            None => tracing::warn!(bridge, port, "Bridge missing, removing port rows only"),
        }
        ops.push(Operation::delete(
            PORT_TABLE,
            vec![Condition::uuid(&port_row.uuid)],
        ));
        ops.extend(
            port_row
                .interfaces
                .iter()
                .map(|iface| Operation::delete(INTERFACE_TABLE, vec![Condition::uuid(iface)])),
        );

        check_results(&self.db.transact(ops).await?)?;
        tracing::info!(bridge, port, "Unregistered switch port");
        Ok(())
    }

    /// Port UUIDs currently attached to `bridge`.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::BridgeNotFound`] if the bridge does not exist.
    pub async fn bridge_ports(&self, bridge: &str) -> CniResult<Vec<Uuid>> {
        self.db
            .get::<Bridge>(Condition::name(bridge))
            .await?
            .map(|b| b.ports)
            .ok_or_else(|| CniError::BridgeNotFound {
                bridge: bridge.to_string(),
            })
    }

    /// Whether a port named `port` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub async fn port_exists(&self, port: &str) -> CniResult<bool> {
        Ok(self.db.get::<Port>(Condition::name(port)).await?.is_some())
    }

    /// MAC the switch reports for the interface named `port`, if any yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails or the stored MAC is garbage.
    pub async fn port_mac_in_use(&self, port: &str) -> CniResult<Option<MacAddr>> {
        let Some(iface) = self.db.get::<Interface>(Condition::name(port)).await? else {
            return Ok(None);
        };
        iface
            .mac_in_use
            .map(|mac| {
                mac.parse().map_err(|_| CniError::Database {
                    message: format!("interface {port} has invalid mac_in_use {mac:?}"),
                })
            })
            .transpose()
    }

    /// Poll `mac_in_use` until the switch reports a MAC for `port`.
    ///
    /// Lookup errors while polling are treated like a missing value.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Timeout`] once `timeout` has elapsed.
    pub async fn wait_for_port_mac(&self, port: &str, timeout: Duration) -> CniResult<MacAddr> {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(MAC_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.port_mac_in_use(port).await {
                Ok(Some(mac)) if !mac.is_zero() => return Ok(mac),
                Ok(_) => {}
                Err(e) => tracing::debug!(port, error = %e, "mac_in_use lookup failed"),
            }
            if Instant::now() >= deadline {
                return Err(CniError::Timeout {
                    operation: format!("mac_in_use on {port}"),
                    after: timeout,
                });
            }
        }
    }
}
