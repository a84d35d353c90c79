//! Logical switch port registration in the `OVN_Northbound` database.

use std::fmt;
use std::net::IpAddr;

use ovncni_common::{CniError, CniResult, MacAddr};
use serde_json::Value;
use uuid::Uuid;

use crate::client::{OvsdbClient, check_results};
use crate::operation::{Condition, Mutation, Operation, Row, value};
use crate::schema::{LOGICAL_SWITCH_PORT_TABLE, LOGICAL_SWITCH_TABLE, LogicalSwitch, LogicalSwitchPort};

/// The `addresses` entry of a logical switch port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalAddresses {
    /// Let northd assign a MAC and IP.
    Dynamic,
    /// Fixed MAC, no IP.
    Mac(MacAddr),
    /// Fixed MAC and IP.
    MacIp(MacAddr, IpAddr),
}

impl fmt::Display for LogicalAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dynamic => f.write_str("dynamic"),
            Self::Mac(mac) => write!(f, "{mac}"),
            Self::MacIp(mac, ip) => write!(f, "{mac} {ip}"),
        }
    }
}

/// Registers logical switch ports.
#[derive(Clone, Copy)]
pub struct LogicalPortRegistrar<'a> {
    db: &'a dyn OvsdbClient,
}

impl<'a> LogicalPortRegistrar<'a> {
    /// Create a registrar over an `OVN_Northbound` database client.
    pub fn new(db: &'a dyn OvsdbClient) -> Self {
        Self { db }
    }

    async fn logical_switch(&self, switch: &str) -> CniResult<Option<LogicalSwitch>> {
        self.db.get::<LogicalSwitch>(Condition::name(switch)).await
    }

    /// Create `port` on `switch` with `addresses`.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::LogicalSwitchNotFound`] if the switch does not
    /// exist and [`CniError::Registration`] if the transaction fails.
    pub async fn register_logical_port(
        &self,
        switch: &str,
        port: &str,
        addresses: &LogicalAddresses,
    ) -> CniResult<()> {
        let ls = self
            .logical_switch(switch)
            .await?
            .ok_or_else(|| CniError::LogicalSwitchNotFound {
                switch: switch.to_string(),
            })?;

        let mut row = Row::new();
        row.insert("name".into(), Value::from(port));
        row.insert(
            "addresses".into(),
            value::set(vec![Value::String(addresses.to_string())]),
        );

        let ops = vec![
            Operation::insert(LOGICAL_SWITCH_PORT_TABLE, row).with_uuid_name("new_lsp"),
            Operation::mutate(
                LOGICAL_SWITCH_TABLE,
                vec![Condition::uuid(&ls.uuid)],
                vec![Mutation::insert(
                    "ports",
                    value::set(vec![value::named_uuid("new_lsp")]),
                )],
            ),
        ];

        check_results(&self.db.transact(ops).await?)?;
        tracing::info!(switch, port, addresses = %addresses, "Registered logical port");
        Ok(())
    }

    /// Remove `port` from `switch` and delete it.
    ///
    /// A port row with the right name that no switch lists is deleted as
    /// well, since its unique name would block the next registration. A
    /// missing port means there is nothing to remove.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Registration`] if the delete transaction fails.
    pub async fn unregister_logical_port(&self, switch: &str, port: &str) -> CniResult<()> {
        let Some(lsp) = self.db.get::<LogicalSwitchPort>(Condition::name(port)).await? else {
            tracing::debug!(switch, port, "Logical port already absent");
            return Ok(());
        };

        let mut ops = Vec::with_capacity(2);
        match self.logical_switch(switch).await? {
            Some(ls) if ls.ports.contains(&lsp.uuid) => ops.push(Operation::mutate(
                LOGICAL_SWITCH_TABLE,
                vec![Condition::uuid(&ls.uuid)],
                vec![Mutation::delete("ports", value::set(vec![value::uuid(&lsp.uuid)]))],
            )),
            _ => tracing::warn!(switch, port, "Logical port not listed by its switch, deleting the row"),
        }
        ops.push(Operation::delete(
            LOGICAL_SWITCH_PORT_TABLE,
            vec![Condition::uuid(&lsp.uuid)],
        ));

        check_results(&self.db.transact(ops).await?)?;
        tracing::info!(switch, port, "Unregistered logical port");
        Ok(())
    }

    /// Port UUIDs attached to `switch`.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::LogicalSwitchNotFound`] if the switch does not exist.
    pub async fn list_logical_ports(&self, switch: &str) -> CniResult<Vec<Uuid>> {
        self.logical_switch(switch)
            .await?
            .map(|ls| ls.ports)
            .ok_or_else(|| CniError::LogicalSwitchNotFound {
                switch: switch.to_string(),
            })
    }

    /// Whether `port` is attached to `switch`.
    ///
    /// # Errors
    ///
    /// Returns an error if a lookup fails.
    pub async fn logical_port_exists(&self, switch: &str, port: &str) -> CniResult<bool> {
        let Some(ls) = self.logical_switch(switch).await? else {
            return Ok(false);
        };
        Ok(self
            .db
            .get::<LogicalSwitchPort>(Condition::name(port))
            .await?
            .is_some_and(|lsp| ls.ports.contains(&lsp.uuid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDb;
    use serde_json::json;

    fn seeded() -> MemoryDb {
        let db = MemoryDb::ovn_northbound();
        db.insert_row(
            LOGICAL_SWITCH_TABLE,
            json!({"name": "public", "ports": ["set", []]}).as_object().cloned().unwrap(),
        );
        db
    }

    #[test]
    fn address_encoding() {
        let mac: MacAddr = "02:aa:bb:cc:dd:01".parse().unwrap();
        assert_eq!(LogicalAddresses::Dynamic.to_string(), "dynamic");
        assert_eq!(LogicalAddresses::Mac(mac).to_string(), "02:aa:bb:cc:dd:01");
        assert_eq!(
            LogicalAddresses::MacIp(mac, "10.0.1.5".parse().unwrap()).to_string(),
            "02:aa:bb:cc:dd:01 10.0.1.5"
        );
    }

    #[tokio::test]
    async fn register_then_list() {
        let db = seeded();
        let registrar = LogicalPortRegistrar::new(&db);
        registrar
            .register_logical_port("public", "v-0123456789abc", &LogicalAddresses::Dynamic)
            .await
            .unwrap();

        let ports = registrar.list_logical_ports("public").await.unwrap();
        assert_eq!(ports.len(), 1);
        assert!(registrar.logical_port_exists("public", "v-0123456789abc").await.unwrap());
        assert_eq!(
            db.rows(LOGICAL_SWITCH_PORT_TABLE)[0]["addresses"],
            json!(["set", ["dynamic"]])
        );
    }

    #[tokio::test]
    async fn register_on_missing_switch_is_fatal() {
        let db = MemoryDb::ovn_northbound();
        let err = LogicalPortRegistrar::new(&db)
            .register_logical_port("ls-missing", "v-0123456789abc", &LogicalAddresses::Dynamic)
            .await
            .unwrap_err();
        assert!(matches!(err, CniError::LogicalSwitchNotFound { .. }));
        assert!(db.rows(LOGICAL_SWITCH_PORT_TABLE).is_empty());
    }

    #[tokio::test]
    async fn unregister_tolerates_missing_switch_and_port() {
        let db = seeded();
        let registrar = LogicalPortRegistrar::new(&db);
        registrar
            .unregister_logical_port("public", "v-0123456789abc")
            .await
            .unwrap();
        registrar
            .unregister_logical_port("ls-missing", "v-0123456789abc")
            .await
            .unwrap();
        assert_eq!(db.commits(), 0);
    }

    #[tokio::test]
    async fn unregister_removes_unlisted_port_row() {
        let db = seeded();
        db.insert_row(
            LOGICAL_SWITCH_PORT_TABLE,
            json!({"name": "v-0123456789abc", "addresses": ["set", ["dynamic"]]})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let registrar = LogicalPortRegistrar::new(&db);
        assert!(!registrar.logical_port_exists("public", "v-0123456789abc").await.unwrap());

        registrar
            .unregister_logical_port("public", "v-0123456789abc")
            .await
            .unwrap();
        assert!(db.rows(LOGICAL_SWITCH_PORT_TABLE).is_empty());

        registrar
            .register_logical_port("public", "v-0123456789abc", &LogicalAddresses::Dynamic)
            .await
            .unwrap();
        assert!(registrar.logical_port_exists("public", "v-0123456789abc").await.unwrap());
    }

    #[tokio::test]
    async fn list_on_missing_switch_fails() {
        let db = MemoryDb::ovn_northbound();
        let err = LogicalPortRegistrar::new(&db)
            .list_logical_ports("public")
            .await
            .unwrap_err();
        assert!(matches!(err, CniError::LogicalSwitchNotFound { .. }));
    }
}
