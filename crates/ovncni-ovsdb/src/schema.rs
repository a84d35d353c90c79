//! Table models for the parts of the `Open_vSwitch` and `OVN_Northbound`
//! schemas this plugin touches.

use ovncni_common::{CniError, CniResult};
use serde_json::Value;
use uuid::Uuid;

use crate::operation::{Row, value};

/// Local switch database name.
pub const OPEN_VSWITCH_DB: &str = "Open_vSwitch";
/// Northbound database name.
pub const OVN_NORTHBOUND_DB: &str = "OVN_Northbound";

/// `Bridge` table.
pub const BRIDGE_TABLE: &str = "Bridge";
/// `Port` table.
pub const PORT_TABLE: &str = "Port";
/// `Interface` table.
pub const INTERFACE_TABLE: &str = "Interface";
/// `Logical_Switch` table.
pub const LOGICAL_SWITCH_TABLE: &str = "Logical_Switch";
/// `Logical_Switch_Port` table.
pub const LOGICAL_SWITCH_PORT_TABLE: &str = "Logical_Switch_Port";

/// A typed view of a table row.
pub trait Model: Sized {
    /// Table the model is stored in.
    const TABLE: &'static str;

    /// Decode a row returned by `select`.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Database`] if a required column is missing.
    fn from_row(row: &Row) -> CniResult<Self>;
}

fn missing(table: &str, column: &str) -> CniError {
    CniError::Database {
        message: format!("{table} row without {column} column"),
    }
}

fn row_uuid(table: &str, row: &Row) -> CniResult<Uuid> {
    row.get("_uuid")
        .and_then(value::as_uuid)
        .ok_or_else(|| missing(table, "_uuid"))
}

fn row_name(table: &str, row: &Row) -> CniResult<String> {
    row.get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing(table, "name"))
}

fn row_uuids(row: &Row, column: &str) -> Vec<Uuid> {
    row.get(column).map(value::uuid_set).unwrap_or_default()
}

fn row_strings(row: &Row, column: &str) -> Vec<String> {
    row.get(column).map(value::string_set).unwrap_or_default()
}

/// A bridge on the local switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    /// Row UUID.
    pub uuid: Uuid,
    /// Bridge name.
    pub name: String,
    /// Member port UUIDs.
    pub ports: Vec<Uuid>,
}

impl Model for Bridge {
    const TABLE: &'static str = BRIDGE_TABLE;

    fn from_row(row: &Row) -> CniResult<Self> {
        Ok(Self {
            uuid: row_uuid(Self::TABLE, row)?,
            name: row_name(Self::TABLE, row)?,
            ports: row_uuids(row, "ports"),
        })
    }
}

/// A port on a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    /// Row UUID.
    pub uuid: Uuid,
    /// Port name.
    pub name: String,
    /// Interfaces backing the port.
    pub interfaces: Vec<Uuid>,
}

impl Model for Port {
    const TABLE: &'static str = PORT_TABLE;

    fn from_row(row: &Row) -> CniResult<Self> {
        Ok(Self {
            uuid: row_uuid(Self::TABLE, row)?,
            name: row_name(Self::TABLE, row)?,
            interfaces: row_uuids(row, "interfaces"),
        })
    }
}

/// A network device attached to a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Row UUID.
    pub uuid: Uuid,
    /// Interface name.
    pub name: String,
    /// Interface type (`system`, `internal`, ...).
    pub kind: String,
    /// MAC the switch observed on the device, once known.
    pub mac_in_use: Option<String>,
}

impl Model for Interface {
    const TABLE: &'static str = INTERFACE_TABLE;

    fn from_row(row: &Row) -> CniResult<Self> {
        Ok(Self {
            uuid: row_uuid(Self::TABLE, row)?,
            name: row_name(Self::TABLE, row)?,
            kind: row
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            mac_in_use: row_strings(row, "mac_in_use")
                .into_iter()
                .find(|mac| !mac.is_empty()),
        })
    }
}

/// A logical switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalSwitch {
    /// Row UUID.
    pub uuid: Uuid,
    /// Switch name.
    pub name: String,
    /// Member logical port UUIDs.
    pub ports: Vec<Uuid>,
}

impl Model for LogicalSwitch {
    const TABLE: &'static str = LOGICAL_SWITCH_TABLE;

    fn from_row(row: &Row) -> CniResult<Self> {
        Ok(Self {
            uuid: row_uuid(Self::TABLE, row)?,
            name: row_name(Self::TABLE, row)?,
            ports: row_uuids(row, "ports"),
        })
    }
}

/// A logical switch port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalSwitchPort {
    /// Row UUID.
    pub uuid: Uuid,
    /// Port name.
    pub name: String,
    /// Address list entries.
    pub addresses: Vec<String>,
}

impl Model for LogicalSwitchPort {
    const TABLE: &'static str = LOGICAL_SWITCH_PORT_TABLE;

    fn from_row(row: &Row) -> CniResult<Self> {
        Ok(Self {
            uuid: row_uuid(Self::TABLE, row)?,
            name: row_name(Self::TABLE, row)?,
            addresses: row_strings(row, "addresses"),
        })
    }
}
