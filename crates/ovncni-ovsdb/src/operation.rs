//! Typed OVSDB operations (RFC 7047, section 5).
//!
//! Operations serialize to the exact JSON objects a `transact` request
//! carries, so the same values can be sent over the wire or applied to the
//! in-memory database.

use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A table row: column name to OVSDB-encoded value.
pub type Row = Map<String, Value>;

/// One operation of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// Insert a row, optionally naming it for later operations.
    Insert {
        /// Target table.
        table: String,
        /// Column values.
        row: Row,
        /// Name other operations use to refer to the new row.
        #[serde(rename = "uuid-name", skip_serializing_if = "Option::is_none")]
        uuid_name: Option<String>,
    },
    /// Read rows.
    Select {
        /// Target table.
        table: String,
        /// Row filter.
        #[serde(rename = "where")]
        conditions: Vec<Condition>,
    },
    /// Change column values in place.
    Mutate {
        /// Target table.
        table: String,
        /// Row filter.
        #[serde(rename = "where")]
        conditions: Vec<Condition>,
        /// Changes to apply.
        mutations: Vec<Mutation>,
    },
    /// Remove rows.
    Delete {
        /// Target table.
        table: String,
        /// Row filter.
        #[serde(rename = "where")]
        conditions: Vec<Condition>,
    },
}

impl Operation {
    /// Insert `row` into `table`.
    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self::Insert {
            table: table.into(),
            row,
            uuid_name: None,
        }
    }

    /// Name the row created by an insert.
    #[must_use]
    pub fn with_uuid_name(self, name: impl Into<String>) -> Self {
        match self {
            Self::Insert { table, row, .. } => Self::Insert {
                table,
                row,
                uuid_name: Some(name.into()),
            },
            other => other,
        }
    }

    /// Select rows of `table` matching every condition.
    pub fn select(table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self::Select {
            table: table.into(),
            conditions,
        }
    }

    /// Apply `mutations` to the rows of `table` matching every condition.
    pub fn mutate(
        table: impl Into<String>,
        conditions: Vec<Condition>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self::Mutate {
            table: table.into(),
            conditions,
            mutations,
        }
    }

    /// Delete the rows of `table` matching every condition.
    pub fn delete(table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self::Delete {
            table: table.into(),
            conditions,
        }
    }

    /// Target table.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Select { table, .. }
            | Self::Mutate { table, .. }
            | Self::Delete { table, .. } => table,
        }
    }
}

/// Comparison used in a `where` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `includes` (set/map superset)
    Includes,
    /// `excludes`
    Excludes,
}

impl Function {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Includes => "includes",
            Self::Excludes => "excludes",
        }
    }
}

/// A `[column, function, value]` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Column name.
    pub column: String,
    /// Comparison.
    pub function: Function,
    /// Right-hand side.
    pub value: Value,
}

impl Condition {
    /// `column == value`.
    pub fn equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            function: Function::Equal,
            value: value.into(),
        }
    }

    /// Match the row with the given UUID.
    #[must_use]
    pub fn uuid(uuid: &Uuid) -> Self {
        Self::equals("_uuid", value::uuid(uuid))
    }

    /// Match a row by its `name` column.
    pub fn name(name: impl Into<String>) -> Self {
        Self::equals("name", Value::String(name.into()))
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.column)?;
        tuple.serialize_element(self.function.as_str())?;
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

/// Mutator applied to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutator {
    /// Add elements to a set or map.
    Insert,
    /// Remove elements from a set or map.
    Delete,
}

impl Mutator {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Delete => "delete",
        }
    }
}

/// A `[column, mutator, value]` mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Column name.
    pub column: String,
    /// Mutator.
    pub mutator: Mutator,
    /// Operand.
    pub value: Value,
}

impl Mutation {
    /// Insert `value` into the set column.
    pub fn insert(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            mutator: Mutator::Insert,
            value,
        }
    }

    /// Remove `value` from the set column.
    pub fn delete(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            mutator: Mutator::Delete,
            value,
        }
    }
}

impl Serialize for Mutation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.column)?;
        tuple.serialize_element(self.mutator.as_str())?;
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

/// Result of one operation.
///
/// A failed operation carries `error`; operations after a failure come
/// back empty.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OperationResult {
    /// Rows affected by mutate/delete/update.
    #[serde(default)]
    pub count: Option<u64>,
    /// UUID of an inserted row.
    #[serde(default)]
    pub uuid: Option<Value>,
    /// Rows returned by select.
    #[serde(default)]
    pub rows: Option<Vec<Row>>,
    /// Error tag.
    #[serde(default)]
    pub error: Option<String>,
    /// Error details.
    #[serde(default)]
    pub details: Option<String>,
}

impl OperationResult {
    /// A successful mutate/delete.
    #[must_use]
    pub const fn count(count: u64) -> Self {
        Self {
            count: Some(count),
            uuid: None,
            rows: None,
            error: None,
            details: None,
        }
    }

    /// A successful insert.
    #[must_use]
    pub fn inserted(uuid: &Uuid) -> Self {
        Self {
            uuid: Some(value::uuid(uuid)),
            ..Self::default()
        }
    }

    /// A successful select.
    #[must_use]
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            rows: Some(rows),
            ..Self::default()
        }
    }

    /// A failed operation.
    pub fn error(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            details: Some(details.into()),
            ..Self::default()
        }
    }

    /// Whether this operation failed.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// UUID of the inserted row, if any.
    #[must_use]
    pub fn inserted_uuid(&self) -> Option<Uuid> {
        self.uuid.as_ref().and_then(value::as_uuid)
    }
}

/// Encoding helpers for OVSDB values.
pub mod value {
    use serde_json::{Value, json};
    use uuid::Uuid;

    /// `["uuid", "<uuid>"]`
    #[must_use]
    pub fn uuid(uuid: &Uuid) -> Value {
        json!(["uuid", uuid.to_string()])
    }

    /// `["named-uuid", "<name>"]`
    #[must_use]
    pub fn named_uuid(name: &str) -> Value {
        json!(["named-uuid", name])
    }

    /// `["set", [...]]`
    #[must_use]
    pub fn set(items: Vec<Value>) -> Value {
        json!(["set", items])
    }

    /// `["map", [[k, v], ...]]` with string keys and values.
    pub fn string_map<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Value {
        let pairs: Vec<Value> = pairs.into_iter().map(|(k, v)| json!([k, v])).collect();
        json!(["map", pairs])
    }

    /// Decode a UUID atom.
    #[must_use]
    pub fn as_uuid(value: &Value) -> Option<Uuid> {
        match value.as_array()?.as_slice() {
            [tag, id] if tag == "uuid" => id.as_str()?.parse().ok(),
            _ => None,
        }
    }

    /// Decode a set, treating a bare atom as a one-element set.
    #[must_use]
    pub fn set_items(value: &Value) -> Vec<Value> {
        if let Some([tag, items]) = value.as_array().map(Vec::as_slice) {
            if tag == "set" {
                return items.as_array().cloned().unwrap_or_default();
            }
        }
        vec![value.clone()]
    }

    /// Decode a set of UUIDs.
    #[must_use]
    pub fn uuid_set(value: &Value) -> Vec<Uuid> {
        set_items(value).iter().filter_map(as_uuid).collect()
    }

    /// Decode a set of strings (also used for optional string columns).
    #[must_use]
    pub fn string_set(value: &Value) -> Vec<String> {
        set_items(value)
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_serializes_with_uuid_name() {
        let mut row = Row::new();
        row.insert("name".to_string(), json!("v-0123456789abc"));
        let op = Operation::insert("Port", row).with_uuid_name("port");

        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "insert", "table": "Port", "row": {"name": "v-0123456789abc"}, "uuid-name": "port"})
        );
    }

    #[test]
    fn mutate_serializes_conditions_and_mutations() {
        let id = Uuid::nil();
        let op = Operation::mutate(
            "Bridge",
            vec![Condition::uuid(&id)],
            vec![Mutation::insert("ports", value::set(vec![value::named_uuid("port")]))],
        );

        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({
                "op": "mutate",
                "table": "Bridge",
                "where": [["_uuid", "==", ["uuid", "00000000-0000-0000-0000-000000000000"]]],
                "mutations": [["ports", "insert", ["set", [["named-uuid", "port"]]]]]
            })
        );
    }

    #[test]
    fn result_decodes_error_and_uuid() {
        let ok: OperationResult =
            serde_json::from_value(json!({"uuid": ["uuid", "00000000-0000-0000-0000-000000000000"]}))
                .unwrap();
        assert_eq!(ok.inserted_uuid(), Some(Uuid::nil()));
        assert!(!ok.is_error());

        let err: OperationResult =
            serde_json::from_value(json!({"error": "constraint violation", "details": "dup"})).unwrap();
        assert!(err.is_error());
    }

    #[test]
    fn set_decoding_accepts_atoms() {
        assert_eq!(value::string_set(&json!("02:aa:bb:cc:dd:01")), vec!["02:aa:bb:cc:dd:01"]);
        assert!(value::string_set(&json!(["set", []])).is_empty());
        assert_eq!(value::uuid_set(&json!(["uuid", Uuid::nil().to_string()])), vec![Uuid::nil()]);
    }
}
