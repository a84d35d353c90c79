//! In-memory OVSDB.
//!
//! Applies transactions all-or-nothing against a copy of the tables and
//! only commits when every operation and every reference check passes,
//! which is what a real server guarantees. Failures can be injected at a
//! given operation index to exercise the registrars' error paths.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use ovncni_common::CniResult;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::client::OvsdbClient;
use crate::operation::{Condition, Function, Mutation, Mutator, Operation, OperationResult, Row, value};
use crate::schema::{
    BRIDGE_TABLE, INTERFACE_TABLE, LOGICAL_SWITCH_PORT_TABLE, LOGICAL_SWITCH_TABLE,
    OPEN_VSWITCH_DB, OVN_NORTHBOUND_DB, PORT_TABLE,
};

type Tables = BTreeMap<String, BTreeMap<Uuid, Row>>;

/// An operation failure: OVSDB error tag and details.
type OpError = (String, String);

fn op_error(tag: &str, details: impl Into<String>) -> OpError {
    (tag.to_string(), details.into())
}

/// A strong reference column whose UUIDs must exist in `target`.
#[derive(Debug, Clone)]
struct Reference {
    table: String,
    column: String,
    target: String,
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    unique: Vec<(String, String)>,
    references: Vec<Reference>,
    injected: Option<(usize, OpError)>,
    commits: usize,
}

/// An in-memory, transactional OVSDB database.
#[derive(Debug)]
pub struct MemoryDb {
    database: String,
    state: Mutex<State>,
}

impl MemoryDb {
    /// Create an empty database.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// The local switch tables this plugin uses.
    #[must_use]
    pub fn open_vswitch() -> Self {
        Self::new(OPEN_VSWITCH_DB)
            .with_unique(BRIDGE_TABLE, "name")
            .with_unique(PORT_TABLE, "name")
            .with_unique(INTERFACE_TABLE, "name")
            .with_reference(BRIDGE_TABLE, "ports", PORT_TABLE)
            .with_reference(PORT_TABLE, "interfaces", INTERFACE_TABLE)
    }

    /// The northbound tables this plugin uses.
    #[must_use]
    pub fn ovn_northbound() -> Self {
        Self::new(OVN_NORTHBOUND_DB)
            .with_unique(LOGICAL_SWITCH_PORT_TABLE, "name")
            .with_reference(LOGICAL_SWITCH_TABLE, "ports", LOGICAL_SWITCH_PORT_TABLE)
    }

    /// Reject inserts that duplicate `column` within `table`.
    #[must_use]
    pub fn with_unique(self, table: &str, column: &str) -> Self {
        self.state
            .lock()
            .unique
            .push((table.to_string(), column.to_string()));
        self
    }

    /// Require every UUID in `table.column` to exist in `target` at commit.
    #[must_use]
    pub fn with_reference(self, table: &str, column: &str, target: &str) -> Self {
        self.state.lock().references.push(Reference {
            table: table.to_string(),
            column: column.to_string(),
            target: target.to_string(),
        });
        self
    }

    /// Insert a row outside of any transaction and return its UUID.
    pub fn insert_row(&self, table: &str, mut row: Row) -> Uuid {
        let uuid = Uuid::new_v4();
        row.insert("_uuid".to_string(), value::uuid(&uuid));
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(uuid, row);
        uuid
    }

    /// Snapshot of every row in `table`.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail operation `index` of the next transaction that writes.
    ///
    /// Select-only transactions run normally and leave the failure armed.
    pub fn fail_operation(&self, index: usize, error: &str, details: &str) {
        self.state.lock().injected = Some((index, op_error(error, details)));
    }

    /// Number of committed transactions that changed data.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }
}

#[async_trait]
impl OvsdbClient for MemoryDb {
    fn database(&self) -> &str {
        &self.database
    }

    async fn transact(&self, ops: Vec<Operation>) -> CniResult<Vec<OperationResult>> {
        let mut state = self.state.lock();
        let writes = ops.iter().any(|op| !matches!(op, Operation::Select { .. }));
        let injected = if writes { state.injected.take() } else { None };
        let mut txn = Transaction {
            tables: state.tables.clone(),
            unique: &state.unique,
            named: HashMap::new(),
            wrote: false,
        };

        let mut results = Vec::with_capacity(ops.len());
        for (index, op) in ops.into_iter().enumerate() {
            let outcome = match &injected {
                Some((at, err)) if *at == index => Err(err.clone()),
                _ => txn.apply(op),
            };
            match outcome {
                Ok(result) => results.push(result),
                Err((error, details)) => {
                    tracing::debug!(index, error = %error, "Aborting in-memory transaction");
                    results.push(OperationResult::error(error, details));
                    return Ok(results);
                }
            }
        }

        if let Err((error, details)) = check_references(&txn.tables, &state.references) {
            results.push(OperationResult::error(error, details));
            return Ok(results);
        }

        if txn.wrote {
            let Transaction { tables, .. } = txn;
            state.tables = tables;
            state.commits += 1;
        }
        Ok(results)
    }
}

struct Transaction<'a> {
    tables: Tables,
    unique: &'a [(String, String)],
    named: HashMap<String, Uuid>,
    wrote: bool,
}

impl Transaction<'_> {
    fn apply(&mut self, op: Operation) -> Result<OperationResult, OpError> {
        match op {
            Operation::Insert {
                table,
                row,
                uuid_name,
            } => self.insert(&table, &row, uuid_name),
            Operation::Select { table, conditions } => {
                let conditions = self.resolve_conditions(&conditions)?;
                let rows = self
                    .tables
                    .get(&table)
                    .map(|rows| {
                        rows.values()
                            .filter(|row| matches(row, &conditions))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(OperationResult::rows(rows))
            }
            Operation::Mutate {
                table,
                conditions,
                mutations,
            } => {
                let conditions = self.resolve_conditions(&conditions)?;
                let mutations = mutations
                    .iter()
                    .map(|m| {
                        Ok(Mutation {
                            value: self.resolve(&m.value)?,
                            ..m.clone()
                        })
                    })
                    .collect::<Result<Vec<_>, OpError>>()?;

                let mut count = 0;
                for row in self.tables.entry(table).or_default().values_mut() {
                    if matches(row, &conditions) {
                        for mutation in &mutations {
                            mutate(row, mutation);
                        }
                        count += 1;
                    }
                }
                self.wrote |= count > 0;
                Ok(OperationResult::count(count))
            }
            Operation::Delete { table, conditions } => {
                let conditions = self.resolve_conditions(&conditions)?;
                let rows = self.tables.entry(table).or_default();
                let before = rows.len();
                rows.retain(|_, row| !matches(row, &conditions));
                let count = (before - rows.len()) as u64;
                self.wrote |= count > 0;
                Ok(OperationResult::count(count))
            }
        }
    }

    fn insert(
        &mut self,
        table: &str,
        row: &Row,
        uuid_name: Option<String>,
    ) -> Result<OperationResult, OpError> {
        let mut row = row
            .iter()
            .map(|(column, v)| Ok((column.clone(), self.resolve(v)?)))
            .collect::<Result<Row, OpError>>()?;

        for (_, column) in self.unique.iter().filter(|(t, _)| t == table) {
            let Some(new) = row.get(column) else { continue };
            let existing = self.tables.get(table).into_iter().flat_map(BTreeMap::values);
            if existing.filter_map(|r| r.get(column)).any(|v| v == new) {
                return Err(op_error(
                    "constraint violation",
                    format!("{table} already has a row with {column} = {new}"),
                ));
            }
        }

        let uuid = Uuid::new_v4();
        if let Some(name) = uuid_name {
            if self.named.insert(name.clone(), uuid).is_some() {
                return Err(op_error("duplicate uuid-name", name));
            }
        }
        row.insert("_uuid".to_string(), value::uuid(&uuid));
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(uuid, row);
        self.wrote = true;
        Ok(OperationResult::inserted(&uuid))
    }

    fn resolve_conditions(&self, conditions: &[Condition]) -> Result<Vec<Condition>, OpError> {
        conditions
            .iter()
            .map(|c| {
                Ok(Condition {
                    value: self.resolve(&c.value)?,
                    ..c.clone()
                })
            })
            .collect()
    }

    /// Replace `["named-uuid", n]` with the UUID inserted under `n`.
    fn resolve(&self, v: &Value) -> Result<Value, OpError> {
        let Value::Array(items) = v else {
            return Ok(v.clone());
        };
        if let [tag, Value::String(name)] = items.as_slice() {
            if tag == "named-uuid" {
                let uuid = self
                    .named
                    .get(name)
                    .ok_or_else(|| op_error("syntax error", format!("unknown uuid-name {name}")))?;
                return Ok(value::uuid(uuid));
            }
        }
        items
            .iter()
            .map(|item| self.resolve(item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }
}

fn sorted_items(v: &Value) -> Vec<String> {
    let mut items: Vec<String> = value::set_items(v).iter().map(Value::to_string).collect();
    items.sort();
    items
}

fn matches(row: &Row, conditions: &[Condition]) -> bool {
    conditions.iter().all(|condition| {
        let lhs = sorted_items(row.get(&condition.column).unwrap_or(&Value::Null));
        let rhs = sorted_items(&condition.value);
        match condition.function {
            Function::Equal => lhs == rhs,
            Function::NotEqual => lhs != rhs,
            Function::Includes => rhs.iter().all(|item| lhs.contains(item)),
            Function::Excludes => rhs.iter().all(|item| !lhs.contains(item)),
        }
    })
}

fn mutate(row: &mut Row, mutation: &Mutation) {
    let mut items = row
        .get(&mutation.column)
        .map(value::set_items)
        .unwrap_or_default();
    let operand = value::set_items(&mutation.value);
    match mutation.mutator {
        Mutator::Insert => {
            for item in operand {
                if !items.contains(&item) {
                    items.push(item);
                }
            }
        }
        Mutator::Delete => items.retain(|item| !operand.contains(item)),
    }
    row.insert(mutation.column.clone(), value::set(items));
}

fn check_references(tables: &Tables, references: &[Reference]) -> Result<(), OpError> {
    for reference in references {
        let Some(rows) = tables.get(&reference.table) else {
            continue;
        };
        let targets = tables.get(&reference.target);
        for row in rows.values() {
            let dangling = row
                .get(&reference.column)
                .map(value::uuid_set)
                .unwrap_or_default()
                .into_iter()
                .find(|uuid| !targets.is_some_and(|t| t.contains_key(uuid)));
            if let Some(uuid) = dangling {
                return Err(op_error(
                    "referential integrity violation",
                    format!(
                        "{}.{} references missing {} row {uuid}",
                        reference.table, reference.column, reference.target
                    ),
                ));
            }
        }
    }
    Ok(())
}
