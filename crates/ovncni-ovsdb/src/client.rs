//! The OVSDB capability used by the registrars.

use async_trait::async_trait;
use ovncni_common::{CniError, CniResult};

use crate::operation::{Condition, Operation, OperationResult, Row};
use crate::schema::Model;

/// Transactional access to one OVSDB database.
///
/// Implementations must apply a transaction all-or-nothing and report
/// per-operation results in order.
#[async_trait]
pub trait OvsdbClient: Send + Sync {
    /// Name of the database transactions are issued against.
    fn database(&self) -> &str;

    /// Run `ops` as one atomic transaction.
    ///
    /// A transport failure is an `Err`; operation-level failures are
    /// reported in the returned results.
    async fn transact(&self, ops: Vec<Operation>) -> CniResult<Vec<OperationResult>>;

    /// Select raw rows of `table`.
    async fn select(&self, table: &str, conditions: Vec<Condition>) -> CniResult<Vec<Row>> {
        let result = self
            .transact(vec![Operation::select(table, conditions)])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        if let Some(error) = result.error {
            return Err(CniError::Database {
                message: format!(
                    "select on {table} failed: {error} ({})",
                    result.details.unwrap_or_default()
                ),
            });
        }
        Ok(result.rows.unwrap_or_default())
    }
}

impl dyn OvsdbClient + '_ {
    /// Fetch the first row of `M`'s table matching `condition`.
    ///
    /// # Errors
    ///
    /// Returns an error if the select fails or the row does not decode.
    pub async fn get<M: Model>(&self, condition: Condition) -> CniResult<Option<M>> {
        self.select(M::TABLE, vec![condition])
            .await?
            .first()
            .map(M::from_row)
            .transpose()
    }

    /// Fetch every row of `M`'s table.
    ///
    /// # Errors
    ///
    /// Returns an error if the select fails or a row does not decode.
    pub async fn list<M: Model>(&self) -> CniResult<Vec<M>> {
        self.select(M::TABLE, Vec::new())
            .await?
            .iter()
            .map(M::from_row)
            .collect()
    }
}

/// Stand-in for a database that could not be reached.
///
/// Every request fails with the original connection error, so a caller
/// sweeping several databases still reaches the ones that are up.
#[derive(Debug, Clone)]
pub struct UnreachableDb {
    database: String,
    reason: String,
}

impl UnreachableDb {
    /// Record that `database` could not be reached because of `error`.
    pub fn new(database: impl Into<String>, error: &CniError) -> Self {
        Self {
            database: database.into(),
            reason: error.to_string(),
        }
    }
}

#[async_trait]
impl OvsdbClient for UnreachableDb {
    fn database(&self) -> &str {
        &self.database
    }

    async fn transact(&self, _ops: Vec<Operation>) -> CniResult<Vec<OperationResult>> {
        Err(CniError::Database {
            message: format!("{} is unreachable: {}", self.database, self.reason),
        })
    }
}

/// Turn the first failed operation into [`CniError::Registration`].
///
/// # Errors
///
/// Returns the index, tag and details of the first failing operation.
pub fn check_results(results: &[OperationResult]) -> CniResult<()> {
    for (index, result) in results.iter().enumerate() {
        if let Some(error) = &result.error {
            tracing::debug!(index, error = %error, details = ?result.details, "OVSDB operation failed");
            return Err(CniError::Registration {
                index,
                error: error.clone(),
                details: result.details.clone().unwrap_or_default(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_results_reports_first_error() {
        let results = vec![
            OperationResult::count(1),
            OperationResult::error("referential integrity violation", "port still referenced"),
            OperationResult::default(),
        ];
        let err = check_results(&results).unwrap_err();
        assert!(matches!(
            err,
            CniError::Registration { index: 1, ref error, .. } if error == "referential integrity violation"
        ));
    }

    #[tokio::test]
    async fn unreachable_db_fails_every_request() {
        let cause = CniError::Database {
            message: "failed to connect to unix:/run/ovn/ovnnb_db.sock".to_string(),
        };
        let db = UnreachableDb::new("OVN_Northbound", &cause);
        let client: &dyn OvsdbClient = &db;

        assert_eq!(client.database(), "OVN_Northbound");
        let err = client.select("Logical_Switch", Vec::new()).await.unwrap_err();
        assert!(matches!(err, CniError::Database { ref message } if message.contains("ovnnb_db.sock")));
        assert!(client.transact(Vec::new()).await.is_err());
    }

    #[test]
    fn check_results_accepts_success() {
        assert!(check_results(&[OperationResult::count(0)]).is_ok());
    }
}
