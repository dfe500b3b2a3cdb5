//! Operational database (ODB) gateway
//!
//! A trait-based abstraction over the relational store the cluster topology is
//! registered in. Two backends implement it:
//!
//! - [`MemoryOdb`] keeps rows in process memory, with the same uniqueness and
//!   foreign-key rules as the real schema. Used by tests and dry runs.
//! - [`SqlOdb`] talks to PostgreSQL, MySQL or SQLite through the `sqlx`
//!   any-driver.
//!
//! The connection is held exclusively for the whole run, so both backends
//! work with a single underlying connection.

pub mod memory;
pub mod model;
pub mod schema;
pub mod sql;

pub use memory::MemoryOdb;
pub use model::{Cluster, ClusterInfo, Server};
pub use sql::SqlOdb;

use async_trait::async_trait;
use futures::future::BoxFuture;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{OdbKind, OdbParams};

/// Errors raised by the ODB gateway
#[derive(Debug, Error)]
pub enum OdbError {
    /// The connection could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// The liveness probe failed
    #[error("{kind} liveness probe failed: {message}")]
    Liveness {
        /// Engine the probe ran against
        kind: OdbKind,
        /// Underlying failure
        message: String,
    },

    /// A statement, commit or rollback failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A unique constraint would be violated
    #[error("duplicate {table} name: {value}")]
    UniqueViolation {
        /// Table the constraint belongs to
        table: &'static str,
        /// Offending value
        value: String,
    },

    /// A foreign key points at a row that does not exist
    #[error("{table} row {id} does not exist")]
    MissingReference {
        /// Referenced table
        table: &'static str,
        /// Referenced id
        id: i64,
    },

    /// A quickstart cluster name does not end in `#<integer>`
    #[error("cannot parse cluster number from name '{0}'")]
    InvalidClusterName(String),
}

impl OdbError {
    /// Create a persistence error with the given message
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}

/// A live connection to the operational database
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OdbConnection: Send + Sync {
    /// Engine behind this connection
    fn kind(&self) -> OdbKind;

    /// Run the engine's trivial round-trip query
    async fn ping(&self) -> Result<(), OdbError>;

    /// Create the topology tables if they do not exist yet
    async fn ensure_schema(&self) -> Result<(), OdbError>;

    /// Name of the highest-id cluster whose name matches `<prefix>-#%`
    async fn latest_cluster_name(&self, prefix: &str) -> Result<Option<String>, OdbError>;

    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn OdbTransaction>, OdbError>;
}

/// An open transaction
///
/// Dropping a transaction without committing discards its changes.
#[async_trait]
pub trait OdbTransaction: Send {
    /// Insert a cluster row
    async fn insert_cluster(&mut self, info: &ClusterInfo) -> Result<Cluster, OdbError>;

    /// Insert a server row belonging to `cluster`
    async fn insert_server(&mut self, name: &str, cluster: &Cluster) -> Result<Server, OdbError>;

    /// Make every change visible
    async fn commit(self: Box<Self>) -> Result<(), OdbError>;

    /// Discard every change
    async fn rollback(self: Box<Self>) -> Result<(), OdbError>;
}

/// Connect to the database described by `params`
pub async fn connect(params: &OdbParams) -> Result<Box<dyn OdbConnection>, OdbError> {
    let odb = SqlOdb::connect(params).await?;
    Ok(Box::new(odb))
}

/// Run `f` inside a transaction
///
/// Commits when `f` succeeds and rolls back when it fails. A failed rollback is
/// logged and the original error returned.
pub async fn run_in_transaction<T, F>(odb: &dyn OdbConnection, f: F) -> Result<T, OdbError>
where
    T: Send,
    F: for<'t> FnOnce(&'t mut dyn OdbTransaction) -> BoxFuture<'t, Result<T, OdbError>> + Send,
{
    let mut tx = odb.begin().await?;
    debug!(kind = %odb.kind(), "Transaction started");

    let outcome = f(tx.as_mut()).await;

    match outcome {
        Ok(value) => {
            tx.commit().await?;
            debug!("Transaction committed");
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            } else {
                debug!(error = %e, "Transaction rolled back");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_info(name: &str) -> ClusterInfo {
        ClusterInfo {
            name: name.to_string(),
            description: None,
            odb_type: "postgresql".to_string(),
            odb_host: "localhost".to_string(),
            odb_port: 5432,
            odb_user: "zato".to_string(),
            odb_db_name: "zato".to_string(),
            odb_schema: None,
            amqp_host: "localhost".to_string(),
            amqp_port: 5672,
            amqp_user: "guest".to_string(),
            lb_host: "localhost".to_string(),
            lb_agent_port: 20151,
            sec_server_host: "localhost".to_string(),
            sec_server_port: 15100,
        }
    }

    #[tokio::test]
    async fn successful_closure_commits() {
        let odb = MemoryOdb::new();
        let info = cluster_info("committed");

        let cluster = run_in_transaction(&odb, move |tx| {
            Box::pin(async move { tx.insert_cluster(&info).await })
        })
        .await
        .unwrap();

        assert_eq!(cluster.name(), "committed");
        assert_eq!(odb.clusters().len(), 1);
    }

    #[tokio::test]
    async fn failing_closure_rolls_back_earlier_inserts() {
        let odb = MemoryOdb::new();
        let info = cluster_info("rolled-back");

        let result: Result<(), OdbError> = run_in_transaction(&odb, move |tx| {
            Box::pin(async move {
                tx.insert_cluster(&info).await?;
                Err(OdbError::persistence("second insert failed"))
            })
        })
        .await;

        assert!(result.is_err());
        assert!(odb.clusters().is_empty());
    }

    #[tokio::test]
    async fn begin_failure_is_propagated() {
        let mut mock = MockOdbConnection::new();
        mock.expect_kind().return_const(OdbKind::Postgresql);
        mock.expect_begin()
            .returning(|| Err(OdbError::Connection("gone".to_string())));

        let result: Result<(), OdbError> =
            run_in_transaction(&mock, |_tx| Box::pin(async { Ok(()) })).await;

        assert!(matches!(result, Err(OdbError::Connection(_))));
    }

    #[test]
    fn error_messages_name_the_failure() {
        let err = OdbError::Liveness {
            kind: OdbKind::Mysql,
            message: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "mysql liveness probe failed: timeout");

        let err = OdbError::UniqueViolation {
            table: "server",
            value: "srv-1".to_string(),
        };
        assert_eq!(err.to_string(), "duplicate server name: srv-1");
    }
}
