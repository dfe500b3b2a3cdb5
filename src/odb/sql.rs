//! SQL ODB backend
//!
//! Uses the `sqlx` any-driver so one code path serves PostgreSQL, MySQL and
//! SQLite. The pool is capped at one connection: the quickstart holds the
//! connection exclusively for the run and never issues concurrent statements.
//!
//! The pool connects lazily, so an unreachable server surfaces from the
//! liveness probe rather than from [`SqlOdb::connect`], which only rejects
//! malformed connection parameters.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyQueryResult};
use sqlx::{Any, AnyPool, Row, Transaction};
use tracing::{debug, info};

use super::schema::{create_statements, placeholders};
use super::{Cluster, ClusterInfo, OdbConnection, OdbError, OdbTransaction, Server};
use crate::config::{OdbKind, OdbParams};

/// sqlx-backed operational database
#[derive(Debug, Clone)]
pub struct SqlOdb {
    pool: AnyPool,
    kind: OdbKind,
}

impl SqlOdb {
    /// Prepare a connection to the database described by `params`
    pub async fn connect(params: &OdbParams) -> Result<Self, OdbError> {
        sqlx::any::install_default_drivers();

        let session_setup = session_setup(params);
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .after_connect(move |conn, _meta| {
                let statements = session_setup.clone();
                Box::pin(async move {
                    for statement in &statements {
                        sqlx::query(statement).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect_lazy(&params.connection_url())
            .map_err(|e| OdbError::Connection(e.to_string()))?;

        info!(
            kind = %params.kind,
            host = %params.host,
            db_name = %params.db_name,
            "Prepared ODB connection"
        );

        Ok(Self {
            pool,
            kind: params.kind,
        })
    }

    /// Get the connection pool for direct access if needed
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

/// Statements run on every new connection
fn session_setup(params: &OdbParams) -> Vec<String> {
    match (params.kind, &params.schema) {
        (OdbKind::Postgresql, Some(schema)) if !schema.is_empty() => {
            vec![format!("SET search_path TO \"{}\"", schema.replace('"', "\"\""))]
        }
        (OdbKind::Sqlite, _) => vec!["PRAGMA foreign_keys = ON".to_string()],
        _ => Vec::new(),
    }
}

fn persistence(e: sqlx::Error) -> OdbError {
    OdbError::Persistence(e.to_string())
}

/// Map an insert failure onto the constraint it violated, if any
fn insert_error(e: sqlx::Error, table: &'static str, value: &str) -> OdbError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return OdbError::UniqueViolation {
                table,
                value: value.to_string(),
            };
        }
    }
    persistence(e)
}

#[async_trait]
impl OdbConnection for SqlOdb {
    fn kind(&self) -> OdbKind {
        self.kind
    }

    async fn ping(&self) -> Result<(), OdbError> {
        sqlx::query(self.kind.ping_query())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OdbError::Liveness {
                kind: self.kind,
                message: e.to_string(),
            })?;
        debug!(kind = %self.kind, "Ping OK");
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), OdbError> {
        for statement in create_statements(self.kind) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(persistence)?;
        }
        info!(kind = %self.kind, "ODB schema in place");
        Ok(())
    }

    async fn latest_cluster_name(&self, prefix: &str) -> Result<Option<String>, OdbError> {
        let sql = format!(
            "SELECT name FROM cluster WHERE name LIKE {} ORDER BY id DESC LIMIT 1",
            placeholders(self.kind, 1)
        );
        let row = sqlx::query(&sql)
            .bind(format!("{}-#%", prefix))
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;

        row.map(|r| r.try_get::<String, _>("name"))
            .transpose()
            .map_err(persistence)
    }

    async fn begin(&self) -> Result<Box<dyn OdbTransaction>, OdbError> {
        let tx = self.pool.begin().await.map_err(persistence)?;
        Ok(Box::new(SqlTransaction {
            tx,
            kind: self.kind,
        }))
    }
}

/// An open sqlx transaction; rolls back when dropped uncommitted
struct SqlTransaction {
    tx: Transaction<'static, Any>,
    kind: OdbKind,
}

impl SqlTransaction {
    /// Insert a row and return its generated id
    ///
    /// PostgreSQL reports the id through `RETURNING`, the others through the
    /// driver's last-insert-id.
    async fn insert_returning_id<'q>(
        &mut self,
        query: sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>>,
    ) -> Result<i64, sqlx::Error> {
        match self.kind {
            OdbKind::Postgresql => {
                let row = query.fetch_one(&mut *self.tx).await?;
                row.try_get::<i64, _>(0)
            }
            OdbKind::Mysql | OdbKind::Sqlite => {
                let result: AnyQueryResult = query.execute(&mut *self.tx).await?;
                result
                    .last_insert_id()
                    .ok_or_else(|| sqlx::Error::Protocol("no last insert id reported".into()))
            }
        }
    }

    fn returning(&self) -> &'static str {
        match self.kind {
            OdbKind::Postgresql => " RETURNING id",
            OdbKind::Mysql | OdbKind::Sqlite => "",
        }
    }
}

#[async_trait]
impl OdbTransaction for SqlTransaction {
    async fn insert_cluster(&mut self, info: &ClusterInfo) -> Result<Cluster, OdbError> {
        let sql = format!(
            "INSERT INTO cluster (name, description, odb_type, odb_host, odb_port, odb_user, \
             odb_db_name, odb_schema, amqp_host, amqp_port, amqp_user, lb_host, lb_agent_port, \
             sec_server_host, sec_server_port) VALUES ({}){}",
            placeholders(self.kind, 15),
            self.returning()
        );
        let query = sqlx::query(&sql)
            .bind(info.name.clone())
            .bind(info.description.clone())
            .bind(info.odb_type.clone())
            .bind(info.odb_host.clone())
            .bind(i32::from(info.odb_port))
            .bind(info.odb_user.clone())
            .bind(info.odb_db_name.clone())
            .bind(info.odb_schema.clone())
            .bind(info.amqp_host.clone())
            .bind(i32::from(info.amqp_port))
            .bind(info.amqp_user.clone())
            .bind(info.lb_host.clone())
            .bind(i32::from(info.lb_agent_port))
            .bind(info.sec_server_host.clone())
            .bind(i32::from(info.sec_server_port));

        let id = self
            .insert_returning_id(query)
            .await
            .map_err(|e| insert_error(e, "cluster", &info.name))?;

        debug!(id, name = %info.name, "Inserted cluster");
        Ok(Cluster {
            id,
            info: info.clone(),
        })
    }

    async fn insert_server(&mut self, name: &str, cluster: &Cluster) -> Result<Server, OdbError> {
        let sql = format!(
            "INSERT INTO server (name, cluster_id) VALUES ({}){}",
            placeholders(self.kind, 2),
            self.returning()
        );
        let query = sqlx::query(&sql)
            .bind(name.to_string())
            .bind(cluster.id);

        let id = self
            .insert_returning_id(query)
            .await
            .map_err(|e| insert_error(e, "server", name))?;

        debug!(id, name = %name, cluster_id = cluster.id, "Inserted server");
        Ok(Server {
            id,
            name: name.to_string(),
            cluster_id: cluster.id,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), OdbError> {
        self.tx.commit().await.map_err(persistence)
    }

    async fn rollback(self: Box<Self>) -> Result<(), OdbError> {
        self.tx.rollback().await.map_err(persistence)
    }
}
