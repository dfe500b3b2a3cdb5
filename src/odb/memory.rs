//! In-memory ODB backend
//!
//! Keeps cluster and server rows in process memory and enforces the same
//! constraints as the SQL schema: unique cluster names, unique server names and
//! server → cluster references. Transactions stage their rows and apply them
//! atomically on commit. Data is lost when the last handle is dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::info;

use super::{Cluster, ClusterInfo, OdbConnection, OdbError, OdbTransaction, Server};
use crate::config::OdbKind;

#[derive(Debug, Default)]
struct MemoryState {
    clusters: Vec<Cluster>,
    servers: Vec<Server>,
    last_cluster_id: i64,
    last_server_id: i64,
}

impl MemoryState {
    fn check_cluster(&self, staged: &[Cluster], name: &str) -> Result<(), OdbError> {
        if self
            .clusters
            .iter()
            .chain(staged)
            .any(|c| c.info.name == name)
        {
            return Err(OdbError::UniqueViolation {
                table: "cluster",
                value: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_server(
        &self,
        staged_clusters: &[Cluster],
        staged_servers: &[Server],
        name: &str,
        cluster_id: i64,
    ) -> Result<(), OdbError> {
        if self
            .servers
            .iter()
            .chain(staged_servers)
            .any(|s| s.name == name)
        {
            return Err(OdbError::UniqueViolation {
                table: "server",
                value: name.to_string(),
            });
        }
        if !self
            .clusters
            .iter()
            .chain(staged_clusters)
            .any(|c| c.id == cluster_id)
        {
            return Err(OdbError::MissingReference {
                table: "cluster",
                id: cluster_id,
            });
        }
        Ok(())
    }
}

/// In-memory operational database
///
/// Clones share the same rows.
#[derive(Clone, Debug)]
pub struct MemoryOdb {
    state: Arc<Mutex<MemoryState>>,
    reachable: bool,
}

impl MemoryOdb {
    /// Create an empty, reachable store
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            reachable: true,
        }
    }

    /// Create a store whose liveness probe always fails
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new()
        }
    }

    /// Insert clusters directly, outside any transaction, in the given order
    pub fn seed_clusters<I, S>(&self, names: I) -> Result<Vec<Cluster>, OdbError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.lock()?;
        let mut created = Vec::new();
        for name in names {
            let name = name.into();
            state.check_cluster(&[], &name)?;
            state.last_cluster_id += 1;
            let cluster = Cluster {
                id: state.last_cluster_id,
                info: seed_info(name),
            };
            state.clusters.push(cluster.clone());
            created.push(cluster);
        }
        Ok(created)
    }

    /// Insert a server directly, outside any transaction
    pub fn seed_server(&self, name: &str, cluster: &Cluster) -> Result<Server, OdbError> {
        let mut state = self.lock()?;
        state.check_server(&[], &[], name, cluster.id)?;
        state.last_server_id += 1;
        let server = Server {
            id: state.last_server_id,
            name: name.to_string(),
            cluster_id: cluster.id,
        };
        state.servers.push(server.clone());
        Ok(server)
    }

    /// Snapshot of every committed cluster, in id order
    pub fn clusters(&self) -> Vec<Cluster> {
        self.lock().map(|s| s.clusters.clone()).unwrap_or_default()
    }

    /// Snapshot of every committed server, in id order
    pub fn servers(&self) -> Vec<Server> {
        self.lock().map(|s| s.servers.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, OdbError> {
        self.state
            .lock()
            .map_err(|_| OdbError::persistence("memory store lock poisoned"))
    }
}

impl Default for MemoryOdb {
    fn default() -> Self {
        Self::new()
    }
}

fn seed_info(name: String) -> ClusterInfo {
    ClusterInfo {
        name,
        description: None,
        odb_type: OdbKind::Sqlite.to_string(),
        odb_host: "localhost".to_string(),
        odb_port: 0,
        odb_user: String::new(),
        odb_db_name: "memory".to_string(),
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

#[async_trait]
impl OdbConnection for MemoryOdb {
    fn kind(&self) -> OdbKind {
        OdbKind::Sqlite
    }

    async fn ping(&self) -> Result<(), OdbError> {
        if self.reachable {
            Ok(())
        } else {
            Err(OdbError::Liveness {
                kind: self.kind(),
                message: "memory store configured as unreachable".to_string(),
            })
        }
    }

    async fn ensure_schema(&self) -> Result<(), OdbError> {
        Ok(())
    }

    async fn latest_cluster_name(&self, prefix: &str) -> Result<Option<String>, OdbError> {
        let pattern = format!("{}-#", prefix);
        let state = self.lock()?;
        Ok(state
            .clusters
            .iter()
            .filter(|c| c.info.name.starts_with(&pattern))
            .max_by_key(|c| c.id)
            .map(|c| c.info.name.clone()))
    }

    async fn begin(&self) -> Result<Box<dyn OdbTransaction>, OdbError> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            clusters: Vec::new(),
            servers: Vec::new(),
        }))
    }
}

/// Rows staged by an open in-memory transaction
struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    clusters: Vec<Cluster>,
    servers: Vec<Server>,
}

impl MemoryTransaction {
    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, OdbError> {
        self.state
            .lock()
            .map_err(|_| OdbError::persistence("memory store lock poisoned"))
    }
}

#[async_trait]
impl OdbTransaction for MemoryTransaction {
    async fn insert_cluster(&mut self, info: &ClusterInfo) -> Result<Cluster, OdbError> {
        let cluster = {
            let mut state = self.lock()?;
            state.check_cluster(&self.clusters, &info.name)?;
            // Ids are consumed even if the transaction rolls back, like a sequence
            state.last_cluster_id += 1;
            Cluster {
                id: state.last_cluster_id,
                info: info.clone(),
            }
        };
        self.clusters.push(cluster.clone());
        Ok(cluster)
    }

    async fn insert_server(&mut self, name: &str, cluster: &Cluster) -> Result<Server, OdbError> {
        let server = {
            let mut state = self.lock()?;
            state.check_server(&self.clusters, &self.servers, name, cluster.id)?;
            state.last_server_id += 1;
            Server {
                id: state.last_server_id,
                name: name.to_string(),
                cluster_id: cluster.id,
            }
        };
        self.servers.push(server.clone());
        Ok(server)
    }

    async fn commit(self: Box<Self>) -> Result<(), OdbError> {
        let mut state = self.lock()?;

        // Re-check against rows committed since staging
        for (i, cluster) in self.clusters.iter().enumerate() {
            state.check_cluster(&self.clusters[..i], &cluster.info.name)?;
        }
        for (i, server) in self.servers.iter().enumerate() {
            state.check_server(
                &self.clusters,
                &self.servers[..i],
                &server.name,
                server.cluster_id,
            )?;
        }

        state.clusters.extend(self.clusters.iter().cloned());
        state.servers.extend(self.servers.iter().cloned());
        info!(
            clusters = self.clusters.len(),
            servers = self.servers.len(),
            "Committed in-memory transaction"
        );
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), OdbError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> ClusterInfo {
        seed_info(name.to_string())
    }

    #[tokio::test]
    async fn unreachable_store_fails_ping() {
        let odb = MemoryOdb::unreachable();
        let err = odb.ping().await.unwrap_err();
        assert!(matches!(err, OdbError::Liveness { .. }));

        assert!(MemoryOdb::new().ping().await.is_ok());
    }

    #[tokio::test]
    async fn latest_cluster_name_follows_highest_id() {
        let odb = MemoryOdb::new();
        odb.seed_clusters(["Other-#9", "Q-#5", "Q-#2"]).unwrap();

        // Highest id wins, not highest suffix
        assert_eq!(
            odb.latest_cluster_name("Q").await.unwrap(),
            Some("Q-#2".to_string())
        );
        assert_eq!(odb.latest_cluster_name("Missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn uncommitted_rows_are_invisible() {
        let odb = MemoryOdb::new();
        let mut tx = odb.begin().await.unwrap();
        tx.insert_cluster(&info("staged")).await.unwrap();

        assert!(odb.clusters().is_empty());
        drop(tx);
        assert!(odb.clusters().is_empty());
    }

    #[tokio::test]
    async fn commit_publishes_cluster_and_server() {
        let odb = MemoryOdb::new();
        let mut tx = odb.begin().await.unwrap();
        let cluster = tx.insert_cluster(&info("c1")).await.unwrap();
        let server = tx.insert_server("s1", &cluster).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(odb.clusters(), vec![cluster.clone()]);
        assert_eq!(odb.servers(), vec![server.clone()]);
        assert_eq!(server.cluster_id, cluster.id);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let odb = MemoryOdb::new();
        let seeded = odb.seed_clusters(["taken"]).unwrap();
        odb.seed_server("srv", &seeded[0]).unwrap();

        let mut tx = odb.begin().await.unwrap();
        let err = tx.insert_cluster(&info("taken")).await.unwrap_err();
        assert!(matches!(err, OdbError::UniqueViolation { table: "cluster", .. }));

        let err = tx.insert_server("srv", &seeded[0]).await.unwrap_err();
        assert!(matches!(err, OdbError::UniqueViolation { table: "server", .. }));
    }

    #[tokio::test]
    async fn server_must_reference_existing_cluster() {
        let odb = MemoryOdb::new();
        let phantom = Cluster {
            id: 42,
            info: info("phantom"),
        };

        let mut tx = odb.begin().await.unwrap();
        let err = tx.insert_server("srv", &phantom).await.unwrap_err();
        assert!(matches!(
            err,
            OdbError::MissingReference {
                table: "cluster",
                id: 42
            }
        ));
    }

    #[tokio::test]
    async fn commit_detects_conflicting_concurrent_commit() {
        let odb = MemoryOdb::new();

        let mut first = odb.begin().await.unwrap();
        first.insert_cluster(&info("race")).await.unwrap();

        let mut second = odb.begin().await.unwrap();
        second.insert_cluster(&info("race")).await.unwrap();
        second.commit().await.unwrap();

        let err = first.commit().await.unwrap_err();
        assert!(matches!(err, OdbError::UniqueViolation { .. }));
        assert_eq!(odb.clusters().len(), 1);
    }
}
