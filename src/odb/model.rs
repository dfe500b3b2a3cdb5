//! Rows written by the quickstart

use serde::Serialize;

/// Column values of a cluster row, everything but the id
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    /// Unique cluster name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// ODB engine name
    pub odb_type: String,
    /// ODB host
    pub odb_host: String,
    /// ODB port
    pub odb_port: u16,
    /// ODB user
    pub odb_user: String,
    /// ODB database name
    pub odb_db_name: String,
    /// ODB schema
    pub odb_schema: Option<String>,
    /// Broker host
    pub amqp_host: String,
    /// Broker port
    pub amqp_port: u16,
    /// Broker user
    pub amqp_user: String,
    /// Load-balancer host
    pub lb_host: String,
    /// Load-balancer agent port
    pub lb_agent_port: u16,
    /// Security server host
    pub sec_server_host: String,
    /// Security server port
    pub sec_server_port: u16,
}

/// A persisted cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cluster {
    /// Row id
    pub id: i64,
    /// Column values
    #[serde(flatten)]
    pub info: ClusterInfo,
}

impl Cluster {
    /// The cluster's unique name
    pub fn name(&self) -> &str {
        &self.info.name
    }
}

/// A persisted server belonging to one cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Server {
    /// Row id
    pub id: i64,
    /// Unique server name
    pub name: String,
    /// Owning cluster
    pub cluster_id: i64,
}
