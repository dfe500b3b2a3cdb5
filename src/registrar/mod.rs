//! Topology registration: the cluster and server rows
//!
//! Quickstart clusters are named `<prefix>-#<n>`. The next number comes from
//! the most recently inserted matching cluster (highest row id), not from the
//! largest suffix, so renamed or hand-inserted clusters can skew it.

use tracing::info;

use crate::config::{
    QuickstartSettings, QUICKSTART_CLUSTER_DESCRIPTION, QUICKSTART_CLUSTER_PREFIX,
    QUICKSTART_SERVER_PREFIX,
};
use crate::odb::{
    run_in_transaction, Cluster, ClusterInfo, OdbConnection, OdbError, OdbTransaction, Server,
};

/// Compute the next free quickstart cluster name for `prefix`
pub async fn next_cluster_name(odb: &dyn OdbConnection, prefix: &str) -> Result<String, OdbError> {
    let next = match odb.latest_cluster_name(prefix).await? {
        Some(latest) => parse_cluster_number(&latest)?
            .checked_add(1)
            .ok_or(OdbError::InvalidClusterName(latest))?,
        None => 1,
    };
    Ok(format!("{}-#{}", prefix, next))
}

/// The integer after the last `#` of a quickstart cluster name
fn parse_cluster_number(name: &str) -> Result<u64, OdbError> {
    name.rsplit_once('#')
        .and_then(|(_, n)| n.trim().parse().ok())
        .ok_or_else(|| OdbError::InvalidClusterName(name.to_string()))
}

/// Name of the quickstart server belonging to `cluster_name`
///
/// `ZatoQuickstartCluster-#4` gives `ZatoQuickstartServer-(cluster-#4)`.
pub fn server_name_for(cluster_name: &str) -> String {
    let suffix = cluster_name.rsplit_once('#').map(|(_, n)| n).unwrap_or("");
    format!("{}-(cluster-#{})", QUICKSTART_SERVER_PREFIX, suffix)
}

/// Cluster row values for a quickstart run
pub fn cluster_info(name: &str, settings: &QuickstartSettings) -> ClusterInfo {
    ClusterInfo {
        name: name.to_string(),
        description: Some(QUICKSTART_CLUSTER_DESCRIPTION.to_string()),
        odb_type: settings.odb.kind.to_string(),
        odb_host: settings.odb.host.clone(),
        odb_port: settings.odb.port(),
        odb_user: settings.odb.user.clone(),
        odb_db_name: settings.odb.db_name.clone(),
        odb_schema: settings.odb.schema.clone(),
        amqp_host: settings.broker.host.clone(),
        amqp_port: settings.broker.port,
        amqp_user: settings.broker.user.clone(),
        lb_host: settings.lb_agent.host.clone(),
        lb_agent_port: settings.lb_agent.port,
        sec_server_host: settings.security_server.host.clone(),
        sec_server_port: settings.security_server.port,
    }
}

/// Insert one cluster row
pub async fn register_cluster(
    tx: &mut dyn OdbTransaction,
    info: &ClusterInfo,
) -> Result<Cluster, OdbError> {
    tx.insert_cluster(info).await
}

/// Insert one server row referencing `cluster`
pub async fn register_server(
    tx: &mut dyn OdbTransaction,
    name: &str,
    cluster: &Cluster,
) -> Result<Server, OdbError> {
    tx.insert_server(name, cluster).await
}

/// Name and insert the cluster and its server as one unit
///
/// Either both rows are committed or neither is.
pub async fn register_topology(
    odb: &dyn OdbConnection,
    settings: &QuickstartSettings,
) -> Result<(Cluster, Server), OdbError> {
    let cluster_name = next_cluster_name(odb, QUICKSTART_CLUSTER_PREFIX).await?;
    let server_name = server_name_for(&cluster_name);
    let info = cluster_info(&cluster_name, settings);

    let (cluster, server) = run_in_transaction(odb, move |tx| {
        Box::pin(async move {
            let cluster = register_cluster(tx, &info).await?;
            let server = register_server(tx, &server_name, &cluster).await?;
            Ok((cluster, server))
        })
    })
    .await?;

    info!(
        cluster = %cluster.name(),
        cluster_id = cluster.id,
        server = %server.name,
        "Registered topology"
    );
    Ok((cluster, server))
}
