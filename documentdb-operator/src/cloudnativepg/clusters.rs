// Hand-carried subset of the CNPG Cluster CRD, kept in the generated style.
// Only the fields this operator reads or writes are present; the PGO owns the
// full schema.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ClusterSpec defines the desired state of a PGO-managed Postgres cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters"
)]
#[kube(namespaced)]
#[kube(status = "ClusterStatus")]
pub struct ClusterSpec {
    /// Number of instances required in the cluster
    pub instances: i64,
    /// Name of the container image
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "imageName")]
    pub image_name: Option<String>,
    /// Instructions to bootstrap this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<ClusterBootstrap>,
    /// Replica cluster configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica: Option<ClusterReplicaCluster>,
    /// The list of external clusters which are used in the configuration
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "externalClusters"
    )]
    pub external_clusters: Option<Vec<ClusterExternalClusters>>,
    /// Configuration of the storage of the instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ClusterStorage>,
    /// The configuration for the CA and related certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<ClusterCertificates>,
    /// The plugins configuration, injected into the operand pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<ClusterPlugins>>,
    /// The configuration to be used for backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<ClusterBackup>,
}

/// Instructions to bootstrap this cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBootstrap {
    /// Bootstrap the cluster via initdb
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initdb: Option<ClusterBootstrapInitdb>,
    /// Bootstrap the cluster from a backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<ClusterBootstrapRecovery>,
}

/// Bootstrap the cluster via initdb
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBootstrapInitdb {
    /// Name of the database used by the application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Name of the owner of the database in the instance to be used by applications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Bootstrap the cluster from a backup
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBootstrapRecovery {
    /// The backup object containing the physical base backup to recover from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<ClusterBootstrapRecoveryBackup>,
    /// The external cluster whose backup we will restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The backup object containing the physical base backup to recover from
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBootstrapRecoveryBackup {
    pub name: String,
}

/// Replica cluster configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterReplicaCluster {
    /// If replica mode is enabled, this cluster will be a replica of an existing cluster
    pub enabled: bool,
    /// The name of the external cluster which is the replication origin
    pub source: String,
}

/// An external cluster reachable through its connection parameters
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterExternalClusters {
    /// The server name, required
    pub name: String,
    /// The list of connection parameters, such as dbname, host, username, etc
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "connectionParameters"
    )]
    pub connection_parameters: Option<BTreeMap<String, String>>,
    /// The reference to the password to be used to connect to the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<ClusterExternalClustersPassword>,
}

/// The reference to the password to be used to connect to the server
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterExternalClustersPassword {
    /// The name of the secret in the pod's namespace to select from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The key of the secret to select from
    pub key: String,
}

/// Configuration of the storage of the instances
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterStorage {
    /// Size of the storage. Required if not already specified in the PVC template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Resize existent PVCs, defaults to true
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "resizeInUseVolumes"
    )]
    pub resize_in_use_volumes: Option<bool>,
    /// StorageClass to use for PVCs
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "storageClass"
    )]
    pub storage_class: Option<String>,
}

/// The configuration for the CA and related certificates
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterCertificates {
    /// The secret containing the Server CA certificate
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "serverCASecret"
    )]
    pub server_ca_secret: Option<String>,
    /// The secret of type kubernetes.io/tls containing the server TLS certificate and key
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "serverTLSSecret"
    )]
    pub server_tls_secret: Option<String>,
}

/// A plugin that will be loaded by the PGO for this cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterPlugins {
    /// Name is the plugin name
    pub name: String,
    /// Enabled is true if this plugin will be used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Parameters is the configuration of the plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
}

/// The configuration to be used for backups
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBackup {
    /// Volume snapshot configuration
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "volumeSnapshot"
    )]
    pub volume_snapshot: Option<ClusterBackupVolumeSnapshot>,
}

/// Volume snapshot configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterBackupVolumeSnapshot {
    /// VolumeSnapshotClass to use for the snapshots
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "className"
    )]
    pub class_name: Option<String>,
}

/// ClusterStatus defines the observed state of Cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterStatus {
    /// The cluster phase, e.g. "Cluster in healthy state"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Current primary instance
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "currentPrimary"
    )]
    pub current_primary: Option<String>,
    /// The total number of instances in the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<i64>,
    /// The number of ready instances in the cluster
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "readyInstances"
    )]
    pub ready_instances: Option<i64>,
}

pub const CLUSTER_PHASE_HEALTHY: &str = "Cluster in healthy state";

impl Cluster {
    /// A cluster is Ready once the PGO reports the healthy phase and every
    /// requested instance is ready.
    pub fn is_ready(&self) -> bool {
        match &self.status {
            Some(status) => {
                status.phase.as_deref() == Some(CLUSTER_PHASE_HEALTHY)
                    && status.ready_instances.unwrap_or(0) >= self.spec.instances
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_without_status_is_not_ready() {
        let cluster = Cluster::new("sample", ClusterSpec::default());
        assert!(!cluster.is_ready());
    }

    #[test]
    fn cluster_is_ready_when_healthy_and_all_instances_up() {
        let mut cluster = Cluster::new(
            "sample",
            ClusterSpec {
                instances: 2,
                ..ClusterSpec::default()
            },
        );
        cluster.status = Some(ClusterStatus {
            phase: Some(CLUSTER_PHASE_HEALTHY.to_string()),
            current_primary: Some("sample-1".to_string()),
            instances: Some(2),
            ready_instances: Some(2),
        });
        assert!(cluster.is_ready());

        cluster.status.as_mut().unwrap().ready_instances = Some(1);
        assert!(!cluster.is_ready());
    }
}
