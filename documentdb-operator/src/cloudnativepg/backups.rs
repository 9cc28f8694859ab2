// Hand-carried subset of the CNPG Backup CRD, kept in the generated style.
// This is the PGO-level snapshot object our Backup controller drives.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BackupSpec defines the desired state of a PGO-level backup.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Backup",
    plural = "backups"
)]
#[kube(namespaced)]
#[kube(status = "BackupStatus")]
pub struct BackupSpec {
    /// The cluster to back up
    pub cluster: BackupCluster,
    /// The backup method to be used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<BackupMethod>,
}

/// The cluster to back up
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct BackupCluster {
    pub name: String,
}

/// The backup method to be used
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub enum BackupMethod {
    #[default]
    #[serde(rename = "volumeSnapshot")]
    VolumeSnapshot,
    #[serde(rename = "barmanObjectStore")]
    BarmanObjectStore,
}

/// BackupStatus defines the observed state of a PGO-level backup.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct BackupStatus {
    /// The backup phase: started, running, completed, failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// When the backup was started
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "startedAt")]
    pub started_at: Option<String>,
    /// When the backup was terminated
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "stoppedAt")]
    pub stopped_at: Option<String>,
    /// Detail about an eventual error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub const PGO_BACKUP_PHASE_COMPLETED: &str = "completed";
pub const PGO_BACKUP_PHASE_FAILED: &str = "failed";
