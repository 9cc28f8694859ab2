use crate::defaults;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An on-demand snapshot of a DocumentDB cluster. Backups are owned by their
/// DocumentDB for tracking but deliberately survive its deletion: the GC
/// routine removes them when their retention expires.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "Backup", group = "documentdb.io", version = "preview", namespaced)]
#[kube(status = "BackupStatus")]
#[allow(non_snake_case)]
pub struct BackupSpec {
    /// Name of the DocumentDB this backup snapshots.
    pub clusterRef: String,
    /// Retention override. Unset inherits from the DocumentDB (or the
    /// built-in default of 30 days).
    pub retentionDays: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq)]
pub enum BackupPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupPhase::Pending => write!(f, "Pending"),
            BackupPhase::Running => write!(f, "Running"),
            BackupPhase::Succeeded => write!(f, "Succeeded"),
            BackupPhase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct BackupStatus {
    #[serde(default)]
    pub phase: BackupPhase,
    pub startedAt: Option<String>,
    pub stoppedAt: Option<String>,
    /// `(stoppedAt | creationTimestamp) + retentionDays * 24h`
    pub expiresAt: Option<String>,
    /// Name of the PGO-level backup object created for this Backup.
    pub snapshotName: Option<String>,
    pub error: Option<String>,
}

/// Creates a Backup on every tick of a cron schedule. Deleting a
/// ScheduledBackup stops further creation but preserves existing children.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "ScheduledBackup",
    group = "documentdb.io",
    version = "preview",
    namespaced
)]
#[kube(status = "ScheduledBackupStatus")]
#[allow(non_snake_case)]
pub struct ScheduledBackupSpec {
    pub clusterRef: String,
    /// Five or six field cron expression; five-field expressions are
    /// normalized by prepending a seconds term.
    pub schedule: String,
    pub retentionDays: Option<i32>,
    pub suspend: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct ScheduledBackupStatus {
    pub lastScheduleTime: Option<String>,
    pub nextScheduleTime: Option<String>,
    pub conditions: Option<Vec<Condition>>,
}

/// Retention precedence: Backup > ScheduledBackup > DocumentDB > built-in.
pub fn effective_retention_days(
    backup_override: Option<i32>,
    scheduled_override: Option<i32>,
    ddb_default: Option<i32>,
) -> i32 {
    backup_override
        .or(scheduled_override)
        .or(ddb_default)
        .unwrap_or_else(defaults::default_retention_days)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_precedence_prefers_the_most_specific() {
        assert_eq!(effective_retention_days(Some(90), Some(14), Some(30)), 90);
        assert_eq!(effective_retention_days(None, Some(14), Some(30)), 14);
        assert_eq!(effective_retention_days(None, None, Some(7)), 7);
        assert_eq!(effective_retention_days(None, None, None), 30);
    }
}
