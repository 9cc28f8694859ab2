use crate::{
    apis::documentdb_types::DocumentDB,
    backups::types::{
        effective_retention_days, Backup, BackupPhase, BackupSpec, ScheduledBackup,
    },
    cloudnativepg::backups::{
        Backup as PgoBackup, BackupCluster, BackupMethod, BackupSpec as PgoBackupSpec,
        PGO_BACKUP_PHASE_COMPLETED, PGO_BACKUP_PHASE_FAILED,
    },
    Context, Error,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use itertools::Itertools;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{
    api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    core::ApiResource,
    runtime::controller::Action,
    Api, Client, Resource, ResourceExt,
};
use lazy_static::lazy_static;
use rand::Rng;
use serde_json::json;
use std::{collections::BTreeMap, str::FromStr, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub const BACKUP_CLUSTER_LABEL: &str = "documentdb.io/cluster";

lazy_static! {
    /// Platforms with a hard-coded snapshot class mapping: environment name
    /// to (class name, CSI driver).
    static ref SNAPSHOT_CLASSES: BTreeMap<&'static str, (&'static str, &'static str)> = {
        let mut m = BTreeMap::new();
        m.insert("aks", ("documentdb-azuredisk-vsc", "disk.csi.azure.com"));
        m.insert("eks", ("documentdb-ebs-vsc", "ebs.csi.aws.com"));
        m.insert("gke", ("documentdb-pd-vsc", "pd.csi.storage.gke.io"));
        m
    };
}

pub fn snapshot_class_for(environment: Option<&str>) -> Option<String> {
    environment
        .and_then(|env| SNAPSHOT_CLASSES.get(env))
        .map(|(class, _)| class.to_string())
}

/// Normalize a cron expression the way users write them: five-field Unix
/// expressions get a seconds term prepended. Anything the cron parser
/// rejects after that is a config error, not a retry.
pub fn normalize_schedule(expression: &str) -> Result<String, Error> {
    let terms: Vec<&str> = expression.split_whitespace().collect();
    let normalized = if terms.len() == 5 {
        format!("0 {}", terms.join(" "))
    } else {
        terms.join(" ")
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::ScheduleError(format!("'{}': {}", expression, e)))?;
    Ok(normalized)
}

pub fn next_tick(expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
    let normalized = normalize_schedule(expression)?;
    let schedule =
        cron::Schedule::from_str(&normalized).map_err(|e| Error::ScheduleError(e.to_string()))?;
    Ok(schedule.after(&after).next())
}

/// `expiresAt = (stoppedAt | creationTimestamp) + retentionDays * 24h`
pub fn compute_expires_at(
    stopped_at: Option<DateTime<Utc>>,
    created: DateTime<Utc>,
    retention_days: i32,
) -> DateTime<Utc> {
    stopped_at.unwrap_or(created) + ChronoDuration::days(retention_days as i64)
}

/// FIFO admission over what the API currently holds: at most one Running
/// Backup per cluster; the next admissible one is the Pending backup that
/// sorts first by (creationTimestamp, name).
pub fn next_admissible(backups: &[Backup]) -> Option<String> {
    let running = backups.iter().any(|b| {
        b.status
            .as_ref()
            .map(|s| s.phase == BackupPhase::Running)
            .unwrap_or(false)
    });
    if running {
        return None;
    }
    backups
        .iter()
        .filter(|b| {
            b.status
                .as_ref()
                .map(|s| s.phase == BackupPhase::Pending)
                .unwrap_or(true)
        })
        .sorted_by_key(|b| {
            (
                b.metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|t| t.0)
                    .unwrap_or_else(Utc::now),
                b.name_any(),
            )
        })
        .next()
        .map(|b| b.name_any())
}

fn volume_snapshot_class_resource() -> ApiResource {
    ApiResource {
        group: "snapshot.storage.k8s.io".to_string(),
        version: "v1".to_string(),
        api_version: "snapshot.storage.k8s.io/v1".to_string(),
        kind: "VolumeSnapshotClass".to_string(),
        plural: "volumesnapshotclasses".to_string(),
    }
}

/// Auto-create the platform snapshot class when we know the driver for the
/// environment. Unknown environments must have one pre-provisioned.
#[instrument(skip(client))]
pub async fn ensure_volume_snapshot_class(
    client: Client,
    environment: Option<&str>,
) -> Result<Option<String>, Error> {
    let Some(env) = environment else {
        return Ok(None);
    };
    let Some((class_name, driver)) = SNAPSHOT_CLASSES.get(env) else {
        debug!("No built-in snapshot class mapping for environment {}", env);
        return Ok(None);
    };

    let api_resource = volume_snapshot_class_resource();
    let api: Api<DynamicObject> = Api::all_with(client, &api_resource);

    match api.get(class_name).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 404 => {
            info!("Creating VolumeSnapshotClass {} for {}", class_name, env);
            let class = DynamicObject {
                types: Some(kube::core::TypeMeta {
                    api_version: api_resource.api_version.clone(),
                    kind: api_resource.kind.clone(),
                }),
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(class_name.to_string()),
                    ..Default::default()
                },
                data: json!({
                    "driver": driver,
                    "deletionPolicy": "Delete"
                }),
            };
            api.create(&PostParams::default(), &class)
                .await
                .map_err(Error::KubeError)?;
        }
        Err(e) => return Err(Error::KubeError(e)),
    }
    Ok(Some(class_name.to_string()))
}

async fn patch_backup_status(
    api: &Api<Backup>,
    name: &str,
    patch: serde_json::Value,
) -> Result<(), Error> {
    let pp = PatchParams {
        field_manager: Some("cntrlr".to_string()),
        ..PatchParams::default()
    };
    api.patch_status(name, &pp, &Patch::Merge(patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

#[instrument(skip(backup, ctx), fields(backup_name = %backup.name_any()))]
pub async fn reconcile_backup(backup: Arc<Backup>, ctx: Arc<Context>) -> Result<Action, Error> {
    let ns = backup.namespace().unwrap();
    let name = backup.name_any();
    let backup_api: Api<Backup> = Api::namespaced(ctx.client.clone(), &ns);
    let phase = backup
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(BackupPhase::Pending);
    let created = backup
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);

    match phase {
        BackupPhase::Succeeded | BackupPhase::Failed => {
            // Terminal: make sure the expiry is pinned, then leave it to GC.
            if backup.status.as_ref().and_then(|s| s.expiresAt.as_ref()).is_none() {
                let stopped = backup
                    .status
                    .as_ref()
                    .and_then(|s| s.stoppedAt.as_ref())
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc));
                let retention = resolve_retention(&backup, ctx.clone(), &ns).await;
                let expires = compute_expires_at(stopped, created, retention);
                patch_backup_status(
                    &backup_api,
                    &name,
                    json!({"status": {"expiresAt": expires.to_rfc3339()}}),
                )
                .await?;
            }
            Ok(Action::await_change())
        }
        BackupPhase::Running => {
            // Mirror the PGO-level snapshot object
            let snapshot_name = backup
                .status
                .as_ref()
                .and_then(|s| s.snapshotName.clone())
                .unwrap_or_else(|| name.clone());
            let pgo_api: Api<PgoBackup> = Api::namespaced(ctx.client.clone(), &ns);
            let pgo = pgo_api.get(&snapshot_name).await.map_err(Error::KubeError)?;
            let pgo_phase = pgo.status.as_ref().and_then(|s| s.phase.clone());
            match pgo_phase.as_deref() {
                Some(PGO_BACKUP_PHASE_COMPLETED) => {
                    let stopped = pgo
                        .status
                        .as_ref()
                        .and_then(|s| s.stopped_at.clone())
                        .unwrap_or_else(|| Utc::now().to_rfc3339());
                    let stopped_ts = DateTime::parse_from_rfc3339(&stopped)
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                    let retention = resolve_retention(&backup, ctx.clone(), &ns).await;
                    let expires = compute_expires_at(stopped_ts, created, retention);
                    patch_backup_status(
                        &backup_api,
                        &name,
                        json!({"status": {
                            "phase": BackupPhase::Succeeded,
                            "stoppedAt": stopped,
                            "expiresAt": expires.to_rfc3339(),
                        }}),
                    )
                    .await?;
                    info!("Backup {} completed", name);
                    Ok(Action::await_change())
                }
                Some(PGO_BACKUP_PHASE_FAILED) => {
                    let error_detail = pgo.status.as_ref().and_then(|s| s.error.clone());
                    let retention = resolve_retention(&backup, ctx.clone(), &ns).await;
                    let expires = compute_expires_at(None, created, retention);
                    patch_backup_status(
                        &backup_api,
                        &name,
                        json!({"status": {
                            "phase": BackupPhase::Failed,
                            "stoppedAt": Utc::now().to_rfc3339(),
                            "expiresAt": expires.to_rfc3339(),
                            "error": error_detail,
                        }}),
                    )
                    .await?;
                    warn!("Backup {} failed", name);
                    Ok(Action::await_change())
                }
                _ => Ok(Action::requeue(Duration::from_secs(30))),
            }
        }
        BackupPhase::Pending => {
            let ddb_api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), &ns);
            let ddb = match ddb_api.get(&backup.spec.clusterRef).await {
                Ok(ddb) => ddb,
                Err(_) => {
                    let retention = backup.spec.retentionDays.unwrap_or(30);
                    let expires = compute_expires_at(None, created, retention);
                    patch_backup_status(
                        &backup_api,
                        &name,
                        json!({"status": {
                            "phase": BackupPhase::Failed,
                            "stoppedAt": Utc::now().to_rfc3339(),
                            "expiresAt": expires.to_rfc3339(),
                            "error": format!("DocumentDB {} not found", backup.spec.clusterRef),
                        }}),
                    )
                    .await?;
                    return Ok(Action::await_change());
                }
            };

            ensure_volume_snapshot_class(ctx.client.clone(), ddb.spec.environment.as_deref())
                .await?;

            // One Running backup per cluster; everyone else queues FIFO
            let lp = ListParams::default();
            let all = backup_api.list(&lp).await.map_err(Error::KubeError)?;
            let peers: Vec<Backup> = all
                .items
                .into_iter()
                .filter(|b| b.spec.clusterRef == backup.spec.clusterRef)
                .collect();
            match next_admissible(&peers) {
                Some(admitted) if admitted == name => {}
                _ => {
                    debug!("Backup {} waiting for its turn", name);
                    return Ok(Action::requeue(Duration::from_secs(30)));
                }
            }

            // Materialize the PGO-level snapshot, owned by this Backup so the
            // snapshot follows its deletion.
            let mut pgo = PgoBackup::new(
                &name,
                PgoBackupSpec {
                    cluster: BackupCluster {
                        name: backup.spec.clusterRef.clone(),
                    },
                    method: Some(BackupMethod::VolumeSnapshot),
                },
            );
            pgo.metadata.namespace = Some(ns.clone());
            pgo.metadata.owner_references =
                Some(vec![backup.controller_owner_ref(&()).unwrap()]);
            let pgo_api: Api<PgoBackup> = Api::namespaced(ctx.client.clone(), &ns);
            let ps = PatchParams::apply("cntrlr").force();
            pgo_api
                .patch(&name, &ps, &Patch::Apply(&pgo))
                .await
                .map_err(Error::KubeError)?;

            patch_backup_status(
                &backup_api,
                &name,
                json!({"status": {
                    "phase": BackupPhase::Running,
                    "startedAt": Utc::now().to_rfc3339(),
                    "snapshotName": name,
                }}),
            )
            .await?;
            info!("Backup {} admitted and running", name);
            Ok(Action::requeue(Duration::from_secs(30)))
        }
    }
}

/// Retention for a Backup: its own override, else the DocumentDB's default,
/// else 30. The ScheduledBackup layer of the precedence chain was already
/// applied when the child Backup was created.
async fn resolve_retention(backup: &Backup, ctx: Arc<Context>, ns: &str) -> i32 {
    if let Some(days) = backup.spec.retentionDays {
        return days;
    }
    let ddb_api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), ns);
    let ddb_default = ddb_api
        .get(&backup.spec.clusterRef)
        .await
        .ok()
        .map(|ddb| ddb.spec.backup.retentionDays);
    effective_retention_days(None, None, ddb_default)
}

pub fn backup_error_policy(backup: Arc<Backup>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!("backup reconcile failed for {}: {:?}", backup.name_any(), error);
    Action::requeue(Duration::from_secs(60))
}

#[instrument(skip(sb, ctx), fields(scheduled_backup = %sb.name_any()))]
pub async fn reconcile_scheduled_backup(
    sb: Arc<ScheduledBackup>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let ns = sb.namespace().unwrap();
    let name = sb.name_any();
    let sb_api: Api<ScheduledBackup> = Api::namespaced(ctx.client.clone(), &ns);

    if sb.spec.suspend.unwrap_or(false) {
        debug!("ScheduledBackup {} is suspended", name);
        return Ok(Action::await_change());
    }

    let schedule = match normalize_schedule(&sb.spec.schedule) {
        Ok(s) => s,
        Err(e) => {
            // Config-class: record and wait for a spec change
            let condition = Condition {
                type_: "ValidSchedule".to_string(),
                status: "False".to_string(),
                reason: "InvalidCron".to_string(),
                message: e.to_string(),
                last_transition_time: Time(Utc::now()),
                observed_generation: sb.metadata.generation,
            };
            let pp = PatchParams {
                field_manager: Some("cntrlr".to_string()),
                ..PatchParams::default()
            };
            sb_api
                .patch_status(
                    &name,
                    &pp,
                    &Patch::Merge(json!({"status": {"conditions": [condition]}})),
                )
                .await
                .map_err(Error::KubeError)?;
            error!("ScheduledBackup {} has an invalid schedule: {}", name, e);
            return Ok(Action::await_change());
        }
    };

    let created = sb
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);
    let from = sb
        .status
        .as_ref()
        .and_then(|s| s.lastScheduleTime.as_ref())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(created);

    let now = Utc::now();
    let next = match next_tick(&schedule, from)? {
        Some(t) => t,
        None => return Ok(Action::await_change()),
    };

    if next <= now {
        let backup_name = format!("{}-{}", name, next.format("%Y%m%d%H%M%S"));
        let mut child = Backup::new(
            &backup_name,
            BackupSpec {
                clusterRef: sb.spec.clusterRef.clone(),
                retentionDays: sb.spec.retentionDays,
            },
        );
        child.metadata.namespace = Some(ns.clone());
        // Tracking label only: children must survive ScheduledBackup deletion
        child.metadata.labels = Some(BTreeMap::from([(
            BACKUP_CLUSTER_LABEL.to_string(),
            sb.spec.clusterRef.clone(),
        )]));
        let backup_api: Api<Backup> = Api::namespaced(ctx.client.clone(), &ns);
        match backup_api.create(&PostParams::default(), &child).await {
            Ok(_) => info!("ScheduledBackup {} created Backup {}", name, backup_name),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("Backup {} already exists for this tick", backup_name)
            }
            Err(e) => return Err(Error::KubeError(e)),
        }

        let pp = PatchParams {
            field_manager: Some("cntrlr".to_string()),
            ..PatchParams::default()
        };
        sb_api
            .patch_status(
                &name,
                &pp,
                &Patch::Merge(json!({"status": {"lastScheduleTime": next.to_rfc3339()}})),
            )
            .await
            .map_err(Error::KubeError)?;
        // Catch up one tick per pass
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let pp = PatchParams {
        field_manager: Some("cntrlr".to_string()),
        ..PatchParams::default()
    };
    sb_api
        .patch_status(
            &name,
            &pp,
            &Patch::Merge(json!({"status": {"nextScheduleTime": next.to_rfc3339()}})),
        )
        .await
        .map_err(Error::KubeError)?;
    let wait = (next - now).num_seconds().max(1) as u64;
    Ok(Action::requeue(Duration::from_secs(wait)))
}

pub fn scheduled_backup_error_policy(
    sb: Arc<ScheduledBackup>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(
        "scheduled backup reconcile failed for {}: {:?}",
        sb.name_any(),
        error
    );
    Action::requeue(Duration::from_secs(60))
}

pub fn is_expired(backup: &Backup, now: DateTime<Utc>) -> bool {
    backup
        .status
        .as_ref()
        .and_then(|s| s.expiresAt.as_ref())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc) < now)
        .unwrap_or(false)
}

/// Delete every Backup whose retention has lapsed. The PGO-level snapshot
/// cascades through the owner reference.
#[instrument(skip(client))]
pub async fn gc_expired_backups(client: Client) -> Result<usize, Error> {
    let api: Api<Backup> = Api::all(client.clone());
    let backups = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;
    let now = Utc::now();
    let mut deleted = 0;
    for backup in backups.items.iter().filter(|b| is_expired(b, now)) {
        let ns = backup.namespace().unwrap();
        let name = backup.name_any();
        let ns_api: Api<Backup> = Api::namespaced(client.clone(), &ns);
        match ns_api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("GC deleted expired backup {}/{}", ns, name);
                deleted += 1;
            }
            Err(e) => warn!("GC failed to delete backup {}/{}: {}", ns, name, e),
        }
    }
    Ok(deleted)
}

/// Periodic GC loop with jitter so multiple replicas do not stampede.
pub async fn run_backup_gc(client: Client) {
    loop {
        let jitter = rand::thread_rng().gen_range(0..60);
        tokio::time::sleep(Duration::from_secs(300 + jitter)).await;
        if let Err(e) = gc_expired_backups(client.clone()).await {
            error!("Backup GC pass failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backups::types::BackupStatus;

    fn backup(name: &str, cluster: &str, created_secs: i64, phase: Option<BackupPhase>) -> Backup {
        use chrono::TimeZone;
        let mut b = Backup::new(
            name,
            BackupSpec {
                clusterRef: cluster.to_string(),
                retentionDays: None,
            },
        );
        b.metadata.creation_timestamp = Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap()));
        b.status = phase.map(|p| BackupStatus {
            phase: p,
            ..BackupStatus::default()
        });
        b
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert_eq!(normalize_schedule("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(
            normalize_schedule("0 0 0 * * *").unwrap(),
            "0 0 0 * * *"
        );
    }

    #[test]
    fn invalid_cron_is_a_config_error() {
        assert!(matches!(
            normalize_schedule("not a cron"),
            Err(Error::ScheduleError(_))
        ));
        assert!(matches!(normalize_schedule(""), Err(Error::ScheduleError(_))));
    }

    #[test]
    fn next_tick_walks_the_schedule() {
        let from = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = next_tick("*/5 * * * *", from).unwrap().unwrap();
        assert_eq!(next.to_rfc3339(), "2026-01-01T00:05:00+00:00");
    }

    #[test]
    fn expires_at_prefers_stopped_at() {
        let created = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let stopped = DateTime::parse_from_rfc3339("2026-01-01T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            compute_expires_at(Some(stopped), created, 1).to_rfc3339(),
            "2026-01-02T06:00:00+00:00"
        );
        assert_eq!(
            compute_expires_at(None, created, 90).to_rfc3339(),
            "2026-04-01T00:00:00+00:00"
        );
    }

    #[test]
    fn admission_is_fifo_with_name_tie_break() {
        let backups = vec![
            backup("b-later", "c1", 200, None),
            backup("b-two", "c1", 100, None),
            backup("b-one", "c1", 100, None),
        ];
        // same creation time: lexicographic name wins
        assert_eq!(next_admissible(&backups), Some("b-one".to_string()));
    }

    #[test]
    fn nothing_is_admitted_while_one_runs() {
        let backups = vec![
            backup("b-running", "c1", 100, Some(BackupPhase::Running)),
            backup("b-waiting", "c1", 200, None),
        ];
        assert_eq!(next_admissible(&backups), None);
    }

    #[test]
    fn terminal_backups_do_not_block_admission() {
        let backups = vec![
            backup("b-done", "c1", 100, Some(BackupPhase::Succeeded)),
            backup("b-next", "c1", 200, Some(BackupPhase::Pending)),
        ];
        assert_eq!(next_admissible(&backups), Some("b-next".to_string()));
    }

    #[test]
    fn expired_backups_are_detected() {
        let mut b = backup("b", "c1", 100, Some(BackupPhase::Succeeded));
        assert!(!is_expired(&b, Utc::now()));
        b.status.as_mut().unwrap().expiresAt = Some("2020-01-01T00:00:00Z".to_string());
        assert!(is_expired(&b, Utc::now()));
        b.status.as_mut().unwrap().expiresAt = Some("2999-01-01T00:00:00Z".to_string());
        assert!(!is_expired(&b, Utc::now()));
    }

    #[test]
    fn known_environments_map_to_snapshot_classes() {
        assert_eq!(
            snapshot_class_for(Some("aks")),
            Some("documentdb-azuredisk-vsc".to_string())
        );
        assert_eq!(snapshot_class_for(Some("bare-metal")), None);
        assert_eq!(snapshot_class_for(None), None);
    }
}
