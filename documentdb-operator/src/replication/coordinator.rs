//! Hub-side coordination of a replicated DocumentDB across member clusters.
//!
//! The hub DocumentDB spec is the source of truth for the desired primary.
//! The coordinator never rolls a promotion back: a stalled step is surfaced
//! as a condition and left for the operator (or a later pass) to make
//! progress on.

use crate::{
    apis::documentdb_types::{
        ClusterReplication, DocumentDB, DocumentDBPhase, PromotionStatus, PromotionStep,
        ReplicationRole,
    },
    config::Config,
    controller::{new_condition, patch_ddb_status_merge, upsert_condition, Context},
    replication::{
        placements::{Placement, PlacementSpec},
        token_configmap_name, validate_replication, ReplicationToken,
    },
    service::{exposure_service_name, service_endpoint},
    Error,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::{
    api::{DeleteParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::controller::Action,
    Api, Client, Resource, ResourceExt,
};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Secret (per member cluster) holding a kubeconfig the hub uses to reach it.
pub const FLEET_KUBECONFIG_SECRET_PREFIX: &str = "documentdb-fleet-kubeconfig-";
pub const FLEET_KUBECONFIG_KEY: &str = "kubeconfig";

const PROMOTION_STALL_SECS: i64 = 600;

/// Observed health of one member cluster, as far as the hub can see it.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberHealth {
    pub cluster: String,
    pub reachable: bool,
    pub ready_standby: bool,
    /// Last reported log sequence number, when the member publishes one.
    pub observed_lsn: Option<u64>,
}

/// Parse a Postgres LSN of the form `X/Y` into a comparable integer.
pub fn parse_lsn(lsn: &str) -> Option<u64> {
    let (high, low) = lsn.split_once('/')?;
    let high = u64::from_str_radix(high, 16).ok()?;
    let low = u64::from_str_radix(low, 16).ok()?;
    Some((high << 32) | low)
}

/// Choose the promotion target for automatic failover: the most advanced
/// reachable ready standby, with cluster-list order as the tie break.
pub fn pick_failover_target(candidates: &[MemberHealth]) -> Option<String> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, m)| m.reachable && m.ready_standby)
        .max_by_key(|(idx, m)| (m.observed_lsn.unwrap_or(0), std::cmp::Reverse(*idx)))
        .map(|(_, m)| m.cluster.clone())
}

/// Build a kube client for a member cluster from its fleet kubeconfig secret
/// in the DocumentDB namespace. The hub's own cluster short-circuits to the
/// local client.
pub async fn member_client(
    ddb: &DocumentDB,
    ctx: Arc<Context>,
    cfg: &Config,
    cluster: &str,
) -> Result<Client, Error> {
    if cluster == cfg.cluster_name {
        return Ok(ctx.client.clone());
    }
    let ns = ddb.namespace().unwrap();
    let secret_name = format!("{}{}", FLEET_KUBECONFIG_SECRET_PREFIX, cluster);
    let secret_api: Api<k8s_openapi::api::core::v1::Secret> =
        Api::namespaced(ctx.client.clone(), &ns);
    let secret = secret_api.get(&secret_name).await.map_err(|_e| {
        Error::MemberClusterError(format!("kubeconfig secret {} not found", secret_name))
    })?;
    let raw = secret
        .data
        .as_ref()
        .and_then(|d| d.get(FLEET_KUBECONFIG_KEY))
        .ok_or_else(|| {
            Error::MemberClusterError(format!(
                "kubeconfig secret {} is missing key {}",
                secret_name, FLEET_KUBECONFIG_KEY
            ))
        })?;
    let yaml = String::from_utf8(raw.0.clone())
        .map_err(|e| Error::MemberClusterError(format!("kubeconfig is not UTF-8: {}", e)))?;
    let kubeconfig = Kubeconfig::from_yaml(&yaml)
        .map_err(|e| Error::MemberClusterError(format!("invalid kubeconfig: {}", e)))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::MemberClusterError(format!("kubeconfig rejected: {}", e)))?;
    Client::try_from(config)
        .map_err(|e| Error::MemberClusterError(format!("cannot build client for {}: {}", cluster, e)))
}

async fn get_member_ddb(
    client: Client,
    ns: &str,
    name: &str,
) -> Result<Option<DocumentDB>, Error> {
    let api: Api<DocumentDB> = Api::namespaced(client, ns);
    match api.get(name).await {
        Ok(ddb) => Ok(Some(ddb)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(Error::MemberClusterError(e.to_string())),
    }
}

fn member_is_ready_primary(ddb: &DocumentDB) -> bool {
    let Some(status) = &ddb.status else {
        return false;
    };
    status.phase == DocumentDBPhase::Ready
        && matches!(
            status.replication.as_ref().and_then(|r| r.role.as_ref()),
            Some(ReplicationRole::Primary)
        )
}

fn member_is_ready_standby(ddb: &DocumentDB) -> bool {
    let Some(status) = &ddb.status else {
        return false;
    };
    status.phase == DocumentDBPhase::Ready
        && matches!(
            status.replication.as_ref().and_then(|r| r.role.as_ref()),
            Some(ReplicationRole::Standby { .. })
        )
}

/// Apply the placement descriptor the fleet controller consumes.
#[instrument(skip(ddb, ctx))]
pub async fn reconcile_placement(ddb: &DocumentDB, ctx: Arc<Context>) -> Result<(), Error> {
    let Some(rep) = ddb.spec.replication() else {
        return Ok(());
    };
    let ns = ddb.namespace().unwrap();
    let name = ddb.name_any();
    let oref = ddb.controller_owner_ref(&()).unwrap();
    let mut placement = Placement::new(
        &name,
        PlacementSpec {
            cluster_list: rep.clusterList.clone(),
            resource_kind: "DocumentDB".to_string(),
            resource_name: name.clone(),
        },
    );
    placement.metadata.namespace = Some(ns.clone());
    placement.metadata.owner_references = Some(vec![oref]);

    let api: Api<Placement> = Api::namespaced(ctx.client.clone(), &ns);
    let ps = PatchParams::apply("cntrlr").force();
    api.patch(&name, &ps, &Patch::Apply(&placement))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

async fn publish_token(
    client: Client,
    ns: &str,
    ddb_name: &str,
    token: &ReplicationToken,
) -> Result<(), Error> {
    let name = token_configmap_name(ddb_name);
    let cm = ConfigMap {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.to_string()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                "documentdb".to_string(),
            )])),
            ..Default::default()
        },
        data: Some(token.to_data()),
        ..ConfigMap::default()
    };
    let api: Api<ConfigMap> = Api::namespaced(client, ns);
    let ps = PatchParams::apply("cntrlr").force();
    api.patch(&name, &ps, &Patch::Apply(&cm))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

async fn delete_token(client: Client, ns: &str, ddb_name: &str) -> Result<(), Error> {
    let api: Api<ConfigMap> = Api::namespaced(client, ns);
    match api
        .delete(&token_configmap_name(ddb_name), &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// The routable endpoint of the exposure service inside a member cluster.
async fn member_service_endpoint(
    client: Client,
    ns: &str,
    ddb: &DocumentDB,
) -> Result<Option<String>, Error> {
    let api: Api<Service> = Api::namespaced(client, ns);
    match api.get(&exposure_service_name(ddb)).await {
        Ok(svc) => Ok(service_endpoint(&svc)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(Error::MemberClusterError(e.to_string())),
    }
}

async fn patch_promotion(
    ctx: &Context,
    ns: &str,
    name: &str,
    promotion: &PromotionStatus,
) -> Result<(), Error> {
    let api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), ns);
    patch_ddb_status_merge(
        &api,
        name,
        json!({"status": {"replication": {"promotion": promotion}}}),
    )
    .await
}

fn promotion_started_at(promotion: &PromotionStatus) -> Option<DateTime<Utc>> {
    promotion
        .startedAt
        .as_ref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Hub coordination pass. Returns `Some(action)` while a promotion is being
/// driven, `None` at steady state.
#[instrument(skip(ddb, ctx, cfg), fields(instance_name = %ddb.name_any()))]
pub async fn reconcile_replication(
    ddb: &DocumentDB,
    ctx: Arc<Context>,
    cfg: &Config,
) -> Result<Option<Action>, Error> {
    let Some(rep) = ddb.spec.replication().cloned() else {
        return Ok(None);
    };
    validate_replication(&rep)?;
    reconcile_placement(ddb, ctx.clone()).await?;

    let ns = ddb.namespace().unwrap();
    let name = ddb.name_any();
    let ddb_api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), &ns);

    let desired = rep.primary.clone();
    let observed = ddb.status.as_ref().and_then(|s| s.primary.clone());
    let promotion = ddb
        .status
        .as_ref()
        .and_then(|s| s.replication.as_ref())
        .and_then(|r| r.promotion.clone());

    if promotion.is_none() && observed.as_deref() == Some(desired.as_str()) {
        // Steady state: watch for automatic failover conditions
        return check_automatic_failover(ddb, ctx, cfg, &rep).await;
    }

    // A promotion is required (or already in flight)
    let promotion = match promotion {
        Some(p) if p.target == desired => p,
        _ => {
            // Step 1: record the observed current primary, then drive
            let p = PromotionStatus {
                target: desired.clone(),
                previousPrimary: observed.clone(),
                step: PromotionStep::AwaitTargetReady,
                startedAt: Some(Utc::now().to_rfc3339()),
            };
            patch_promotion(&ctx, &ns, &name, &p).await?;
            info!(
                "Starting promotion of {} from {:?} to {}",
                name, observed, desired
            );
            p
        }
    };

    // A stalled promotion is surfaced, never rolled back
    if let Some(started) = promotion_started_at(&promotion) {
        if (Utc::now() - started).num_seconds() > PROMOTION_STALL_SECS {
            let condition = new_condition(
                "PromotionStalled",
                "True",
                "StepTimeout",
                &format!("promotion blocked at step {}", promotion.step),
                ddb.metadata.generation,
            );
            let conditions = upsert_condition(
                ddb.status.as_ref().and_then(|s| s.conditions.as_ref()),
                condition,
            );
            patch_ddb_status_merge(&ddb_api, &name, json!({"status": {"conditions": conditions}}))
                .await?;
            warn!(
                "Promotion of {} stalled at {}, operator intervention may be needed",
                name, promotion.step
            );
        }
    }

    match promotion.step {
        PromotionStep::AwaitTargetReady => {
            let target_client = member_client(ddb, ctx.clone(), cfg, &desired).await?;
            let member = get_member_ddb(target_client, &ns, &name).await?;
            match member {
                Some(member) if member_is_ready_primary(&member) => {
                    let next = PromotionStatus {
                        step: PromotionStep::PublishToken,
                        ..promotion
                    };
                    patch_promotion(&ctx, &ns, &name, &next).await?;
                    Ok(Some(Action::requeue(Duration::from_secs(1))))
                }
                _ => {
                    debug!("Target {} not ready as primary yet", desired);
                    Ok(Some(Action::requeue(Duration::from_secs(15))))
                }
            }
        }
        PromotionStep::PublishToken => {
            // The token lands in the new primary's namespace just long enough
            // for streaming to resume without a full re-clone.
            let target_client = member_client(ddb, ctx.clone(), cfg, &desired).await?;
            let endpoint =
                member_service_endpoint(target_client.clone(), &ns, ddb).await?;
            let Some(endpoint) = endpoint else {
                debug!("Target {} has no routable endpoint yet", desired);
                return Ok(Some(Action::requeue(Duration::from_secs(15))));
            };
            let token = ReplicationToken {
                host: endpoint,
                port: cfg.engine_port.to_string(),
                lsn: None,
            };
            publish_token(target_client, &ns, &name, &token).await?;
            let next = PromotionStatus {
                step: PromotionStep::AwaitFormerPrimaryStandby,
                ..promotion
            };
            patch_promotion(&ctx, &ns, &name, &next).await?;
            info!("Replication token published for {}", name);
            Ok(Some(Action::requeue(Duration::from_secs(5))))
        }
        PromotionStep::AwaitFormerPrimaryStandby => {
            let former = promotion.previousPrimary.clone();
            let done = match former {
                None => true,
                Some(ref former) => {
                    let former_client = member_client(ddb, ctx.clone(), cfg, former).await?;
                    match get_member_ddb(former_client, &ns, &name).await? {
                        Some(member) => member_is_ready_standby(&member),
                        None => false,
                    }
                }
            };
            if done {
                let next = PromotionStatus {
                    step: PromotionStep::Cleanup,
                    ..promotion
                };
                patch_promotion(&ctx, &ns, &name, &next).await?;
                Ok(Some(Action::requeue(Duration::from_secs(1))))
            } else {
                debug!("Former primary {:?} not yet a standby", promotion.previousPrimary);
                Ok(Some(Action::requeue(Duration::from_secs(15))))
            }
        }
        PromotionStep::Cleanup => {
            let target_client = member_client(ddb, ctx.clone(), cfg, &desired).await?;
            delete_token(target_client, &ns, &name).await?;
            patch_ddb_status_merge(
                &ddb_api,
                &name,
                json!({"status": {
                    "primary": desired,
                    "replication": {"promotion": null},
                }}),
            )
            .await?;
            info!("Promotion of {} to {} converged", name, desired);
            Ok(None)
        }
    }
}

/// Automatic failover: after `failoverAfterSeconds` of primary
/// unreachability, promote the best standby by patching the hub spec. This is
/// the only place the coordinator writes spec.
async fn check_automatic_failover(
    ddb: &DocumentDB,
    ctx: Arc<Context>,
    cfg: &Config,
    rep: &ClusterReplication,
) -> Result<Option<Action>, Error> {
    let Some(window) = rep.failoverAfterSeconds else {
        return Ok(None);
    };
    let ns = ddb.namespace().unwrap();
    let name = ddb.name_any();
    let ddb_api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), &ns);

    let primary_reachable = match member_client(ddb, ctx.clone(), cfg, &rep.primary).await {
        Ok(client) => get_member_ddb(client, &ns, &name).await.is_ok(),
        Err(_) => false,
    };

    let existing = ddb.status.as_ref().and_then(|s| s.conditions.as_ref());
    let reachable_condition = existing
        .and_then(|conds| conds.iter().find(|c| c.type_ == "PrimaryReachable"))
        .cloned();

    if primary_reachable {
        if reachable_condition
            .as_ref()
            .map(|c| c.status != "True")
            .unwrap_or(true)
        {
            let conditions = upsert_condition(
                existing,
                new_condition(
                    "PrimaryReachable",
                    "True",
                    "Probed",
                    "primary member responds",
                    ddb.metadata.generation,
                ),
            );
            patch_ddb_status_merge(&ddb_api, &name, json!({"status": {"conditions": conditions}}))
                .await?;
        }
        return Ok(None);
    }

    // Primary unreachable: start (or continue) the failover clock
    let since = match &reachable_condition {
        Some(c) if c.status == "False" => c.last_transition_time.0,
        _ => {
            let conditions = upsert_condition(
                existing,
                new_condition(
                    "PrimaryReachable",
                    "False",
                    "ProbeFailed",
                    "primary member does not respond",
                    ddb.metadata.generation,
                ),
            );
            patch_ddb_status_merge(&ddb_api, &name, json!({"status": {"conditions": conditions}}))
                .await?;
            return Ok(Some(Action::requeue(Duration::from_secs(30))));
        }
    };

    let elapsed = (Utc::now() - since).num_seconds();
    if elapsed < window {
        let remaining = (window - elapsed).max(10) as u64;
        return Ok(Some(Action::requeue(Duration::from_secs(
            remaining.min(60),
        ))));
    }

    // Window elapsed: gather standby health and pick the target
    let mut candidates = Vec::new();
    for cluster in rep.clusterList.iter().filter(|c| **c != rep.primary) {
        let health = match member_client(ddb, ctx.clone(), cfg, cluster).await {
            Ok(client) => match get_member_ddb(client, &ns, &name).await {
                Ok(Some(member)) => MemberHealth {
                    cluster: cluster.clone(),
                    reachable: true,
                    ready_standby: member_is_ready_standby(&member),
                    observed_lsn: None,
                },
                _ => MemberHealth {
                    cluster: cluster.clone(),
                    reachable: false,
                    ready_standby: false,
                    observed_lsn: None,
                },
            },
            Err(_) => MemberHealth {
                cluster: cluster.clone(),
                reachable: false,
                ready_standby: false,
                observed_lsn: None,
            },
        };
        candidates.push(health);
    }

    let Some(target) = pick_failover_target(&candidates) else {
        error!("No failover target available for {}", name);
        let conditions = upsert_condition(
            existing,
            new_condition(
                "FailoverBlocked",
                "True",
                "NoCandidate",
                "no reachable ready standby to promote",
                ddb.metadata.generation,
            ),
        );
        patch_ddb_status_merge(&ddb_api, &name, json!({"status": {"conditions": conditions}}))
            .await?;
        return Ok(Some(Action::requeue(Duration::from_secs(60))));
    };

    info!(
        "Automatic failover of {}: promoting {} after {}s of primary unreachability",
        name, target, elapsed
    );
    let pp = PatchParams {
        field_manager: Some("cntrlr".to_string()),
        ..PatchParams::default()
    };
    ddb_api
        .patch(
            &name,
            &pp,
            &Patch::Merge(json!({"spec": {"clusterReplication": {"primary": target}}})),
        )
        .await
        .map_err(Error::KubeError)?;
    Ok(Some(Action::requeue(Duration::from_secs(1))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_parses_as_high_low_hex() {
        assert_eq!(parse_lsn("0/3000060"), Some(0x3000060));
        assert_eq!(parse_lsn("16/B374D848"), Some((0x16 << 32) | 0xB374D848));
        assert_eq!(parse_lsn("junk"), None);
        assert_eq!(parse_lsn("1-2"), None);
    }

    fn member(cluster: &str, reachable: bool, ready: bool, lsn: Option<u64>) -> MemberHealth {
        MemberHealth {
            cluster: cluster.to_string(),
            reachable,
            ready_standby: ready,
            observed_lsn: lsn,
        }
    }

    #[test]
    fn failover_prefers_the_most_advanced_standby() {
        let candidates = vec![
            member("a", true, true, Some(100)),
            member("b", true, true, Some(300)),
            member("c", true, true, Some(200)),
        ];
        assert_eq!(pick_failover_target(&candidates), Some("b".to_string()));
    }

    #[test]
    fn failover_skips_unreachable_and_unready_members() {
        let candidates = vec![
            member("a", false, true, Some(500)),
            member("b", true, false, Some(400)),
            member("c", true, true, None),
        ];
        assert_eq!(pick_failover_target(&candidates), Some("c".to_string()));
    }

    #[test]
    fn failover_ties_break_on_cluster_list_order() {
        let candidates = vec![
            member("a", true, true, None),
            member("b", true, true, None),
        ];
        assert_eq!(pick_failover_target(&candidates), Some("a".to_string()));
    }

    #[test]
    fn no_candidate_means_no_target() {
        let candidates = vec![member("a", false, false, None)];
        assert_eq!(pick_failover_target(&candidates), None);
    }

    #[test]
    fn ready_primary_requires_phase_and_role() {
        use crate::apis::documentdb_types::{DocumentDBStatus, ReplicationStatus};
        let mut ddb = DocumentDB::new("sample", Default::default());
        assert!(!member_is_ready_primary(&ddb));
        ddb.status = Some(DocumentDBStatus {
            phase: DocumentDBPhase::Ready,
            replication: Some(ReplicationStatus {
                role: Some(ReplicationRole::Primary),
                promotion: None,
            }),
            ..DocumentDBStatus::default()
        });
        assert!(member_is_ready_primary(&ddb));
        ddb.status.as_mut().unwrap().phase = DocumentDBPhase::Degraded;
        assert!(!member_is_ready_primary(&ddb));
    }
}
