use crate::{
    apis::documentdb_types::{DocumentDB, ReplicationRole},
    backups::{manager::snapshot_class_for, types::Backup as DocumentDBBackup},
    cloudnativepg::clusters::{
        Cluster, ClusterBackup, ClusterBackupVolumeSnapshot, ClusterBootstrap,
        ClusterBootstrapInitdb, ClusterBootstrapRecovery, ClusterBootstrapRecoveryBackup,
        ClusterCertificates, ClusterExternalClusters, ClusterExternalClustersPassword,
        ClusterPlugins, ClusterReplicaCluster, ClusterSpec, ClusterStorage,
    },
    config::Config,
    replication::{ReplicationToken, EXTERNAL_ORIGIN_NAME},
    secret::CREDENTIAL_PASSWORD_KEY,
    service::exposure_service_name,
    Context, Error,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, Resource, ResourceExt,
};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, error, instrument};

pub const SIDECAR_INJECTOR_PLUGIN_NAME: &str = "documentdb-sidecar-injector";

/// Parameter keys of the sidecar injector plugin block. The gateway plugin
/// reads exactly these.
pub const PARAM_GATEWAY_IMAGE: &str = "gatewayImage";
pub const PARAM_GATEWAY_TLS_SECRET: &str = "gatewayTLSSecret";
pub const PARAM_CREDENTIAL_SECRET: &str = "credentialSecret";
pub const PARAM_LABELS: &str = "labels";
pub const PARAM_ANNOTATIONS: &str = "annotations";

/// Everything the composition needs beyond the DocumentDB itself. Resolved by
/// the reconciler before the cluster is built so composition stays pure.
pub struct ClusterInputs {
    /// TLS secret mounted by the Postgres pods and handed to the gateway.
    pub tls_secret: String,
    /// PGO-level backup object to bootstrap from, if recovering.
    pub recovery_snapshot: Option<String>,
    /// Role of this member cluster; None outside a fleet.
    pub role: Option<ReplicationRole>,
    /// Streaming origin published during a promotion, overriding the
    /// steady-state origin host.
    pub token: Option<ReplicationToken>,
}

/// The effective engine image: explicit spec, then process-wide default.
pub fn effective_image(ddb: &DocumentDB, cfg: &Config) -> String {
    if ddb.spec.documentDBImage.is_empty() {
        cfg.documentdb_image.clone()
    } else {
        ddb.spec.documentDBImage.clone()
    }
}

pub fn effective_gateway_image(ddb: &DocumentDB, cfg: &Config) -> String {
    match &ddb.spec.gatewayImage {
        Some(image) if !image.is_empty() => image.clone(),
        _ => cfg.gateway_image.clone(),
    }
}

/// Name of the Postgres cluster backing a logical node. Node 0 keeps the
/// DocumentDB name so single-node clusters stay unprefixed.
pub fn node_cluster_name(ddb: &DocumentDB, node: i32) -> String {
    if node == 0 {
        ddb.name_any()
    } else {
        format!("{}-node-{}", ddb.name_any(), node)
    }
}

fn plugin_parameters(ddb: &DocumentDB, cfg: &Config, tls_secret: &str) -> BTreeMap<String, String> {
    let labels = json!({
        "app": "documentdb",
        "documentdb.io/name": ddb.name_any(),
    });
    let annotations = json!({
        "documentdb.io/gateway-port": cfg.gateway_port.to_string(),
    });

    let mut parameters = BTreeMap::new();
    parameters.insert(
        PARAM_GATEWAY_IMAGE.to_string(),
        effective_gateway_image(ddb, cfg),
    );
    parameters.insert(PARAM_GATEWAY_TLS_SECRET.to_string(), tls_secret.to_string());
    parameters.insert(
        PARAM_CREDENTIAL_SECRET.to_string(),
        ddb.spec.documentDbCredentialSecret.clone(),
    );
    parameters.insert(PARAM_LABELS.to_string(), labels.to_string());
    parameters.insert(PARAM_ANNOTATIONS.to_string(), annotations.to_string());
    parameters
}

fn cluster_bootstrap(
    ddb: &DocumentDB,
    inputs: &ClusterInputs,
) -> (Option<ClusterBootstrap>, Option<Vec<ClusterExternalClusters>>, Option<ClusterReplicaCluster>) {
    // Recovery from a snapshot wins over everything else
    if let Some(snapshot) = &inputs.recovery_snapshot {
        let bootstrap = ClusterBootstrap {
            recovery: Some(ClusterBootstrapRecovery {
                backup: Some(ClusterBootstrapRecoveryBackup {
                    name: snapshot.clone(),
                }),
                source: None,
            }),
            ..ClusterBootstrap::default()
        };
        return (Some(bootstrap), None, None);
    }

    // A standby member streams from the primary member's exposure endpoint
    if let Some(ReplicationRole::Standby { of: _ }) = &inputs.role {
        let (host, port) = match &inputs.token {
            Some(token) => (token.host.clone(), token.port.clone()),
            // Steady state: fleet placement materializes the DocumentDB under
            // the same name everywhere, so the origin is its service DNS.
            None => (
                format!(
                    "{}.{}.svc",
                    exposure_service_name(ddb),
                    ddb.namespace().unwrap()
                ),
                "5432".to_string(),
            ),
        };
        let mut connection_parameters = BTreeMap::new();
        connection_parameters.insert("host".to_string(), host);
        connection_parameters.insert("port".to_string(), port);
        connection_parameters.insert("user".to_string(), "streaming_replica".to_string());
        connection_parameters.insert("sslmode".to_string(), "require".to_string());

        let origin = ClusterExternalClusters {
            name: EXTERNAL_ORIGIN_NAME.to_string(),
            connection_parameters: Some(connection_parameters),
            password: Some(ClusterExternalClustersPassword {
                name: Some(ddb.spec.documentDbCredentialSecret.clone()),
                key: CREDENTIAL_PASSWORD_KEY.to_string(),
            }),
        };
        let bootstrap = ClusterBootstrap {
            recovery: Some(ClusterBootstrapRecovery {
                backup: None,
                source: Some(EXTERNAL_ORIGIN_NAME.to_string()),
            }),
            ..ClusterBootstrap::default()
        };
        let replica = ClusterReplicaCluster {
            enabled: true,
            source: EXTERNAL_ORIGIN_NAME.to_string(),
        };
        return (Some(bootstrap), Some(vec![origin]), Some(replica));
    }

    let bootstrap = ClusterBootstrap {
        initdb: Some(ClusterBootstrapInitdb {
            database: Some("documentdb".to_string()),
            owner: Some("documentdb".to_string()),
        }),
        ..ClusterBootstrap::default()
    };
    (Some(bootstrap), None, None)
}

#[instrument(skip(ddb, cfg, inputs))]
pub fn cnpg_cluster_from_ddb(
    ddb: &DocumentDB,
    cfg: &Config,
    inputs: &ClusterInputs,
    node: i32,
) -> Cluster {
    let name = node_cluster_name(ddb, node);
    let namespace = ddb.namespace().unwrap();
    let owner_reference = ddb.controller_owner_ref(&()).unwrap();

    let (bootstrap, external_clusters, replica) = cluster_bootstrap(ddb, inputs);
    let storage = Some(ClusterStorage {
        size: Some(ddb.spec.resource.storage.pvcSize.0.clone()),
        resize_in_use_volumes: Some(true),
        storage_class: None,
    });
    let backup = snapshot_class_for(ddb.spec.environment.as_deref()).map(|class| ClusterBackup {
        volume_snapshot: Some(ClusterBackupVolumeSnapshot {
            class_name: Some(class),
        }),
    });

    Cluster {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            owner_references: Some(vec![owner_reference]),
            ..ObjectMeta::default()
        },
        spec: ClusterSpec {
            instances: ddb.spec.instancesPerNode as i64,
            image_name: Some(effective_image(ddb, cfg)),
            bootstrap,
            replica,
            external_clusters,
            storage,
            certificates: Some(ClusterCertificates {
                server_tls_secret: Some(inputs.tls_secret.clone()),
                server_ca_secret: None,
            }),
            plugins: Some(vec![ClusterPlugins {
                name: SIDECAR_INJECTOR_PLUGIN_NAME.to_string(),
                enabled: Some(true),
                parameters: Some(plugin_parameters(ddb, cfg, &inputs.tls_secret)),
            }]),
            backup,
        },
        status: None,
    }
}

/// Resolve the Backup referenced by `bootstrap.recovery`. Absence is a
/// Config-class error; an existing but unfinished backup is a wait.
#[instrument(skip(ddb, ctx))]
pub async fn resolve_bootstrap_backup(
    ddb: &DocumentDB,
    ctx: Arc<Context>,
) -> Result<Option<DocumentDBBackup>, Error> {
    let Some(backup_name) = ddb.spec.recovery_backup() else {
        return Ok(None);
    };
    let ns = ddb.namespace().unwrap();
    let backup_api: Api<DocumentDBBackup> = Api::namespaced(ctx.client.clone(), &ns);
    match backup_api.get(backup_name).await {
        Ok(backup) => Ok(Some(backup)),
        Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::BackupNotFoundError(
            format!("{}/{}", ns, backup_name),
        )),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[instrument(skip(ddb, ctx, cfg, inputs), fields(trace_id))]
pub async fn reconcile_cnpg(
    ddb: &DocumentDB,
    ctx: Arc<Context>,
    cfg: &Config,
    inputs: &ClusterInputs,
) -> Result<(), Action> {
    let namespace = ddb.namespace().unwrap();
    let cluster_api: Api<Cluster> = Api::namespaced(ctx.client.clone(), namespace.as_str());

    // Additional logical nodes are gated behind the scaling controller
    let node_count = if cfg.enable_scaling_controller {
        ddb.spec.nodeCount.max(1)
    } else {
        1
    };

    for node in 0..node_count {
        let cluster = cnpg_cluster_from_ddb(ddb, cfg, inputs, node);
        let name = cluster
            .metadata
            .name
            .clone()
            .expect("CNPG Cluster should always have a name");
        debug!("Patching cluster {}", name);
        let ps = PatchParams::apply("cntrlr");
        let _o = cluster_api
            .patch(&name, &ps, &Patch::Apply(&cluster))
            .await
            .map_err(|e| {
                error!("Error patching cluster {}: {}", name, e);
                Action::requeue(Duration::from_secs(300))
            })?;
    }
    debug!("Applied");
    Ok(())
}

/// Fetch the current state of the node-0 Postgres cluster, if it exists.
pub async fn get_cluster(ddb: &DocumentDB, ctx: Arc<Context>) -> Result<Option<Cluster>, Error> {
    let namespace = ddb.namespace().unwrap();
    let cluster_api: Api<Cluster> = Api::namespaced(ctx.client.clone(), namespace.as_str());
    match cluster_api.get(&node_cluster_name(ddb, 0)).await {
        Ok(cluster) => Ok(Some(cluster)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::documentdb_types::ServiceType;

    fn test_ddb() -> DocumentDB {
        let mut ddb = DocumentDB::new("sample", Default::default());
        ddb.metadata.namespace = Some("default".to_string());
        ddb.metadata.uid = Some("752d59ef-2671-4890-9feb-0097459b18c8".to_string());
        ddb
    }

    fn base_inputs() -> ClusterInputs {
        ClusterInputs {
            tls_secret: "sample-server-tls".to_string(),
            recovery_snapshot: None,
            role: None,
            token: None,
        }
    }

    #[test]
    fn image_precedence_prefers_the_spec() {
        let cfg = Config::default();
        let mut ddb = test_ddb();
        assert_eq!(effective_image(&ddb, &cfg), cfg.documentdb_image);
        ddb.spec.documentDBImage = "example.com/engine:1".to_string();
        assert_eq!(effective_image(&ddb, &cfg), "example.com/engine:1");
    }

    #[test]
    fn fresh_cluster_bootstraps_with_initdb() {
        let ddb = test_ddb();
        let cluster = cnpg_cluster_from_ddb(&ddb, &Config::default(), &base_inputs(), 0);
        assert_eq!(cluster.metadata.name.as_deref(), Some("sample"));
        let bootstrap = cluster.spec.bootstrap.unwrap();
        assert!(bootstrap.initdb.is_some());
        assert!(bootstrap.recovery.is_none());
        assert!(cluster.spec.replica.is_none());
    }

    #[test]
    fn recovery_bootstrap_references_the_snapshot() {
        let ddb = test_ddb();
        let mut inputs = base_inputs();
        inputs.recovery_snapshot = Some("b1".to_string());
        let cluster = cnpg_cluster_from_ddb(&ddb, &Config::default(), &inputs, 0);
        let recovery = cluster.spec.bootstrap.unwrap().recovery.unwrap();
        assert_eq!(recovery.backup.unwrap().name, "b1");
    }

    #[test]
    fn standby_member_streams_from_the_origin() {
        let ddb = test_ddb();
        let mut inputs = base_inputs();
        inputs.role = Some(ReplicationRole::Standby {
            of: "cluster-a".to_string(),
        });
        let cluster = cnpg_cluster_from_ddb(&ddb, &Config::default(), &inputs, 0);
        assert!(cluster.spec.replica.as_ref().unwrap().enabled);
        let externals = cluster.spec.external_clusters.unwrap();
        assert_eq!(externals.len(), 1);
        let params = externals[0].connection_parameters.as_ref().unwrap();
        assert_eq!(
            params.get("host").unwrap(),
            "documentdb-service-sample.default.svc"
        );
        let recovery = cluster.spec.bootstrap.unwrap().recovery.unwrap();
        assert_eq!(recovery.source.as_deref(), Some(EXTERNAL_ORIGIN_NAME));
    }

    #[test]
    fn promotion_token_overrides_the_origin_host() {
        let ddb = test_ddb();
        let mut inputs = base_inputs();
        inputs.role = Some(ReplicationRole::Standby {
            of: "cluster-b".to_string(),
        });
        inputs.token = Some(ReplicationToken {
            host: "52.9.9.9".to_string(),
            port: "5433".to_string(),
            lsn: None,
        });
        let cluster = cnpg_cluster_from_ddb(&ddb, &Config::default(), &inputs, 0);
        let externals = cluster.spec.external_clusters.unwrap();
        let params = externals[0].connection_parameters.as_ref().unwrap();
        assert_eq!(params.get("host").unwrap(), "52.9.9.9");
        assert_eq!(params.get("port").unwrap(), "5433");
    }

    #[test]
    fn plugin_block_carries_the_gateway_parameters() {
        let mut ddb = test_ddb();
        ddb.spec.exposeViaService.serviceType = ServiceType::ClusterIP;
        let cluster = cnpg_cluster_from_ddb(&ddb, &Config::default(), &base_inputs(), 0);
        let plugins = cluster.spec.plugins.unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name, SIDECAR_INJECTOR_PLUGIN_NAME);
        let params = plugins[0].parameters.as_ref().unwrap();
        assert_eq!(
            params.get(PARAM_GATEWAY_TLS_SECRET).unwrap(),
            "sample-server-tls"
        );
        assert_eq!(
            params.get(PARAM_CREDENTIAL_SECRET).unwrap(),
            "documentdb-credentials"
        );
        let labels: serde_json::Value =
            serde_json::from_str(params.get(PARAM_LABELS).unwrap()).unwrap();
        assert_eq!(labels["documentdb.io/name"], "sample");
    }

    #[test]
    fn storage_and_instances_follow_the_spec() {
        let mut ddb = test_ddb();
        ddb.spec.instancesPerNode = 3;
        ddb.spec.resource.storage.pvcSize =
            k8s_openapi::apimachinery::pkg::api::resource::Quantity("25Gi".to_string());
        let cluster = cnpg_cluster_from_ddb(&ddb, &Config::default(), &base_inputs(), 0);
        assert_eq!(cluster.spec.instances, 3);
        assert_eq!(
            cluster.spec.storage.unwrap().size.as_deref(),
            Some("25Gi")
        );
    }

    #[test]
    fn tls_secret_is_mounted_by_the_cluster() {
        let ddb = test_ddb();
        let cluster = cnpg_cluster_from_ddb(&ddb, &Config::default(), &base_inputs(), 0);
        assert_eq!(
            cluster
                .spec
                .certificates
                .unwrap()
                .server_tls_secret
                .as_deref(),
            Some("sample-server-tls")
        );
    }

    #[test]
    fn node_clusters_are_deterministically_named() {
        let ddb = test_ddb();
        assert_eq!(node_cluster_name(&ddb, 0), "sample");
        assert_eq!(node_cluster_name(&ddb, 2), "sample-node-2");
    }

    #[test]
    fn snapshot_class_lands_in_the_cluster_backup_block() {
        let mut ddb = test_ddb();
        ddb.spec.environment = Some("aks".to_string());
        let cluster = cnpg_cluster_from_ddb(&ddb, &Config::default(), &base_inputs(), 0);
        assert_eq!(
            cluster
                .spec
                .backup
                .unwrap()
                .volume_snapshot
                .unwrap()
                .class_name
                .as_deref(),
            Some("documentdb-azuredisk-vsc")
        );
    }

    #[test]
    fn recomposition_is_idempotent() {
        let ddb = test_ddb();
        let cfg = Config::default();
        let a = cnpg_cluster_from_ddb(&ddb, &cfg, &base_inputs(), 0);
        let b = cnpg_cluster_from_ddb(&ddb, &cfg, &base_inputs(), 0);
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
    }
}
