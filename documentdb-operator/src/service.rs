use crate::{
    apis::documentdb_types::{DocumentDB, ServiceType},
    config::Config,
    Context,
};
use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, Resource, ResourceExt,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, error, instrument};

pub const EXPOSURE_SERVICE_PREFIX: &str = "documentdb-service-";

/// Label the gateway plugin keeps pointed at the promoted instance. The
/// exposure selector matches it, so flipping pod labels is what moves client
/// traffic during a failover.
pub const REPLICA_TYPE_LABEL: &str = "replica_type";
pub const REPLICA_TYPE_PRIMARY: &str = "primary";
pub const REPLICA_TYPE_STANDBY: &str = "standby";

pub fn exposure_service_name(ddb: &DocumentDB) -> String {
    format!("{}{}", EXPOSURE_SERVICE_PREFIX, ddb.name_any())
}

/// Selector targeting only the current primary pod of the Postgres cluster.
pub fn exposure_selector(ddb: &DocumentDB) -> BTreeMap<String, String> {
    let mut selector: BTreeMap<String, String> = BTreeMap::new();
    selector.insert("cnpg.io/cluster".to_owned(), ddb.name_any());
    selector.insert(
        REPLICA_TYPE_LABEL.to_owned(),
        REPLICA_TYPE_PRIMARY.to_owned(),
    );
    selector
}

pub fn exposure_service_from_ddb(ddb: &DocumentDB, cfg: &Config) -> Service {
    let name = exposure_service_name(ddb);
    let ns = ddb.namespace().unwrap();
    let oref = ddb.controller_owner_ref(&()).unwrap();
    let selector = exposure_selector(ddb);

    let mut labels = selector.clone();
    labels.remove(REPLICA_TYPE_LABEL);
    labels.insert("app".to_owned(), "documentdb".to_string());
    labels.insert("documentdb.io/name".to_owned(), ddb.name_any());

    let service_type = match ddb.spec.exposeViaService.serviceType {
        ServiceType::ClusterIP => "ClusterIP",
        ServiceType::LoadBalancer => "LoadBalancer",
    };

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ns),
            labels: Some(labels),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            ports: Some(vec![ServicePort {
                port: cfg.gateway_port,
                name: Some("gateway".to_string()),
                target_port: Some(IntOrString::Int(cfg.gateway_port)),
                ..ServicePort::default()
            }]),
            selector: Some(selector),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

#[instrument(skip(ddb, ctx), fields(instance_name = %ddb.name_any()))]
pub async fn reconcile_exposure_service(
    ddb: &DocumentDB,
    ctx: Arc<Context>,
    cfg: &Config,
) -> Result<(), Action> {
    let ns = ddb.namespace().unwrap();
    let svc = exposure_service_from_ddb(ddb, cfg);
    let name = svc
        .metadata
        .name
        .clone()
        .expect("Exposure service should always have a name");
    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);

    debug!("Patching exposure service {}", name);
    let ps = PatchParams::apply("cntrlr").force();
    let _o = svc_api
        .patch(&name, &ps, &Patch::Apply(&svc))
        .await
        .map_err(|e| {
            error!("Error patching exposure service: {}", e);
            Action::requeue(Duration::from_secs(300))
        })?;
    Ok(())
}

/// The routable endpoint of an exposure service, if any. ClusterIP services
/// are addressable as soon as an IP is assigned; LoadBalancer services only
/// once the cloud provider fills in the ingress address.
pub fn service_endpoint(svc: &Service) -> Option<String> {
    let spec = svc.spec.as_ref()?;
    match spec.type_.as_deref() {
        Some("LoadBalancer") => {
            let ingress = svc
                .status
                .as_ref()?
                .load_balancer
                .as_ref()?
                .ingress
                .as_ref()?;
            let first = ingress.first()?;
            first.ip.clone().or_else(|| first.hostname.clone())
        }
        _ => spec.cluster_ip.clone().filter(|ip| !ip.is_empty() && ip != "None"),
    }
}

/// Wait for a routable endpoint, requeueing while a LoadBalancer address is
/// still pending.
#[instrument(skip(ddb, ctx))]
pub async fn exposure_service_endpoint(
    ddb: &DocumentDB,
    ctx: Arc<Context>,
) -> Result<String, Action> {
    let ns = ddb.namespace().unwrap();
    let name = exposure_service_name(ddb);
    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);
    let svc = svc_api.get(&name).await.map_err(|e| {
        error!("Error getting exposure service {}: {}", name, e);
        Action::requeue(Duration::from_secs(10))
    })?;
    match service_endpoint(&svc) {
        Some(endpoint) => Ok(endpoint),
        None => {
            debug!(
                "Exposure service {} has no routable endpoint yet, requeueing",
                name
            );
            Err(Action::requeue(Duration::from_secs(15)))
        }
    }
}

/// Finalizer cleanup: delete the exposure service. The remaining children are
/// garbage collected through their owner references.
pub async fn delete_exposure_service(ddb: &DocumentDB, ctx: Arc<Context>) -> Result<(), Action> {
    let ns = ddb.namespace().unwrap();
    let name = exposure_service_name(ddb);
    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);
    let _o = svc_api.delete(&name, &Default::default()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    fn test_ddb(name: &str) -> DocumentDB {
        let mut ddb = DocumentDB::new(name, Default::default());
        ddb.metadata.namespace = Some("default".to_string());
        ddb.metadata.uid = Some("752d59ef-2671-4890-9feb-0097459b18c8".to_string());
        ddb
    }

    #[test]
    fn service_name_is_deterministic() {
        let ddb = test_ddb("sample");
        assert_eq!(exposure_service_name(&ddb), "documentdb-service-sample");
    }

    #[test]
    fn selector_targets_only_the_primary() {
        let ddb = test_ddb("sample");
        let selector = exposure_selector(&ddb);
        assert_eq!(selector.get("replica_type").unwrap(), "primary");
        assert_eq!(selector.get("cnpg.io/cluster").unwrap(), "sample");
        assert_eq!(selector.len(), 2);
    }

    #[test]
    fn service_shape_follows_the_spec() {
        let mut ddb = test_ddb("sample");
        ddb.spec.exposeViaService.serviceType = ServiceType::LoadBalancer;
        let cfg = Config::default();
        let svc = exposure_service_from_ddb(&ddb, &cfg);
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 10260);
        assert_eq!(spec.selector.unwrap(), exposure_selector(&test_ddb("sample")));
    }

    #[test]
    fn toggling_service_type_round_trips_the_service_shape() {
        let cfg = Config::default();
        let mut ddb = test_ddb("sample");
        let original = exposure_service_from_ddb(&ddb, &cfg);
        ddb.spec.exposeViaService.serviceType = ServiceType::LoadBalancer;
        let _switched = exposure_service_from_ddb(&ddb, &cfg);
        ddb.spec.exposeViaService.serviceType = ServiceType::ClusterIP;
        let back = exposure_service_from_ddb(&ddb, &cfg);
        assert_eq!(
            serde_json::to_value(&original).unwrap(),
            serde_json::to_value(&back).unwrap()
        );
    }

    #[test]
    fn cluster_ip_endpoint_is_immediate() {
        let svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                cluster_ip: Some("10.0.0.12".to_string()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        assert_eq!(service_endpoint(&svc), Some("10.0.0.12".to_string()));
    }

    #[test]
    fn pending_load_balancer_has_no_endpoint() {
        let mut svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                cluster_ip: Some("10.0.0.12".to_string()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        assert_eq!(service_endpoint(&svc), None);

        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("52.1.2.3".to_string()),
                    ..LoadBalancerIngress::default()
                }]),
            }),
            ..ServiceStatus::default()
        });
        assert_eq!(service_endpoint(&svc), Some("52.1.2.3".to_string()));
    }

    #[test]
    fn headless_cluster_ip_is_not_an_endpoint() {
        let svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                cluster_ip: Some("None".to_string()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        assert_eq!(service_endpoint(&svc), None);
    }
}
