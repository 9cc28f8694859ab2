use actix_web::{post, web, HttpResponse, Responder};
use controller::service::{REPLICA_TYPE_LABEL, REPLICA_TYPE_PRIMARY, REPLICA_TYPE_STANDBY};
use controller::{Error, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Patch, PatchParams},
    Api, Client,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub enum LifecycleHook {
    PreStart,
    PostPromote,
    OnTerminate,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[allow(non_snake_case)]
pub struct LifecycleRequest {
    pub hook: LifecycleHook,
    pub namespace: String,
    pub podName: String,
    /// On PostPromote: the pod that lost the primary role.
    pub demotedPodName: Option<String>,
}

async fn set_replica_type(client: &Client, ns: &str, pod_name: &str, value: &str) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
    let patch = json!({"metadata": {"labels": {REPLICA_TYPE_LABEL: value}}});
    pods.patch(
        pod_name,
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    debug!("Set {}={} on pod {}/{}", REPLICA_TYPE_LABEL, value, ns, pod_name);
    Ok(())
}

/// Apply a lifecycle hook reported by the PGO. PreStart and OnTerminate are
/// no-ops: the gateway holds no persistent state.
#[instrument(skip(client, request), fields(hook = ?request.hook, pod = %request.podName))]
pub async fn apply_hook(client: &Client, request: &LifecycleRequest) -> Result<()> {
    match request.hook {
        LifecycleHook::PreStart | LifecycleHook::OnTerminate => Ok(()),
        LifecycleHook::PostPromote => {
            // Demote before promote: the exposure selector must never match
            // two pods at once.
            if let Some(demoted) = &request.demotedPodName {
                set_replica_type(client, &request.namespace, demoted, REPLICA_TYPE_STANDBY)
                    .await?;
            }
            set_replica_type(
                client,
                &request.namespace,
                &request.podName,
                REPLICA_TYPE_PRIMARY,
            )
            .await?;
            info!(
                "Promoted pod {}/{} (demoted {:?})",
                request.namespace, request.podName, request.demotedPodName
            );
            Ok(())
        }
    }
}

#[post("/plugin/v1/lifecycle")]
pub async fn lifecycle(
    body: web::Json<LifecycleRequest>,
    client: web::Data<Arc<Client>>,
) -> impl Responder {
    let request = body.into_inner();
    match apply_hook(&client, &request).await {
        Ok(()) => HttpResponse::Ok().json(json!({"applied": true})),
        Err(e) => HttpResponse::InternalServerError().json(json!({"error": e.to_string()})),
    }
}
