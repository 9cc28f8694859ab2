use crate::config::Config;
use actix_web::{post, web, HttpResponse, Responder};
use controller::cloudnativepg::cnpg::{
    PARAM_ANNOTATIONS, PARAM_CREDENTIAL_SECRET, PARAM_GATEWAY_IMAGE, PARAM_GATEWAY_TLS_SECRET,
    PARAM_LABELS,
};
use controller::secret::{CREDENTIAL_PASSWORD_KEY, CREDENTIAL_USERNAME_KEY};
use controller::service::{REPLICA_TYPE_LABEL, REPLICA_TYPE_PRIMARY, REPLICA_TYPE_STANDBY};
use controller::{Error, Result};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, Pod, SecretKeySelector, SecretVolumeSource,
    Volume, VolumeMount,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

pub const GATEWAY_CONTAINER_NAME: &str = "gateway";
pub const GATEWAY_TLS_VOLUME: &str = "gateway-tls";
pub const GATEWAY_TLS_MOUNT_PATH: &str = "/documentdb/tls";
pub const DEFAULT_CREDENTIAL_SECRET: &str = "documentdb-credentials";

/// Parameter naming the currently promoted pod, reported by the PGO.
pub const PARAM_PRIMARY: &str = "primary";

/// The mutation request the PGO sends for each would-be pod.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MutateRequest {
    pub pod: Pod,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Validated plugin parameters. Unknown keys in the raw map are ignored for
/// forward compatibility; malformed label/annotation JSON fails the mutation.
#[derive(Debug, Clone)]
pub struct InjectionParameters {
    pub gateway_image: String,
    pub gateway_tls_secret: Option<String>,
    pub credential_secret: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub primary: bool,
}

impl InjectionParameters {
    pub fn parse(parameters: &BTreeMap<String, String>, config: &Config) -> Result<Self> {
        let gateway_image = match parameters.get(PARAM_GATEWAY_IMAGE) {
            Some(image) if !image.is_empty() => image.clone(),
            _ if !config.gateway_image.is_empty() => config.gateway_image.clone(),
            _ => {
                return Err(Error::InvalidSpecError(format!(
                    "plugin parameter {} missing and no default configured",
                    PARAM_GATEWAY_IMAGE
                )))
            }
        };

        let labels = parse_string_map(parameters.get(PARAM_LABELS), PARAM_LABELS)?;
        let annotations = parse_string_map(parameters.get(PARAM_ANNOTATIONS), PARAM_ANNOTATIONS)?;

        Ok(Self {
            gateway_image,
            gateway_tls_secret: parameters
                .get(PARAM_GATEWAY_TLS_SECRET)
                .filter(|s| !s.is_empty())
                .cloned(),
            credential_secret: parameters
                .get(PARAM_CREDENTIAL_SECRET)
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| DEFAULT_CREDENTIAL_SECRET.to_string()),
            labels,
            annotations,
            primary: parameters.get(PARAM_PRIMARY).map(|v| v == "true").unwrap_or(false),
        })
    }
}

fn parse_string_map(
    raw: Option<&String>,
    parameter: &str,
) -> Result<BTreeMap<String, String>> {
    match raw {
        None => Ok(BTreeMap::new()),
        Some(raw) if raw.is_empty() => Ok(BTreeMap::new()),
        Some(raw) => serde_json::from_str::<BTreeMap<String, String>>(raw).map_err(|e| {
            warn!("Malformed {} JSON in plugin parameters: {}", parameter, e);
            Error::SerializationError(e)
        }),
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

/// The gateway container co-located with each Postgres instance.
pub fn gateway_container(params: &InjectionParameters, config: &Config) -> Container {
    let mut volume_mounts = Vec::new();
    if params.gateway_tls_secret.is_some() {
        volume_mounts.push(VolumeMount {
            name: GATEWAY_TLS_VOLUME.to_string(),
            mount_path: GATEWAY_TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
    }

    Container {
        name: GATEWAY_CONTAINER_NAME.to_string(),
        image: Some(params.gateway_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(vec![
            secret_env("USERNAME", &params.credential_secret, CREDENTIAL_USERNAME_KEY),
            secret_env("PASSWORD", &params.credential_secret, CREDENTIAL_PASSWORD_KEY),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("gateway".to_string()),
            container_port: config.gateway_port,
            ..ContainerPort::default()
        }]),
        volume_mounts: if volume_mounts.is_empty() {
            None
        } else {
            Some(volume_mounts)
        },
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Container::default()
    }
}

fn add_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    // Check to make sure we only add the volume once
    if volumes.iter().any(|v| v.name == volume.name) {
        debug!("Pod already has volume {}, skipping", volume.name);
    } else {
        volumes.push(volume);
    }
}

/// Mutate a pod spec to run the gateway next to Postgres. Calling this on an
/// already-mutated pod returns an identical pod.
#[instrument(skip(pod, params, config))]
pub fn mutate_pod(pod: &Pod, params: &InjectionParameters, config: &Config) -> Pod {
    let mut pod = pod.clone();

    // Merge parameter labels and annotations; existing keys win on collision
    let labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    for (key, value) in &params.labels {
        labels.entry(key.clone()).or_insert_with(|| value.clone());
    }
    // replica_type is owned by the injector, not the merge
    labels.insert(
        REPLICA_TYPE_LABEL.to_string(),
        if params.primary {
            REPLICA_TYPE_PRIMARY.to_string()
        } else {
            REPLICA_TYPE_STANDBY.to_string()
        },
    );

    let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    for (key, value) in &params.annotations {
        annotations
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }

    let spec = pod.spec.get_or_insert_with(Default::default);

    let container = gateway_container(params, config);
    match spec
        .containers
        .iter_mut()
        .find(|c| c.name == GATEWAY_CONTAINER_NAME)
    {
        // Rebuild in place so a second mutation cannot drift
        Some(existing) => *existing = container,
        None => spec.containers.push(container),
    }

    if let Some(tls_secret) = &params.gateway_tls_secret {
        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        add_volume(
            volumes,
            Volume {
                name: GATEWAY_TLS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(tls_secret.clone()),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            },
        );
    }

    pod
}

#[post("/plugin/v1/mutate")]
pub async fn mutate(
    body: web::Json<MutateRequest>,
    config: web::Data<Config>,
) -> impl Responder {
    let request = body.into_inner();
    match InjectionParameters::parse(&request.parameters, &config) {
        Ok(params) => {
            let mutated = mutate_pod(&request.pod, &params, &config);
            HttpResponse::Ok().json(mutated)
        }
        Err(e) => {
            // The PGO surfaces this as a pod event
            HttpResponse::UnprocessableEntity().json(json!({ "error": e.to_string() }))
        }
    }
}
