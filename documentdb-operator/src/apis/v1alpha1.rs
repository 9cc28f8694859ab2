//! Legacy `v1alpha1` version of the DocumentDB resource.
//!
//! Conversion is hub-and-spoke with `preview` as the hub: upgrades are
//! lossless (new fields take their defaults), downgrades drop the fields that
//! do not exist in this version and record them in the
//! `documentdb.io/converted-lost-fields` annotation instead of silently
//! discarding them. The conversion webhook in [`crate::apis::conversion`]
//! applies both directions when the apiserver serves a non-storage version.

use crate::apis::documentdb_types as preview;
use crate::apis::documentdb_types::DocumentDBStatus;
use crate::defaults;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation carrying the names of spec fields lost on downgrade.
pub const LOST_FIELDS_ANNOTATION: &str = "documentdb.io/converted-lost-fields";

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[allow(non_snake_case)]
pub struct ClusterReplication {
    #[serde(default)]
    pub fleetEnabled: bool,
    pub primary: String,
    pub clusterList: Vec<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "DocumentDB",
    group = "documentdb.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "DocumentDBStatus", shortname = "ddb")]
#[allow(non_snake_case)]
pub struct DocumentDBSpec {
    #[serde(default = "defaults::default_node_count")]
    pub nodeCount: i32,

    #[serde(default = "defaults::default_instances_per_node")]
    pub instancesPerNode: i32,

    #[serde(default)]
    pub documentDBImage: String,

    pub gatewayImage: Option<String>,

    pub documentDBVersion: Option<String>,

    #[serde(default = "defaults::default_credential_secret")]
    pub documentDbCredentialSecret: String,

    #[serde(default = "defaults::default_resource")]
    pub resource: preview::DocumentDBResource,

    #[serde(default = "defaults::default_expose_via_service")]
    pub exposeViaService: preview::ExposeViaService,

    #[serde(default = "defaults::default_tls")]
    pub tls: preview::TlsConfig,

    pub clusterReplication: Option<ClusterReplication>,

    pub bootstrap: Option<preview::Bootstrap>,

    #[serde(default = "defaults::default_backup")]
    pub backup: preview::BackupConfig,
}

impl From<DocumentDBSpec> for preview::DocumentDBSpec {
    fn from(old: DocumentDBSpec) -> Self {
        preview::DocumentDBSpec {
            nodeCount: old.nodeCount,
            instancesPerNode: old.instancesPerNode,
            documentDBImage: old.documentDBImage,
            gatewayImage: old.gatewayImage,
            documentDBVersion: old.documentDBVersion,
            documentDbCredentialSecret: old.documentDbCredentialSecret,
            resource: old.resource,
            exposeViaService: old.exposeViaService,
            tls: old.tls,
            clusterReplication: old.clusterReplication.map(|r| {
                preview::ClusterReplication {
                    fleetEnabled: r.fleetEnabled,
                    primary: r.primary,
                    clusterList: r.clusterList,
                    failoverAfterSeconds: None,
                }
            }),
            bootstrap: old.bootstrap,
            backup: old.backup,
            environment: None,
            stop: defaults::default_stop(),
        }
    }
}

/// Downgrade a hub spec to `v1alpha1`, returning the converted spec and the
/// list of field paths that did not survive the conversion.
pub fn downgrade(spec: preview::DocumentDBSpec) -> (DocumentDBSpec, Vec<String>) {
    let mut lost = Vec::new();
    if spec.environment.is_some() {
        lost.push("spec.environment".to_string());
    }
    if spec.stop {
        lost.push("spec.stop".to_string());
    }
    if spec
        .clusterReplication
        .as_ref()
        .and_then(|r| r.failoverAfterSeconds)
        .is_some()
    {
        lost.push("spec.clusterReplication.failoverAfterSeconds".to_string());
    }

    let converted = DocumentDBSpec {
        nodeCount: spec.nodeCount,
        instancesPerNode: spec.instancesPerNode,
        documentDBImage: spec.documentDBImage,
        gatewayImage: spec.gatewayImage,
        documentDBVersion: spec.documentDBVersion,
        documentDbCredentialSecret: spec.documentDbCredentialSecret,
        resource: spec.resource,
        exposeViaService: spec.exposeViaService,
        tls: spec.tls,
        clusterReplication: spec.clusterReplication.map(|r| ClusterReplication {
            fleetEnabled: r.fleetEnabled,
            primary: r.primary,
            clusterList: r.clusterList,
        }),
        bootstrap: spec.bootstrap,
        backup: spec.backup,
    };
    (converted, lost)
}
