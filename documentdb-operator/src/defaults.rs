use crate::apis::documentdb_types::{
    BackupConfig, DocumentDBResource, DocumentDBStorage, ExposeViaService, ServiceType, TlsConfig,
    TlsMode,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

pub fn default_node_count() -> i32 {
    1
}

pub fn default_instances_per_node() -> i32 {
    1
}

pub fn default_image() -> String {
    "ghcr.io/documentdb/documentdb:16".to_owned()
}

pub fn default_gateway_image() -> String {
    "ghcr.io/documentdb/documentdb-gateway:16".to_owned()
}

pub fn default_sidecar_image() -> String {
    "ghcr.io/documentdb/documentdb-sidecar-injector:latest".to_owned()
}

pub fn default_documentdb_version() -> String {
    "16.0.0".to_owned()
}

pub fn default_credential_secret() -> String {
    "documentdb-credentials".to_owned()
}

pub fn default_pvc_size() -> Quantity {
    Quantity("10Gi".to_string())
}

pub fn default_resource() -> DocumentDBResource {
    DocumentDBResource {
        storage: DocumentDBStorage {
            pvcSize: default_pvc_size(),
        },
    }
}

pub fn default_expose_via_service() -> ExposeViaService {
    ExposeViaService {
        serviceType: ServiceType::ClusterIP,
    }
}

pub fn default_tls() -> TlsConfig {
    TlsConfig {
        mode: TlsMode::SelfSigned,
        provided: None,
        certManager: None,
    }
}

pub fn default_retention_days() -> i32 {
    30
}

pub fn default_backup() -> BackupConfig {
    BackupConfig {
        retentionDays: default_retention_days(),
    }
}

pub fn default_stop() -> bool {
    false
}
