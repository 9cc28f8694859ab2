use crate::defaults;
use k8s_openapi::{
    apimachinery::pkg::api::resource::Quantity, apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct DocumentDBStorage {
    #[serde(default = "defaults::default_pvc_size")]
    pub pvcSize: Quantity,
}

impl Default for DocumentDBStorage {
    fn default() -> Self {
        Self {
            pvcSize: defaults::default_pvc_size(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct DocumentDBResource {
    #[serde(default)]
    pub storage: DocumentDBStorage,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    LoadBalancer,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[allow(non_snake_case)]
pub struct ExposeViaService {
    #[serde(default)]
    pub serviceType: ServiceType,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq)]
pub enum TlsMode {
    #[default]
    SelfSigned,
    Provided,
    CertManager,
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMode::SelfSigned => write!(f, "SelfSigned"),
            TlsMode::Provided => write!(f, "Provided"),
            TlsMode::CertManager => write!(f, "CertManager"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[allow(non_snake_case)]
pub struct ProvidedTls {
    pub secretName: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct IssuerRef {
    pub name: String,
    /// Kind of the referenced issuer, `Issuer` or `ClusterIssuer`
    pub kind: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[allow(non_snake_case)]
pub struct CertManagerTls {
    pub issuerRef: IssuerRef,
    pub dnsNames: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[allow(non_snake_case)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,
    pub provided: Option<ProvidedTls>,
    pub certManager: Option<CertManagerTls>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[allow(non_snake_case)]
pub struct ClusterReplication {
    #[serde(default)]
    pub fleetEnabled: bool,
    /// Member cluster that hosts the writable primary. Must be an entry of
    /// `clusterList`.
    pub primary: String,
    pub clusterList: Vec<String>,
    /// Enables automatic failover: after this many seconds of primary
    /// unreachability the coordinator promotes the most advanced standby.
    pub failoverAfterSeconds: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct BackupRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct RecoveryBootstrap {
    pub backup: Option<BackupRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct Bootstrap {
    pub recovery: Option<RecoveryBootstrap>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct BackupConfig {
    #[serde(default = "defaults::default_retention_days")]
    pub retentionDays: i32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        defaults::default_backup()
    }
}

/// Generate the Kubernetes wrapper struct `DocumentDB` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs). `preview`
/// is the hub and storage version; `v1alpha1` converts to and from it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(kind = "DocumentDB", group = "documentdb.io", version = "preview", namespaced)]
#[kube(status = "DocumentDBStatus", shortname = "ddb")]
#[allow(non_snake_case)]
pub struct DocumentDBSpec {
    /// Number of independent logical nodes of the cluster.
    #[serde(default = "defaults::default_node_count")]
    pub nodeCount: i32,

    /// Postgres instances backing each node: one primary plus standbys.
    #[serde(default = "defaults::default_instances_per_node")]
    pub instancesPerNode: i32,

    /// Engine image. Empty means: use the process-wide default.
    #[serde(default)]
    pub documentDBImage: String,

    /// Gateway sidecar image. Empty means: use the process-wide default.
    pub gatewayImage: Option<String>,

    pub documentDBVersion: Option<String>,

    /// Name of the user-provided secret carrying `username` and `password`.
    /// The operator reads it; it never writes it.
    #[serde(default = "defaults::default_credential_secret")]
    pub documentDbCredentialSecret: String,

    #[serde(default = "defaults::default_resource")]
    pub resource: DocumentDBResource,

    #[serde(default = "defaults::default_expose_via_service")]
    pub exposeViaService: ExposeViaService,

    #[serde(default = "defaults::default_tls")]
    pub tls: TlsConfig,

    pub clusterReplication: Option<ClusterReplication>,

    pub bootstrap: Option<Bootstrap>,

    #[serde(default = "defaults::default_backup")]
    pub backup: BackupConfig,

    /// Platform hint used to pick a volume snapshot class, e.g. "aks".
    pub environment: Option<String>,

    #[serde(default = "defaults::default_stop")]
    pub stop: bool,
}

/// Mirrors the serde defaults so a constructed spec and a deserialized empty
/// spec agree.
impl Default for DocumentDBSpec {
    fn default() -> Self {
        Self {
            nodeCount: defaults::default_node_count(),
            instancesPerNode: defaults::default_instances_per_node(),
            documentDBImage: String::new(),
            gatewayImage: None,
            documentDBVersion: None,
            documentDbCredentialSecret: defaults::default_credential_secret(),
            resource: defaults::default_resource(),
            exposeViaService: defaults::default_expose_via_service(),
            tls: defaults::default_tls(),
            clusterReplication: None,
            bootstrap: None,
            backup: defaults::default_backup(),
            environment: None,
            stop: defaults::default_stop(),
        }
    }
}

impl DocumentDBSpec {
    /// Whether cross-cluster replication is configured at all.
    pub fn replication(&self) -> Option<&ClusterReplication> {
        self.clusterReplication
            .as_ref()
            .filter(|r| r.fleetEnabled && !r.clusterList.is_empty())
    }

    /// The backup referenced by `bootstrap.recovery`, if any.
    pub fn recovery_backup(&self) -> Option<&str> {
        self.bootstrap
            .as_ref()
            .and_then(|b| b.recovery.as_ref())
            .and_then(|r| r.backup.as_ref())
            .map(|b| b.name.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq)]
pub enum DocumentDBPhase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Degraded,
    Promoting,
    Deleting,
    Failed,
}

impl fmt::Display for DocumentDBPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentDBPhase::Pending => write!(f, "Pending"),
            DocumentDBPhase::Provisioning => write!(f, "Provisioning"),
            DocumentDBPhase::Ready => write!(f, "Ready"),
            DocumentDBPhase::Degraded => write!(f, "Degraded"),
            DocumentDBPhase::Promoting => write!(f, "Promoting"),
            DocumentDBPhase::Deleting => write!(f, "Deleting"),
            DocumentDBPhase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[allow(non_snake_case)]
pub struct TlsStatus {
    pub ready: bool,
    pub mode: TlsMode,
    /// The TLS secret actually mounted by the Postgres pods.
    pub secretName: Option<String>,
    /// `notAfter` of the first certificate in `tls.crt`, RFC 3339.
    pub expirationTime: Option<String>,
}

/// Replication role as a tagged variant so that split-brain states are
/// unrepresentable: a cluster is exactly one of these.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub enum ReplicationRole {
    Primary,
    Standby { of: String },
    PromotionCandidate,
    Demoting,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq)]
pub enum PromotionStep {
    AwaitTargetReady,
    PublishToken,
    AwaitFormerPrimaryStandby,
    Cleanup,
}

impl fmt::Display for PromotionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromotionStep::AwaitTargetReady => write!(f, "AwaitTargetReady"),
            PromotionStep::PublishToken => write!(f, "PublishToken"),
            PromotionStep::AwaitFormerPrimaryStandby => write!(f, "AwaitFormerPrimaryStandby"),
            PromotionStep::Cleanup => write!(f, "Cleanup"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct PromotionStatus {
    pub target: String,
    pub previousPrimary: Option<String>,
    pub step: PromotionStep,
    pub startedAt: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ReplicationStatus {
    /// Unset on a hub that only coordinates and hosts no member itself.
    pub role: Option<ReplicationRole>,
    pub promotion: Option<PromotionStatus>,
}

/// The status object of `DocumentDB`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct DocumentDBStatus {
    #[serde(default)]
    pub phase: DocumentDBPhase,
    pub connectionString: Option<String>,
    pub tls: Option<TlsStatus>,
    /// Textual health, e.g. "Cluster in healthy state"
    pub status: Option<String>,
    /// Observed primary cluster name
    pub primary: Option<String>,
    pub replication: Option<ReplicationStatus>,
    pub supportedApiVersions: Option<Vec<String>>,
    pub conditions: Option<Vec<Condition>>,
    /// Consecutive reconciles that saw the Postgres cluster not Ready.
    /// Backs the Ready -> Degraded transition across operator restarts.
    pub consecutiveUnready: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_documentdb_spec() {
        let json_str = r#"
        {
          "nodeCount": 1,
          "instancesPerNode": 3,
          "documentDBImage": "ghcr.io/documentdb/documentdb:16",
          "resource": {
            "storage": {
              "pvcSize": "25Gi"
            }
          },
          "exposeViaService": {
            "serviceType": "LoadBalancer"
          },
          "tls": {
            "mode": "CertManager",
            "certManager": {
              "issuerRef": {
                "name": "platform-issuer",
                "kind": "ClusterIssuer"
              },
              "dnsNames": ["db.example.com"]
            }
          },
          "clusterReplication": {
            "fleetEnabled": true,
            "primary": "cluster-a",
            "clusterList": ["cluster-a", "cluster-b"]
          },
          "bootstrap": {
            "recovery": {
              "backup": {
                "name": "b1"
              }
            }
          },
          "backup": {
            "retentionDays": 14
          },
          "environment": "aks"
        }
        "#;

        let spec: DocumentDBSpec = serde_json::from_str(json_str).unwrap();
        assert_eq!(spec.instancesPerNode, 3);
        assert_eq!(spec.documentDbCredentialSecret, "documentdb-credentials");
        assert_eq!(spec.resource.storage.pvcSize, Quantity("25Gi".to_string()));
        assert_eq!(spec.exposeViaService.serviceType, ServiceType::LoadBalancer);
        assert_eq!(spec.tls.mode, TlsMode::CertManager);
        assert_eq!(spec.recovery_backup(), Some("b1"));
        let replication = spec.replication().unwrap();
        assert_eq!(replication.primary, "cluster-a");
        assert_eq!(spec.backup.retentionDays, 14);
    }

    #[test]
    fn test_defaults_fill_an_empty_spec() {
        let spec: DocumentDBSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.nodeCount, 1);
        assert_eq!(spec.instancesPerNode, 1);
        assert!(spec.documentDBImage.is_empty());
        assert_eq!(spec.tls.mode, TlsMode::SelfSigned);
        assert_eq!(spec.exposeViaService.serviceType, ServiceType::ClusterIP);
        assert_eq!(spec.backup.retentionDays, 30);
        assert!(spec.replication().is_none());
        assert!(spec.recovery_backup().is_none());
    }

    #[test]
    fn test_replication_requires_fleet_enabled() {
        let spec: DocumentDBSpec = serde_json::from_str(
            r#"{"clusterReplication": {"fleetEnabled": false, "primary": "a", "clusterList": ["a"]}}"#,
        )
        .unwrap();
        assert!(spec.replication().is_none());
    }
}
