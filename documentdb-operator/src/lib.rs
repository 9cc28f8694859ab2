/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod apis;

pub mod backups;
pub mod cert_manager;
pub mod cloudnativepg;
pub mod config;
pub mod defaults;
pub mod replication;
pub mod secret;
pub mod service;
/// Log and trace integrations
pub mod telemetry;
pub mod tls;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub mod fixtures;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Missing Secret Error: {0}")]
    MissingSecretError(String),

    #[error("Invalid TLS configuration: {0}")]
    TlsConfigError(String),

    #[error("Certificate Parse Error: {0}")]
    CertificateParseError(String),

    #[error("Referenced backup not found: {0}")]
    BackupNotFoundError(String),

    #[error("Invalid backup schedule: {0}")]
    ScheduleError(String),

    #[error("Invalid replication configuration: {0}")]
    ReplicationConfigError(String),

    #[error("Member cluster unreachable: {0}")]
    MemberClusterError(String),

    #[error("Promotion Error: {0}")]
    PromotionError(String),

    #[error("Invalid spec: {0}")]
    InvalidSpecError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }

    /// Config-class errors are not retriable: the reconciler records them on
    /// status and waits for a spec change instead of requeueing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::TlsConfigError(_)
                | Error::BackupNotFoundError(_)
                | Error::ScheduleError(_)
                | Error::ReplicationConfigError(_)
                | Error::InvalidSpecError(_)
        )
    }
}
