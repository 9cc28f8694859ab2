use crate::{
    apis::documentdb_types::{DocumentDB, TlsMode, TlsStatus},
    cert_manager::{
        Certificate, CertificateIssuerRef, CertificateSpec, Issuer, IssuerSelfSigned, IssuerSpec,
    },
    service::exposure_service_name,
    Context, Error,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Patch, PatchParams},
    Api, Resource, ResourceExt,
};
use std::{fmt, sync::Arc};
use tracing::{debug, instrument, warn};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Certificates inside this window of their notAfter are considered renewing.
pub const RENEWAL_WINDOW_DAYS: i64 = 30;

/// Provisioning state of the TLS material for one DocumentDB.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TlsPhase {
    Absent,
    Provisioning,
    Ready,
    Renewing,
}

impl fmt::Display for TlsPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsPhase::Absent => write!(f, "Absent"),
            TlsPhase::Provisioning => write!(f, "Provisioning"),
            TlsPhase::Ready => write!(f, "Ready"),
            TlsPhase::Renewing => write!(f, "Renewing"),
        }
    }
}

/// Derive the phase from what was observed this pass. A certificate within
/// its renewal window keeps serving: Renewing still publishes the secret.
pub fn tls_phase(
    material_exists: bool,
    secret_valid: bool,
    expiration: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> TlsPhase {
    if !material_exists {
        return TlsPhase::Absent;
    }
    if !secret_valid {
        return TlsPhase::Provisioning;
    }
    match expiration {
        Some(not_after) if not_after - now < Duration::days(RENEWAL_WINDOW_DAYS) => {
            TlsPhase::Renewing
        }
        _ => TlsPhase::Ready,
    }
}

/// DNS names covered by operator-issued certificates: the exposure service
/// plus its cluster-internal forms.
pub fn certificate_dns_names(ddb: &DocumentDB) -> Vec<String> {
    let service = exposure_service_name(ddb);
    let ns = ddb.namespace().unwrap();
    vec![
        service.clone(),
        format!("{}.{}.svc", service, ns),
        format!("{}.{}.svc.cluster.local", service, ns),
    ]
}

pub fn self_signed_issuer_name(ddb: &DocumentDB) -> String {
    format!("{}-self-signed", ddb.name_any())
}

pub fn certificate_name(ddb: &DocumentDB) -> String {
    format!("{}-server", ddb.name_any())
}

pub fn certificate_secret_name(ddb: &DocumentDB) -> String {
    format!("{}-server-tls", ddb.name_any())
}

/// Outcome of a TLS sub-reconcile: the status to publish plus the phase for
/// conditions. `status.ready == false` means the caller should requeue.
pub struct TlsOutcome {
    pub status: TlsStatus,
    pub phase: TlsPhase,
}

#[instrument(skip(ddb, ctx), fields(instance_name = %ddb.name_any()))]
pub async fn reconcile_tls(ddb: &DocumentDB, ctx: Arc<Context>) -> Result<TlsOutcome, Error> {
    match ddb.spec.tls.mode {
        TlsMode::Provided => reconcile_provided(ddb, ctx).await,
        TlsMode::SelfSigned => reconcile_issued(ddb, ctx, None).await,
        TlsMode::CertManager => {
            let cert_manager = ddb.spec.tls.certManager.clone().ok_or_else(|| {
                Error::TlsConfigError(
                    "tls.mode is CertManager but tls.certManager is not set".to_string(),
                )
            })?;
            if cert_manager.issuerRef.name.is_empty() {
                return Err(Error::TlsConfigError(
                    "tls.certManager.issuerRef.name must not be empty".to_string(),
                ));
            }
            reconcile_issued(
                ddb,
                ctx,
                Some((cert_manager.issuerRef, cert_manager.dnsNames)),
            )
            .await
        }
    }
}

async fn reconcile_provided(ddb: &DocumentDB, ctx: Arc<Context>) -> Result<TlsOutcome, Error> {
    let provided = ddb.spec.tls.provided.clone().ok_or_else(|| {
        Error::TlsConfigError("tls.mode is Provided but tls.provided.secretName is not set".to_string())
    })?;
    if provided.secretName.is_empty() {
        return Err(Error::TlsConfigError(
            "tls.provided.secretName must not be empty".to_string(),
        ));
    }

    let ns = ddb.namespace().unwrap();
    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    let secret = match secret_api.get(&provided.secretName).await {
        Ok(secret) => secret,
        Err(_) => {
            // The secret is synced externally (CSI or user-applied); absence
            // is a wait, not a failure.
            debug!(
                "Provided TLS secret {} not present yet, waiting",
                provided.secretName
            );
            return Ok(TlsOutcome {
                status: TlsStatus {
                    ready: false,
                    mode: TlsMode::Provided,
                    secretName: None,
                    expirationTime: None,
                },
                phase: TlsPhase::Absent,
            });
        }
    };

    build_outcome(&secret, TlsMode::Provided, &provided.secretName, true)
}

/// SelfSigned and CertManager share the Certificate-driven path; SelfSigned
/// additionally owns a namespaced self-signed Issuer.
async fn reconcile_issued(
    ddb: &DocumentDB,
    ctx: Arc<Context>,
    issuer_override: Option<(crate::apis::documentdb_types::IssuerRef, Option<Vec<String>>)>,
) -> Result<TlsOutcome, Error> {
    let ns = ddb.namespace().unwrap();
    let oref = ddb.controller_owner_ref(&()).unwrap();
    let ps = PatchParams::apply("cntrlr").force();
    let mode = match issuer_override {
        Some(_) => TlsMode::CertManager,
        None => TlsMode::SelfSigned,
    };

    let (issuer_ref, dns_names) = match issuer_override {
        Some((issuer_ref, dns_names)) => (
            CertificateIssuerRef {
                name: issuer_ref.name,
                kind: issuer_ref.kind.or_else(|| Some("Issuer".to_string())),
                group: Some("cert-manager.io".to_string()),
            },
            dns_names.unwrap_or_else(|| certificate_dns_names(ddb)),
        ),
        None => {
            // Own a self-signed Issuer next to the cluster
            let issuer_name = self_signed_issuer_name(ddb);
            let mut issuer = Issuer::new(
                &issuer_name,
                IssuerSpec {
                    self_signed: Some(IssuerSelfSigned {}),
                },
            );
            issuer.metadata.namespace = Some(ns.clone());
            issuer.metadata.owner_references = Some(vec![oref.clone()]);
            let issuer_api: Api<Issuer> = Api::namespaced(ctx.client.clone(), &ns);
            issuer_api
                .patch(&issuer_name, &ps, &Patch::Apply(&issuer))
                .await
                .map_err(Error::KubeError)?;
            (
                CertificateIssuerRef {
                    name: issuer_name,
                    kind: Some("Issuer".to_string()),
                    group: Some("cert-manager.io".to_string()),
                },
                certificate_dns_names(ddb),
            )
        }
    };

    let cert_name = certificate_name(ddb);
    let secret_name = certificate_secret_name(ddb);
    let mut certificate = Certificate::new(
        &cert_name,
        CertificateSpec {
            secret_name: secret_name.clone(),
            dns_names: Some(dns_names),
            issuer_ref,
            duration: Some("2160h".to_string()),
            renew_before: Some(format!("{}h", RENEWAL_WINDOW_DAYS * 24)),
        },
    );
    certificate.metadata.namespace = Some(ns.clone());
    certificate.metadata.owner_references = Some(vec![oref]);

    let cert_api: Api<Certificate> = Api::namespaced(ctx.client.clone(), &ns);
    cert_api
        .patch(&cert_name, &ps, &Patch::Apply(&certificate))
        .await
        .map_err(Error::KubeError)?;

    let observed = cert_api.get(&cert_name).await.map_err(Error::KubeError)?;
    if !observed.is_ready() {
        debug!("Certificate {} not ready yet", cert_name);
        return Ok(TlsOutcome {
            status: TlsStatus {
                ready: false,
                mode,
                secretName: None,
                expirationTime: None,
            },
            phase: TlsPhase::Provisioning,
        });
    }

    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    let secret = match secret_api.get(&secret_name).await {
        Ok(secret) => secret,
        Err(_) => {
            return Ok(TlsOutcome {
                status: TlsStatus {
                    ready: false,
                    mode,
                    secretName: None,
                    expirationTime: None,
                },
                phase: TlsPhase::Provisioning,
            })
        }
    };

    // Issued secrets are re-checked before publishing: the Certificate can be
    // Ready while the secret is mid-rotation.
    build_outcome(&secret, mode, &secret_name, false)
}

fn build_outcome(
    secret: &Secret,
    mode: TlsMode,
    secret_name: &str,
    type_must_match: bool,
) -> Result<TlsOutcome, Error> {
    let valid = match validate_tls_secret(secret, type_must_match) {
        Ok(()) => true,
        Err(e) => {
            warn!("TLS secret {} not usable yet: {}", secret_name, e);
            false
        }
    };
    if !valid {
        return Ok(TlsOutcome {
            status: TlsStatus {
                ready: false,
                mode,
                secretName: None,
                expirationTime: None,
            },
            phase: TlsPhase::Provisioning,
        });
    }

    let expiration = secret
        .data
        .as_ref()
        .and_then(|d| d.get(TLS_CERT_KEY))
        .map(|crt| parse_certificate_expiration(&crt.0))
        .transpose()?;

    let phase = tls_phase(true, true, expiration, Utc::now());
    Ok(TlsOutcome {
        status: TlsStatus {
            ready: true,
            mode,
            secretName: Some(secret_name.to_string()),
            expirationTime: expiration.map(|t| t.to_rfc3339()),
        },
        phase,
    })
}

/// A usable TLS secret carries non-empty `tls.crt` and `tls.key`; in Provided
/// mode it must also be typed `kubernetes.io/tls`.
pub fn validate_tls_secret(secret: &Secret, type_must_match: bool) -> Result<(), Error> {
    if type_must_match && secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
        return Err(Error::TlsConfigError(format!(
            "secret {} is not of type {}",
            secret.name_any(),
            TLS_SECRET_TYPE
        )));
    }
    for key in [TLS_CERT_KEY, TLS_KEY_KEY] {
        let present = secret
            .data
            .as_ref()
            .map(|d| d.get(key).map(|v| !v.0.is_empty()).unwrap_or(false))
            .unwrap_or(false);
        if !present {
            return Err(Error::TlsConfigError(format!(
                "secret {} is missing key {}",
                secret.name_any(),
                key
            )));
        }
    }
    Ok(())
}

/// Parse the first certificate in a PEM bundle and return its notAfter.
pub fn parse_certificate_expiration(pem: &[u8]) -> Result<DateTime<Utc>, Error> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem)
        .map_err(|e| Error::CertificateParseError(format!("invalid PEM: {}", e)))?;
    let cert = parsed
        .parse_x509()
        .map_err(|e| Error::CertificateParseError(format!("invalid certificate: {}", e)))?;
    let ts = cert.validity().not_after.timestamp();
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| Error::CertificateParseError("notAfter out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn tls_secret(type_: Option<&str>, crt: &[u8], key: &[u8]) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(TLS_CERT_KEY.to_string(), ByteString(crt.to_vec()));
        data.insert(TLS_KEY_KEY.to_string(), ByteString(key.to_vec()));
        Secret {
            type_: type_.map(|t| t.to_string()),
            data: Some(data),
            ..Secret::default()
        }
    }

    #[test]
    fn provided_secret_must_be_tls_typed() {
        let secret = tls_secret(Some("Opaque"), b"cert", b"key");
        assert!(validate_tls_secret(&secret, true).is_err());
        // Issued secrets are not re-checked for type
        assert!(validate_tls_secret(&secret, false).is_ok());
    }

    #[test]
    fn empty_key_material_is_rejected() {
        let secret = tls_secret(Some(TLS_SECRET_TYPE), b"cert", b"");
        assert!(validate_tls_secret(&secret, true).is_err());
    }

    #[test]
    fn valid_secret_passes() {
        let secret = tls_secret(Some(TLS_SECRET_TYPE), b"cert", b"key");
        assert!(validate_tls_secret(&secret, true).is_ok());
    }

    #[test]
    fn phase_machine_follows_material_state() {
        let now = Utc::now();
        assert_eq!(tls_phase(false, false, None, now), TlsPhase::Absent);
        assert_eq!(tls_phase(true, false, None, now), TlsPhase::Provisioning);
        assert_eq!(tls_phase(true, true, None, now), TlsPhase::Ready);
        let far = now + Duration::days(90);
        assert_eq!(tls_phase(true, true, Some(far), now), TlsPhase::Ready);
        let soon = now + Duration::days(7);
        assert_eq!(tls_phase(true, true, Some(soon), now), TlsPhase::Renewing);
    }

    #[test]
    fn expiration_of_a_generated_certificate_parses() {
        let cert = rcgen::generate_simple_self_signed(vec!["db.example.com".to_string()]).unwrap();
        let pem = cert.cert.pem();
        let not_after = parse_certificate_expiration(pem.as_bytes()).unwrap();
        assert!(not_after > Utc::now());
    }

    #[test]
    fn garbage_is_not_a_certificate() {
        assert!(parse_certificate_expiration(b"not a pem").is_err());
    }

    #[test]
    fn dns_names_cover_the_exposure_service() {
        let mut ddb = DocumentDB::new("sample", Default::default());
        ddb.metadata.namespace = Some("default".to_string());
        let names = certificate_dns_names(&ddb);
        assert_eq!(
            names,
            vec![
                "documentdb-service-sample".to_string(),
                "documentdb-service-sample.default.svc".to_string(),
                "documentdb-service-sample.default.svc.cluster.local".to_string(),
            ]
        );
    }
}
