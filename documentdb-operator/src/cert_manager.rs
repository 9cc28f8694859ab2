// Hand-carried subset of the cert-manager Certificate and Issuer CRDs, kept
// in the generated style. cert-manager owns the full schema; this operator
// only creates these resources and reads their Ready condition.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CertificateSpec defines the desired state of a cert-manager Certificate.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    plural = "certificates"
)]
#[kube(namespaced)]
#[kube(status = "CertificateStatus")]
pub struct CertificateSpec {
    /// Name of the Secret resource that will be automatically created and managed by this Certificate resource
    #[serde(rename = "secretName")]
    pub secret_name: String,
    /// DNSNames is a list of DNS subjectAltNames to be set on the Certificate
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "dnsNames")]
    pub dns_names: Option<Vec<String>>,
    /// IssuerRef is a reference to the issuer for this certificate
    #[serde(rename = "issuerRef")]
    pub issuer_ref: CertificateIssuerRef,
    /// The requested 'duration' (i.e. lifetime) of the Certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// How long before the currently issued certificate's expiry cert-manager should renew the certificate
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "renewBefore"
    )]
    pub renew_before: Option<String>,
}

/// IssuerRef is a reference to the issuer for this certificate
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CertificateIssuerRef {
    /// Name of the resource being referred to
    pub name: String,
    /// Kind of the resource being referred to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Group of the resource being referred to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// CertificateStatus defines the observed state of a Certificate.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CertificateStatus {
    /// List of status conditions to indicate the status of the certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<CertificateCondition>>,
    /// The expiration time of the certificate stored in the secret named by spec.secretName
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "notAfter")]
    pub not_after: Option<String>,
    /// The time after which the certificate stored in the secret named by spec.secretName should be renewed
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "renewalTime"
    )]
    pub renewal_time: Option<String>,
}

/// CertificateCondition contains condition information for a Certificate.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CertificateCondition {
    /// Type of the condition, known values are (`Ready`, `Issuing`)
    #[serde(rename = "type")]
    pub r#type: String,
    /// Status of the condition, one of (`True`, `False`, `Unknown`)
    pub status: String,
    /// Brief reason for the condition's last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable description of the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Certificate {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.r#type == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }
}

/// IssuerSpec defines the desired state of a cert-manager Issuer.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Issuer",
    plural = "issuers"
)]
#[kube(namespaced)]
pub struct IssuerSpec {
    /// SelfSigned configures this issuer to sign certificates using a self-signed CA
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "selfSigned"
    )]
    pub self_signed: Option<IssuerSelfSigned>,
}

/// SelfSigned configures this issuer to sign certificates using a self-signed CA
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct IssuerSelfSigned {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_readiness_follows_the_ready_condition() {
        let mut cert = Certificate::new(
            "sample",
            CertificateSpec {
                secret_name: "sample-tls".to_string(),
                issuer_ref: CertificateIssuerRef {
                    name: "self-signed".to_string(),
                    kind: Some("Issuer".to_string()),
                    group: None,
                },
                ..CertificateSpec::default()
            },
        );
        assert!(!cert.is_ready());

        cert.status = Some(CertificateStatus {
            conditions: Some(vec![CertificateCondition {
                r#type: "Ready".to_string(),
                status: "True".to_string(),
                reason: Some("Issued".to_string()),
                message: None,
            }]),
            not_after: Some("2030-01-01T00:00:00Z".to_string()),
            renewal_time: None,
        });
        assert!(cert.is_ready());
    }
}
