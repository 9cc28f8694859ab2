use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceConversion, ServiceReference, WebhookClientConfig, WebhookConversion,
};
use kube::CustomResourceExt;

fn main() {
    // DocumentDB is multi-version: merge the spokes around the stored hub
    let versions = vec![
        controller::apis::documentdb_types::DocumentDB::crd(),
        controller::apis::v1alpha1::DocumentDB::crd(),
    ];
    let mut documentdb = kube::core::crd::merge_crds(versions, "preview")
        .expect("failed to merge DocumentDB versions");
    // Non-storage versions are converted by the operator's /convert endpoint.
    // The caBundle is injected at install time alongside the serving cert.
    documentdb.spec.conversion = Some(CustomResourceConversion {
        strategy: "Webhook".to_string(),
        webhook: Some(WebhookConversion {
            client_config: Some(WebhookClientConfig {
                service: Some(ServiceReference {
                    name: "documentdb-operator".to_string(),
                    namespace: "documentdb-system".to_string(),
                    path: Some("/convert".to_string()),
                    port: Some(8443),
                }),
                ca_bundle: None,
                url: None,
            }),
            conversion_review_versions: vec!["v1".to_string()],
        }),
    });
    print!("{}", serde_yaml::to_string(&documentdb).unwrap());
    print!(
        "---\n{}",
        serde_yaml::to_string(&controller::backups::types::Backup::crd()).unwrap()
    );
    print!(
        "---\n{}",
        serde_yaml::to_string(&controller::backups::types::ScheduledBackup::crd()).unwrap()
    );
}
