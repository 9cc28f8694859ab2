// Include the #[ignore] macro on slow tests
// That way, 'cargo test' does not run them by default.
// To run just these tests, use 'cargo test -- --ignored'
// To run all tests, use 'cargo test -- --include-ignored'
//
// https://doc.rust-lang.org/book/ch11-02-running-tests.html
//
// These tests assume there is already kubernetes running and you have a context configured.
// It also assumes that the CRD(s) and operator are already installed for this cluster.
// In this way, it can be used as a conformance test on a target, separate from installation.
//
// Do your best to keep the function names as unique as possible.  This will help with
// debugging and troubleshooting and also Rust seems to match like named tests and will run them
// at the same time.  This can cause issues if they are not independent.

#[cfg(test)]
mod test {
    use controller::{
        apis::documentdb_types::{DocumentDB, DocumentDBPhase},
        backups::types::{Backup, ScheduledBackup},
        cloudnativepg::clusters::Cluster,
        service::exposure_service_name,
    };
    use k8s_openapi::{
        api::core::v1::{Namespace, Secret, Service},
        apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
        ByteString,
    };
    use kube::{
        api::{DeleteParams, Patch, PatchParams, PostParams},
        runtime::wait::{await_condition, conditions},
        Api, Client, Config, ResourceExt,
    };
    use std::{collections::BTreeMap, time::Duration};

    const API_VERSION: &str = "documentdb.io/preview";
    // Timeout settings while waiting for an event
    const TIMEOUT_SECONDS_READY: u64 = 600;
    const TIMEOUT_SECONDS_SECRET_PRESENT: u64 = 120;
    const TIMEOUT_SECONDS_DDB_DELETED: u64 = 120;

    async fn kube_client() -> Client {
        // Get the name of the currently selected namespace
        let kube_config = Config::infer()
            .await
            .expect("Please configure your Kubernetes context.");
        let selected_namespace = &kube_config.default_namespace;

        // Initialize the Kubernetes client
        let client =
            Client::try_from(kube_config.clone()).expect("Failed to initialize Kubernetes client");

        // Next, check that the currently selected namespace is labeled
        // to allow the running of tests.
        let namespaces: Api<Namespace> = Api::all(client.clone());
        let namespace = namespaces.get(selected_namespace).await.unwrap();
        let labels = namespace.metadata.labels.unwrap();
        assert!(
            labels.contains_key("safe-to-run-documentdb-tests"),
            "expected to find label 'safe-to-run-documentdb-tests'"
        );
        assert_eq!(
            labels["safe-to-run-documentdb-tests"], "true",
            "expected to find label 'safe-to-run-documentdb-tests' with value 'true'"
        );

        // Check that the CRD is installed
        let custom_resource_definitions: Api<CustomResourceDefinition> = Api::all(client.clone());
        let _check_for_crd = tokio::time::timeout(
            Duration::from_secs(2),
            await_condition(
                custom_resource_definitions,
                "documentdbs.documentdb.io",
                conditions::is_crd_established(),
            ),
        )
        .await
        .expect("Custom Resource Definition for DocumentDB was not found.");

        client
    }

    async fn create_credential_secret(client: Client, namespace: &str) {
        let secret_api: Api<Secret> = Api::namespaced(client, namespace);
        let mut data = BTreeMap::new();
        data.insert(
            "username".to_string(),
            ByteString(b"documentdb".to_vec()),
        );
        data.insert("password".to_string(), ByteString(b"s3cr3t".to_vec()));
        let secret = Secret {
            metadata: kube::core::ObjectMeta {
                name: Some("documentdb-credentials".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Secret::default()
        };
        let _ = secret_api.create(&PostParams::default(), &secret).await;
    }

    async fn wait_for_phase(
        ddbs: &Api<DocumentDB>,
        name: &str,
        phase: DocumentDBPhase,
        timeout_seconds: u64,
    ) {
        let result = tokio::time::timeout(Duration::from_secs(timeout_seconds), async {
            loop {
                if let Ok(ddb) = ddbs.get(name).await {
                    if ddb.status.as_ref().map(|s| s.phase) == Some(phase) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "timed out waiting for {} to reach {:?}",
            name,
            phase
        );
    }

    #[tokio::test]
    #[ignore]
    async fn functional_test_basic_provisioning() {
        let client = kube_client().await;
        let namespace = client.default_namespace().to_string();
        create_credential_secret(client.clone(), &namespace).await;

        let name = "ddb-basic";
        let ddbs: Api<DocumentDB> = Api::namespaced(client.clone(), &namespace);

        let ddb = serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "DocumentDB",
            "metadata": {
                "name": name
            },
            "spec": {
                "nodeCount": 1,
                "instancesPerNode": 1,
                "resource": {"storage": {"pvcSize": "10Gi"}},
                "exposeViaService": {"serviceType": "ClusterIP"},
                "tls": {"mode": "SelfSigned"}
            }
        });
        let params = PatchParams::apply("documentdb-integration-test");
        let patch = Patch::Apply(&ddb);
        let _ = ddbs.patch(name, &params, &patch).await.unwrap();

        wait_for_phase(&ddbs, name, DocumentDBPhase::Ready, TIMEOUT_SECONDS_READY).await;

        // Connection string advertises TLS against the self-signed material
        let ddb = ddbs.get(name).await.unwrap();
        let connection = ddb
            .status
            .as_ref()
            .and_then(|s| s.connectionString.clone())
            .expect("Ready DocumentDB must publish a connection string");
        assert!(connection.contains("tls=true&tlsAllowInvalidCertificates=true"));
        assert!(connection.contains(":10260/"));

        // Exposure service exists with the deterministic name and type
        let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
        let svc = services.get(&exposure_service_name(&ddb)).await.unwrap();
        assert_eq!(
            svc.spec.as_ref().unwrap().type_.as_deref(),
            Some("ClusterIP")
        );
        let selector = svc.spec.as_ref().unwrap().selector.clone().unwrap();
        assert_eq!(selector.get("replica_type").map(String::as_str), Some("primary"));

        // The underlying Postgres cluster carries the sidecar plugin block
        let clusters: Api<Cluster> = Api::namespaced(client.clone(), &namespace);
        let cluster = clusters.get(name).await.unwrap();
        let plugins = cluster.spec.plugins.unwrap();
        assert_eq!(plugins[0].name, "documentdb-sidecar-injector");

        // Cleanup
        let _ = ddbs.delete(name, &DeleteParams::default()).await;
        let result = tokio::time::timeout(
            Duration::from_secs(TIMEOUT_SECONDS_DDB_DELETED),
            async {
                while ddbs.get(name).await.is_ok() {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            },
        )
        .await;
        assert!(result.is_ok(), "DocumentDB was not deleted in time");
    }

    #[tokio::test]
    #[ignore]
    async fn functional_test_provided_tls_happy_path() {
        let client = kube_client().await;
        let namespace = client.default_namespace().to_string();
        create_credential_secret(client.clone(), &namespace).await;

        // Pre-create a valid TLS secret the way an external syncer would
        let cert = rcgen::generate_simple_self_signed(vec!["db.example.com".to_string()]).unwrap();
        let secret_api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
        let mut data = BTreeMap::new();
        data.insert(
            "tls.crt".to_string(),
            ByteString(cert.cert.pem().into_bytes()),
        );
        data.insert(
            "tls.key".to_string(),
            ByteString(cert.key_pair.serialize_pem().into_bytes()),
        );
        let tls_secret = Secret {
            metadata: kube::core::ObjectMeta {
                name: Some("documentdb-provided-tls".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("kubernetes.io/tls".to_string()),
            ..Secret::default()
        };
        let _ = secret_api
            .create(&PostParams::default(), &tls_secret)
            .await;

        let name = "ddb-provided-tls";
        let ddbs: Api<DocumentDB> = Api::namespaced(client.clone(), &namespace);
        let ddb = serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "DocumentDB",
            "metadata": {"name": name},
            "spec": {
                "tls": {
                    "mode": "Provided",
                    "provided": {"secretName": "documentdb-provided-tls"}
                }
            }
        });
        let params = PatchParams::apply("documentdb-integration-test");
        let _ = ddbs.patch(name, &params, &Patch::Apply(&ddb)).await.unwrap();

        // status.tls.ready within a bounded interval, naming the given secret
        let result = tokio::time::timeout(
            Duration::from_secs(TIMEOUT_SECONDS_SECRET_PRESENT),
            async {
                loop {
                    if let Ok(ddb) = ddbs.get(name).await {
                        if let Some(tls) = ddb.status.as_ref().and_then(|s| s.tls.as_ref()) {
                            if tls.ready {
                                assert_eq!(
                                    tls.secretName.as_deref(),
                                    Some("documentdb-provided-tls")
                                );
                                return;
                            }
                        }
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            },
        )
        .await;
        assert!(result.is_ok(), "TLS did not become ready in time");

        // The plugin block forwards the same secret to the gateway
        let clusters: Api<Cluster> = Api::namespaced(client.clone(), &namespace);
        let cluster = clusters.get(name).await.unwrap();
        let plugins = cluster.spec.plugins.unwrap();
        let parameters = plugins[0].parameters.as_ref().unwrap();
        assert_eq!(
            parameters.get("gatewayTLSSecret").map(String::as_str),
            Some("documentdb-provided-tls")
        );

        let _ = ddbs.delete(name, &DeleteParams::default()).await;
    }

    #[tokio::test]
    #[ignore]
    async fn functional_test_recovery_from_missing_backup_fails() {
        let client = kube_client().await;
        let namespace = client.default_namespace().to_string();
        create_credential_secret(client.clone(), &namespace).await;

        let name = "ddb-recovery-missing";
        let ddbs: Api<DocumentDB> = Api::namespaced(client.clone(), &namespace);
        let ddb = serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "DocumentDB",
            "metadata": {"name": name},
            "spec": {
                "bootstrap": {"recovery": {"backup": {"name": "does-not-exist"}}}
            }
        });
        let params = PatchParams::apply("documentdb-integration-test");
        let _ = ddbs.patch(name, &params, &Patch::Apply(&ddb)).await.unwrap();

        wait_for_phase(&ddbs, name, DocumentDBPhase::Failed, TIMEOUT_SECONDS_SECRET_PRESENT).await;

        let ddb = ddbs.get(name).await.unwrap();
        let conditions = ddb
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        assert!(
            conditions
                .iter()
                .any(|c| c.type_ == "Failed" && c.reason == "BackupNotFound"),
            "expected a Failed condition with reason BackupNotFound"
        );

        // No Postgres cluster may have been created
        let clusters: Api<Cluster> = Api::namespaced(client.clone(), &namespace);
        assert!(clusters.get(name).await.is_err());

        let _ = ddbs.delete(name, &DeleteParams::default()).await;
    }

    #[tokio::test]
    #[ignore]
    async fn functional_test_scheduled_backup_cadence() {
        let client = kube_client().await;
        let namespace = client.default_namespace().to_string();

        let name = "ddb-scheduled";
        let scheduled: Api<ScheduledBackup> = Api::namespaced(client.clone(), &namespace);
        let sb = serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "ScheduledBackup",
            "metadata": {"name": name},
            "spec": {
                "clusterRef": "ddb-basic",
                "schedule": "*/5 * * * *",
                "retentionDays": 1
            }
        });
        let params = PatchParams::apply("documentdb-integration-test");
        let _ = scheduled
            .patch(name, &params, &Patch::Apply(&sb))
            .await
            .unwrap();

        // Over ~15 minutes of wall clock, three children appear, retention inherited
        let backups: Api<Backup> = Api::namespaced(client.clone(), &namespace);
        let result = tokio::time::timeout(Duration::from_secs(16 * 60), async {
            loop {
                let list = backups.list(&Default::default()).await.unwrap();
                let children: Vec<_> = list
                    .items
                    .iter()
                    .filter(|b| b.name_any().starts_with(name))
                    .collect();
                if children.len() >= 3 {
                    for child in children {
                        assert_eq!(child.spec.retentionDays, Some(1));
                    }
                    return;
                }
                tokio::time::sleep(Duration::from_secs(15)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "expected three scheduled backups");

        let _ = scheduled.delete(name, &DeleteParams::default()).await;
    }
}
