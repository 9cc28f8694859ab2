//! Helper methods only available for tests
use crate::{
    apis::documentdb_types::DocumentDB, controller::DOCUMENTDB_FINALIZER, Context, Diagnostics,
    Metrics,
};
use assert_json_diff::assert_json_include;
use http::{Request, Response};
use hyper::Body;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tokio::sync::RwLock;

impl DocumentDB {
    /// A bare DocumentDB in the default namespace, as the apiserver would
    /// first hand it to the controller.
    pub fn test() -> Self {
        let mut ddb = DocumentDB::new("sample", Default::default());
        ddb.metadata.namespace = Some("default".to_string());
        ddb
    }

    /// Modify the resource as it would look after the finalizer was attached
    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(DOCUMENTDB_FINALIZER.to_string());
        self
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

impl ApiServerVerifier {
    /// Handle the expected finalizer-attaching PATCH and respond with the
    /// finalized object.
    pub fn handle_finalizer_creation(mut self, ddb: &DocumentDB) -> tokio::task::JoinHandle<()> {
        let ddb = ddb.clone();
        tokio::spawn(async move {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/documentdb.io/preview/namespaces/default/documentdbs/{}?",
                    ddb.name_any()
                )
            );
            let expected_patch = serde_json::json!([
                { "op": "test", "path": "/metadata/finalizers", "value": null },
                { "op": "add", "path": "/metadata/finalizers", "value": vec![DOCUMENTDB_FINALIZER] }
            ]);
            let request_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
            let runtime_patch: serde_json::Value =
                serde_json::from_slice(&request_body).expect("valid json from runtime");
            assert_json_include!(actual: runtime_patch, expected: expected_patch);

            let response = serde_json::to_vec(&ddb.finalized()).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
        })
    }
}

impl Context {
    // Create a test context with a mocked kube client
    pub fn test() -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let ctx = Self {
            client: mock_client,
            metrics: Metrics::default(),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
        };
        (Arc::new(ctx), ApiServerVerifier(handle))
    }
}
