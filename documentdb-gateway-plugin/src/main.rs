use actix_web::{dev::ServerHandle, web, App, HttpServer};
use documentdb_gateway_plugin::{
    config::Config,
    health::{liveness, readiness},
    lifecycle::lifecycle,
    mutate::mutate,
    watcher::CertificateUpdateHandler,
};
use kube::Client;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::*;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = Config::default();

    // Initialize logging
    tracing_log::LogTracer::init().ok();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let stop_handle = web::Data::new(StopHandle::default());

    // Setup Kubernetes Client for the lifecycle hooks
    let kube_client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            panic!("Failed to create Kubernetes client: {}", e);
        }
    };

    // Watch the serving certificate so a rotation reloads the listener
    let should_restart = Arc::new(AtomicBool::new(false));
    let event_handler = CertificateUpdateHandler {
        should_restart: should_restart.clone(),
    };
    let mut cert_watcher: RecommendedWatcher =
        match notify::Watcher::new(event_handler, notify::Config::default()) {
            Ok(w) => w,
            Err(e) => {
                panic!("Error creating filesystem watcher: {}", e);
            }
        };
    if let Err(e) = cert_watcher.watch(config.tls_cert.as_ref(), RecursiveMode::NonRecursive) {
        error!("Error watching TLS certificate: {}", e);
    }
    if let Err(e) = cert_watcher.watch(config.tls_key.as_ref(), RecursiveMode::NonRecursive) {
        error!("Error watching TLS key: {}", e);
    }

    loop {
        // Reload the TLS certificate and key file. The PGO side of the plugin
        // protocol authenticates with a client certificate.
        let mut tls_config = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
        tls_config
            .set_private_key_file(config.tls_key.clone(), SslFiletype::PEM)
            .unwrap();
        tls_config
            .set_certificate_chain_file(config.tls_cert.clone())
            .unwrap();
        tls_config.set_ca_file(config.client_ca.clone()).unwrap();
        tls_config.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        let server_bind_address = format!("{}:{}", config.server_host, config.server_port);

        let server = HttpServer::new({
            let config_data = web::Data::new(config.clone());
            let kube_data = web::Data::new(Arc::new(kube_client.clone()));
            let stop_handle = stop_handle.clone();
            move || {
                {
                    App::new()
                        .app_data(config_data.clone())
                        .app_data(kube_data.clone())
                        .app_data(stop_handle.clone())
                        .service(liveness)
                        .service(readiness)
                        .service(mutate)
                        .service(lifecycle)
                }
            }
        })
        .bind_openssl(server_bind_address, tls_config)?
        .shutdown_timeout(5)
        .run();

        stop_handle.register(server.handle());

        info!(
            "Starting HTTPS server at https://{}:{}/",
            config.server_host, config.server_port
        );
        debug!("Config: {:?}", config);
        server.await?;

        // If the certificate hasn't changed, break out of the loop.
        if !should_restart.load(Ordering::Relaxed) {
            break;
        }

        // Reset the flag for the next iteration
        should_restart.store(false, Ordering::Relaxed);
    }

    Ok(())
}

#[derive(Default)]
struct StopHandle {
    inner: Mutex<Option<ServerHandle>>,
}

impl StopHandle {
    // Set the ServerHandle to stop
    pub(crate) fn register(&self, handle: ServerHandle) {
        *self.inner.lock() = Some(handle);
    }
}
