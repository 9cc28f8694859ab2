use notify::EventHandler;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, info};

/// Flags a restart when the serving certificate changes on disk, so the
/// server loop can rebuild its SslAcceptor with the new material.
pub struct CertificateUpdateHandler {
    pub should_restart: Arc<AtomicBool>,
}

impl EventHandler for CertificateUpdateHandler {
    fn handle_event(&mut self, event: notify::Result<notify::Event>) {
        match event {
            Ok(event) => {
                debug!("Filesystem event on TLS material: {:?}", event);
                info!("TLS certificate changed, restarting server.");
                self.should_restart.store(true, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("Error watching TLS certificate: {}", e);
            }
        }
    }
}
