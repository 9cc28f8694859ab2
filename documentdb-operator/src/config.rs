use crate::defaults;
use std::env;

/// Process-wide configuration, read once at startup. Values from the
/// environment are consulted only when the corresponding DocumentDB spec
/// field is empty; explicit spec always wins.
#[derive(Clone, Debug)]
pub struct Config {
    pub documentdb_image: String,
    pub gateway_image: String,
    pub sidecar_image: String,
    pub documentdb_version: String,
    pub enable_scaling_controller: bool,
    /// Name of the member cluster this operator runs in. Used to decide
    /// whether a replicated DocumentDB materializes as primary or standby.
    pub cluster_name: String,
    /// Run the cross-cluster ReplicationCoordinator. Only one cluster in a
    /// fleet (the hub) sets this.
    pub fleet_hub: bool,
    pub engine_port: i32,
    pub gateway_port: i32,
    pub sidecar_plugin_port: i32,
    /// Serving certificate for the version-conversion webhook. Both paths
    /// must be set for the HTTPS listener to start; without it only the hub
    /// storage version is usable.
    pub conversion_tls_cert: String,
    pub conversion_tls_key: String,
    pub conversion_port: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            documentdb_image: from_env_default("DOCUMENTDB_IMAGE", &defaults::default_image()),
            gateway_image: from_env_default(
                "DOCUMENTDB_GATEWAY_IMAGE",
                &defaults::default_gateway_image(),
            ),
            sidecar_image: from_env_default(
                "DOCUMENTDB_SIDECAR_IMAGE",
                &defaults::default_sidecar_image(),
            ),
            documentdb_version: from_env_default(
                "DOCUMENTDB_VERSION",
                &defaults::default_documentdb_version(),
            ),
            enable_scaling_controller: from_env_default("ENABLE_SCALING_CONTROLLER", "false")
                == "true",
            cluster_name: from_env_default("CLUSTER_NAME", "local"),
            fleet_hub: from_env_default("FLEET_HUB", "false") == "true",
            engine_port: parse_port("DOCUMENTDB_ENGINE_PORT", 5432),
            gateway_port: parse_port("DOCUMENTDB_GATEWAY_PORT", 10260),
            sidecar_plugin_port: parse_port("SIDECAR_PLUGIN_PORT", 8445),
            conversion_tls_cert: from_env_default("CONVERSION_TLS_CERT", ""),
            conversion_tls_key: from_env_default("CONVERSION_TLS_KEY", ""),
            conversion_port: parse_port("CONVERSION_WEBHOOK_PORT", 8443),
        }
    }
}

/// source a variable from environment - use default if not exists
fn from_env_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_port(key: &str, default: i32) -> i32 {
    match from_env_default(key, &default.to_string()).parse::<i32>() {
        Ok(p) => p,
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        // None of these variables are set in the test environment
        let cfg = Config::default();
        assert_eq!(cfg.engine_port, 5432);
        assert_eq!(cfg.gateway_port, 10260);
        assert_eq!(cfg.sidecar_plugin_port, 8445);
        assert_eq!(cfg.conversion_port, 8443);
        assert!(cfg.conversion_tls_cert.is_empty());
        assert!(!cfg.fleet_hub);
        assert!(!cfg.enable_scaling_controller);
    }
}
