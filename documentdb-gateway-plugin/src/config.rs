use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Server certificate and key presented to the PGO
    pub tls_cert: String,
    pub tls_key: String,
    /// CA bundle the PGO's client certificate must chain to
    pub client_ca: String,
    /// Fallback gateway image when the plugin parameters omit one
    pub gateway_image: String,
    pub gateway_port: i32,
    pub opentelemetry_endpoint_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: from_env_default("SERVER_HOST", "0.0.0.0"),
            server_port: from_env_default("SERVER_PORT", "8445")
                .parse::<u16>()
                .unwrap_or(8445),
            tls_cert: from_env_default("TLS_CERT", "/certs/tls.crt"),
            tls_key: from_env_default("TLS_KEY", "/certs/tls.key"),
            client_ca: from_env_default("CLIENT_CA", "/certs/ca.crt"),
            gateway_image: from_env_default("DOCUMENTDB_GATEWAY_IMAGE", ""),
            gateway_port: from_env_default("DOCUMENTDB_GATEWAY_PORT", "10260")
                .parse::<i32>()
                .unwrap_or(10260),
            opentelemetry_endpoint_url: env::var("OPENTELEMETRY_ENDPOINT_URL").ok(),
        }
    }
}

/// source a variable from environment - use default if not exists
fn from_env_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}
