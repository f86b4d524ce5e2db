//! HTTP listener settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Value of `connection_security` that enables TLS termination in-process.
pub const CONNECTION_SECURITY_TLS: &str = "TLS";

/// Listener and process lifecycle settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// `""` for plain sockets or `"TLS"`.
    pub connection_security: String,
    /// Upper bound on graceful shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Version string announced in `hello` events and ping replies.
    pub server_version: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8065,
            connection_security: String::new(),
            shutdown_timeout_secs: 30,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerSettings {
    /// Whether connection security is enabled.
    pub fn is_tls(&self) -> bool {
        self.connection_security
            .eq_ignore_ascii_case(CONNECTION_SECURITY_TLS)
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Graceful shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
