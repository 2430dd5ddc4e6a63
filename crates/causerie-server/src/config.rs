//! Broker configuration loaded from environment variables.
//!
//! Every setting has a default so the broker starts with zero
//! configuration for local development.

use std::net::SocketAddr;

use causerie_shared::constants::{APP_NAME, DEFAULT_HTTP_PORT, MAX_FILE_SIZE};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket listener.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Name reported to clients in the handshake.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Causerie"`
    pub instance_name: String,

    /// Largest WebSocket frame accepted from a client. Must leave room
    /// for a base64-encoded file at the size cap.
    /// Env: `MAX_FRAME_BYTES`
    /// Default: 80 MiB
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: APP_NAME.to_string(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Base64 inflates by 4/3; the rest is envelope overhead.
fn default_max_frame_bytes() -> usize {
    (MAX_FILE_SIZE as usize / 3 + 1) * 4 + 8 * 1024 * 1024
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            if !name.trim().is_empty() {
                config.instance_name = name;
            }
        }

        if let Some(val) = lookup("MAX_FRAME_BYTES") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_frame_bytes = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_FRAME_BYTES, using default"),
            }
        }

        config
    }
}
