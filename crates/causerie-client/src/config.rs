//! Client configuration loaded from `CAUSERIE_*` environment variables.

use std::time::Duration;

use causerie_net::SessionConfig;
use causerie_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_STUN_SERVERS, RECONNECT_DELAY_SECS, RING_TIMEOUT_SECS, WS_PATH,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker WebSocket URL.
    /// Env: `CAUSERIE_SERVER_URL`
    /// Default: `ws://localhost:8080/chat-websocket`
    pub server_url: String,

    /// Pause between connection attempts.
    /// Env: `CAUSERIE_RECONNECT_DELAY_SECS`
    /// Default: 5
    pub reconnect_delay: Duration,

    /// Consecutive failed attempts before giving up (unset = never).
    /// Env: `CAUSERIE_MAX_RECONNECT_ATTEMPTS`
    pub max_reconnect_attempts: Option<u32>,

    /// How long an incoming call rings before it is declined.
    /// Env: `CAUSERIE_RING_TIMEOUT_SECS`
    /// Default: 30
    pub ring_timeout: Duration,

    /// STUN servers for the media link, comma separated.
    /// Env: `CAUSERIE_STUN_SERVERS`
    pub stun_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://localhost:{DEFAULT_HTTP_PORT}{WS_PATH}"),
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            max_reconnect_attempts: None,
            ring_timeout: Duration::from_secs(RING_TIMEOUT_SECS),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("CAUSERIE_SERVER_URL") {
            config.server_url = url;
        }

        if let Some(secs) = parse_secs(&lookup, "CAUSERIE_RECONNECT_DELAY_SECS") {
            config.reconnect_delay = secs;
        }

        if let Some(val) = lookup("CAUSERIE_MAX_RECONNECT_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(0) => config.max_reconnect_attempts = None,
                Ok(n) => config.max_reconnect_attempts = Some(n),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid CAUSERIE_MAX_RECONNECT_ATTEMPTS, ignoring")
                }
            }
        }

        if let Some(secs) = parse_secs(&lookup, "CAUSERIE_RING_TIMEOUT_SECS") {
            config.ring_timeout = secs;
        }

        if let Some(list) = lookup("CAUSERIE_STUN_SERVERS") {
            let servers: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !servers.is_empty() {
                config.stun_servers = servers;
            }
        }

        config
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reconnect_delay: self.reconnect_delay,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let val = lookup(key)?;
    match val.parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(key, value = %val, "Invalid duration, using default");
            None
        }
    }
}
