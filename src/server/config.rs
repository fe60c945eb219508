//! Server-side configuration, read from the environment.
//!
//! These knobs never reach the client; the client-visible subset is the
//! [`RuntimeConfig`](crate::core::config::RuntimeConfig) served from
//! `/config`.

use crate::core::config::{RuntimeConfig, MAX_PEERS_PER_ROOM, MAX_SIGNAL_PAYLOAD, ROOM_TTL};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Origins allowed by the CORS layer; empty means permissive.
    pub cors_origins: Vec<String>,
    pub trust_proxy: bool,
    pub max_signal_payload: usize,
    pub max_peers_per_room: usize,
    pub room_ttl: Duration,
    /// What `/config` hands to connecting peers.
    pub runtime: RuntimeConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut runtime = RuntimeConfig::default();
        if let Ok(title) = env::var("ROOMDROP_APP_TITLE") {
            runtime.app_title = title;
        }
        if let Ok(urls) = env::var("ROOMDROP_STUN_URLS") {
            runtime.ice_servers = urls
                .split(',')
                .filter(|u| !u.trim().is_empty())
                .map(|u| crate::core::config::IceServerConfig::stun(u.trim()))
                .collect();
        }
        if let Ok(max) = env::var("ROOMDROP_MAX_FILE_SIZE") {
            runtime.max_file_size = max.parse().unwrap_or(0);
        }

        Self {
            port: env::var("ROOMDROP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            cors_origins: env::var("ROOMDROP_CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            trust_proxy: env::var("ROOMDROP_TRUST_PROXY")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            max_signal_payload: env::var("ROOMDROP_MAX_SIGNAL_PAYLOAD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(MAX_SIGNAL_PAYLOAD),
            max_peers_per_room: MAX_PEERS_PER_ROOM,
            room_ttl: env::var("ROOMDROP_ROOM_TTL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(ROOM_TTL),
            runtime,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            cors_origins: Vec::new(),
            trust_proxy: false,
            max_signal_payload: MAX_SIGNAL_PAYLOAD,
            max_peers_per_room: MAX_PEERS_PER_ROOM,
            room_ttl: ROOM_TTL,
            runtime: RuntimeConfig::default(),
        }
    }
}
