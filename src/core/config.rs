//! Centralized configuration constants for roomdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format details (frame layout, event names)
//! stay in their respective modules.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk payload size in bytes (128 KB). The metadata frame
/// always reports the size the transfer started with.
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Smallest chunk payload a client may be configured with.
pub const MIN_CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk payload a client may be configured with.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// High water mark for the data channel send buffer (bytes).
/// When `buffered_amount` exceeds this value the send loop parks itself
/// until the buffered-amount-low notification fires.
pub const BUFFER_HIGH_WATER: usize = 1024 * 1024;

/// Low water threshold installed on the data channel. Crossing it from
/// above is the sole resume signal for a paused send loop.
pub const BUFFER_LOW_WATER: usize = 256 * 1024;

/// Receives larger than this are streamed to disk instead of assembled
/// in memory (200 MB).
pub const MAX_IN_MEMORY_SIZE: u64 = 200 * 1024 * 1024;

/// Batch size bounds for the adaptive send loop.
pub const BATCH_MIN: u32 = 1;
pub const BATCH_MAX: u32 = 20;

/// Yield interval bounds between send batches.
pub const YIELD_MIN: Duration = Duration::from_millis(10);
pub const YIELD_MAX: Duration = Duration::from_millis(200);

/// Initial yield interval between send batches.
pub const YIELD_INITIAL: Duration = Duration::from_millis(50);

/// Minimum interval between progress reports to the presenter.
pub const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(500);

// ── Connection / Negotiation ─────────────────────────────────────────────────

/// Time allowed for the data channel to reach the open state before the
/// controller reports a failure. Suppressed while a sender has not yet
/// observed any peer join its room.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while the send pipeline waits for the channel to open.
pub const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between a transport `disconnected` report and the
/// user-visible "peer went offline" error.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(4);

/// Delay between detecting a vanished peer and restarting the sender's
/// connection for the same room.
pub const RESTART_DELAY: Duration = Duration::from_millis(250);

/// Delay between observing a peer join and creating the offer, giving the
/// receiver time to install its own peer connection after `room-joined`.
pub const OFFER_DELAY: Duration = Duration::from_millis(600);

/// After a signaling reconnect the sender re-asserts membership with
/// `join-room`; if the room is gone it falls back to `create-room` after
/// this delay so the receiver never races a transient `room-not-found`.
pub const REJOIN_FALLBACK_DELAY: Duration = Duration::from_millis(750);

/// Cap for the signaling client's exponential reconnect backoff.
pub const SIGNALING_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Initial signaling reconnect backoff.
pub const SIGNALING_BACKOFF_START: Duration = Duration::from_millis(500);

// ── Server limits ────────────────────────────────────────────────────────────

/// Rooms are strictly two-occupant: one sender, one receiver.
pub const MAX_PEERS_PER_ROOM: usize = 2;

/// Rooms older than this are deleted at the next sweep.
pub const ROOM_TTL: Duration = Duration::from_secs(30 * 60);

/// Interval between room TTL sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Sliding window for the per-peer event rate limiter.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Maximum non-exempt events per peer per [`RATE_WINDOW`].
pub const RATE_MAX: u32 = 10;

/// Maximum serialized size of a relayed signal envelope.
pub const MAX_SIGNAL_PAYLOAD: usize = 64 * 1024;

// ── Runtime configuration (served from `/config`) ────────────────────────────

/// One ICE server entry, in the shape peers hand to the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Client-visible runtime configuration, fetched from the server's
/// `/config` endpoint. Server-only settings (port, TTLs, payload caps,
/// CORS) never appear here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub default_chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub buffer_high_water: usize,
    pub buffer_low_water: usize,
    pub max_in_memory_size: u64,
    /// 0 means unlimited.
    pub max_file_size: u64,
    pub app_title: String,
    pub theme_color: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub donate_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub terms_url: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunk_size: MIN_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            buffer_high_water: BUFFER_HIGH_WATER,
            buffer_low_water: BUFFER_LOW_WATER,
            max_in_memory_size: MAX_IN_MEMORY_SIZE,
            max_file_size: 0,
            app_title: "roomdrop".to_string(),
            theme_color: "#2f81f7".to_string(),
            donate_url: String::new(),
            terms_url: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_camel_case_keys() {
        let json = serde_json::to_value(RuntimeConfig::default()).unwrap();
        assert!(json.get("iceServers").is_some());
        assert!(json.get("defaultChunkSize").is_some());
        assert!(json.get("maxInMemorySize").is_some());
        // Empty optional URLs are omitted entirely.
        assert!(json.get("donateUrl").is_none());
    }
}
