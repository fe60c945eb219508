//! Per-connection event rate limiter and signal payload guard.
//!
//! Both rejections produce a single `app-error` reply to the offending
//! peer; neither ever disconnects the socket.

use crate::core::config::{RATE_MAX, RATE_WINDOW};
use std::collections::HashMap;
use std::time::Instant;

/// Fixed-window counter state for one peer.
#[derive(Debug)]
struct RateState {
    count: u32,
    window_end: Instant,
}

/// Per-peer fixed-window rate limiter with refill at the boundary.
#[derive(Debug, Default)]
pub struct RateLimiter {
    states: HashMap<String, RateState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one event for `peer`. Returns `false` when the peer has
    /// exhausted its quota for the current window.
    pub fn allow(&mut self, peer: &str, now: Instant) -> bool {
        match self.states.get_mut(peer) {
            Some(state) if now <= state.window_end => {
                if state.count >= RATE_MAX {
                    return false;
                }
                state.count += 1;
                true
            }
            _ => {
                self.states.insert(
                    peer.to_string(),
                    RateState {
                        count: 1,
                        window_end: now + RATE_WINDOW,
                    },
                );
                true
            }
        }
    }

    /// Drop a peer's window state (disconnect path).
    pub fn forget(&mut self, peer: &str) {
        self.states.remove(peer);
    }
}

/// Whether a serialized signal envelope fits under the relay's size cap.
pub fn payload_within_limit(serialized_len: usize, max: usize) -> bool {
    serialized_len <= max
}
