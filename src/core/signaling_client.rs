//! WebSocket signaling client with automatic reconnection.
//!
//! Reconnects forever with exponential backoff capped at five seconds.
//! Outbound events queue in the command channel while the link is down
//! and flush on reconnect; the session re-asserts its room membership
//! whenever a `Connected` notice arrives.

use crate::core::config::{SIGNALING_BACKOFF_CAP, SIGNALING_BACKOFF_START};
use crate::core::protocol::{ClientEvent, ServerEvent};
use crate::utils::sos::SignalOfStop;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// What the session sees from the signaling link.
#[derive(Debug)]
pub enum SignalNotice {
    /// The link is up (first connect or reconnect).
    Connected,
    /// A decoded server event.
    Event(ServerEvent),
    /// The link dropped; reconnection is already underway.
    Lost,
}

/// Handle for sending client events; the pump task owns the socket.
#[derive(Clone)]
pub struct SignalingClient {
    cmd_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl SignalingClient {
    /// Spawn the connection pump against `url` (a `ws://…/ws` endpoint).
    pub fn start(url: String, sos: SignalOfStop) -> (Self, mpsc::UnboundedReceiver<SignalNotice>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(url, cmd_rx, notice_tx, sos));
        (Self { cmd_tx }, notice_rx)
    }

    /// Queue an event; it is delivered once the link is up.
    pub fn send(&self, event: ClientEvent) {
        let _ = self.cmd_tx.send(event);
    }

    /// Detached handle for tests: the paired receiver observes every
    /// event the session emits, and no socket is involved.
    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (Self { cmd_tx }, cmd_rx)
    }
}

/// Derive the signaling WebSocket URL from the server's base URL.
pub fn ws_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}/ws")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}/ws")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        format!("{trimmed}/ws")
    } else {
        format!("ws://{trimmed}/ws")
    }
}

async fn pump(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientEvent>,
    notices: mpsc::UnboundedSender<SignalNotice>,
    sos: SignalOfStop,
) {
    let mut backoff = SIGNALING_BACKOFF_START;

    while !sos.cancelled() {
        match sos.select(connect_async(url.as_str())).await {
            Err(()) => break,
            Ok(Err(e)) => {
                warn!(event = "signaling_connect_failed", %url, error = %e, retry_in = ?backoff);
            }
            Ok(Ok((stream, _response))) => {
                info!(event = "signaling_connected", %url);
                backoff = SIGNALING_BACKOFF_START;
                if notices.send(SignalNotice::Connected).is_err() {
                    return;
                }

                let (mut write, mut read) = stream.split();
                loop {
                    tokio::select! {
                        _ = sos.wait() => {
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                        cmd = cmd_rx.recv() => {
                            let Some(event) = cmd else { return };
                            match serde_json::to_string(&event) {
                                Ok(json) => {
                                    if write.send(Message::Text(json)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(event = "signal_encode_failed", error = %e),
                            }
                        }
                        frame = read.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<ServerEvent>(&text) {
                                        Ok(event) => {
                                            if notices.send(SignalNotice::Event(event)).is_err() {
                                                return;
                                            }
                                        }
                                        Err(e) => {
                                            warn!(event = "malformed_server_event", error = %e)
                                        }
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    debug!(event = "signaling_read_error", error = %e);
                                    break;
                                }
                            }
                        }
                    }
                }

                if notices.send(SignalNotice::Lost).is_err() {
                    return;
                }
            }
        }

        if sos.select(tokio::time::sleep(backoff)).await.is_err() {
            break;
        }
        backoff = (backoff * 2).min(SIGNALING_BACKOFF_CAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_derivation() {
        assert_eq!(ws_url("http://localhost:8080"), "ws://localhost:8080/ws");
        assert_eq!(ws_url("https://drop.example.com/"), "wss://drop.example.com/ws");
        assert_eq!(ws_url("ws://10.0.0.2:9000"), "ws://10.0.0.2:9000/ws");
        assert_eq!(ws_url("localhost:8080"), "ws://localhost:8080/ws");
    }
}
