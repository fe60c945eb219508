//! Signaling wire protocol.
//!
//! This module is a pure data layer — no I/O, no async. Every type here
//! crosses the WebSocket link between a peer and the signaling server as
//! a single JSON text message, externally tagged by `type`.
//!
//! SDP descriptions and ICE candidates are opaque to the relay: they are
//! carried as raw JSON values and never inspected, only bounded in size
//! and checked for room membership.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from a peer to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Register a new room. The creator becomes its first member.
    #[serde(rename_all = "camelCase")]
    CreateRoom { room_id: String },
    /// Direct join: sender reconnects, or legacy links without a lobby.
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    /// Receiver lobby: announce interest and wait for sender approval.
    #[serde(rename_all = "camelCase")]
    RequestJoin { room_id: String },
    /// Sender admits a pending receiver into the room.
    #[serde(rename_all = "camelCase")]
    PeerAccepted { room_id: String, peer_id: String },
    /// Sender turns a pending receiver away.
    #[serde(rename_all = "camelCase")]
    PeerRejected { room_id: String, peer_id: String },
    /// SDP offer, relayed verbatim to the other room member.
    #[serde(rename_all = "camelCase")]
    Offer { offer: Value, room_id: String },
    /// SDP answer, relayed verbatim to the other room member.
    #[serde(rename_all = "camelCase")]
    Answer { answer: Value, room_id: String },
    /// ICE candidate, relayed verbatim to the other room member.
    #[serde(rename_all = "camelCase")]
    Candidate { candidate: Value, room_id: String },
}

impl ClientEvent {
    /// Room the event addresses.
    pub fn room_id(&self) -> &str {
        match self {
            ClientEvent::CreateRoom { room_id }
            | ClientEvent::JoinRoom { room_id }
            | ClientEvent::RequestJoin { room_id }
            | ClientEvent::PeerAccepted { room_id, .. }
            | ClientEvent::PeerRejected { room_id, .. }
            | ClientEvent::Offer { room_id, .. }
            | ClientEvent::Answer { room_id, .. }
            | ClientEvent::Candidate { room_id, .. } => room_id,
        }
    }

    /// Whether this event counts against the per-peer rate limit.
    ///
    /// `offer` and `answer` are exempt: their payloads dominate and are
    /// bounded by the payload guard instead.
    pub fn rate_limited(&self) -> bool {
        !matches!(self, ClientEvent::Offer { .. } | ClientEvent::Answer { .. })
    }
}

/// Messages sent from the signaling server to a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Ack of `create-room`.
    #[serde(rename_all = "camelCase")]
    RoomCreated { room_id: String },
    /// The recipient is now a member of the room.
    #[serde(rename_all = "camelCase")]
    RoomJoined { room_id: String },
    /// `join-room` / `request-join` named a room that does not exist.
    #[serde(rename_all = "camelCase")]
    RoomNotFound { room_id: String },
    /// Ack of `request-join`; the receiver now awaits approval.
    #[serde(rename_all = "camelCase")]
    JoinRequested { room_id: String },
    /// Delivered to room members when a receiver asks to join.
    #[serde(rename_all = "camelCase")]
    PeerJoinRequest { peer_id: String, room_id: String },
    /// Delivered to the other members when a peer enters the room.
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String, room_id: String },
    /// Delivered to a requester the sender turned away.
    #[serde(rename_all = "camelCase")]
    PeerRejected { peer_id: String, room_id: String },
    /// Relayed offer, augmented with the sending peer.
    #[serde(rename_all = "camelCase")]
    Offer {
        offer: Value,
        room_id: String,
        from: String,
    },
    /// Relayed answer, augmented with the sending peer.
    #[serde(rename_all = "camelCase")]
    Answer {
        answer: Value,
        room_id: String,
        from: String,
    },
    /// Relayed ICE candidate, augmented with the sending peer.
    #[serde(rename_all = "camelCase")]
    Candidate {
        candidate: Value,
        room_id: String,
        from: String,
    },
    /// Recoverable error; the connection stays up.
    AppError { message: String },
}

impl ServerEvent {
    pub fn app_error(message: impl Into<String>) -> Self {
        ServerEvent::AppError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_wire_shape() {
        let ev = ClientEvent::CreateRoom {
            room_id: "abc123".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "create-room", "roomId": "abc123"})
        );

        let ev = ClientEvent::PeerAccepted {
            room_id: "r".into(),
            peer_id: "p".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "peer-accepted", "roomId": "r", "peerId": "p"})
        );
    }

    #[test]
    fn test_envelope_round_trip() {
        let ev = ClientEvent::Offer {
            offer: json!({"type": "offer", "sdp": "v=0..."}),
            room_id: "deadbeef".into(),
        };
        let text = serde_json::to_string(&ev).unwrap();
        let back: ClientEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_server_event_wire_shape() {
        let ev = ServerEvent::Candidate {
            candidate: json!({"candidate": "candidate:1 1 udp ..."}),
            room_id: "r".into(),
            from: "peer-a".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "candidate");
        assert_eq!(v["from"], "peer-a");
        assert_eq!(v["roomId"], "r");

        let err = ServerEvent::app_error("room already exists");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"type": "app-error", "message": "room already exists"})
        );
    }

    #[test]
    fn test_rate_limit_exemptions() {
        let offer = ClientEvent::Offer {
            offer: json!({}),
            room_id: "r".into(),
        };
        let answer = ClientEvent::Answer {
            answer: json!({}),
            room_id: "r".into(),
        };
        let cand = ClientEvent::Candidate {
            candidate: json!({}),
            room_id: "r".into(),
        };
        assert!(!offer.rate_limited());
        assert!(!answer.rate_limited());
        assert!(cand.rate_limited());
        assert!(ClientEvent::CreateRoom { room_id: "r".into() }.rate_limited());
    }
}
