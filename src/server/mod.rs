//! Signaling relay: room lifecycle, admission handshake, and opaque
//! offer/answer/candidate relay between the two peers of a room.

pub mod config;
pub mod hub;
pub mod limits;
pub mod rooms;
pub mod ws;
