//! roomdrop: direct browser-style peer-to-peer file transfer.
//!
//! Two peers rendezvous through a lightweight signaling relay, complete
//! a sender-approval handshake, negotiate a WebRTC data channel, and
//! stream the file directly — framed chunks with a leading CRC32,
//! adaptive backpressure on the channel's buffered amount, and a
//! receive path that assembles in memory or streams to disk. The
//! relay never sees a payload byte.

pub mod core;
pub mod server;
pub mod utils;
