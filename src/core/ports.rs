//! Capability ports between the session logic and its environment.
//!
//! The pipelines and the connection controller are written against these
//! traits so that every rule — backpressure, integrity, restart timing —
//! is exercised in tests with in-memory fakes, while the binaries plug
//! in the real WebRTC channel, disk-backed files, and a terminal
//! presenter.

use crate::core::error::TransferError;
use crate::core::transfer::progress::ProgressReport;
use crate::core::transfer::FileMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

// ── Data channel ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// The ordered, reliable byte-stream channel between the two peers.
///
/// Exactly one writer (the send loop) and one reader (the session's
/// event dispatch) may touch it. Inbound traffic and the
/// buffered-amount-low notification arrive as [`PeerEvent`]s on the
/// channel handed to the transport at construction.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn ready_state(&self) -> ChannelState;
    async fn send_text(&self, text: String) -> Result<(), TransferError>;
    async fn send_binary(&self, frame: Bytes) -> Result<(), TransferError>;
    async fn buffered_amount(&self) -> usize;
    /// Install the low-water threshold whose downward crossing fires
    /// [`PeerEvent::BufferedAmountLow`].
    async fn set_low_water(&self, threshold: usize);
    async fn close(&self);
}

// ── Peer transport ────────────────────────────────────────────────────────────

/// Connection-level state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Everything the transport pushes at the session driver loop.
#[derive(Debug)]
pub enum PeerEvent {
    StateChanged(TransportState),
    ChannelOpen,
    ChannelClosed,
    ChannelError(String),
    /// Inbound text frame (the metadata frame).
    ChannelText(String),
    /// Inbound binary frame (a chunk frame).
    ChannelBinary(Bytes),
    /// The send buffer dropped below the low-water threshold.
    BufferedAmountLow,
    /// A local ICE candidate is ready to be relayed.
    LocalCandidate(Value),
    /// Local ICE gathering finished.
    IceGatheringComplete,
}

/// One peer connection attempt: negotiation surface plus its channel.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create and install the local offer; returns it for relay.
    async fn create_offer(&self) -> Result<Value, TransferError>;
    /// Apply the remote offer, create and install the answer; returns
    /// the answer for relay.
    async fn apply_remote_offer(&self, offer: &Value) -> Result<Value, TransferError>;
    async fn apply_remote_answer(&self, answer: &Value) -> Result<(), TransferError>;
    async fn add_remote_candidate(&self, candidate: &Value) -> Result<(), TransferError>;
    /// The data channel, once it exists. Initiators have it from
    /// construction; responders from the moment the channel arrives.
    fn channel(&self) -> Option<Arc<dyn DataChannel>>;
    /// Unhook every callback, then close. Benign close/error events from
    /// the teardown itself must not reach the event stream.
    async fn close(&self);
}

/// Builds one transport per connection attempt; recovery re-invokes it.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        initiator: bool,
        events: tokio::sync::mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransferError>;
}

// ── File access ───────────────────────────────────────────────────────────────

/// Read access to the bytes being sent.
#[async_trait]
pub trait FileSource: Send + Sync {
    fn name(&self) -> &str;
    fn len(&self) -> u64;
    /// MIME hint; may be empty.
    fn mime(&self) -> &str;
    /// Source mtime, milliseconds since the epoch.
    fn last_modified(&self) -> i64;
    async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError>;
}

/// Incremental write destination for a received file.
#[async_trait]
pub trait ByteSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransferError>;
    /// Finish the write and make it durable; returns a human-readable
    /// destination description.
    async fn commit(self: Box<Self>) -> Result<String, TransferError>;
    /// Discard everything written so far.
    async fn abort(self: Box<Self>);
}

/// The environment's file-save capability. `None` means the capability
/// is unavailable or the user declined, and the receiver falls back to
/// in-memory assembly.
#[async_trait]
pub trait SinkProvider: Send + Sync {
    async fn open(&self, meta: &FileMetadata) -> Option<Box<dyn ByteSink>>;
}

// ── Presenter ─────────────────────────────────────────────────────────────────

/// A fully assembled in-memory artifact ready for download.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime: String,
    pub last_modified: i64,
    pub bytes: Vec<u8>,
}

/// The UI surface, abstracted: status text, progress, errors, the
/// download offer, and the sender's approval prompt.
#[async_trait]
pub trait Presenter: Send + Sync {
    fn status(&self, text: &str);
    fn progress(&self, report: &ProgressReport);
    fn warning(&self, text: &str);
    fn error(&self, text: &str);
    /// Sender-side approval prompt for a pending receiver.
    async fn approve_join(&self, peer_id: &str, room_id: &str) -> bool;
    /// Hand an in-memory artifact over for a user-initiated download.
    fn offer_download(&self, file: ReceivedFile);
    /// The artifact was persisted externally by the streaming sink.
    fn file_persisted(&self, name: &str, destination: &str);
}
