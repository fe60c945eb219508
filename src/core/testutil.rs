//! In-memory fakes for the capability ports, shared by the pipeline and
//! controller tests.

use crate::core::error::TransferError;
use crate::core::ports::{
    ByteSink, ChannelState, DataChannel, FileSource, PeerEvent, PeerTransport, Presenter,
    ReceivedFile, SinkProvider, TransportFactory,
};
use crate::core::transfer::progress::ProgressReport;
use crate::core::transfer::FileMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ── Data channel ──────────────────────────────────────────────────────────────

/// Scriptable data channel: records outbound frames, replays buffered
/// amount readings, and can close itself after N sends.
pub struct MockChannel {
    state: Mutex<ChannelState>,
    texts: Mutex<Vec<String>>,
    frames: Mutex<Vec<Vec<u8>>>,
    buffered_script: Mutex<VecDeque<usize>>,
    close_after: Mutex<Option<usize>>,
}

impl MockChannel {
    pub fn open() -> Self {
        let ch = Self::connecting();
        *ch.state.lock().unwrap() = ChannelState::Open;
        ch
    }

    pub fn connecting() -> Self {
        Self {
            state: Mutex::new(ChannelState::Connecting),
            texts: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            buffered_script: Mutex::new(VecDeque::new()),
            close_after: Mutex::new(None),
        }
    }

    /// Queue buffered-amount readings; reads past the script return 0.
    pub fn script_buffered(&self, readings: Vec<usize>) {
        *self.buffered_script.lock().unwrap() = readings.into();
    }

    /// Flip to `Closed` once `n` binary frames have been accepted.
    pub fn close_after_sends(&self, n: usize) {
        *self.close_after.lock().unwrap() = Some(n);
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    fn check_auto_close(&self) {
        if let Some(limit) = *self.close_after.lock().unwrap() {
            if self.frames.lock().unwrap().len() >= limit {
                *self.state.lock().unwrap() = ChannelState::Closed;
            }
        }
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn ready_state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    async fn send_text(&self, text: String) -> Result<(), TransferError> {
        if self.ready_state() != ChannelState::Open {
            return Err(TransferError::transport("mock channel not open"));
        }
        self.texts.lock().unwrap().push(text);
        Ok(())
    }

    async fn send_binary(&self, frame: Bytes) -> Result<(), TransferError> {
        if self.ready_state() != ChannelState::Open {
            return Err(TransferError::transport("mock channel not open"));
        }
        self.frames.lock().unwrap().push(frame.to_vec());
        self.check_auto_close();
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered_script.lock().unwrap().pop_front().unwrap_or(0)
    }

    async fn set_low_water(&self, _threshold: usize) {}

    async fn close(&self) {
        *self.state.lock().unwrap() = ChannelState::Closed;
    }
}

// ── File source / sink ────────────────────────────────────────────────────────

pub struct MemoryFile {
    name: String,
    bytes: Vec<u8>,
}

impl MemoryFile {
    pub fn new(name: &str, bytes: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            bytes: bytes.to_vec(),
        }
    }
}

#[async_trait]
impl FileSource for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn mime(&self) -> &str {
        ""
    }

    fn last_modified(&self) -> i64 {
        1_700_000_000_000
    }

    async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        let start = offset as usize;
        let end = (start + len).min(self.bytes.len());
        if start > self.bytes.len() {
            return Err(TransferError::validation("read past end of file"));
        }
        Ok(self.bytes[start..end].to_vec())
    }
}

/// Shared buffer a [`MemorySink`] writes into, inspectable after the
/// sink has been consumed by `commit`/`abort`.
#[derive(Clone, Default)]
pub struct SinkLog {
    pub bytes: Arc<Mutex<Vec<u8>>>,
    pub committed: Arc<AtomicBool>,
    pub aborted: Arc<AtomicBool>,
}

pub struct MemorySink {
    log: SinkLog,
    fail_after: Option<usize>,
    written: usize,
}

impl MemorySink {
    pub fn new(log: SinkLog) -> Self {
        Self {
            log,
            fail_after: None,
            written: 0,
        }
    }

    pub fn failing_after(log: SinkLog, writes: usize) -> Self {
        Self {
            log,
            fail_after: Some(writes),
            written: 0,
        }
    }
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        if let Some(limit) = self.fail_after {
            if self.written >= limit {
                return Err(TransferError::Io(std::io::Error::other("disk full")));
            }
        }
        self.written += 1;
        self.log.bytes.lock().unwrap().extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<String, TransferError> {
        self.log.committed.store(true, Ordering::Relaxed);
        Ok("memory".to_string())
    }

    async fn abort(self: Box<Self>) {
        self.log.aborted.store(true, Ordering::Relaxed);
    }
}

/// Provider that always streams into the given log.
pub struct AlwaysStream {
    pub log: SinkLog,
}

#[async_trait]
impl SinkProvider for AlwaysStream {
    async fn open(&self, _meta: &FileMetadata) -> Option<Box<dyn ByteSink>> {
        Some(Box::new(MemorySink::new(self.log.clone())))
    }
}

/// Provider whose capability is unavailable (or declined).
pub struct NeverStream;

#[async_trait]
impl SinkProvider for NeverStream {
    async fn open(&self, _meta: &FileMetadata) -> Option<Box<dyn ByteSink>> {
        None
    }
}

// ── Presenters ────────────────────────────────────────────────────────────────

/// Presenter that swallows everything and approves every join.
pub struct NullPresenter;

#[async_trait]
impl Presenter for NullPresenter {
    fn status(&self, _text: &str) {}
    fn progress(&self, _report: &ProgressReport) {}
    fn warning(&self, _text: &str) {}
    fn error(&self, _text: &str) {}
    async fn approve_join(&self, _peer_id: &str, _room_id: &str) -> bool {
        true
    }
    fn offer_download(&self, _file: ReceivedFile) {}
    fn file_persisted(&self, _name: &str, _destination: &str) {}
}

/// Presenter that records every surface for assertions.
#[derive(Default)]
pub struct RecordingPresenter {
    pub statuses: Mutex<Vec<String>>,
    pub warnings: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
    pub downloads: Mutex<Vec<ReceivedFile>>,
    pub persisted: Mutex<Vec<(String, String)>>,
    pub approve: AtomicBool,
}

impl RecordingPresenter {
    pub fn approving() -> Self {
        let p = Self::default();
        p.approve.store(true, Ordering::Relaxed);
        p
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<ReceivedFile> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Presenter for RecordingPresenter {
    fn status(&self, text: &str) {
        self.statuses.lock().unwrap().push(text.to_string());
    }
    fn progress(&self, _report: &ProgressReport) {}
    fn warning(&self, text: &str) {
        self.warnings.lock().unwrap().push(text.to_string());
    }
    fn error(&self, text: &str) {
        self.errors.lock().unwrap().push(text.to_string());
    }
    async fn approve_join(&self, _peer_id: &str, _room_id: &str) -> bool {
        self.approve.load(Ordering::Relaxed)
    }
    fn offer_download(&self, file: ReceivedFile) {
        self.downloads.lock().unwrap().push(file);
    }
    fn file_persisted(&self, name: &str, destination: &str) {
        self.persisted
            .lock()
            .unwrap()
            .push((name.to_string(), destination.to_string()));
    }
}

// ── Peer transport ────────────────────────────────────────────────────────────

/// Transport fake recording the negotiation calls made against it.
pub struct MockTransport {
    pub channel: Arc<MockChannel>,
    pub offers_created: AtomicUsize,
    pub remote_offers: Mutex<Vec<Value>>,
    pub remote_answers: Mutex<Vec<Value>>,
    pub candidates: Mutex<Vec<Value>>,
    pub closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            channel: Arc::new(MockChannel::open()),
            offers_created: AtomicUsize::new(0),
            remote_offers: Mutex::new(Vec::new()),
            remote_answers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn applied_candidates(&self) -> Vec<Value> {
        self.candidates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<Value, TransferError> {
        self.offers_created.fetch_add(1, Ordering::Relaxed);
        Ok(json!({"type": "offer", "sdp": "v=0 mock"}))
    }

    async fn apply_remote_offer(&self, offer: &Value) -> Result<Value, TransferError> {
        self.remote_offers.lock().unwrap().push(offer.clone());
        Ok(json!({"type": "answer", "sdp": "v=0 mock"}))
    }

    async fn apply_remote_answer(&self, answer: &Value) -> Result<(), TransferError> {
        self.remote_answers.lock().unwrap().push(answer.clone());
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &Value) -> Result<(), TransferError> {
        if candidate.get("fail").is_some() {
            return Err(TransferError::negotiation("mock candidate failure"));
        }
        self.candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        Some(self.channel.clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.channel.close().await;
    }
}

/// Factory handing out [`MockTransport`]s and keeping them inspectable.
#[derive(Default)]
pub struct MockFactory {
    pub created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.created.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        _initiator: bool,
        _events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransferError> {
        let transport = Arc::new(MockTransport::new());
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
