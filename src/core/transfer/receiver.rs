//! Receive pipeline: parses framed chunks, verifies integrity, and
//! assembles the artifact in memory or streams it to a sink.
//!
//! Completion is gated on the byte count reaching the advertised file
//! size. The metadata's `total_chunks` is only a progress denominator:
//! the sender's chunk sizing may drift, so frame counting is never a
//! termination signal and trailing frames after completion are dropped.

use crate::core::config::MAX_IN_MEMORY_SIZE;
use crate::core::error::TransferError;
use crate::core::ports::{ByteSink, Presenter, ReceivedFile, SinkProvider};
use crate::core::transfer::progress::ProgressThrottle;
use crate::core::transfer::{decode_chunk_frame, verify_chunk, FileMetadata, MIN_FRAME_LEN};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What a frame did to the transfer.
#[derive(Debug, PartialEq)]
pub enum RecvOutcome {
    Receiving,
    Completed(Completion),
}

/// How the finished artifact was delivered.
#[derive(Debug, PartialEq)]
pub enum Completion {
    /// Assembled in memory; hand to the presenter for download.
    InMemory(ReceivedFile),
    /// Persisted incrementally by the streaming sink.
    Streamed { name: String, destination: String },
}

/// One inbound file transfer.
pub struct ReceivePipeline {
    presenter: Arc<dyn Presenter>,
    sinks: Arc<dyn SinkProvider>,
    max_in_memory: u64,

    meta: Option<FileMetadata>,
    received_bytes: u64,
    received_chunks: u32,
    chunks_in_memory: BTreeMap<u32, Vec<u8>>,
    sink: Option<Box<dyn ByteSink>>,
    use_streaming: bool,
    last_validation_error: Option<String>,
    progress: Option<ProgressThrottle>,
    complete: bool,
}

impl ReceivePipeline {
    pub fn new(presenter: Arc<dyn Presenter>, sinks: Arc<dyn SinkProvider>) -> Self {
        Self::with_memory_limit(presenter, sinks, MAX_IN_MEMORY_SIZE)
    }

    pub fn with_memory_limit(
        presenter: Arc<dyn Presenter>,
        sinks: Arc<dyn SinkProvider>,
        max_in_memory: u64,
    ) -> Self {
        Self {
            presenter,
            sinks,
            max_in_memory,
            meta: None,
            received_bytes: 0,
            received_chunks: 0,
            chunks_in_memory: BTreeMap::new(),
            sink: None,
            use_streaming: false,
            last_validation_error: None,
            progress: None,
            complete: false,
        }
    }

    pub fn last_validation_error(&self) -> Option<&str> {
        self.last_validation_error.as_deref()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn received_chunks(&self) -> u32 {
        self.received_chunks
    }

    /// Drop any partial state, discarding streamed bytes.
    pub async fn abort(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.abort().await;
        }
        self.meta = None;
        self.chunks_in_memory.clear();
    }

    /// The metadata text frame: initialize state for a fresh transfer.
    pub async fn on_text(&mut self, text: &str) -> Result<RecvOutcome, TransferError> {
        let meta = FileMetadata::parse(text)?;

        // A new metadata frame supersedes any unfinished transfer.
        if self.meta.is_some() && !self.complete {
            warn!(event = "receive_restarted", name = %meta.name);
            self.abort().await;
        }

        info!(
            event = "file_recv_start",
            file_id = %meta.file_id,
            name = %meta.name,
            bytes = meta.size,
            total_chunks = meta.total_chunks,
        );

        self.received_bytes = 0;
        self.received_chunks = 0;
        self.chunks_in_memory.clear();
        self.last_validation_error = None;
        self.complete = false;
        self.use_streaming = false;
        self.progress = Some(ProgressThrottle::new(Instant::now()));

        if meta.size > self.max_in_memory {
            match self.sinks.open(&meta).await {
                Some(sink) => {
                    self.sink = Some(sink);
                    self.use_streaming = true;
                }
                None => {
                    self.presenter.warning(
                        "streaming save unavailable; buffering in memory may consume significant memory",
                    );
                }
            }
        }

        self.meta = Some(meta);
        if self.meta.as_ref().map(|m| m.size) == Some(0) {
            return self.finish().await.map(RecvOutcome::Completed);
        }
        Ok(RecvOutcome::Receiving)
    }

    /// One binary chunk frame.
    pub async fn on_binary(&mut self, buf: &[u8]) -> Result<RecvOutcome, TransferError> {
        let (file_id, size, total) = match self.meta.as_ref() {
            Some(meta) => (meta.file_id.clone(), meta.size, meta.total_chunks),
            None => {
                debug!(event = "chunk_before_metadata", bytes = buf.len());
                return Ok(RecvOutcome::Receiving);
            }
        };
        if self.complete {
            debug!(event = "chunk_after_completion", bytes = buf.len());
            return Ok(RecvOutcome::Receiving);
        }
        if buf.len() < MIN_FRAME_LEN {
            warn!(event = "short_chunk_frame", bytes = buf.len());
            return Ok(RecvOutcome::Receiving);
        }

        let (received_crc, payload) = decode_chunk_frame(buf)?;
        if let Err(err) = verify_chunk(received_crc, payload) {
            // The channel is ordered and reliable; a mismatch is a
            // defect, not loss. Drop the frame, hold position, stay open
            // for a correct retransmission.
            let message = err.to_string();
            warn!(
                event = "chunk_integrity_failure",
                file_id = %file_id,
                chunk = self.received_chunks,
                %message,
            );
            self.last_validation_error = Some(message.clone());
            self.presenter.error(&message);
            return Ok(RecvOutcome::Receiving);
        }

        if self.received_bytes + payload.len() as u64 > size {
            return Err(TransferError::validation(format!(
                "received {} bytes for a {}-byte file",
                self.received_bytes + payload.len() as u64,
                size
            )));
        }

        if self.use_streaming {
            let sink = self.sink.as_mut().expect("streaming sink present");
            if let Err(e) = sink.write(payload).await {
                self.presenter.error(&format!("write failed: {e}"));
                self.abort().await;
                return Err(e);
            }
        } else {
            self.chunks_in_memory
                .insert(self.received_chunks, payload.to_vec());
        }

        self.received_chunks += 1;
        self.received_bytes += payload.len() as u64;

        if self.received_chunks >= total && self.received_bytes < size {
            // The sender drifted to larger chunks than advertised; byte
            // count remains the canonical signal.
            debug!(
                event = "chunk_count_reached_early",
                received_chunks = self.received_chunks,
                total_chunks = total,
            );
        }
        if let Some(progress) = self.progress.as_mut() {
            if let Some(report) = progress.update(self.received_bytes, size, Instant::now()) {
                self.presenter.progress(&report);
            }
        }

        if self.received_bytes == size {
            return self.finish().await.map(RecvOutcome::Completed);
        }
        Ok(RecvOutcome::Receiving)
    }

    async fn finish(&mut self) -> Result<Completion, TransferError> {
        let meta = self.meta.as_ref().expect("metadata present").clone();
        self.complete = true;

        info!(
            event = "file_recv_complete",
            file_id = %meta.file_id,
            name = %meta.name,
            bytes = self.received_bytes,
            chunks = self.received_chunks,
            streamed = self.use_streaming,
        );

        if self.use_streaming {
            let sink = self.sink.take().expect("streaming sink present");
            let destination = sink.commit().await?;
            Ok(Completion::Streamed {
                name: meta.name,
                destination,
            })
        } else {
            let mut bytes = Vec::with_capacity(self.received_bytes as usize);
            for chunk in std::mem::take(&mut self.chunks_in_memory).into_values() {
                bytes.extend_from_slice(&chunk);
            }
            Ok(Completion::InMemory(ReceivedFile {
                name: meta.name,
                mime: meta.file_type,
                last_modified: meta.last_modified,
                bytes,
            }))
        }
    }
}
