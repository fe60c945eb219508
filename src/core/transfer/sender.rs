//! Send pipeline: slices the file, frames chunks, and feeds the data
//! channel under adaptive backpressure.
//!
//! The loop pauses by *returning* whenever the channel's buffered amount
//! exceeds the high water mark; the buffered-amount-low notification is
//! the single resume signal. Between batches the loop cedes the
//! scheduler through a timer, and at each batch boundary the batch size
//! and yield interval are retuned against the observed buffer level.

use crate::core::config::{
    BATCH_MAX, BATCH_MIN, BUFFER_HIGH_WATER, DEFAULT_CHUNK_SIZE, OPEN_POLL_INTERVAL, OPEN_TIMEOUT,
    YIELD_INITIAL, YIELD_MAX, YIELD_MIN,
};
use crate::core::error::TransferError;
use crate::core::ports::{ChannelState, DataChannel, FileSource, Presenter};
use crate::core::transfer::progress::ProgressThrottle;
use crate::core::transfer::{encode_chunk_frame_into, total_chunks, FileMetadata};
use crate::utils::ids::secure_id;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Tunable knobs; tests shrink the buffers and deadlines.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub chunk_size: usize,
    pub high_water: usize,
    pub open_timeout: Duration,
    pub open_poll_interval: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_water: BUFFER_HIGH_WATER,
            open_timeout: OPEN_TIMEOUT,
            open_poll_interval: OPEN_POLL_INTERVAL,
        }
    }
}

impl SenderConfig {
    /// Buffer level the adaptive tuner steers toward:
    /// `max(128 KB, high_water / 2)`.
    fn target_buffer(&self) -> usize {
        (self.high_water / 2).max(128 * 1024)
    }
}

/// Batch/yield tuning, persisted across transfers within a session so a
/// restarted connection starts from the last known-good shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendTuning {
    pub batch_size: u32,
    pub yield_interval: Duration,
}

impl Default for SendTuning {
    fn default() -> Self {
        Self {
            batch_size: BATCH_MIN,
            yield_interval: YIELD_INITIAL,
        }
    }
}

/// Why the loop returned control to the driver.
#[derive(Debug, PartialEq)]
pub enum SendStatus {
    /// Buffered amount crossed the high water mark; waiting for the
    /// low-water notification.
    Paused,
    /// Every byte was handed to the channel.
    Complete(SendTuning),
}

/// One outbound file transfer. Owns the file handle for its duration.
pub struct SendPipeline {
    channel: Arc<dyn DataChannel>,
    file: Arc<dyn FileSource>,
    presenter: Arc<dyn Presenter>,
    config: SenderConfig,

    file_id: String,
    offset: u64,
    base_chunk_size: usize,
    current_chunk_size: usize,
    batch_size: u32,
    yield_interval: Duration,
    paused: bool,
    backpressure_events: u32,
    chunks_in_batch: u32,
    progress: ProgressThrottle,
    frame_buf: Vec<u8>,
}

impl SendPipeline {
    pub fn new(
        channel: Arc<dyn DataChannel>,
        file: Arc<dyn FileSource>,
        presenter: Arc<dyn Presenter>,
        tuning: SendTuning,
        config: SenderConfig,
    ) -> Self {
        let chunk = config.chunk_size;
        Self {
            channel,
            file,
            presenter,
            config,
            file_id: secure_id(),
            offset: 0,
            base_chunk_size: chunk,
            current_chunk_size: chunk,
            batch_size: tuning.batch_size.clamp(BATCH_MIN, BATCH_MAX),
            yield_interval: tuning.yield_interval.clamp(YIELD_MIN, YIELD_MAX),
            paused: false,
            backpressure_events: 0,
            chunks_in_batch: 0,
            progress: ProgressThrottle::new(Instant::now()),
            frame_buf: Vec::new(),
        }
    }

    pub fn tuning(&self) -> SendTuning {
        SendTuning {
            batch_size: self.batch_size,
            yield_interval: self.yield_interval,
        }
    }

    /// Wait for the channel, announce the metadata, then run the loop.
    pub async fn start(&mut self) -> Result<SendStatus, TransferError> {
        self.wait_channel_open().await?;

        let meta = FileMetadata {
            file_id: self.file_id.clone(),
            name: self.file.name().to_string(),
            size: self.file.len(),
            file_type: self.file.mime().to_string(),
            last_modified: self.file.last_modified(),
            total_chunks: total_chunks(self.file.len(), self.base_chunk_size),
            chunk_size: self.base_chunk_size as u32,
        };
        let text = serde_json::to_string(&meta)
            .map_err(|e| TransferError::validation(format!("metadata encode: {e}")))?;
        self.channel.send_text(text).await?;

        info!(
            event = "file_send_start",
            file_id = %self.file_id,
            name = %meta.name,
            bytes = meta.size,
            total_chunks = meta.total_chunks,
        );
        self.run().await
    }

    /// Resume after a buffered-amount-low notification. `None` when the
    /// notification arrives while the loop is not parked.
    pub async fn on_buffered_low(&mut self) -> Result<Option<SendStatus>, TransferError> {
        if self.paused && self.offset < self.file.len() {
            self.paused = false;
            self.run().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// The main loop. Returns on pause or completion; every error is
    /// terminal for this transfer.
    async fn run(&mut self) -> Result<SendStatus, TransferError> {
        let size = self.file.len();

        while self.offset < size {
            let buffered = self.channel.buffered_amount().await;
            if buffered > self.config.high_water {
                self.paused = true;
                self.backpressure_events += 1;
                debug!(
                    event = "send_paused",
                    file_id = %self.file_id,
                    buffered,
                    high_water = self.config.high_water,
                    backpressure_events = self.backpressure_events,
                );
                return Ok(SendStatus::Paused);
            }

            let want = self
                .current_chunk_size
                .min((size - self.offset) as usize);
            let payload = self
                .file
                .read_range(self.offset, want)
                .await
                .map_err(|e| TransferError::transport(format!("Read error: {e}")))?;

            encode_chunk_frame_into(&mut self.frame_buf, &payload);

            if self.channel.ready_state() != ChannelState::Open {
                return Err(TransferError::transport("data channel closed mid-transfer"));
            }
            self.channel
                .send_binary(Bytes::copy_from_slice(&self.frame_buf))
                .await?;

            self.offset += payload.len() as u64;
            if let Some(report) = self.progress.update(self.offset, size, Instant::now()) {
                self.presenter.progress(&report);
            }

            self.chunks_in_batch += 1;
            if self.chunks_in_batch >= self.batch_size {
                self.chunks_in_batch = 0;
                let buffered = self.channel.buffered_amount().await;
                self.retune(buffered);
                tokio::time::sleep(self.yield_interval).await;
            }
        }

        info!(
            event = "file_send_complete",
            file_id = %self.file_id,
            bytes = size,
            backpressure_events = self.backpressure_events,
            batch_size = self.batch_size,
            yield_ms = self.yield_interval.as_millis() as u64,
        );
        Ok(SendStatus::Complete(self.tuning()))
    }

    /// Adaptive rules, applied at each batch boundary: grow under a
    /// healthy link, shrink before the high-water guard would trip.
    fn retune(&mut self, buffered: usize) {
        let target = self.config.target_buffer();
        if buffered < target / 4 && self.batch_size < BATCH_MAX {
            self.batch_size = (self.batch_size + 2).min(BATCH_MAX);
            self.yield_interval = self
                .yield_interval
                .saturating_sub(Duration::from_millis(5))
                .max(YIELD_MIN);
        } else if buffered > target && self.batch_size > BATCH_MIN {
            self.batch_size = (((self.batch_size as f64) * 0.7).floor() as u32).max(BATCH_MIN);
            self.yield_interval =
                (self.yield_interval + Duration::from_millis(20)).min(YIELD_MAX);
        }
    }

    /// Spin until the channel opens, with a hard deadline.
    async fn wait_channel_open(&self) -> Result<(), TransferError> {
        let deadline = Instant::now() + self.config.open_timeout;
        loop {
            match self.channel.ready_state() {
                ChannelState::Open => return Ok(()),
                ChannelState::Closed => {
                    return Err(TransferError::transport("data channel is closed"))
                }
                state => {
                    if Instant::now() >= deadline {
                        warn!(event = "channel_open_timeout", ?state);
                        return Err(TransferError::transport("channel open timeout"));
                    }
                    tokio::time::sleep(self.config.open_poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::{MemoryFile, MockChannel, NullPresenter};
    use crate::core::transfer::{decode_chunk_frame, verify_chunk};

    fn small_config() -> SenderConfig {
        SenderConfig {
            chunk_size: 16,
            high_water: BUFFER_HIGH_WATER,
            open_timeout: Duration::from_millis(200),
            open_poll_interval: Duration::from_millis(10),
        }
    }

    fn pipeline(channel: Arc<MockChannel>, data: &[u8], config: SenderConfig) -> SendPipeline {
        SendPipeline::new(
            channel,
            Arc::new(MemoryFile::new("hello.txt", data)),
            Arc::new(NullPresenter),
            SendTuning::default(),
            config,
        )
    }

    #[tokio::test]
    async fn test_small_file_single_frame() {
        let channel = Arc::new(MockChannel::open());
        let mut tx = pipeline(channel.clone(), b"hello, world\n", small_config());

        let status = tx.start().await.unwrap();
        assert!(matches!(status, SendStatus::Complete(_)));

        let meta = FileMetadata::parse(&channel.sent_texts()[0]).unwrap();
        assert_eq!(meta.size, 13);
        assert_eq!(meta.total_chunks, 1);
        assert_eq!(meta.chunk_size, 16);

        let frames = channel.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 17);
        let (crc, payload) = decode_chunk_frame(&frames[0]).unwrap();
        verify_chunk(crc, payload).unwrap();
        assert_eq!(payload, b"hello, world\n");
    }

    #[tokio::test]
    async fn test_zero_byte_file_sends_only_metadata() {
        let channel = Arc::new(MockChannel::open());
        let mut tx = pipeline(channel.clone(), b"", small_config());
        let status = tx.start().await.unwrap();
        assert!(matches!(status, SendStatus::Complete(_)));

        let meta = FileMetadata::parse(&channel.sent_texts()[0]).unwrap();
        assert_eq!(meta.size, 0);
        assert_eq!(meta.total_chunks, 0);
        assert!(channel.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_exact_multiple_chunking() {
        let channel = Arc::new(MockChannel::open());
        let data = vec![0xA5u8; 64];
        let mut tx = pipeline(channel.clone(), &data, small_config());
        tx.start().await.unwrap();

        let frames = channel.sent_frames();
        assert_eq!(frames.len(), 4);
        for frame in &frames {
            let (crc, payload) = decode_chunk_frame(frame).unwrap();
            verify_chunk(crc, payload).unwrap();
            assert_eq!(payload.len(), 16);
        }
    }

    #[tokio::test]
    async fn test_backpressure_pauses_and_low_event_resumes() {
        let channel = Arc::new(MockChannel::open());
        // First loop-top reading is over the high water mark.
        channel.script_buffered(vec![2 * 1024 * 1024]);
        let data = vec![1u8; 48];
        let mut tx = pipeline(channel.clone(), &data, small_config());

        let status = tx.start().await.unwrap();
        assert_eq!(status, SendStatus::Paused);
        assert!(channel.sent_frames().is_empty());

        // Drained: the low-water notification re-enters the loop.
        let status = tx.on_buffered_low().await.unwrap();
        assert!(matches!(status, Some(SendStatus::Complete(_))));
        assert_eq!(channel.sent_frames().len(), 3);

        // A spurious low event after completion is a no-op.
        assert_eq!(tx.on_buffered_low().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_adaptive_growth_on_healthy_link() {
        let channel = Arc::new(MockChannel::open());
        let data = vec![2u8; 16 * 12];
        let mut tx = pipeline(channel.clone(), &data, small_config());
        tx.start().await.unwrap();

        // With an empty buffer every boundary grows the batch and
        // shrinks the yield.
        let tuning = tx.tuning();
        assert!(tuning.batch_size > BATCH_MIN);
        assert!(tuning.yield_interval < YIELD_INITIAL);
    }

    #[tokio::test]
    async fn test_adaptive_decay_under_pressure() {
        let channel = Arc::new(MockChannel::open());
        // Ten loop-top readings stay under the high water mark; the
        // batch-boundary reading sits above the tuning target.
        let mut script = vec![0; 10];
        script.push(600_000);
        channel.script_buffered(script);
        let data = vec![3u8; 16 * 12];
        let mut tx = SendPipeline::new(
            channel.clone(),
            Arc::new(MemoryFile::new("f", &data)),
            Arc::new(NullPresenter),
            SendTuning {
                batch_size: 10,
                yield_interval: Duration::from_millis(50),
            },
            small_config(),
        );
        tx.start().await.unwrap();

        let tuning = tx.tuning();
        assert_eq!(tuning.batch_size, 7);
        assert_eq!(tuning.yield_interval, Duration::from_millis(70));
    }

    #[tokio::test]
    async fn test_channel_close_mid_transfer_fails() {
        let channel = Arc::new(MockChannel::open());
        channel.close_after_sends(2);
        let data = vec![4u8; 16 * 8];
        let mut tx = pipeline(channel.clone(), &data, small_config());
        let err = tx.start().await.unwrap_err();
        assert!(matches!(err, TransferError::Transport(_)));
    }

    #[tokio::test]
    async fn test_open_timeout() {
        let channel = Arc::new(MockChannel::connecting());
        let mut tx = pipeline(channel, b"abc", small_config());
        let err = tx.start().await.unwrap_err();
        match err {
            TransferError::Transport(msg) => assert!(msg.contains("open timeout")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
