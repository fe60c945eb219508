//! Disk-backed implementations of the file access ports.
//!
//! The receive sink writes into a `.partial` sibling and renames into
//! place on commit, so an interrupted transfer never leaves a
//! half-written file under the final name.

use crate::core::error::TransferError;
use crate::core::ports::{ByteSink, FileSource, SinkProvider};
use crate::core::transfer::FileMetadata;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::{debug, warn};

// ── Source ────────────────────────────────────────────────────────────────────

/// Read access to a local file being sent.
pub struct DiskFileSource {
    name: String,
    len: u64,
    last_modified: i64,
    file: Mutex<File>,
}

impl DiskFileSource {
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(TransferError::validation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(Self {
            name,
            len: meta.len(),
            last_modified,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl FileSource for DiskFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn mime(&self) -> &str {
        ""
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
    }

    async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        let want = (len as u64).min(self.len.saturating_sub(offset)) as usize;
        let mut buf = vec![0u8; want];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

/// Streaming sink writing to `<dest>.partial`, renamed on commit.
pub struct TempFileSink {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: File,
}

impl TempFileSink {
    pub async fn create(dest: PathBuf) -> Result<Self, TransferError> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let temp_path = partial_path(&dest);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        Ok(Self {
            temp_path,
            final_path: dest,
            file,
        })
    }
}

#[async_trait]
impl ByteSink for TempFileSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<String, TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        tokio::fs::rename(&self.temp_path, &self.final_path).await?;
        debug!(event = "sink_committed", path = %self.final_path.display());
        Ok(self.final_path.display().to_string())
    }

    async fn abort(self: Box<Self>) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.temp_path).await {
            warn!(event = "partial_cleanup_failed", path = %self.temp_path.display(), error = %e);
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    name.push_str(".partial");
    dest.with_file_name(name)
}

// ── Provider ──────────────────────────────────────────────────────────────────

/// Streams incoming files into a download directory, never trusting the
/// advertised name as a path.
pub struct SaveDirProvider {
    dir: PathBuf,
}

impl SaveDirProvider {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl SinkProvider for SaveDirProvider {
    async fn open(&self, meta: &FileMetadata) -> Option<Box<dyn ByteSink>> {
        let dest = unique_path(&self.dir, &sanitize_file_name(&meta.name)).await;
        match TempFileSink::create(dest).await {
            Ok(sink) => Some(Box::new(sink)),
            Err(e) => {
                warn!(event = "sink_open_failed", error = %e);
                None
            }
        }
    }
}

/// Reduce a peer-supplied display name to one safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .next_back()
        .unwrap_or("");
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let trimmed = safe.trim_matches([' ', '.']);
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// First free `name`, `name (1)`, `name (2)`, … inside `dir`.
async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s.to_string(), format!(".{e}")),
        _ => (name.to_string(), String::new()),
    };
    for i in 1u32.. {
        let candidate = dir.join(format!("{stem} ({i}){ext}"));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
    }
    unreachable!()
}
