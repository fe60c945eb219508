//! File transfer pipeline: wire framing, progress, send and receive.
//!
//! The data channel carries exactly one text frame — the UTF-8 JSON
//! metadata — followed by binary chunk frames:
//!
//!   offset 0..4   little-endian u32 CRC32 of the payload
//!   offset 4..N   payload bytes
//!
//! There is no trailer frame; the receiver finishes when its byte count
//! reaches the advertised file size. Reliable, ordered delivery is the
//! channel's job, so a CRC mismatch indicates a defect rather than a
//! lossy path and halts assembly without closing the channel.

pub mod blob;
pub mod progress;
pub mod receiver;
pub mod sender;

use crate::core::error::TransferError;
use crate::utils::crc32::{crc32, crc32_to_hex};
use serde::{Deserialize, Serialize};

/// Shortest legal chunk frame: four CRC bytes plus one payload byte.
pub const MIN_FRAME_LEN: usize = 5;

/// The first frame on the data channel, sent as JSON text.
///
/// `total_chunks` is derived from the initial chunk size and is only a
/// progress denominator: the sender's adaptive sizing may change how
/// many frames actually arrive, so receivers never treat it as a
/// termination signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename = "metadata")]
pub struct FileMetadata {
    pub file_id: String,
    /// Display only; never trusted as a filesystem path.
    pub name: String,
    pub size: u64,
    /// MIME hint; may be empty.
    pub file_type: String,
    /// Source mtime in milliseconds since the epoch.
    pub last_modified: i64,
    pub total_chunks: u32,
    /// The sender's initial chunk size.
    pub chunk_size: u32,
}

impl FileMetadata {
    /// Parse the metadata text frame, refusing anything whose tag is not
    /// `"metadata"` (serde enforces the tag) or whose chunk accounting
    /// is inconsistent.
    pub fn parse(text: &str) -> Result<Self, TransferError> {
        let meta: FileMetadata = serde_json::from_str(text)
            .map_err(|e| TransferError::validation(format!("bad metadata frame: {e}")))?;
        if meta.chunk_size == 0 {
            return Err(TransferError::validation("metadata chunk_size is zero"));
        }
        let expected = total_chunks(meta.size, meta.chunk_size as usize);
        if meta.total_chunks != expected {
            return Err(TransferError::validation(format!(
                "metadata total_chunks {} does not match ceil({}/{})",
                meta.total_chunks, meta.size, meta.chunk_size
            )));
        }
        Ok(meta)
    }
}

/// `ceil(size / chunk_size)` as the metadata advertises it.
#[inline]
pub fn total_chunks(size: u64, chunk_size: usize) -> u32 {
    if size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64) as u32
}

/// Encode a chunk frame into a reusable buffer, clearing it first:
/// `[le_u32 crc32][payload]`.
pub fn encode_chunk_frame_into(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.clear();
    buf.reserve(4 + payload.len());
    buf.extend_from_slice(&crc32(payload).to_le_bytes());
    buf.extend_from_slice(payload);
}

/// Split a chunk frame into its leading CRC and payload.
pub fn decode_chunk_frame(buf: &[u8]) -> Result<(u32, &[u8]), TransferError> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(TransferError::validation(format!(
            "chunk frame too short: {} bytes",
            buf.len()
        )));
    }
    let crc = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Ok((crc, &buf[4..]))
}

/// Verify a decoded frame's payload against its leading CRC.
pub fn verify_chunk(received_crc: u32, payload: &[u8]) -> Result<(), TransferError> {
    let computed = crc32(payload);
    if computed != received_crc {
        return Err(TransferError::Integrity {
            expected: crc32_to_hex(received_crc),
            actual: crc32_to_hex(computed),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64, chunk_size: u32) -> FileMetadata {
        FileMetadata {
            file_id: "00112233445566778899aabbccddeeff".into(),
            name: "hello.txt".into(),
            size,
            file_type: "text/plain".into(),
            last_modified: 1_700_000_000_000,
            total_chunks: total_chunks(size, chunk_size as usize),
            chunk_size,
        }
    }

    #[test]
    fn test_metadata_wire_shape() {
        let json = serde_json::to_value(meta(13, 16)).unwrap();
        assert_eq!(json["type"], "metadata");
        assert_eq!(json["file_id"], "00112233445566778899aabbccddeeff");
        assert_eq!(json["total_chunks"], 1);
        assert_eq!(json["chunk_size"], 16);
    }

    #[test]
    fn test_metadata_parse_round_trip() {
        let m = meta(1024 * 1024, 128 * 1024);
        let text = serde_json::to_string(&m).unwrap();
        assert_eq!(FileMetadata::parse(&text).unwrap(), m);
    }

    #[test]
    fn test_metadata_rejects_bad_accounting() {
        let mut m = meta(100, 16);
        m.total_chunks = 3;
        let text = serde_json::to_string(&m).unwrap();
        assert!(FileMetadata::parse(&text).is_err());

        let no_tag = r#"{"file_id":"x","name":"y","size":1,"file_type":"","last_modified":0,"total_chunks":1,"chunk_size":1}"#;
        assert!(FileMetadata::parse(no_tag).is_err());
    }

    #[test]
    fn test_total_chunks() {
        assert_eq!(total_chunks(0, 16), 0);
        assert_eq!(total_chunks(1, 16), 1);
        assert_eq!(total_chunks(16, 16), 1);
        assert_eq!(total_chunks(17, 16), 2);
        assert_eq!(total_chunks(32, 16), 2);
    }

    #[test]
    fn test_frame_round_trip() {
        let mut buf = Vec::new();
        encode_chunk_frame_into(&mut buf, b"hello, world\n");
        assert_eq!(buf.len(), 17);

        let (crc, payload) = decode_chunk_frame(&buf).unwrap();
        assert_eq!(payload, b"hello, world\n");
        verify_chunk(crc, payload).unwrap();
    }

    #[test]
    fn test_frame_reuses_buffer() {
        let mut buf = Vec::new();
        encode_chunk_frame_into(&mut buf, &[0xAA; 64]);
        encode_chunk_frame_into(&mut buf, &[0xBB; 8]);
        assert_eq!(buf.len(), 12);
        let (crc, payload) = decode_chunk_frame(&buf).unwrap();
        assert_eq!(payload, &[0xBB; 8]);
        verify_chunk(crc, payload).unwrap();
    }

    #[test]
    fn test_corrupted_frame_is_detected() {
        let mut buf = Vec::new();
        encode_chunk_frame_into(&mut buf, b"payload bytes");
        buf[6] ^= 0x01;
        let (crc, payload) = decode_chunk_frame(&buf).unwrap();
        let err = verify_chunk(crc, payload).unwrap_err();
        match err {
            TransferError::Integrity { expected, actual } => {
                assert_eq!(expected.len(), 8);
                assert_eq!(actual.len(), 8);
                assert_ne!(expected, actual);
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[test]
    fn test_short_frames_rejected() {
        assert!(decode_chunk_frame(&[]).is_err());
        assert!(decode_chunk_frame(&[1, 2, 3, 4]).is_err());
        assert!(decode_chunk_frame(&[1, 2, 3, 4, 5]).is_ok());
    }
}
