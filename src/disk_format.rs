//! On-disk record framing shared by the file-backed stores
//!
//! Layout: 4-byte magic, CRC32 of the payload (LE u32), payload length
//! (LE u64), payload. Records are written to a temporary sibling and renamed
//! into place, so readers never observe a partial record.

use crate::error::Result;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use xxhash_rust::xxh3::xxh3_64;

const HEADER_LEN: usize = 16;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stable hex file name for an arbitrary key
pub fn hashed_name(key: &str) -> String {
    format!("{:016x}", xxh3_64(key.as_bytes()))
}

pub fn encode_frame(magic: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(magic);
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Payload of a well-formed frame, or `None` for anything truncated or corrupt
pub fn decode_frame<'a>(magic: &[u8; 4], data: &'a [u8]) -> Option<&'a [u8]> {
    if data.len() < HEADER_LEN || &data[..4] != magic {
        return None;
    }
    let crc = u32::from_le_bytes(data[4..8].try_into().ok()?);
    let len = u64::from_le_bytes(data[8..16].try_into().ok()?) as usize;
    let payload = &data[HEADER_LEN..];
    if payload.len() != len {
        return None;
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    (hasher.finalize() == crc).then_some(payload)
}

/// Write `data` to `path` through a temporary file and rename
pub async fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: &[u8; 4] = b"TEST";

    #[test]
    fn test_frame_round_trip() {
        let frame = encode_frame(MAGIC, b"payload");
        assert_eq!(decode_frame(MAGIC, &frame), Some(&b"payload"[..]));
    }

    #[test]
    fn test_corrupt_frame_rejected() {
        let mut frame = encode_frame(MAGIC, b"payload");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert_eq!(decode_frame(MAGIC, &frame), None);
    }

    #[test]
    fn test_truncated_or_foreign_frame_rejected() {
        let frame = encode_frame(MAGIC, b"payload");
        assert_eq!(decode_frame(MAGIC, &frame[..frame.len() - 2]), None);
        assert_eq!(decode_frame(b"OTHR", &frame), None);
        assert_eq!(decode_frame(MAGIC, b"TE"), None);
    }

    #[test]
    fn test_hashed_name_is_stable() {
        assert_eq!(hashed_name("a"), hashed_name("a"));
        assert_ne!(hashed_name("a"), hashed_name("b"));
        assert_eq!(hashed_name("a").len(), 16);
    }

    #[tokio::test]
    async fn test_atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/file.bin");
        atomic_write(&path, b"data").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"data");
    }
}
