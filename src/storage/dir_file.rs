//! On-disk image of the outer directory
//!
//! ```text
//! ┌──────────┬──────────┬──────────────┬──────────┬──────────┬──────────────────┐
//! │ magic 4B │ depth 4B │ page count 8B│ crc 4B   │ pad 4B   │ offsets (u64 LE) │
//! └──────────┴──────────┴──────────────┴──────────┴──────────┴──────────────────┘
//! ```
//!
//! The CRC-32 covers depth, page count and every offset. The page count
//! records how many pages the page file held when the image was written: a
//! page file that has grown since means a split finished on disk without its
//! directory, and the image is stale.
//!
//! The file is replaced wholesale by writing a temporary sibling and renaming
//! it over the old one.

use super::directory::Directory;
use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"HDIR";
const HEADER_LEN: usize = 24;

/// Serialize a directory for a page file of `page_count` pages
pub fn encode(directory: &Directory<u64>, page_count: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + directory.len() * 8);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&directory.depth().to_le_bytes());
    out.extend_from_slice(&page_count.to_le_bytes());
    out.extend_from_slice(&[0u8; 8]);
    for offset in directory.entries() {
        out.extend_from_slice(&offset.to_le_bytes());
    }
    let crc = checksum(&out);
    out[16..20].copy_from_slice(&crc.to_le_bytes());
    out
}

/// Parse a directory image, checking it against the page file geometry
pub fn decode(bytes: &[u8], page_size: u64, page_count: u64) -> Result<Directory<u64>> {
    if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
        return Err(Error::Corrupt("directory file has no valid header".to_string()));
    }
    let depth = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let recorded_pages = u64::from_le_bytes(
        bytes[8..16]
            .try_into()
            .map_err(|_| Error::Corrupt("directory header truncated".to_string()))?,
    );
    let stored_crc = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);

    if depth == 0 || depth > 32 {
        return Err(Error::Corrupt(format!("directory depth {} out of range", depth)));
    }
    let expected_len = HEADER_LEN as u64 + 8 * (1u64 << depth);
    if bytes.len() as u64 != expected_len {
        return Err(Error::Corrupt(format!(
            "directory file is {} bytes, depth {} needs {}",
            bytes.len(),
            depth,
            expected_len
        )));
    }
    if checksum(bytes) != stored_crc {
        return Err(Error::Corrupt("directory checksum mismatch".to_string()));
    }
    if recorded_pages != page_count {
        return Err(Error::Corrupt(format!(
            "directory describes {} pages, page file holds {}",
            recorded_pages, page_count
        )));
    }

    let limit = page_size * page_count;
    let mut entries = Vec::with_capacity(1usize << depth);
    for chunk in bytes[HEADER_LEN..].chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        let offset = u64::from_le_bytes(raw);
        if offset % page_size != 0 || offset >= limit {
            return Err(Error::Corrupt(format!("directory entry points at offset {}", offset)));
        }
        entries.push(offset);
    }
    Directory::from_entries(depth, entries)
}

/// Read a directory file; `Ok(None)` when it does not exist
pub fn read(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Atomically replace the directory file with `bytes`
pub fn write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp_path = temp_path(path);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// CRC over everything except the stored checksum and padding
fn checksum(image: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&image[4..16]);
    hasher.update(&image[HEADER_LEN..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Directory<u64> {
        Directory::from_entries(2, vec![0, 0, 4096, 8192]).unwrap()
    }

    #[test]
    fn test_decode_accepts_fresh_image() -> Result<()> {
        let bytes = encode(&sample(), 3);
        assert_eq!(bytes.len(), HEADER_LEN + 32);
        assert_eq!(decode(&bytes, 4096, 3)?, sample());
        Ok(())
    }

    #[test]
    fn test_decode_rejects_stale_page_count() {
        let bytes = encode(&sample(), 3);
        assert!(matches!(decode(&bytes, 4096, 4), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_decode_rejects_flipped_bit() {
        let mut bytes = encode(&sample(), 3);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(decode(&bytes, 4096, 3).is_err());
    }

    #[test]
    fn test_decode_rejects_out_of_range_offset() {
        let dir = Directory::from_entries(1, vec![0u64, 12288]).unwrap();
        let bytes = encode(&dir, 3);
        assert!(decode(&bytes, 4096, 3).is_err());
    }

    #[test]
    fn test_write_replaces_file() -> Result<()> {
        let temp = tempfile::tempdir().map_err(|e| Error::io("creating temp dir", e))?;
        let path = temp.path().join("table.dir");
        assert!(read(&path).map_err(|e| Error::io("reading", e))?.is_none());

        write(&path, b"first").map_err(|e| Error::io("writing", e))?;
        write(&path, b"second").map_err(|e| Error::io("writing", e))?;
        let bytes = read(&path).map_err(|e| Error::io("reading", e))?;
        assert_eq!(bytes.as_deref(), Some(&b"second"[..]));
        assert!(!temp_path(&path).exists());
        Ok(())
    }
}
