//! The synchronized triple-store and its on-disk form.
//!
//! - `metadata`: product rows keyed by id (CSV)
//! - `vectors`: dense embedding rows keyed by id (binary)
//! - `ann`: nearest-neighbor index over the same vectors (binary)
//! - `generations`: versioned directories tying the three files together

pub mod ann;
pub mod generations;
pub mod hnsw;
pub mod metadata;
pub mod vectors;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Errors that can occur while reading or writing persisted artifacts.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Duplicate id {0}")]
    DuplicateId(u64),
}

/// Write `bytes` to `path` atomically: temp file, fsync, rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    write_atomic_with(path, |writer| writer.write_all(bytes))
}

/// Atomic write driven by a closure that streams into the temp file.
/// The temp file is removed if the closure or any I/O step fails.
pub fn write_atomic_with<F>(path: &Path, write: F) -> std::io::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"))?;
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let result = (|| {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

/// fsync a directory so renames inside it are durable.
pub fn sync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
#[error("unexpected end of data while reading {0}")]
pub struct Truncated(pub &'static str);

/// Little-endian cursor over an in-memory buffer.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], Truncated> {
        let end = self.pos.checked_add(n).ok_or(Truncated(what))?;
        let slice = self.bytes.get(self.pos..end).ok_or(Truncated(what))?;
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, Truncated> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u16(&mut self, what: &'static str) -> Result<u16, Truncated> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2, what)?);
        Ok(u16::from_le_bytes(buf))
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32, Truncated> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn u64(&mut self, what: &'static str) -> Result<u64, Truncated> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn f32s(&mut self, n: usize, what: &'static str) -> Result<Vec<f32>, Truncated> {
        let bytes = self.take(n.checked_mul(4).ok_or(Truncated(what))?, what)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file.bin");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!tmp.path().join(".file.bin.tmp").exists());
    }

    #[test]
    fn test_write_atomic_cleans_up_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file.bin");
        write_atomic(&path, b"kept").unwrap();

        let result = write_atomic_with(&path, |w| {
            w.write_all(b"partial")?;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        });

        assert!(result.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"kept");
        assert!(!tmp.path().join(".file.bin.tmp").exists());
    }

    #[test]
    fn test_byte_reader_detects_truncation() {
        let data = 7u32.to_le_bytes();
        let mut reader = ByteReader::new(&data);
        assert!(reader.u64("count").is_err());

        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.u32("count").unwrap(), 7);
        assert!(reader.is_empty());
    }
}
