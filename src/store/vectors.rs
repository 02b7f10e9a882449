//! Dense vector store and its binary file.
//!
//! File format: embeddings.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - fingerprint: [u8; 32] (embedding pipeline fingerprint)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, in row order):
//! - product_id: u64 (little-endian)
//! - content_hash: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)
//!
//! Trailer:
//! - checksum: u32 (CRC32 of all entry bytes)

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use crate::store::StorageError;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + fingerprint(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Row-major N x D matrix of unit-norm vectors keyed by product id.
#[derive(Debug, Clone)]
pub struct VectorStore {
    dimensions: usize,
    fingerprint: [u8; 32],
    ids: Vec<u64>,
    content_hashes: Vec<u64>,
    data: Vec<f32>,
    positions: HashMap<u64, usize>,
}

/// A borrowed row of the store.
#[derive(Debug, Clone, Copy)]
pub struct VectorRow<'a> {
    pub id: u64,
    pub content_hash: u64,
    pub vector: &'a [f32],
}

impl VectorStore {
    pub fn new(dimensions: usize, fingerprint: [u8; 32]) -> Self {
        Self {
            dimensions,
            fingerprint,
            ids: Vec::new(),
            content_hashes: Vec::new(),
            data: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn with_capacity(dimensions: usize, fingerprint: [u8; 32], capacity: usize) -> Self {
        let mut store = Self::new(dimensions, fingerprint);
        store.ids.reserve(capacity);
        store.content_hashes.reserve(capacity);
        store.data.reserve(capacity * dimensions);
        store.positions.reserve(capacity);
        store
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Fingerprint of the embedding pipeline that produced these vectors.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.ids.iter().copied()
    }

    pub fn get(&self, id: u64) -> Option<VectorRow<'_>> {
        self.positions.get(&id).map(|&pos| self.row(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = VectorRow<'_>> {
        (0..self.ids.len()).map(move |pos| self.row(pos))
    }

    fn row(&self, pos: usize) -> VectorRow<'_> {
        let start = pos * self.dimensions;
        VectorRow {
            id: self.ids[pos],
            content_hash: self.content_hashes[pos],
            vector: &self.data[start..start + self.dimensions],
        }
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), StorageError> {
        if vector.len() != self.dimensions {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Append a row for a new id.
    pub fn push(&mut self, id: u64, content_hash: u64, vector: &[f32]) -> Result<(), StorageError> {
        self.check_dimensions(vector)?;
        if self.positions.contains_key(&id) {
            return Err(StorageError::DuplicateId(id));
        }

        self.positions.insert(id, self.ids.len());
        self.ids.push(id);
        self.content_hashes.push(content_hash);
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Overwrite the row of an existing id in place. Returns false if absent.
    pub fn replace(&mut self, id: u64, content_hash: u64, vector: &[f32]) -> Result<bool, StorageError> {
        self.check_dimensions(vector)?;
        let Some(&pos) = self.positions.get(&id) else {
            return Ok(false);
        };

        let start = pos * self.dimensions;
        self.data[start..start + self.dimensions].copy_from_slice(vector);
        self.content_hashes[pos] = content_hash;
        Ok(true)
    }

    /// Drop the rows whose id is in `ids`, compacting the matrix. Ids of the
    /// surviving rows are unchanged.
    pub fn remove_ids(&mut self, ids: &HashSet<u64>) -> usize {
        let before = self.ids.len();
        let dims = self.dimensions;

        let mut kept = 0;
        for pos in 0..self.ids.len() {
            if ids.contains(&self.ids[pos]) {
                continue;
            }
            if kept != pos {
                self.ids[kept] = self.ids[pos];
                self.content_hashes[kept] = self.content_hashes[pos];
                self.data.copy_within(pos * dims..(pos + 1) * dims, kept * dims);
            }
            kept += 1;
        }

        self.ids.truncate(kept);
        self.content_hashes.truncate(kept);
        self.data.truncate(kept * dims);
        self.positions = self.ids.iter().enumerate().map(|(pos, &id)| (id, pos)).collect();

        before - kept
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), StorageError> {
        let header = Header {
            version: FORMAT_VERSION,
            fingerprint: self.fingerprint,
            dimensions: self.dimensions as u16,
            entry_count: self.ids.len() as u64,
        };
        writer.write_all(&header.encode())?;

        let mut hasher = crc32fast::Hasher::new();
        let mut entry = Vec::with_capacity(16 + self.dimensions * 4);
        for row in self.iter() {
            entry.clear();
            entry.extend_from_slice(&row.id.to_le_bytes());
            entry.extend_from_slice(&row.content_hash.to_le_bytes());
            for &value in row.vector {
                entry.extend_from_slice(&value.to_le_bytes());
            }
            hasher.update(&entry);
            writer.write_all(&entry)?;
        }

        writer.write_all(&hasher.finalize().to_le_bytes())?;
        Ok(())
    }

    /// Read a store written by `write_to`. The fingerprint is returned as
    /// stored; callers compare it against the live embedding pipeline.
    /// With `expected_dimensions` unset the header's dimension is trusted.
    pub fn read_from<R: Read>(reader: &mut R, expected_dimensions: Option<usize>) -> Result<Self, StorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;
        let header = Header::decode(&header_bytes)?;

        let dims = header.dimensions as usize;
        if let Some(expected) = expected_dimensions {
            if dims != expected {
                return Err(StorageError::DimensionMismatch { expected, got: dims });
            }
        }

        let count = usize::try_from(header.entry_count)
            .map_err(|_| StorageError::InvalidFormat("entry count too large".to_string()))?;
        let mut store = Self::with_capacity(dims, header.fingerprint, count.min(1 << 20));

        let mut hasher = crc32fast::Hasher::new();
        let mut entry = vec![0u8; 16 + dims * 4];
        let mut vector = vec![0f32; dims];
        for _ in 0..count {
            reader.read_exact(&mut entry)?;
            hasher.update(&entry);

            let id = u64::from_le_bytes(entry[0..8].try_into().map_err(|_| bad_entry())?);
            let content_hash = u64::from_le_bytes(entry[8..16].try_into().map_err(|_| bad_entry())?);
            for (slot, chunk) in vector.iter_mut().zip(entry[16..].chunks_exact(4)) {
                *slot = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            store.push(id, content_hash, &vector)?;
        }

        let mut trailer = [0u8; 4];
        reader.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer) != hasher.finalize() {
            return Err(StorageError::ChecksumMismatch);
        }

        Ok(store)
    }
}

fn bad_entry() -> StorageError {
    StorageError::InvalidFormat("malformed vector entry".to_string())
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    fingerprint: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = self.version;
        header_bytes[1..33].copy_from_slice(&self.fingerprint);
        header_bytes[33..35].copy_from_slice(&self.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&self.entry_count.to_le_bytes());

        // Checksum over header without checksum field
        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());
        header_bytes
    }

    fn decode(header_bytes: &[u8; HEADER_SIZE]) -> Result<Self, StorageError> {
        let version = header_bytes[0];

        // Version check first
        if version != FORMAT_VERSION {
            return Err(StorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes([
            header_bytes[43],
            header_bytes[44],
            header_bytes[45],
            header_bytes[46],
        ]);
        if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
            return Err(StorageError::ChecksumMismatch);
        }

        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&header_bytes[1..33]);

        Ok(Self {
            version,
            fingerprint,
            dimensions: u16::from_le_bytes([header_bytes[33], header_bytes[34]]),
            entry_count: u64::from_le_bytes([
                header_bytes[35],
                header_bytes[36],
                header_bytes[37],
                header_bytes[38],
                header_bytes[39],
                header_bytes[40],
                header_bytes[41],
                header_bytes[42],
            ]),
        })
    }
}
