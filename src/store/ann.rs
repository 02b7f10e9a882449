//! Id-addressed nearest-neighbor index over unit-norm vectors.
//!
//! The index kind is fixed when the index is created and recorded in the
//! serialized form:
//! - `Flat`: exact inner-product scan over every entry
//! - `Hnsw`: approximate graph search (see `store::hnsw`)
//!
//! Results are ordered by descending score, ties broken by ascending id.
//!
//! File format: ann.index
//! - magic: b"CANN"
//! - version: u8 (1)
//! - kind: u8 (0 = flat, 1 = hnsw)
//! - dimensions: u16
//! - body (kind specific)
//! - checksum: u32 (CRC32 of everything before it)

use std::cmp::Ordering;
use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::AnnConfig;
use crate::store::hnsw::HnswIndex;
use crate::store::{ByteReader, Truncated};

const MAGIC: &[u8; 4] = b"CANN";
const FORMAT_VERSION: u8 = 1;

/// Below this many entries a sequential scan beats the rayon fan-out.
const PARALLEL_SCAN_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    #[default]
    Flat,
    Hnsw,
}

impl IndexKind {
    fn tag(self) -> u8 {
        match self {
            IndexKind::Flat => 0,
            IndexKind::Hnsw => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(IndexKind::Flat),
            1 => Some(IndexKind::Hnsw),
            _ => None,
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKind::Flat => write!(f, "flat"),
            IndexKind::Hnsw => write!(f, "hnsw"),
        }
    }
}

/// Error type for index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector has zero norm")]
    ZeroNormVector,

    #[error("Id {0} is already indexed")]
    DuplicateId(u64),

    #[error("Index kind mismatch: expected {expected}, file has {got}")]
    KindMismatch { expected: IndexKind, got: IndexKind },

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: index file may be corrupted")]
    ChecksumMismatch,

    #[error("Corrupt index: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Truncated(#[from] Truncated),
}

/// Search hit from the index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: u64,
    /// Inner product with the query (cosine for unit vectors)
    pub score: f32,
}

/// Descending score, then ascending id.
pub fn rank_order(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.score.total_cmp(&a.score).then(a.id.cmp(&b.id))
}

/// Construction parameters, fixed for the lifetime of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnParams {
    pub kind: IndexKind,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl From<&AnnConfig> for AnnParams {
    fn from(config: &AnnConfig) -> Self {
        Self {
            kind: config.kind,
            m: config.hnsw_m,
            ef_construction: config.hnsw_ef_construction,
            ef_search: config.hnsw_ef_search,
        }
    }
}

impl Default for AnnParams {
    fn default() -> Self {
        Self::from(&AnnConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct AnnIndex {
    dimensions: usize,
    backend: Backend,
}

#[derive(Debug, Clone)]
enum Backend {
    Flat(FlatIndex),
    Hnsw(HnswIndex),
}

/// Exact search: every query scans all entries.
#[derive(Debug, Clone, Default)]
pub struct FlatIndex {
    entries: HashMap<u64, Vec<f32>>,
}

impl FlatIndex {
    fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let score = |(id, vector): (&u64, &Vec<f32>)| Neighbor {
            id: *id,
            score: dot(query, vector),
        };

        let mut results: Vec<Neighbor> = if self.entries.len() >= PARALLEL_SCAN_THRESHOLD {
            self.entries.par_iter().map(score).collect()
        } else {
            self.entries.iter().map(score).collect()
        };

        results.sort_by(rank_order);
        results.truncate(k);
        results
    }
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

impl AnnIndex {
    pub fn new(dimensions: usize, params: &AnnParams) -> Self {
        let backend = match params.kind {
            IndexKind::Flat => Backend::Flat(FlatIndex::default()),
            IndexKind::Hnsw => Backend::Hnsw(HnswIndex::new(params.m, params.ef_construction, params.ef_search)),
        };
        Self { dimensions, backend }
    }

    /// Build an index from scratch over `entries`, inserted in the given order.
    pub fn build<'a, I>(dimensions: usize, params: &AnnParams, entries: I) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = (u64, &'a [f32])>,
    {
        let mut index = Self::new(dimensions, params);
        for (id, vector) in entries {
            index.insert(id, vector.to_vec())?;
        }
        Ok(index)
    }

    pub fn kind(&self) -> IndexKind {
        match self.backend {
            Backend::Flat(_) => IndexKind::Flat,
            Backend::Hnsw(_) => IndexKind::Hnsw,
        }
    }

    pub fn params(&self) -> AnnParams {
        match &self.backend {
            Backend::Flat(_) => AnnParams {
                kind: IndexKind::Flat,
                ..AnnParams::default()
            },
            Backend::Hnsw(h) => AnnParams {
                kind: IndexKind::Hnsw,
                m: h.m(),
                ef_construction: h.ef_construction(),
                ef_search: h.ef_search(),
            },
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Flat(f) => f.entries.len(),
            Backend::Hnsw(h) => h.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: u64) -> Option<&[f32]> {
        match &self.backend {
            Backend::Flat(f) => f.entries.get(&id).map(Vec::as_slice),
            Backend::Hnsw(h) => h.get(id),
        }
    }

    /// All indexed ids in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = match &self.backend {
            Backend::Flat(f) => f.entries.keys().copied().collect(),
            Backend::Hnsw(h) => h.ids().collect(),
        };
        ids.sort_unstable();
        ids
    }

    /// Insert a vector under a new id.
    pub fn insert(&mut self, id: u64, vector: Vec<f32>) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        if l2_norm(&vector) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }
        if self.contains(id) {
            return Err(IndexError::DuplicateId(id));
        }

        match &mut self.backend {
            Backend::Flat(f) => {
                f.entries.insert(id, vector);
            }
            Backend::Hnsw(h) => h.insert(id, vector),
        }
        Ok(())
    }

    /// Remove an entry. Returns false if the id was not indexed.
    pub fn remove(&mut self, id: u64) -> bool {
        match &mut self.backend {
            Backend::Flat(f) => f.entries.remove(&id).is_some(),
            Backend::Hnsw(h) => h.remove(id),
        }
    }

    /// Top-`k` entries by inner product with `query`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(vec![]);
        }

        Ok(match &self.backend {
            Backend::Flat(f) => f.search(query, k),
            Backend::Hnsw(h) => h.search(query, k),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(MAGIC);
        buffer.push(FORMAT_VERSION);
        buffer.push(self.kind().tag());
        buffer.extend_from_slice(&(self.dimensions as u16).to_le_bytes());

        match &self.backend {
            Backend::Flat(f) => {
                let mut ids: Vec<&u64> = f.entries.keys().collect();
                ids.sort_unstable();
                buffer.extend_from_slice(&(ids.len() as u64).to_le_bytes());
                for id in ids {
                    buffer.extend_from_slice(&id.to_le_bytes());
                    for value in &f.entries[id] {
                        buffer.extend_from_slice(&value.to_le_bytes());
                    }
                }
            }
            Backend::Hnsw(h) => h.write_body(&mut buffer),
        }

        let checksum = crc32fast::hash(&buffer);
        buffer.extend_from_slice(&checksum.to_le_bytes());
        buffer
    }

    /// Decode an index written by `to_bytes`. A file of another kind or
    /// dimension is rejected so the caller can rebuild it.
    pub fn from_bytes(bytes: &[u8], expected_kind: IndexKind, expected_dimensions: usize) -> Result<Self, IndexError> {
        if bytes.len() < MAGIC.len() + 4 + 4 {
            return Err(IndexError::Corrupt("file too short".to_string()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if stored != crc32fast::hash(body) {
            return Err(IndexError::ChecksumMismatch);
        }

        let mut reader = ByteReader::new(body);
        if reader.take(4, "magic")? != MAGIC {
            return Err(IndexError::Corrupt("invalid magic".to_string()));
        }
        let version = reader.u8("version")?;
        if version != FORMAT_VERSION {
            return Err(IndexError::VersionMismatch(version, FORMAT_VERSION));
        }
        let kind = IndexKind::from_tag(reader.u8("kind")?)
            .ok_or_else(|| IndexError::Corrupt("unknown index kind".to_string()))?;
        if kind != expected_kind {
            return Err(IndexError::KindMismatch {
                expected: expected_kind,
                got: kind,
            });
        }
        let dimensions = reader.u16("dimensions")? as usize;
        if dimensions != expected_dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        let backend = match kind {
            IndexKind::Flat => {
                let count = reader.u64("entry count")?;
                let mut entries = HashMap::new();
                for _ in 0..count {
                    let id = reader.u64("entry id")?;
                    let vector = reader.f32s(dimensions, "entry vector")?;
                    if entries.insert(id, vector).is_some() {
                        return Err(IndexError::DuplicateId(id));
                    }
                }
                Backend::Flat(FlatIndex { entries })
            }
            IndexKind::Hnsw => Backend::Hnsw(HnswIndex::read_body(&mut reader, dimensions)?),
        };

        if !reader.is_empty() {
            return Err(IndexError::Corrupt("trailing bytes after index body".to_string()));
        }

        Ok(Self { dimensions, backend })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: &[f32]) -> Vec<f32> {
        let n = l2_norm(v);
        v.iter().map(|x| x / n).collect()
    }

    fn params(kind: IndexKind) -> AnnParams {
        AnnParams {
            kind,
            m: 4,
            ef_construction: 32,
            ef_search: 32,
        }
    }

    fn sample(kind: IndexKind) -> AnnIndex {
        let mut index = AnnIndex::new(3, &params(kind));
        index.insert(1, unit(&[1.0, 0.0, 0.0])).unwrap();
        index.insert(2, unit(&[0.0, 1.0, 0.0])).unwrap();
        index.insert(3, unit(&[0.7, 0.7, 0.0])).unwrap();
        index
    }

    #[test]
    fn test_insert_validation() {
        let mut index = AnnIndex::new(3, &AnnParams::default());
        assert!(matches!(
            index.insert(1, vec![1.0, 0.0]),
            Err(IndexError::DimensionMismatch { expected: 3, got: 2 })
        ));
        assert!(matches!(index.insert(1, vec![0.0; 3]), Err(IndexError::ZeroNormVector)));
        index.insert(1, vec![1.0, 0.0, 0.0]).unwrap();
        assert!(matches!(
            index.insert(1, vec![0.0, 1.0, 0.0]),
            Err(IndexError::DuplicateId(1))
        ));
    }

    #[test]
    fn test_search_ranks_by_inner_product() {
        for kind in [IndexKind::Flat, IndexKind::Hnsw] {
            let index = sample(kind);
            let hits = index.search(&unit(&[1.0, 0.1, 0.0]), 3).unwrap();
            let ids: Vec<u64> = hits.iter().map(|h| h.id).collect();
            assert_eq!(ids, vec![1, 3, 2], "kind {kind}");
            assert!(hits[0].score > hits[1].score);
        }
    }

    #[test]
    fn test_ties_break_by_ascending_id() {
        let mut index = AnnIndex::new(2, &AnnParams::default());
        index.insert(9, vec![1.0, 0.0]).unwrap();
        index.insert(4, vec![1.0, 0.0]).unwrap();
        index.insert(6, vec![0.0, 1.0]).unwrap();

        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![4, 9, 6]);
    }

    #[test]
    fn test_k_larger_than_index() {
        let index = sample(IndexKind::Flat);
        assert_eq!(index.search(&[1.0, 0.0, 0.0], 50).unwrap().len(), 3);
        assert!(index.search(&[1.0, 0.0, 0.0], 0).unwrap().is_empty());
        assert!(AnnIndex::new(3, &AnnParams::default())
            .search(&[1.0, 0.0, 0.0], 5)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_remove_then_reinsert() {
        for kind in [IndexKind::Flat, IndexKind::Hnsw] {
            let mut index = sample(kind);
            assert!(index.remove(1));
            assert!(!index.remove(1));
            assert_eq!(index.len(), 2);

            let hits = index.search(&[1.0, 0.0, 0.0], 3).unwrap();
            assert!(hits.iter().all(|h| h.id != 1));

            index.insert(1, unit(&[0.0, 0.0, 1.0])).unwrap();
            let hits = index.search(&[0.0, 0.0, 1.0], 1).unwrap();
            assert_eq!(hits[0].id, 1);
        }
    }

    #[test]
    fn test_bytes_roundtrip_keeps_results() {
        for kind in [IndexKind::Flat, IndexKind::Hnsw] {
            let index = sample(kind);
            let bytes = index.to_bytes();
            let loaded = AnnIndex::from_bytes(&bytes, kind, 3).unwrap();

            assert_eq!(loaded.kind(), kind);
            assert_eq!(loaded.ids(), vec![1, 2, 3]);
            let query = unit(&[0.2, 1.0, 0.0]);
            assert_eq!(index.search(&query, 3).unwrap(), loaded.search(&query, 3).unwrap());
        }
    }

    #[test]
    fn test_from_bytes_rejects_mismatches() {
        let bytes = sample(IndexKind::Flat).to_bytes();
        assert!(matches!(
            AnnIndex::from_bytes(&bytes, IndexKind::Hnsw, 3),
            Err(IndexError::KindMismatch { .. })
        ));
        assert!(matches!(
            AnnIndex::from_bytes(&bytes, IndexKind::Flat, 4),
            Err(IndexError::DimensionMismatch { .. })
        ));

        let mut corrupt = bytes.clone();
        corrupt[12] ^= 0xFF;
        assert!(matches!(
            AnnIndex::from_bytes(&corrupt, IndexKind::Flat, 3),
            Err(IndexError::ChecksumMismatch)
        ));
        assert!(AnnIndex::from_bytes(&bytes[..6], IndexKind::Flat, 3).is_err());
    }
}
