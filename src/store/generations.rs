//! Versioned on-disk catalog.
//!
//! Every committed mutation lands in a fresh `generations/gen-<n>/` directory
//! holding all three artifacts. `CURRENT` names the live directory and is
//! replaced last, so a reader following it always finds three files written
//! by the same commit.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use crate::store::ann::{AnnIndex, IndexError, IndexKind};
use crate::store::metadata::MetadataTable;
use crate::store::vectors::VectorStore;
use crate::store::{sync_dir, write_atomic, write_atomic_with, StorageError};

pub const CURRENT_FILE: &str = "CURRENT";
pub const GENERATIONS_DIR: &str = "generations";
pub const METADATA_FILE: &str = "product_metadata.csv";
pub const VECTORS_FILE: &str = "embeddings.bin";
pub const ANN_FILE: &str = "ann.index";

const GENERATION_PREFIX: &str = "gen-";

/// One committed generation as read from disk. Only the metadata table is
/// mandatory; the vector and index files may be missing or damaged and are
/// repaired by reconcile.
#[derive(Debug)]
pub struct LoadedGeneration {
    pub generation: u64,
    pub metadata: MetadataTable,
    pub vectors: Result<VectorStore, StorageError>,
    pub ann: Result<AnnIndex, IndexError>,
    pub committed_at: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct GenerationStore {
    root: PathBuf,
    keep_generations: usize,
}

impl GenerationStore {
    pub fn new(root: &Path, keep_generations: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            keep_generations: keep_generations.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation_dir(&self, generation: u64) -> PathBuf {
        self.root
            .join(GENERATIONS_DIR)
            .join(format!("{GENERATION_PREFIX}{generation}"))
    }

    /// Live generation number, or None when nothing was ever committed.
    pub fn current(&self) -> Result<Option<u64>, StorageError> {
        let path = self.root.join(CURRENT_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        parse_generation(content.trim())
            .map(Some)
            .ok_or_else(|| StorageError::InvalidFormat(format!("bad {CURRENT_FILE} pointer: {:?}", content.trim())))
    }

    /// Number for the next commit. Skips past leftovers of interrupted
    /// commits so they are never mistaken for the new generation.
    pub fn next_generation(&self, live: u64) -> u64 {
        let newest_on_disk = self.list().ok().and_then(|l| l.last().copied()).unwrap_or(0);
        newest_on_disk.max(live) + 1
    }

    pub fn read_generation(&self, generation: u64, ann_kind: IndexKind) -> Result<LoadedGeneration, StorageError> {
        let now = Instant::now();
        let dir = self.generation_dir(generation);

        let metadata_path = dir.join(METADATA_FILE);
        if !metadata_path.exists() {
            return Err(StorageError::InvalidFormat(format!(
                "generation {generation} has no {METADATA_FILE}"
            )));
        }
        let metadata = MetadataTable::read_csv(BufReader::new(File::open(&metadata_path)?))?;

        let vectors = File::open(dir.join(VECTORS_FILE))
            .map_err(StorageError::from)
            .and_then(|file| VectorStore::read_from(&mut BufReader::new(file), None));
        if let Err(e) = &vectors {
            log::warn!("generation {generation}: vector file unusable: {e}");
        }

        let ann = match &vectors {
            Ok(store) => fs::read(dir.join(ANN_FILE))
                .map_err(|e| IndexError::Corrupt(format!("cannot read {ANN_FILE}: {e}")))
                .and_then(|bytes| AnnIndex::from_bytes(&bytes, ann_kind, store.dimensions())),
            Err(_) => Err(IndexError::Corrupt("vector file unavailable".to_string())),
        };
        if let Err(e) = &ann {
            log::warn!("generation {generation}: index file unusable: {e}");
        }

        let committed_at = fs::metadata(self.root.join(CURRENT_FILE))
            .and_then(|m| m.modified())
            .ok();

        log::debug!(
            "took {}ms to load generation {generation}",
            now.elapsed().as_micros() as f64 / 1000.0
        );

        Ok(LoadedGeneration {
            generation,
            metadata,
            vectors,
            ann,
            committed_at,
        })
    }

    /// Write all three artifacts into a new generation directory, then point
    /// `CURRENT` at it. Nothing is visible to readers until the final rename.
    pub fn write_generation(
        &self,
        generation: u64,
        metadata: &MetadataTable,
        vectors: &VectorStore,
        ann: &AnnIndex,
    ) -> Result<(), StorageError> {
        let now = Instant::now();
        let dir = self.generation_dir(generation);

        // leftover of an interrupted commit; never the live generation
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        write_atomic_with(&dir.join(METADATA_FILE), |w| {
            metadata.write_csv(w).map_err(std::io::Error::other)
        })?;
        write_atomic_with(&dir.join(VECTORS_FILE), |w| {
            vectors.write_to(w).map_err(std::io::Error::other)
        })?;
        write_atomic(&dir.join(ANN_FILE), &ann.to_bytes())?;

        sync_dir(&dir)?;
        sync_dir(&self.root.join(GENERATIONS_DIR))?;

        write_atomic(
            &self.root.join(CURRENT_FILE),
            format!("{GENERATION_PREFIX}{generation}\n").as_bytes(),
        )?;
        // the generation is live from here on
        sync_dir_after_publish(&self.root);

        log::debug!(
            "took {}ms to commit generation {generation}",
            now.elapsed().as_micros() as f64 / 1000.0
        );

        self.prune(generation);
        Ok(())
    }

    /// Generation numbers present on disk, ascending.
    pub fn list(&self) -> Result<Vec<u64>, StorageError> {
        let dir = self.root.join(GENERATIONS_DIR);
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut found: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().and_then(parse_generation))
            .collect();
        found.sort_unstable();
        Ok(found)
    }

    /// Drop all but the newest `keep_generations` directories. Failures only
    /// cost disk space, so they are logged and ignored.
    fn prune(&self, live: u64) {
        let generations = match self.list() {
            Ok(generations) => generations,
            Err(e) => {
                log::warn!("failed to list generations: {e}");
                return;
            }
        };

        let excess = generations.len().saturating_sub(self.keep_generations);
        for generation in generations.into_iter().take(excess) {
            if generation == live {
                continue;
            }
            let dir = self.generation_dir(generation);
            match fs::remove_dir_all(&dir) {
                Ok(()) => log::debug!("removed old generation {generation}"),
                Err(e) => log::warn!("failed to remove {}: {e}", dir.display()),
            }
        }
    }
}

/// fsync `root` once `CURRENT` has been swapped. A failure only weakens
/// durability of the rename, so it is logged.
fn sync_dir_after_publish(root: &Path) {
    if let Err(e) = sync_dir(root) {
        log::warn!("failed to sync {} after publishing a generation: {e}", root.display());
    }
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix(GENERATION_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::{ProductInput, ProductRecord};
    use crate::store::ann::AnnParams;

    fn catalog_parts(n: u64) -> (MetadataTable, VectorStore, AnnIndex) {
        let mut metadata = MetadataTable::new();
        let mut vectors = VectorStore::new(2, [7u8; 32]);
        for id in 0..n {
            let record = ProductRecord::from_input(
                id,
                &ProductInput {
                    name: format!("Product {id}"),
                    brand: "Acme".into(),
                    ingredients: "salt".into(),
                    ..Default::default()
                },
            );
            let angle = id as f32;
            vectors
                .push(id, record.content_hash(), &[angle.cos(), angle.sin()])
                .unwrap();
            metadata.insert(record).unwrap();
        }
        let ann = AnnIndex::build(2, &AnnParams::default(), vectors.iter().map(|r| (r.id, r.vector))).unwrap();
        (metadata, vectors, ann)
    }

    #[test]
    #[cfg(unix)]
    fn test_sync_failure_after_publish_is_only_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("gone");

        assert!(sync_dir(&missing).is_err());
        sync_dir_after_publish(&missing);
    }

    #[test]
    fn test_empty_root_has_no_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GenerationStore::new(tmp.path(), 2);
        assert_eq!(store.current().unwrap(), None);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_write_then_read_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GenerationStore::new(tmp.path(), 2);
        let (metadata, vectors, ann) = catalog_parts(3);

        store.write_generation(1, &metadata, &vectors, &ann).unwrap();
        assert_eq!(store.current().unwrap(), Some(1));

        let loaded = store.read_generation(1, IndexKind::Flat).unwrap();
        assert_eq!(loaded.generation, 1);
        assert_eq!(loaded.metadata.len(), 3);
        let loaded_vectors = loaded.vectors.unwrap();
        assert_eq!(loaded_vectors.len(), 3);
        assert_eq!(loaded_vectors.fingerprint(), [7u8; 32]);
        assert_eq!(loaded.ann.unwrap().ids(), vec![0, 1, 2]);
        assert!(loaded.committed_at.is_some());
    }

    #[test]
    fn test_old_generations_are_pruned() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GenerationStore::new(tmp.path(), 2);
        let (metadata, vectors, ann) = catalog_parts(1);

        for generation in 1..=4 {
            store.write_generation(generation, &metadata, &vectors, &ann).unwrap();
        }

        assert_eq!(store.list().unwrap(), vec![3, 4]);
        assert_eq!(store.current().unwrap(), Some(4));
    }

    #[test]
    fn test_damaged_index_is_reported_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GenerationStore::new(tmp.path(), 2);
        let (metadata, vectors, ann) = catalog_parts(2);
        store.write_generation(1, &metadata, &vectors, &ann).unwrap();

        fs::write(store.generation_dir(1).join(ANN_FILE), b"garbage").unwrap();
        fs::remove_file(store.generation_dir(1).join(VECTORS_FILE)).unwrap();

        let loaded = store.read_generation(1, IndexKind::Flat).unwrap();
        assert_eq!(loaded.metadata.len(), 2);
        assert!(loaded.vectors.is_err());
        assert!(loaded.ann.is_err());
    }

    #[test]
    fn test_missing_metadata_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GenerationStore::new(tmp.path(), 2);
        let (metadata, vectors, ann) = catalog_parts(1);
        store.write_generation(1, &metadata, &vectors, &ann).unwrap();

        fs::remove_file(store.generation_dir(1).join(METADATA_FILE)).unwrap();
        assert!(store.read_generation(1, IndexKind::Flat).is_err());
    }

    #[test]
    fn test_index_kind_change_is_a_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GenerationStore::new(tmp.path(), 2);
        let (metadata, vectors, ann) = catalog_parts(2);
        store.write_generation(1, &metadata, &vectors, &ann).unwrap();

        let loaded = store.read_generation(1, IndexKind::Hnsw).unwrap();
        assert!(matches!(loaded.ann, Err(IndexError::KindMismatch { .. })));
    }

    #[test]
    fn test_bad_current_pointer() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(CURRENT_FILE), "latest\n").unwrap();
        let store = GenerationStore::new(tmp.path(), 2);
        assert!(matches!(store.current(), Err(StorageError::InvalidFormat(_))));
    }
}
