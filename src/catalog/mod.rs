//! The catalog aggregate: metadata table, vector store and ANN index kept in
//! lockstep.
//!
//! A `Catalog` value is an immutable snapshot from the point of view of
//! readers. Mutations run on a private clone which replaces the published
//! snapshot only after it has been persisted.

pub mod reconcile;

use std::collections::HashSet;

use chrono::{DateTime, Local};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::errors::CatalogError;
use crate::models::ChunkedEmbedder;
use crate::product::ProductRecord;
use crate::store::ann::{AnnIndex, AnnParams};
use crate::store::generations::GenerationStore;
use crate::store::metadata::MetadataTable;
use crate::store::vectors::VectorStore;

/// Whether anything was ever committed, decided once from `CURRENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogState {
    Empty,
    Loaded { generation: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub deleted_ids: Vec<u64>,
    pub not_found_ids: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    metadata: MetadataTable,
    vectors: VectorStore,
    ann: AnnIndex,
    state: CatalogState,
    committed_at: Option<DateTime<Local>>,
}

impl Catalog {
    /// A catalog with no rows, not yet bound to an embedding pipeline
    /// (zero dimensions). The first mutation binds it.
    pub fn empty(params: &AnnParams) -> Self {
        Self {
            metadata: MetadataTable::new(),
            vectors: VectorStore::new(0, [0u8; 32]),
            ann: AnnIndex::new(0, params),
            state: CatalogState::Empty,
            committed_at: None,
        }
    }

    pub(crate) fn from_parts(
        metadata: MetadataTable,
        vectors: VectorStore,
        ann: AnnIndex,
        state: CatalogState,
        committed_at: Option<DateTime<Local>>,
    ) -> Self {
        Self {
            metadata,
            vectors,
            ann,
            state,
            committed_at,
        }
    }

    pub fn state(&self) -> CatalogState {
        self.state
    }

    /// Live generation number, 0 before the first commit.
    pub fn generation(&self) -> u64 {
        match self.state {
            CatalogState::Empty => 0,
            CatalogState::Loaded { generation } => generation,
        }
    }

    pub fn committed_at(&self) -> Option<DateTime<Local>> {
        self.committed_at
    }

    pub fn metadata(&self) -> &MetadataTable {
        &self.metadata
    }

    pub fn vectors(&self) -> &VectorStore {
        &self.vectors
    }

    pub fn ann(&self) -> &AnnIndex {
        &self.ann
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&ProductRecord> {
        self.metadata.get(id)
    }

    /// Id for the next added product: max existing id + 1, or 0.
    pub fn next_id(&self) -> u64 {
        self.metadata.max_id().map_or(0, |max| max + 1)
    }

    /// Whether stored vectors were produced by `embedder`.
    pub fn matches_pipeline(&self, embedder: &ChunkedEmbedder) -> bool {
        self.vectors.dimensions() == embedder.dimensions() && self.vectors.fingerprint() == embedder.fingerprint()
    }

    /// Verify that the three stores hold the same ids with bit-identical
    /// vectors in the vector store and the index.
    pub fn check_consistency(&self) -> Result<(), CatalogError> {
        let (rows, vectors, entries) = (self.metadata.len(), self.vectors.len(), self.ann.len());
        if rows != vectors || rows != entries {
            return Err(CatalogError::Consistency(format!(
                "{rows} metadata rows, {vectors} vectors, {entries} index entries"
            )));
        }

        for record in self.metadata.iter() {
            let Some(row) = self.vectors.get(record.id) else {
                return Err(CatalogError::Consistency(format!("product {} has no vector", record.id)));
            };
            if !same_bits(self.ann.get(record.id), Some(row.vector)) {
                return Err(CatalogError::Consistency(format!(
                    "index entry for product {} differs from its vector",
                    record.id
                )));
            }
        }

        Ok(())
    }

    /// Insert a new product with its embedding. `record.id` must be unused.
    pub fn add(&mut self, record: ProductRecord, vector: Vec<f32>) -> Result<u64, CatalogError> {
        let id = record.id;
        if self.metadata.contains(id) {
            return Err(CatalogError::validation(format!("product id {id} already exists")));
        }

        self.vectors.push(id, record.content_hash(), &vector)?;
        self.ann.insert(id, vector)?;
        self.metadata.insert(record)?;

        Ok(id)
    }

    /// Replace a product and its embedding, keeping the id.
    pub fn update(&mut self, record: ProductRecord, vector: Vec<f32>) -> Result<(), CatalogError> {
        let id = record.id;
        if !self.metadata.contains(id) {
            return Err(CatalogError::NotFound(id));
        }

        if !self.vectors.replace(id, record.content_hash(), &vector)? {
            return Err(CatalogError::Consistency(format!("product {id} has no vector")));
        }
        // the index has no in-place replacement
        self.ann.remove(id);
        self.ann.insert(id, vector)?;
        self.metadata.replace(record);

        Ok(())
    }

    /// Remove products by id. Unknown ids are reported, not fatal. Surviving
    /// products keep their ids; the index is rebuilt over the survivors.
    pub fn delete(&mut self, ids: &[u64]) -> Result<DeleteOutcome, CatalogError> {
        let mut seen = HashSet::new();
        let mut outcome = DeleteOutcome::default();

        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            if self.metadata.contains(id) {
                outcome.deleted_ids.push(id);
            } else {
                log::warn!("delete: product {id} not found, skipping");
                outcome.not_found_ids.push(id);
            }
        }

        if outcome.deleted_ids.is_empty() {
            return Ok(outcome);
        }

        let doomed: HashSet<u64> = outcome.deleted_ids.iter().copied().collect();
        self.metadata.remove_ids(&doomed);
        self.vectors.remove_ids(&doomed);
        self.ann = AnnIndex::build(
            self.vectors.dimensions(),
            &self.ann.params(),
            self.vectors.iter().map(|row| (row.id, row.vector)),
        )?;

        Ok(outcome)
    }

    /// Persist as the next generation and mark the snapshot as loaded.
    pub fn commit(&mut self, store: &GenerationStore) -> Result<(), CatalogError> {
        let generation = store.next_generation(self.generation());
        store.write_generation(generation, &self.metadata, &self.vectors, &self.ann)?;

        self.state = CatalogState::Loaded { generation };
        self.committed_at = Some(Local::now());
        Ok(())
    }
}

pub(crate) fn same_bits(a: Option<&[f32]>, b: Option<&[f32]>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits()),
        _ => false,
    }
}

/// Embed the corpus of every record, in order, into a fresh vector store
/// bound to `embedder`. Shows a progress bar on a terminal.
pub fn embed_records<'a, I>(embedder: &ChunkedEmbedder, records: I, total: usize) -> Result<VectorStore, CatalogError>
where
    I: IntoIterator<Item = &'a ProductRecord>,
{
    let mut store = VectorStore::with_capacity(embedder.dimensions(), embedder.fingerprint(), total);

    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} embedding [{bar:40}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let records: Vec<&ProductRecord> = records.into_iter().collect();
    for batch in records.chunks(embedder.batch_size()) {
        let texts: Vec<String> = batch.iter().map(|r| r.corpus.clone()).collect();
        let vectors = embedder.embed_many(&texts)?;
        for (record, vector) in batch.iter().zip(vectors) {
            store.push(record.id, record.content_hash(), &vector)?;
        }
        progress.inc(batch.len() as u64);
    }

    progress.finish_and_clear();
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::ProductInput;

    fn record(id: u64, name: &str) -> ProductRecord {
        ProductRecord::from_input(
            id,
            &ProductInput {
                name: name.into(),
                brand: "Acme".into(),
                ingredients: "sugar".into(),
                ..Default::default()
            },
        )
    }

    fn unit(x: f32, y: f32) -> Vec<f32> {
        let n = (x * x + y * y).sqrt();
        vec![x / n, y / n]
    }

    fn catalog() -> Catalog {
        let params = AnnParams::default();
        let mut catalog = Catalog::from_parts(
            MetadataTable::new(),
            VectorStore::new(2, [1u8; 32]),
            AnnIndex::new(2, &params),
            CatalogState::Empty,
            None,
        );
        catalog.add(record(0, "Zero"), unit(1.0, 0.0)).unwrap();
        catalog.add(record(1, "One"), unit(1.0, 1.0)).unwrap();
        catalog.add(record(2, "Two"), unit(0.0, 1.0)).unwrap();
        catalog
    }

    #[test]
    fn test_next_id_follows_max() {
        let params = AnnParams::default();
        assert_eq!(Catalog::empty(&params).next_id(), 0);

        let mut catalog = catalog();
        assert_eq!(catalog.next_id(), 3);
        catalog.delete(&[1]).unwrap();
        assert_eq!(catalog.next_id(), 3);
    }

    #[test]
    fn test_add_keeps_stores_in_lockstep() {
        let catalog = catalog();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.vectors().len(), 3);
        assert_eq!(catalog.ann().len(), 3);
        catalog.check_consistency().unwrap();
    }

    #[test]
    fn test_add_rejects_wrong_dimension_without_partial_write() {
        let mut catalog = catalog();

        let result = catalog.add(record(3, "Bad"), vec![1.0, 0.0, 0.0]);
        assert!(result.is_err());
        assert_eq!(catalog.len(), 3);
        catalog.check_consistency().unwrap();
    }

    #[test]
    fn test_update_unknown_id() {
        let mut catalog = catalog();
        let result = catalog.update(record(9, "Ghost"), unit(1.0, 0.0));
        assert!(matches!(result, Err(CatalogError::NotFound(9))));
    }

    #[test]
    fn test_update_replaces_vector_and_row() {
        let mut catalog = catalog();
        catalog.update(record(0, "Renamed"), unit(0.0, 1.0)).unwrap();

        assert_eq!(catalog.get(0).unwrap().name, "Renamed");
        assert_eq!(catalog.vectors().get(0).unwrap().vector, unit(0.0, 1.0).as_slice());
        catalog.check_consistency().unwrap();
    }

    #[test]
    fn test_delete_preserves_surviving_ids() {
        let mut catalog = catalog();
        let outcome = catalog.delete(&[1, 1, 42]).unwrap();

        assert_eq!(outcome.deleted_ids, vec![1]);
        assert_eq!(outcome.not_found_ids, vec![42]);
        assert_eq!(catalog.metadata().ids().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(catalog.get(2).unwrap().name, "Two");
        assert_eq!(catalog.ann().ids(), vec![0, 2]);
        catalog.check_consistency().unwrap();
    }

    #[test]
    fn test_delete_only_unknown_ids_is_noop() {
        let mut catalog = catalog();
        let outcome = catalog.delete(&[7, 8]).unwrap();
        assert!(outcome.deleted_ids.is_empty());
        assert_eq!(outcome.not_found_ids, vec![7, 8]);
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_consistency_detects_divergent_index() {
        let mut catalog = catalog();
        catalog.ann.remove(2);
        catalog.ann.insert(2, unit(1.0, 0.0)).unwrap();
        assert!(matches!(
            catalog.check_consistency(),
            Err(CatalogError::Consistency(_))
        ));
    }

    #[test]
    fn test_commit_advances_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GenerationStore::new(tmp.path(), 2);
        let mut catalog = catalog();

        catalog.commit(&store).unwrap();
        assert_eq!(catalog.state(), CatalogState::Loaded { generation: 1 });
        catalog.commit(&store).unwrap();
        assert_eq!(catalog.generation(), 2);
        assert!(catalog.committed_at().is_some());
        assert_eq!(store.current().unwrap(), Some(2));
    }
}
