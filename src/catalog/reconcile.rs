//! Consistency check and repair of the three stores.
//!
//! Repair order:
//! 1. metadata rows whose stored corpus drifted from their fields get the
//!    corpus rebuilt
//! 2. vectors that are missing, misaligned, stale or produced by another
//!    embedding pipeline are recomputed for every row from the corpus
//! 3. an index that disagrees with the vectors is rebuilt from them
//!
//! Metadata is the source of truth and is never dropped.

use std::sync::Arc;

use serde::Serialize;

use super::{embed_records, same_bits};
use crate::errors::CatalogError;
use crate::models::{ChunkedEmbedder, EmbeddingError};
use crate::product::ProductUpdate;
use crate::store::ann::{AnnIndex, AnnParams};
use crate::store::metadata::MetadataTable;
use crate::store::vectors::VectorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    None,
    RebuiltIndex,
    Reembedded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub metadata_rows: usize,
    pub vector_rows: usize,
    pub ann_entries: usize,
    pub action: RepairAction,
    pub problems: Vec<String>,
}

impl ReconcileReport {
    pub fn repaired(&self) -> bool {
        self.action != RepairAction::None || !self.problems.is_empty()
    }
}

/// Result of a reconcile pass, ready to become a `Catalog`.
#[derive(Debug)]
pub struct Reconciled {
    pub metadata: MetadataTable,
    pub vectors: VectorStore,
    pub ann: AnnIndex,
    pub report: ReconcileReport,
}

/// Check and repair. `load_embedder` is called only when vectors must be
/// recomputed or when `verify_pipeline` asks for the fingerprint check.
pub fn reconcile<F>(
    mut metadata: MetadataTable,
    vectors: Option<VectorStore>,
    ann: Option<AnnIndex>,
    params: &AnnParams,
    verify_pipeline: bool,
    load_embedder: F,
) -> Result<Reconciled, CatalogError>
where
    F: Fn() -> Result<Arc<ChunkedEmbedder>, EmbeddingError>,
{
    let mut problems = Vec::new();

    let drifted: Vec<u64> = metadata
        .iter()
        .filter(|record| !record.corpus_is_current())
        .map(|record| record.id)
        .collect();
    if !drifted.is_empty() {
        problems.push(format!("{} products had an outdated corpus", drifted.len()));
        for id in drifted {
            if let Some(rebuilt) = metadata.get(id).map(|r| r.with_update(&ProductUpdate::default())) {
                metadata.replace(rebuilt);
            }
        }
    }

    let pipeline = if verify_pipeline {
        Some(load_embedder()?)
    } else {
        None
    };

    // an empty catalog that was never bound just adopts the current pipeline
    let (vectors, ann) = match (&pipeline, vectors) {
        (Some(embedder), Some(store)) if metadata.is_empty() && store.is_empty() && store.dimensions() == 0 => {
            log::debug!("binding empty catalog to {}", embedder.model_name());
            (
                Some(VectorStore::new(embedder.dimensions(), embedder.fingerprint())),
                Some(AnnIndex::new(embedder.dimensions(), params)),
            )
        }
        (_, vectors) => (vectors, ann),
    };

    let usable_vectors = match vectors {
        None => {
            problems.push("vector store unavailable".to_string());
            None
        }
        Some(store) => {
            let vector_problems = check_vectors(&metadata, &store, pipeline.as_deref());
            if vector_problems.is_empty() {
                Some(store)
            } else {
                problems.extend(vector_problems);
                // keep the binding so an empty catalog can stay unbound
                let fresh = VectorStore::new(store.dimensions(), store.fingerprint());
                return finish_reembed(metadata, Some(fresh), pipeline, params, problems, load_embedder);
            }
        }
    };

    let Some(store) = usable_vectors else {
        return finish_reembed(metadata, None, pipeline, params, problems, load_embedder);
    };

    let index_problem = match &ann {
        None => Some("index unavailable".to_string()),
        Some(index) if index.kind() != params.kind => {
            Some(format!("index kind {} differs from configured {}", index.kind(), params.kind))
        }
        Some(index) if index.len() != store.len() => {
            Some(format!("{} index entries but {} vectors", index.len(), store.len()))
        }
        Some(index) => {
            let diverged = store
                .iter()
                .filter(|row| !same_bits(index.get(row.id), Some(row.vector)))
                .count();
            (diverged > 0).then(|| format!("{diverged} index entries differ from stored vectors"))
        }
    };

    let (ann, action) = match (ann, index_problem) {
        (Some(index), None) => (index, RepairAction::None),
        (_, problem) => {
            problems.extend(problem);
            log::info!("rebuilding index over {} vectors", store.len());
            let index = AnnIndex::build(store.dimensions(), params, store.iter().map(|row| (row.id, row.vector)))?;
            (index, RepairAction::RebuiltIndex)
        }
    };

    Ok(Reconciled {
        report: report(&metadata, &store, &ann, action, problems),
        metadata,
        vectors: store,
        ann,
    })
}

fn check_vectors(metadata: &MetadataTable, store: &VectorStore, pipeline: Option<&ChunkedEmbedder>) -> Vec<String> {
    let mut problems = Vec::new();

    if store.len() != metadata.len() {
        problems.push(format!("{} metadata rows but {} vectors", metadata.len(), store.len()));
    }

    let mut missing = 0;
    let mut stale = 0;
    for record in metadata.iter() {
        match store.get(record.id) {
            None => missing += 1,
            Some(row) if row.content_hash != record.content_hash() => stale += 1,
            Some(_) => {}
        }
    }
    if missing > 0 {
        problems.push(format!("{missing} products have no vector"));
    }
    if stale > 0 {
        problems.push(format!("{stale} vectors were computed from an older corpus"));
    }

    if let Some(embedder) = pipeline {
        let matches = store.dimensions() == embedder.dimensions() && store.fingerprint() == embedder.fingerprint();
        if !matches {
            problems.push(format!(
                "vectors were produced by a different embedding pipeline (current model {})",
                embedder.model_name()
            ));
        }
    }

    problems
}

fn finish_reembed<F>(
    metadata: MetadataTable,
    previous: Option<VectorStore>,
    pipeline: Option<Arc<ChunkedEmbedder>>,
    params: &AnnParams,
    problems: Vec<String>,
    load_embedder: F,
) -> Result<Reconciled, CatalogError>
where
    F: Fn() -> Result<Arc<ChunkedEmbedder>, EmbeddingError>,
{
    let store = match (&pipeline, previous) {
        (None, Some(previous)) if metadata.is_empty() => previous,
        (None, None) if metadata.is_empty() => VectorStore::new(0, [0u8; 32]),
        (Some(embedder), _) => {
            log::info!("re-embedding {} products with {}", metadata.len(), embedder.model_name());
            embed_records(embedder, metadata.iter(), metadata.len())?
        }
        (None, _) => {
            let embedder = load_embedder()?;
            log::info!("re-embedding {} products with {}", metadata.len(), embedder.model_name());
            embed_records(&embedder, metadata.iter(), metadata.len())?
        }
    };

    let ann = AnnIndex::build(store.dimensions(), params, store.iter().map(|row| (row.id, row.vector)))?;

    Ok(Reconciled {
        report: report(&metadata, &store, &ann, RepairAction::Reembedded, problems),
        metadata,
        vectors: store,
        ann,
    })
}

fn report(
    metadata: &MetadataTable,
    vectors: &VectorStore,
    ann: &AnnIndex,
    action: RepairAction,
    problems: Vec<String>,
) -> ReconcileReport {
    for problem in &problems {
        log::warn!("reconcile: {problem}");
    }

    ReconcileReport {
        metadata_rows: metadata.len(),
        vector_rows: vectors.len(),
        ann_entries: ann.len(),
        action,
        problems,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::{ProductInput, ProductRecord};
    use crate::store::ann::IndexKind;
    use crate::tests::support::vocab_embedder;

    fn metadata() -> MetadataTable {
        let mut table = MetadataTable::new();
        for (id, name) in [(0, "Dark Chocolate Bar"), (1, "Vanilla Protein Powder"), (2, "Quinoa Bread")] {
            table
                .insert(ProductRecord::from_input(
                    id,
                    &ProductInput {
                        name: name.into(),
                        brand: "Acme".into(),
                        ingredients: "stuff".into(),
                        ..Default::default()
                    },
                ))
                .unwrap();
        }
        table
    }

    fn healthy(embedder: &ChunkedEmbedder) -> (MetadataTable, VectorStore, AnnIndex) {
        let metadata = metadata();
        let vectors = embed_records(embedder, metadata.iter(), metadata.len()).unwrap();
        let ann = AnnIndex::build(
            vectors.dimensions(),
            &AnnParams::default(),
            vectors.iter().map(|r| (r.id, r.vector)),
        )
        .unwrap();
        (metadata, vectors, ann)
    }

    fn no_model() -> Result<Arc<ChunkedEmbedder>, EmbeddingError> {
        Err(EmbeddingError::InitFailed("model must not be loaded".into()))
    }

    #[test]
    fn test_consistent_catalog_is_left_alone() {
        let embedder = Arc::new(vocab_embedder(32));
        let (metadata, vectors, ann) = healthy(&embedder);

        let out = reconcile(metadata, Some(vectors), Some(ann), &AnnParams::default(), true, || {
            Ok(embedder.clone())
        })
        .unwrap();

        assert_eq!(out.report.action, RepairAction::None);
        assert!(out.report.problems.is_empty());
        assert_eq!(out.report.metadata_rows, 3);
        assert_eq!(out.report.ann_entries, 3);
    }

    #[test]
    fn test_missing_index_is_rebuilt_without_model() {
        let embedder = vocab_embedder(32);
        let (metadata, vectors, _) = healthy(&embedder);

        let out = reconcile(metadata, Some(vectors), None, &AnnParams::default(), false, no_model).unwrap();

        assert_eq!(out.report.action, RepairAction::RebuiltIndex);
        assert_eq!(out.ann.ids(), vec![0, 1, 2]);
    }

    #[test]
    fn test_index_of_other_kind_is_rebuilt() {
        let embedder = vocab_embedder(32);
        let (metadata, vectors, ann) = healthy(&embedder);
        let params = AnnParams {
            kind: IndexKind::Hnsw,
            ..AnnParams::default()
        };

        let out = reconcile(metadata, Some(vectors), Some(ann), &params, false, no_model).unwrap();

        assert_eq!(out.report.action, RepairAction::RebuiltIndex);
        assert_eq!(out.ann.kind(), IndexKind::Hnsw);
    }

    #[test]
    fn test_missing_vectors_are_recomputed_from_corpus() {
        let embedder = Arc::new(vocab_embedder(32));
        let (metadata, vectors, _) = healthy(&embedder);
        let expected = vectors.get(1).unwrap().vector.to_vec();

        let out = reconcile(metadata, None, None, &AnnParams::default(), false, || Ok(embedder.clone())).unwrap();

        assert_eq!(out.report.action, RepairAction::Reembedded);
        assert_eq!(out.vectors.len(), 3);
        assert_eq!(out.vectors.get(1).unwrap().vector, expected.as_slice());
        assert_eq!(out.ann.len(), 3);
    }

    #[test]
    fn test_vector_for_deleted_row_forces_reembed() {
        let embedder = Arc::new(vocab_embedder(32));
        let (mut metadata, vectors, ann) = healthy(&embedder);
        metadata.remove_ids(&[2].into_iter().collect());

        let out = reconcile(metadata, Some(vectors), Some(ann), &AnnParams::default(), false, || {
            Ok(embedder.clone())
        })
        .unwrap();

        assert_eq!(out.report.action, RepairAction::Reembedded);
        assert_eq!(out.vectors.ids().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(out.ann.ids(), vec![0, 1]);
    }

    #[test]
    fn test_pipeline_change_forces_reembed() {
        let old = vocab_embedder(32);
        let (metadata, vectors, ann) = healthy(&old);
        let new = Arc::new(vocab_embedder(16));

        let out = reconcile(metadata, Some(vectors), Some(ann), &AnnParams::default(), true, || Ok(new.clone())).unwrap();

        assert_eq!(out.report.action, RepairAction::Reembedded);
        assert_eq!(out.vectors.dimensions(), 16);
        assert_eq!(out.vectors.fingerprint(), new.fingerprint());
    }

    #[test]
    fn test_empty_catalog_without_vectors_needs_no_model() {
        let out = reconcile(MetadataTable::new(), None, None, &AnnParams::default(), false, no_model).unwrap();
        assert_eq!(out.report.action, RepairAction::Reembedded);
        assert!(out.vectors.is_empty());
    }

    #[test]
    fn test_unbound_empty_catalog_is_bound_without_repair() {
        let embedder = Arc::new(vocab_embedder(32));
        let params = AnnParams::default();

        let out = reconcile(
            MetadataTable::new(),
            Some(VectorStore::new(0, [0u8; 32])),
            Some(AnnIndex::new(0, &params)),
            &params,
            true,
            || Ok(embedder.clone()),
        )
        .unwrap();

        assert!(!out.report.repaired());
        assert_eq!(out.report.action, RepairAction::None);
        assert_eq!(out.vectors.dimensions(), 32);
        assert_eq!(out.vectors.fingerprint(), embedder.fingerprint());
        assert_eq!(out.ann.dimensions(), 32);
    }

    #[test]
    fn test_model_failure_surfaces() {
        let embedder = vocab_embedder(32);
        let (metadata, _, _) = healthy(&embedder);

        let result = reconcile(metadata, None, None, &AnnParams::default(), false, no_model);
        assert!(matches!(result, Err(CatalogError::Embedding(_))));
    }
}
