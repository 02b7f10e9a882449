//! Catalog service: the operations exposed to serving collaborators.
//!
//! Readers take a cheap `Arc` snapshot and never block writers. Writers are
//! serialized in-process by a mutex and across processes by `catalog.lock`;
//! each mutation works on a private copy that is published only after its
//! generation has been committed to disk.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::backup;
use crate::catalog::reconcile::{reconcile, ReconcileReport};
use crate::catalog::{embed_records, Catalog, CatalogState, DeleteOutcome};
use crate::config::Config;
use crate::corpus::normalize_text;
use crate::errors::CatalogError;
use crate::lock::FileLock;
use crate::models::{ChunkedEmbedder, ModelProvider};
use crate::product::{validate_input, validate_update, ProductInput, ProductRecord, ProductUpdate, SeedRow};
use crate::retriever::{HybridRetriever, SearchMode, SearchResponse};
use crate::store::ann::{AnnIndex, AnnParams, IndexKind};
use crate::store::generations::GenerationStore;
use crate::store::metadata::MetadataTable;
use crate::store::StorageError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrandCount {
    pub brand: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CorpusLengthStats {
    pub mean: f64,
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogStats {
    pub total_products: usize,
    pub total_vectors: usize,
    pub ann_entries: usize,
    pub vector_dimension: usize,
    pub top_brands: Vec<BrandCount>,
    pub corpus_length_stats: CorpusLengthStats,
    pub generation: u64,
    pub last_updated: Option<String>,
    pub ann_kind: IndexKind,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedReport {
    pub inserted: usize,
    pub skipped: usize,
}

pub struct CatalogService {
    config: Config,
    models: Arc<ModelProvider>,
    store: GenerationStore,
    ann_params: AnnParams,
    snapshot: RwLock<Arc<Catalog>>,
    writer: Mutex<()>,
}

impl CatalogService {
    /// Open the catalog under the config's base path. Damage left behind by
    /// an interrupted process is repaired and committed before returning.
    pub fn open(config: Config, models: Arc<ModelProvider>) -> Result<Self, CatalogError> {
        let store = GenerationStore::new(config.base_path(), config.storage.keep_generations);
        let ann_params = AnnParams::from(&config.ann);

        let service = Self {
            snapshot: RwLock::new(Arc::new(Catalog::empty(&ann_params))),
            config,
            models,
            store,
            ann_params,
            writer: Mutex::new(()),
        };

        let catalog = service.load_from_disk()?;
        log::info!(
            "catalog opened: {} products, generation {}",
            catalog.len(),
            catalog.generation()
        );
        service.publish(catalog);

        Ok(service)
    }

    /// Current published catalog.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, catalog: Catalog) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
    }

    fn lock_writer(&self) -> Result<(MutexGuard<'_, ()>, FileLock), CatalogError> {
        let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let file_lock = FileLock::acquire(self.store.root())?;
        Ok((guard, file_lock))
    }

    /// Read the live generation, repairing it in memory when the three
    /// files disagree. The flag tells whether the repair must be committed.
    fn read_catalog(&self) -> Result<(Catalog, bool), CatalogError> {
        let Some(generation) = self.store.current()? else {
            return Ok((Catalog::empty(&self.ann_params), false));
        };

        let loaded = self.store.read_generation(generation, self.ann_params.kind)?;
        let committed_at = loaded.committed_at.map(DateTime::<Local>::from);
        let state = CatalogState::Loaded { generation };

        let repaired = reconcile(
            loaded.metadata,
            loaded.vectors.ok(),
            loaded.ann.ok(),
            &self.ann_params,
            false,
            || self.models.embedder(),
        )?;
        if repaired.report.repaired() {
            log::warn!("generation {generation} was inconsistent and has been repaired");
        }

        let catalog = Catalog::from_parts(repaired.metadata, repaired.vectors, repaired.ann, state, committed_at);
        Ok((catalog, repaired.report.repaired()))
    }

    fn load_from_disk(&self) -> Result<Catalog, CatalogError> {
        let (mut catalog, needs_commit) = self.read_catalog()?;
        if needs_commit {
            let _locks = self.lock_writer()?;
            catalog.commit(&self.store)?;
        }
        Ok(catalog)
    }

    /// Run `mutate` against a private copy of the catalog and publish it if
    /// it reports a change. Any error discards the copy.
    fn mutate<T, F>(&self, mutate: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&mut Catalog) -> Result<(T, bool), CatalogError>,
    {
        let _locks = self.lock_writer()?;

        // another process may have committed since our snapshot was taken
        let snapshot = self.snapshot();
        let on_disk = self.store.current()?;
        let mut draft = if on_disk.unwrap_or(0) != snapshot.generation() {
            log::info!("catalog changed on disk, reloading");
            let (mut catalog, needs_commit) = self.read_catalog()?;
            if needs_commit {
                catalog.commit(&self.store)?;
                self.publish(catalog.clone());
            }
            catalog
        } else {
            (*snapshot).clone()
        };

        let (value, changed) = mutate(&mut draft)?;
        if changed {
            draft.commit(&self.store)?;
            debug_assert!(draft.check_consistency().is_ok());
            self.publish(draft);
        }

        Ok(value)
    }

    /// Embedder whose pipeline matches `draft`. Stored vectors from another
    /// pipeline are recomputed first.
    fn bound_embedder(&self, draft: &mut Catalog) -> Result<Arc<ChunkedEmbedder>, CatalogError> {
        let embedder = self.models.embedder()?;
        if !draft.matches_pipeline(&embedder) {
            if !draft.is_empty() {
                log::warn!("stored vectors do not match the embedding pipeline, reconciling");
            }
            self.reconcile_draft(draft)?;
        }
        Ok(embedder)
    }

    fn reconcile_draft(&self, draft: &mut Catalog) -> Result<ReconcileReport, CatalogError> {
        let repaired = reconcile(
            draft.metadata().clone(),
            Some(draft.vectors().clone()),
            Some(draft.ann().clone()),
            &self.ann_params,
            true,
            || self.models.embedder(),
        )?;

        *draft = Catalog::from_parts(
            repaired.metadata,
            repaired.vectors,
            repaired.ann,
            draft.state(),
            draft.committed_at(),
        );
        Ok(repaired.report)
    }

    pub fn search(&self, query: &str, mode: Option<SearchMode>, top_k: Option<usize>) -> Result<SearchResponse, CatalogError> {
        let mode = mode.unwrap_or(self.config.search.default_mode);
        let top_k = top_k.unwrap_or(self.config.search.default_top_k);
        let retriever = HybridRetriever::new(&self.models, &self.config.search);

        match retriever.search(&self.snapshot(), query, mode, top_k) {
            Err(CatalogError::Consistency(reason)) => {
                log::warn!("search hit an inconsistent catalog ({reason}), reconciling");
                self.reconcile()?;
                retriever.search(&self.snapshot(), query, mode, top_k)
            }
            result => result,
        }
    }

    /// Add a product and return its id.
    pub fn add(&self, input: ProductInput) -> Result<u64, CatalogError> {
        validate_input(&input, &self.config.validation)?;

        self.mutate(|draft| {
            let embedder = self.bound_embedder(draft)?;
            let record = ProductRecord::from_input(draft.next_id(), &input);
            let vector = embedder.embed(&record.corpus)?;
            let id = draft.add(record, vector)?;
            log::info!("added product {id}");
            Ok((id, true))
        })
    }

    /// Apply a partial update and return the stored record.
    pub fn update(&self, id: u64, update: ProductUpdate) -> Result<ProductRecord, CatalogError> {
        validate_update(&update, &self.config.validation)?;

        self.mutate(|draft| {
            if draft.get(id).is_none() {
                return Err(CatalogError::NotFound(id));
            }
            let embedder = self.bound_embedder(draft)?;
            let record = draft
                .get(id)
                .map(|current| current.with_update(&update))
                .ok_or(CatalogError::NotFound(id))?;
            let vector = embedder.embed(&record.corpus)?;
            draft.update(record.clone(), vector)?;
            log::info!("updated product {id}");
            Ok((record, true))
        })
    }

    pub fn delete(&self, ids: &[u64]) -> Result<DeleteOutcome, CatalogError> {
        self.mutate(|draft| {
            let outcome = draft.delete(ids)?;
            if !outcome.deleted_ids.is_empty() {
                log::info!("deleted {} products", outcome.deleted_ids.len());
            }
            let changed = !outcome.deleted_ids.is_empty();
            Ok((outcome, changed))
        })
    }

    /// Check the three stores against each other and the embedding
    /// pipeline, repairing and committing when needed.
    pub fn reconcile(&self) -> Result<ReconcileReport, CatalogError> {
        self.mutate(|draft| {
            let report = self.reconcile_draft(draft)?;
            let changed = report.repaired();
            Ok((report, changed))
        })
    }

    /// First build from ingestion rows. Refuses to overwrite a non-empty
    /// catalog unless `replace` is set.
    pub fn seed(&self, rows: Vec<SeedRow>, replace: bool) -> Result<SeedReport, CatalogError> {
        self.mutate(|draft| {
            if !draft.is_empty() && !replace {
                return Err(CatalogError::validation(format!(
                    "catalog already holds {} products, pass replace to rebuild it",
                    draft.len()
                )));
            }

            let (records, skipped) = seed_records(rows)?;
            let embedder = self.models.embedder()?;
            log::info!("embedding {} products with {}", records.len(), embedder.model_name());
            let vectors = embed_records(&embedder, records.iter(), records.len())?;

            let mut metadata = MetadataTable::new();
            for record in records {
                metadata.insert(record)?;
            }
            let ann = AnnIndex::build(
                vectors.dimensions(),
                &self.ann_params,
                vectors.iter().map(|row| (row.id, row.vector)),
            )?;

            let report = SeedReport {
                inserted: metadata.len(),
                skipped,
            };
            *draft = Catalog::from_parts(metadata, vectors, ann, draft.state(), draft.committed_at());
            Ok((report, true))
        })
    }

    pub fn get(&self, id: u64) -> Result<ProductRecord, CatalogError> {
        self.snapshot().get(id).cloned().ok_or(CatalogError::NotFound(id))
    }

    /// The `limit` most recently added products (highest ids first).
    pub fn recent(&self, limit: usize) -> Vec<ProductRecord> {
        let snapshot = self.snapshot();
        let mut ids: Vec<u64> = snapshot.metadata().ids().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.into_iter()
            .take(limit)
            .filter_map(|id| snapshot.get(id).cloned())
            .collect()
    }

    pub fn stats(&self) -> CatalogStats {
        let snapshot = self.snapshot();
        let metadata = snapshot.metadata();

        let mut brands: HashMap<&str, usize> = HashMap::new();
        for record in metadata.iter().filter(|r| !r.brand.is_empty()) {
            *brands.entry(record.brand.as_str()).or_default() += 1;
        }
        let mut top_brands: Vec<BrandCount> = brands
            .into_iter()
            .map(|(brand, count)| BrandCount {
                brand: brand.to_string(),
                count,
            })
            .collect();
        top_brands.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.brand.cmp(&b.brand)));
        top_brands.truncate(self.config.stats.top_brands);

        let lengths: Vec<usize> = metadata.iter().map(|r| r.corpus.chars().count()).collect();
        let corpus_length_stats = match (lengths.iter().min(), lengths.iter().max()) {
            (Some(&min), Some(&max)) => CorpusLengthStats {
                mean: lengths.iter().sum::<usize>() as f64 / lengths.len() as f64,
                min,
                max,
            },
            _ => CorpusLengthStats::default(),
        };

        CatalogStats {
            total_products: metadata.len(),
            total_vectors: snapshot.vectors().len(),
            ann_entries: snapshot.ann().len(),
            vector_dimension: snapshot.vectors().dimensions(),
            top_brands,
            corpus_length_stats,
            generation: snapshot.generation(),
            last_updated: snapshot.committed_at().map(|t| t.to_rfc3339()),
            ann_kind: snapshot.ann().kind(),
        }
    }

    /// Archive the config and the live generation. Writers are held off so
    /// the generation cannot be pruned mid-archive.
    pub fn backup(&self, output_dir: Option<PathBuf>) -> Result<PathBuf, CatalogError> {
        let _locks = self.lock_writer()?;
        let output_dir = output_dir.unwrap_or_else(|| self.config.base_path().join("backups"));
        let generation = self.store.current()?;
        let generation_dir = generation.map(|g| self.store.generation_dir(g));
        backup::create_backup(self.config.base_path(), generation_dir.as_deref(), &output_dir)
    }
}

/// Turn ingestion rows into records. Rows without a name are skipped; rows
/// without an id take the lowest id not claimed by another row.
fn seed_records(rows: Vec<SeedRow>) -> Result<(Vec<ProductRecord>, usize), CatalogError> {
    let claimed: HashSet<u64> = rows.iter().filter_map(|r| r.id).collect();
    let mut next_free = 0u64;
    let mut seen = HashSet::new();
    let mut errors = Vec::new();
    let mut records = Vec::with_capacity(rows.len());
    let mut skipped = 0;

    for (line, row) in rows.into_iter().enumerate() {
        let (id, input) = row.into_input();
        if normalize_text(&input.name).is_empty() {
            log::warn!("seed row {} has no name, skipping", line + 1);
            skipped += 1;
            continue;
        }

        let id = match id {
            Some(id) => id,
            None => {
                while claimed.contains(&next_free) || seen.contains(&next_free) {
                    next_free += 1;
                }
                next_free
            }
        };
        if !seen.insert(id) {
            errors.push(format!("duplicate id {id} in seed row {}", line + 1));
            continue;
        }

        records.push(ProductRecord::from_input(id, &input));
    }

    if !errors.is_empty() {
        return Err(CatalogError::Validation { errors });
    }
    Ok((records, skipped))
}

/// Parse ingestion rows from CSV with the `ProductInput` columns and an
/// optional `id` column.
pub fn read_seed_rows<R: Read>(reader: R) -> Result<Vec<SeedRow>, CatalogError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for row in csv_reader.deserialize::<SeedRow>() {
        rows.push(row.map_err(StorageError::from)?);
    }
    Ok(rows)
}
