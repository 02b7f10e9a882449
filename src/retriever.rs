//! Two-stage retrieval: dense candidates from the ANN index, optionally
//! re-ordered by the cross-encoder.
//!
//! Per query: Idle -> Embedding -> DenseRetrieval -> (ReRank) -> Done, with
//! any stage able to end in Failed.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::config::SearchConfig;
use crate::errors::CatalogError;
use crate::models::{EmbeddingError, ModelProvider};
use crate::product::{ProductRecord, ProductView};
use crate::store::ann::Neighbor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Bi-encoder similarity only
    Dense,
    /// Dense candidates re-ranked by the cross-encoder
    #[default]
    Hybrid,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Dense => write!(f, "dense"),
            SearchMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Idle,
    Embedding,
    DenseRetrieval,
    ReRank,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    #[serde(flatten)]
    pub product: ProductView,
    /// Rerank score in hybrid mode, dense score otherwise
    pub score: f32,
    pub dense_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTimings {
    pub embedding_ms: f64,
    pub retrieval_ms: f64,
    pub rerank_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub mode: SearchMode,
    pub results: Vec<SearchHit>,
    pub timings: SearchTimings,
}

/// Tracks the stage of one query and records where it failed.
struct QueryRun {
    stage: QueryStage,
}

impl QueryRun {
    fn new() -> Self {
        Self {
            stage: QueryStage::Idle,
        }
    }

    fn advance(&mut self, next: QueryStage) {
        log::debug!("query stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
    }

    fn check<T, E>(&mut self, result: Result<T, E>) -> Result<T, CatalogError>
    where
        E: Into<CatalogError>,
    {
        result.map_err(|e| {
            let e = e.into();
            log::debug!("query failed during {:?}: {e}", self.stage);
            self.stage = QueryStage::Failed;
            e
        })
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_micros() as f64 / 1000.0
}

pub struct HybridRetriever<'a> {
    models: &'a ModelProvider,
    settings: &'a SearchConfig,
}

impl<'a> HybridRetriever<'a> {
    pub fn new(models: &'a ModelProvider, settings: &'a SearchConfig) -> Self {
        Self { models, settings }
    }

    /// `top_k` outside `1..=max_top_k` is clamped. An empty catalog yields
    /// no results; an empty query is rejected.
    pub fn search(
        &self,
        catalog: &Catalog,
        query: &str,
        mode: SearchMode,
        top_k: usize,
    ) -> Result<SearchResponse, CatalogError> {
        let top_k = top_k.clamp(1, self.settings.max_top_k.max(1));
        let span = tracing::info_span!("search", %mode, top_k);
        let _entered = span.enter();

        let query = query.trim();
        if query.is_empty() {
            return Err(CatalogError::validation("query must not be empty"));
        }

        let started = Instant::now();
        let mut timings = SearchTimings::default();
        let mut run = QueryRun::new();

        if catalog.is_empty() {
            log::debug!("catalog is empty, nothing to search");
            return Ok(SearchResponse {
                query: query.to_string(),
                mode,
                results: vec![],
                timings,
            });
        }

        run.advance(QueryStage::Embedding);
        let stage_start = Instant::now();
        let embedder = run.check(self.models.embedder())?;
        if !catalog.matches_pipeline(&embedder) {
            run.advance(QueryStage::Failed);
            return Err(CatalogError::Consistency(
                "stored vectors were produced by a different embedding pipeline".to_string(),
            ));
        }
        let query_vector = run.check(embedder.embed(query))?;
        timings.embedding_ms = elapsed_ms(stage_start);

        run.advance(QueryStage::DenseRetrieval);
        let stage_start = Instant::now();
        let retrieval_k = self.settings.retrieval_k.max(top_k).min(catalog.len());
        let neighbors = run.check(catalog.ann().search(&query_vector, retrieval_k))?;
        let candidates = run.check(resolve(catalog, &neighbors))?;
        timings.retrieval_ms = elapsed_ms(stage_start);

        let mut hits = match mode {
            SearchMode::Dense => candidates
                .into_iter()
                .map(|(record, dense)| SearchHit {
                    product: record.view(),
                    score: dense,
                    dense_score: dense,
                    rerank_score: None,
                })
                .collect::<Vec<_>>(),
            SearchMode::Hybrid => {
                run.advance(QueryStage::ReRank);
                let stage_start = Instant::now();
                let hits = run.check(self.rerank(query, candidates))?;
                timings.rerank_ms = elapsed_ms(stage_start);
                hits
            }
        };
        hits.truncate(top_k);

        run.advance(QueryStage::Done);
        timings.total_ms = elapsed_ms(started);
        if timings.total_ms > self.settings.latency_target_ms as f64 {
            log::warn!(
                "query took {:.1}ms, above the {}ms target",
                timings.total_ms,
                self.settings.latency_target_ms
            );
        }

        Ok(SearchResponse {
            query: query.to_string(),
            mode,
            results: hits,
            timings,
        })
    }

    fn rerank(&self, query: &str, candidates: Vec<(&ProductRecord, f32)>) -> Result<Vec<SearchHit>, EmbeddingError> {
        let scorer = self.models.reranker()?;
        let documents: Vec<&str> = candidates.iter().map(|(record, _)| record.corpus.as_str()).collect();
        let scores = scorer.score(query, &documents)?;
        if scores.len() != candidates.len() {
            return Err(EmbeddingError::RerankFailed(format!(
                "scorer returned {} scores for {} candidates",
                scores.len(),
                candidates.len()
            )));
        }

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .zip(scores)
            .map(|((record, dense), rerank)| SearchHit {
                product: record.view(),
                score: rerank,
                dense_score: dense,
                rerank_score: Some(rerank),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.dense_score.total_cmp(&a.dense_score))
                .then_with(|| a.product.id.cmp(&b.product.id))
        });
        Ok(hits)
    }
}

/// Pair every neighbor with its metadata row, keeping the index order.
fn resolve<'c>(catalog: &'c Catalog, neighbors: &[Neighbor]) -> Result<Vec<(&'c ProductRecord, f32)>, CatalogError> {
    neighbors
        .iter()
        .map(|n| {
            catalog
                .get(n.id)
                .map(|record| (record, n.score))
                .ok_or_else(|| CatalogError::Consistency(format!("index returned unknown product {}", n.id)))
        })
        .collect()
}

