//! Hybrid retrieval over the corpus.
//!
//! Semantic scoring runs against the dense matrix of an index snapshot.
//! Large corpora are first narrowed with the inverted keyword index and
//! only the candidate rows are scored. Without a query vector, or with no
//! embedded chunks, the engine falls back to keyword overlap scoring.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    chunking::Chunk,
    corpus::{CorpusStore, IndexSnapshot},
    dense_index::EmbeddingMatrix,
    embedding::{EmbeddingProvider, normalize},
    ids::CollectionId,
    tokenizer::{PREFIX_MATCH_MIN_CHARS, overlap_score, tokenize},
    topk::{select_top_k, select_top_k_by},
};

/// Tuning knobs for retrieval.
///
/// # Examples
///
/// ```
/// use ragweave::retrieval::RetrievalConfig;
///
/// let config: RetrievalConfig =
///     serde_json::from_str(r#"{"similarity_threshold": 0.5}"#).unwrap();
/// assert_eq!(config.similarity_threshold, 0.5);
/// assert_eq!(config.full_scan_row_limit, 200);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Cosine similarity a chunk must exceed to be returned.
    pub similarity_threshold: f32,
    /// Below this many matrix rows every query is a full scan.
    pub full_scan_row_limit: usize,
    /// Two-phase needs at least `limit * candidate_multiplier` candidates...
    pub candidate_multiplier: usize,
    /// ...and never fewer than this.
    pub candidate_floor: usize,
    /// Minimum normalized keyword overlap for the fallback path.
    pub keyword_threshold: f32,
    /// Tokens this long or longer also match by prefix.
    pub prefix_min_len: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.3,
            full_scan_row_limit: 200,
            candidate_multiplier: 3,
            candidate_floor: 20,
            keyword_threshold: 0.30,
            prefix_min_len: PREFIX_MATCH_MIN_CHARS,
        }
    }
}

/// How a result list was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Every matrix row was scored.
    FullScan,
    /// Only rows surfaced by the keyword index were scored.
    TwoPhase,
    /// Keyword overlap; no dense scoring happened.
    Keyword,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Arc<Chunk>,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub strategy: RetrievalStrategy,
    /// Best first.
    pub results: Vec<ScoredChunk>,
}

impl RetrievalOutcome {
    fn keyword(results: Vec<ScoredChunk>) -> Self {
        Self {
            strategy: RetrievalStrategy::Keyword,
            results,
        }
    }
}

pub struct RetrievalEngine {
    corpus: Arc<CorpusStore>,
    provider: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        corpus: Arc<CorpusStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            corpus,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn corpus(&self) -> &Arc<CorpusStore> {
        &self.corpus
    }

    /// The `limit` most relevant chunks for `query`, best first.
    ///
    /// `scope` restricts the search to those collections; an empty scope
    /// searches everything. Never fails: no match is an empty list.
    pub fn retrieve(
        &self,
        query: &str,
        limit: usize,
        scope: &[CollectionId],
    ) -> Vec<Arc<Chunk>> {
        self.retrieve_scored(query, limit, scope)
            .results
            .into_iter()
            .map(|r| r.chunk)
            .collect()
    }

    /// Like [`retrieve`](Self::retrieve), keeping scores and the strategy.
    pub fn retrieve_scored(
        &self,
        query: &str,
        limit: usize,
        scope: &[CollectionId],
    ) -> RetrievalOutcome {
        if limit == 0 {
            return RetrievalOutcome::keyword(Vec::new());
        }

        let dimension = self.provider.dimension();
        let snapshot = self.corpus.snapshot(scope, dimension);

        let Some(query_vector) = self.query_vector(query, dimension) else {
            debug!("no query vector, using keyword retrieval");
            return RetrievalOutcome::keyword(self.keyword_search(
                &snapshot, query, limit,
            ));
        };

        if snapshot.matrix().is_empty() {
            debug!("no embedded chunks in scope, using keyword retrieval");
            return RetrievalOutcome::keyword(self.keyword_search(
                &snapshot, query, limit,
            ));
        }

        match self.semantic_search(&snapshot, query, &query_vector, limit) {
            Some(outcome) => outcome,
            None => RetrievalOutcome::keyword(self.keyword_search(
                &snapshot, query, limit,
            )),
        }
    }

    fn query_vector(&self, query: &str, dimension: usize) -> Option<Vec<f32>> {
        let mut vector = match self.provider.try_embed(query) {
            Ok(vector) => vector,
            Err(e) => {
                debug!(error = %e, "no query vector");
                return None;
            }
        };
        if vector.len() != dimension {
            warn!(
                expected = dimension,
                got = vector.len(),
                "query embedding has the wrong dimension"
            );
            return None;
        }
        normalize(&mut vector).then_some(vector)
    }

    /// Dense scoring. Returns `None` only when scoring itself failed.
    fn semantic_search(
        &self,
        snapshot: &IndexSnapshot,
        query: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Option<RetrievalOutcome> {
        let matrix = snapshot.matrix();
        let rows = matrix.row_count();

        let full_scan = rows < self.config.full_scan_row_limit;
        let (strategy, scored_matrix) = if full_scan {
            (RetrievalStrategy::FullScan, None)
        } else {
            let tokens = tokenize(query);
            let mut candidate_rows: Vec<usize> = snapshot
                .sparse()
                .candidates(&tokens, self.config.prefix_min_len)
                .into_iter()
                .filter_map(|id| snapshot.matrix_row(id))
                .collect();
            candidate_rows.sort_unstable();

            let needed = limit
                .saturating_mul(self.config.candidate_multiplier)
                .max(self.config.candidate_floor);
            if candidate_rows.len() < needed {
                debug!(
                    rows,
                    candidates = candidate_rows.len(),
                    needed,
                    "too few candidates, using full scan"
                );
                (RetrievalStrategy::FullScan, None)
            } else {
                (
                    RetrievalStrategy::TwoPhase,
                    Some(matrix.sub_matrix(&candidate_rows)),
                )
            }
        };

        let target: &EmbeddingMatrix =
            scored_matrix.as_ref().unwrap_or(matrix);
        let scores = match target.score(query_vector) {
            Ok(scores) => scores,
            Err(e) => {
                warn!(error = %e, "dense scoring failed, using keywords");
                return None;
            }
        };

        let threshold = self.config.similarity_threshold;
        let results = select_top_k(&scores, limit, threshold)
            .into_iter()
            .filter_map(|(row, score)| {
                target.chunk(row).map(|chunk| ScoredChunk {
                    chunk: Arc::clone(chunk),
                    score,
                })
            })
            .collect::<Vec<_>>();

        debug!(
            ?strategy,
            rows,
            scored = target.row_count(),
            results = results.len(),
            "semantic retrieval"
        );
        Some(RetrievalOutcome { strategy, results })
    }

    /// Normalized token overlap against every chunk in the snapshot.
    fn keyword_search(
        &self,
        snapshot: &IndexSnapshot,
        query: &str,
        limit: usize,
    ) -> Vec<ScoredChunk> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let prefix = self.config.prefix_min_len;
        let scored = snapshot
            .token_sets()
            .iter()
            .map(|target| overlap_score(&tokens, target, prefix))
            .enumerate();
        let threshold = self.config.keyword_threshold;

        select_top_k_by(scored, limit, |s| s >= threshold)
            .into_iter()
            .filter_map(|(row, score)| {
                snapshot.chunks().get(row).map(|chunk| ScoredChunk {
                    chunk: Arc::clone(chunk),
                    score,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
