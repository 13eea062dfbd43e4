//! In-memory corpus of collections and chunks.
//!
//! The corpus is the single writer for chunk data. Every mutation bumps a
//! generation counter and drops the cached index snapshots; readers get an
//! immutable [`IndexSnapshot`] that is rebuilt lazily on the next read.
//!
//! When a [`StoreDb`] is attached, every mutation is written through to it.
//! A failed write is logged and remembered, and the next mutation retries
//! it; the in-memory state stays authoritative either way.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    chunking::Chunk,
    dense_index::EmbeddingMatrix,
    embedding::{EmbeddingProvider, embed_chunks},
    error::{Error, Result},
    ids::{ChunkId, CollectionId, unix_now},
    sparse_index::InvertedIndex,
    store_db::StoreDb,
};

/// A named group of chunks, usually one ingested document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub chunk_count: usize,
    /// Sum of the UTF-8 byte lengths of the chunk contents.
    pub byte_size: usize,
    /// Identifier of the model that produced the stored embeddings.
    pub embedding_model_stamp: Option<String>,
    pub created_at: u64,
}

impl Collection {
    fn recount(&mut self, chunks: &[Arc<Chunk>]) {
        self.chunk_count = chunks.len();
        self.byte_size = chunks.iter().map(|c| c.content.len()).sum();
    }

    /// True when the stored vectors were not produced by `model`.
    pub fn is_stale_for(&self, model: &str) -> bool {
        self.embedding_model_stamp.as_deref() != Some(model)
    }
}

#[derive(Debug, Default)]
struct CorpusState {
    collections: BTreeMap<CollectionId, Collection>,
    chunks: BTreeMap<CollectionId, Vec<Arc<Chunk>>>,
}

/// Immutable, generation-stamped view of the indexed chunks of a scope.
#[derive(Debug)]
pub struct IndexSnapshot {
    generation: u64,
    chunks: Vec<Arc<Chunk>>,
    /// `token_sets[i]` is `chunks[i].token_set()`.
    token_sets: Vec<BTreeSet<String>>,
    matrix: EmbeddingMatrix,
    matrix_rows: HashMap<ChunkId, usize>,
    sparse: InvertedIndex,
}

impl IndexSnapshot {
    fn build(
        generation: u64,
        chunks: Vec<Arc<Chunk>>,
        dimension: usize,
    ) -> Self {
        let token_sets = chunks.iter().map(|c| c.token_set()).collect();
        let matrix = EmbeddingMatrix::build(&chunks, dimension);
        let matrix_rows = (0..matrix.row_count())
            .filter_map(|row| matrix.chunk(row).map(|c| (c.id, row)))
            .collect();
        let sparse = InvertedIndex::build(chunks.iter().map(|c| c.as_ref()));

        Self {
            generation,
            chunks,
            token_sets,
            matrix,
            matrix_rows,
            sparse,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    pub fn token_sets(&self) -> &[BTreeSet<String>] {
        &self.token_sets
    }

    pub fn matrix(&self) -> &EmbeddingMatrix {
        &self.matrix
    }

    /// Matrix row holding `id`, if the chunk has a usable embedding.
    pub fn matrix_row(&self, id: ChunkId) -> Option<usize> {
        self.matrix_rows.get(&id).copied()
    }

    pub fn sparse(&self) -> &InvertedIndex {
        &self.sparse
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SnapshotKey {
    scope: Vec<CollectionId>,
    dimension: usize,
}

pub struct CorpusStore {
    state: RwLock<CorpusState>,
    generation: AtomicU64,
    snapshots: Mutex<HashMap<SnapshotKey, Arc<IndexSnapshot>>>,
    store: Option<Arc<StoreDb>>,
    /// Collections whose last write-through failed.
    pending: Mutex<BTreeSet<CollectionId>>,
}

impl Default for CorpusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CorpusStore {
    /// A purely in-memory corpus.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CorpusState::default()),
            generation: AtomicU64::new(0),
            snapshots: Mutex::new(HashMap::new()),
            store: None,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Load every collection and chunk from `store` and write through to
    /// it from now on.
    ///
    /// Chunk counts and byte sizes are recomputed from the loaded chunks;
    /// chunks whose collection record is missing are discarded.
    pub fn open(store: Arc<StoreDb>) -> Result<Self> {
        let mut state = CorpusState::default();
        for collection in store.load_collections()? {
            state.chunks.insert(collection.id, Vec::new());
            state.collections.insert(collection.id, collection);
        }

        let mut orphans = 0usize;
        for chunk in store.load_chunks()? {
            match state.chunks.get_mut(&chunk.collection_id) {
                Some(list) => list.push(Arc::new(chunk)),
                None => orphans += 1,
            }
        }
        if orphans > 0 {
            warn!(orphans, "ignoring chunks without a collection record");
        }

        for (id, chunks) in state.chunks.iter_mut() {
            chunks.sort_by_key(|c| c.sequence_index);
            if let Some(collection) = state.collections.get_mut(id) {
                collection.recount(chunks);
            }
        }

        info!(
            collections = state.collections.len(),
            chunks = state.chunks.values().map(Vec::len).sum::<usize>(),
            "loaded corpus"
        );

        Ok(Self {
            state: RwLock::new(state),
            store: Some(store),
            ..Self::new()
        })
    }

    /// Current generation; bumped by every mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn collections(&self) -> Vec<Collection> {
        let state = self.read();
        let mut list: Vec<Collection> =
            state.collections.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        list
    }

    pub fn collection(&self, id: CollectionId) -> Option<Collection> {
        self.read().collections.get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Collection> {
        self.read()
            .collections
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Chunks of one collection in sequence order.
    pub fn chunks_of(&self, id: CollectionId) -> Vec<Arc<Chunk>> {
        self.read().chunks.get(&id).cloned().unwrap_or_default()
    }

    pub fn chunk_count(&self) -> usize {
        self.read().chunks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_count() == 0
    }

    /// Add a collection, replacing any existing collection with the same
    /// name in the same write.
    ///
    /// `chunks` must belong to `id`; chunks carrying another collection id
    /// are skipped.
    pub fn insert_collection(
        &self,
        id: CollectionId,
        name: &str,
        chunks: Vec<Chunk>,
        model_stamp: Option<String>,
    ) -> Collection {
        self.retry_pending();

        let chunks: Vec<Arc<Chunk>> = chunks
            .into_iter()
            .filter(|c| c.collection_id == id)
            .map(Arc::new)
            .collect();
        let mut collection = Collection {
            id,
            name: name.to_string(),
            chunk_count: 0,
            byte_size: 0,
            embedding_model_stamp: model_stamp,
            created_at: unix_now(),
        };
        collection.recount(&chunks);

        let replaced: Vec<CollectionId> = {
            let mut state = self.write();
            let replaced: Vec<CollectionId> = state
                .collections
                .values()
                .filter(|c| c.name == name && c.id != id)
                .map(|c| c.id)
                .collect();
            for old in &replaced {
                state.collections.remove(old);
                state.chunks.remove(old);
            }
            state.collections.insert(id, collection.clone());
            state.chunks.insert(id, chunks);
            self.invalidate();
            replaced
        };

        info!(
            collection = %id,
            name,
            chunks = collection.chunk_count,
            replaced = replaced.len(),
            "stored collection"
        );

        for old in replaced {
            self.persist(old);
        }
        self.persist(id);
        collection
    }

    /// Remove a collection and its chunks.
    pub fn remove_collection(&self, id: CollectionId) -> Option<Collection> {
        self.retry_pending();

        let removed = {
            let mut state = self.write();
            let removed = state.collections.remove(&id);
            state.chunks.remove(&id);
            if removed.is_some() {
                self.invalidate();
            }
            removed
        };

        if removed.is_some() {
            info!(collection = %id, "removed collection");
            self.persist(id);
        }
        removed
    }

    /// Collections whose embeddings were not produced by `model`.
    pub fn stale_collections(&self, model: &str) -> Vec<CollectionId> {
        self.read()
            .collections
            .values()
            .filter(|c| c.is_stale_for(model))
            .map(|c| c.id)
            .collect()
    }

    /// Recompute embeddings for every collection stamped with a different
    /// model than `provider`. Returns the number of chunks re-embedded.
    ///
    /// Safe to run repeatedly: collections already stamped with the
    /// current model are skipped.
    pub fn reembed_stale(&self, provider: &dyn EmbeddingProvider) -> usize {
        if !provider.is_available() {
            debug!("embedding provider unavailable, skipping re-embed");
            return 0;
        }
        let model = provider.model_identifier().to_string();
        let mut total = 0;

        for id in self.stale_collections(&model) {
            let mut chunks: Vec<Chunk> = self
                .chunks_of(id)
                .iter()
                .map(|c| Chunk::clone(c))
                .collect();
            let embedded = embed_chunks(provider, &mut chunks);

            self.retry_pending();
            {
                let mut state = self.write();
                let Some(collection) = state.collections.get_mut(&id) else {
                    // Removed while we were embedding.
                    continue;
                };
                collection.embedding_model_stamp = Some(model.clone());
                state
                    .chunks
                    .insert(id, chunks.into_iter().map(Arc::new).collect());
                self.invalidate();
            }

            info!(collection = %id, embedded, model = %model, "re-embedded");
            total += embedded;
            self.persist(id);
        }
        total
    }

    /// Get the index snapshot for `scope` (empty means every collection),
    /// building it if the cached one is stale.
    pub fn snapshot(
        &self,
        scope: &[CollectionId],
        dimension: usize,
    ) -> Arc<IndexSnapshot> {
        let mut scope = scope.to_vec();
        scope.sort_unstable();
        scope.dedup();
        let key = SnapshotKey { scope, dimension };

        let current = self.generation();
        if let Some(snapshot) = self.lock_snapshots().get(&key)
            && snapshot.generation == current
        {
            return Arc::clone(snapshot);
        }

        let (generation, chunks) = {
            let state = self.read();
            let generation = self.generation();
            let chunks: Vec<Arc<Chunk>> = if key.scope.is_empty() {
                state.chunks.values().flatten().cloned().collect()
            } else {
                key.scope
                    .iter()
                    .filter_map(|id| state.chunks.get(id))
                    .flatten()
                    .cloned()
                    .collect()
            };
            (generation, chunks)
        };

        let snapshot =
            Arc::new(IndexSnapshot::build(generation, chunks, dimension));
        debug!(
            generation,
            chunks = snapshot.chunks.len(),
            rows = snapshot.matrix.row_count(),
            tokens = snapshot.sparse.token_count(),
            "rebuilt index snapshot"
        );

        // A mutation may have landed while building; only cache if not.
        if self.generation() == generation {
            self.lock_snapshots().insert(key, Arc::clone(&snapshot));
        }
        snapshot
    }

    /// Collections with an unflushed write.
    pub fn pending_writes(&self) -> Vec<CollectionId> {
        self.lock_pending().iter().copied().collect()
    }

    /// Retry every write-through that failed earlier.
    pub fn retry_pending(&self) {
        if self.store.is_none() {
            return;
        }
        let pending: Vec<CollectionId> =
            std::mem::take(&mut *self.lock_pending()).into_iter().collect();
        for id in pending {
            self.persist(id);
        }
    }

    /// Retry failed writes now and report any that still did not land.
    pub fn flush(&self) -> Result<()> {
        self.retry_pending();
        let pending = self.lock_pending().len();
        if pending > 0 {
            return Err(Error::PersistenceFailure(format!(
                "{pending} collection writes pending"
            )));
        }
        Ok(())
    }

    /// Must be called with the state write lock held.
    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.lock_snapshots().clear();
    }

    /// Write the current in-memory state of `id` to the store: the full
    /// collection if it exists, a removal otherwise.
    fn persist(&self, id: CollectionId) {
        let Some(store) = &self.store else {
            return;
        };

        let (collection, chunks) = {
            let state = self.read();
            (
                state.collections.get(&id).cloned(),
                state.chunks.get(&id).cloned().unwrap_or_default(),
            )
        };

        let result = match &collection {
            Some(collection) => {
                let refs: Vec<&Chunk> =
                    chunks.iter().map(|c| c.as_ref()).collect();
                store.replace_collection(collection, &refs)
            }
            None => store.remove_collection(id).map(|_| ()),
        };

        if let Err(e) = result {
            warn!(
                collection = %id,
                error = %e,
                "persisting collection failed, will retry"
            );
            self.lock_pending().insert(id);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CorpusState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CorpusState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_snapshots(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SnapshotKey, Arc<IndexSnapshot>>>
    {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeSet<CollectionId>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CorpusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorpusStore")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunking::{ChunkingConfig, Section, chunk_sections},
        embedding::HashingEmbedder,
        retrieval::{RetrievalConfig, RetrievalEngine},
    };

    fn document(topic: &str, paragraphs: usize) -> Vec<Section> {
        let body = (0..paragraphs)
            .map(|i| {
                format!(
                    "Paragraph {i} about {topic}. It describes {topic} in \
                     enough detail that the chunker has real text to pack \
                     into segments of a few hundred characters each."
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        vec![Section::new("Page 1", body)]
    }

    fn chunks_for(id: CollectionId, topic: &str) -> Vec<Chunk> {
        chunk_sections(&document(topic, 8), id, &ChunkingConfig::default(), topic)
            .unwrap()
    }

    fn embedded(id: CollectionId, topic: &str, provider: &HashingEmbedder) -> Vec<Chunk> {
        let mut chunks = chunks_for(id, topic);
        embed_chunks(provider, &mut chunks);
        chunks
    }

    #[test]
    fn insert_counts_chunks_and_bytes() {
        let corpus = CorpusStore::new();
        let id = CollectionId::generate("rust");
        let chunks = chunks_for(id, "rust");
        let expected_bytes: usize = chunks.iter().map(|c| c.content.len()).sum();
        let expected_count = chunks.len();

        let collection = corpus.insert_collection(id, "rust", chunks, None);

        assert_eq!(collection.chunk_count, expected_count);
        assert_eq!(collection.byte_size, expected_bytes);
        assert_eq!(corpus.chunk_count(), expected_count);
        assert_eq!(corpus.chunks_of(id).len(), expected_count);
    }

    #[test]
    fn same_name_replaces_collection() {
        let corpus = CorpusStore::new();
        let first = CollectionId::generate("notes");
        corpus.insert_collection(first, "notes", chunks_for(first, "tea"), None);
        let second = CollectionId::generate("notes");
        corpus.insert_collection(second, "notes", chunks_for(second, "coffee"), None);

        let collections = corpus.collections();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].id, second);
        assert!(corpus.chunks_of(first).is_empty());
    }

    #[test]
    fn mutations_invalidate_snapshots() {
        let corpus = CorpusStore::new();
        let before = corpus.snapshot(&[], 8);
        assert!(before.chunks().is_empty());

        let id = CollectionId::generate("rust");
        corpus.insert_collection(id, "rust", chunks_for(id, "rust"), None);

        let after = corpus.snapshot(&[], 8);
        assert!(after.generation() > before.generation());
        assert!(!after.chunks().is_empty());

        // Unchanged corpus reuses the cached snapshot.
        let again = corpus.snapshot(&[], 8);
        assert!(Arc::ptr_eq(&after, &again));

        corpus.remove_collection(id);
        assert!(corpus.snapshot(&[], 8).chunks().is_empty());
    }

    #[test]
    fn snapshot_respects_scope() {
        let corpus = CorpusStore::new();
        let a = CollectionId::generate("a");
        let b = CollectionId::generate("b");
        corpus.insert_collection(a, "a", chunks_for(a, "rust"), None);
        corpus.insert_collection(b, "b", chunks_for(b, "pasta"), None);

        let only_a = corpus.snapshot(&[a], 8);
        assert!(only_a.chunks().iter().all(|c| c.collection_id == a));
        let all = corpus.snapshot(&[], 8);
        assert_eq!(all.chunks().len(), corpus.chunk_count());
    }

    #[test]
    fn snapshot_matrix_only_holds_embedded_chunks() {
        let provider = HashingEmbedder::new(16);
        let corpus = CorpusStore::new();
        let a = CollectionId::generate("a");
        let b = CollectionId::generate("b");
        let embedded_chunks = embedded(a, "rust", &provider);
        let embedded_count = embedded_chunks.len();
        corpus.insert_collection(a, "a", embedded_chunks, None);
        corpus.insert_collection(b, "b", chunks_for(b, "pasta"), None);

        let snapshot = corpus.snapshot(&[], 16);
        assert_eq!(snapshot.matrix().row_count(), embedded_count);
        for chunk in corpus.chunks_of(a) {
            assert!(snapshot.matrix_row(chunk.id).is_some());
        }
        for chunk in corpus.chunks_of(b) {
            assert!(snapshot.matrix_row(chunk.id).is_none());
        }
    }

    #[test]
    fn reembed_refreshes_stale_collections_once() {
        let provider = HashingEmbedder::new(16);
        let corpus = CorpusStore::new();
        let id = CollectionId::generate("rust");
        let chunks = chunks_for(id, "rust");
        let count = chunks.len();
        corpus.insert_collection(id, "rust", chunks, Some("old-model".into()));

        assert_eq!(corpus.stale_collections(provider.model_identifier()), vec![id]);
        assert_eq!(corpus.reembed_stale(&provider), count);
        assert!(corpus.stale_collections(provider.model_identifier()).is_empty());
        assert!(corpus.chunks_of(id).iter().all(|c| c.embedding.is_some()));

        assert_eq!(corpus.reembed_stale(&provider), 0);
    }

    #[test]
    fn store_roundtrip_restores_corpus() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(StoreDb::open(&tmp.path().join("store.redb")).unwrap());
        let provider = HashingEmbedder::new(16);
        let id = CollectionId::generate("rust");
        {
            let corpus = CorpusStore::open(Arc::clone(&store)).unwrap();
            corpus.insert_collection(
                id,
                "rust",
                embedded(id, "rust", &provider),
                Some(provider.model_identifier().to_string()),
            );
            assert!(corpus.pending_writes().is_empty());
        }

        let corpus = CorpusStore::open(store).unwrap();
        let collection = corpus.collection(id).unwrap();
        assert_eq!(collection.name, "rust");
        assert_eq!(collection.chunk_count, corpus.chunks_of(id).len());
        assert!(corpus.chunks_of(id).iter().all(|c| c.embedding.is_some()));
        let indices: Vec<usize> =
            corpus.chunks_of(id).iter().map(|c| c.sequence_index).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn removal_is_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(StoreDb::open(&tmp.path().join("store.redb")).unwrap());
        let id = CollectionId::generate("rust");
        {
            let corpus = CorpusStore::open(Arc::clone(&store)).unwrap();
            corpus.insert_collection(id, "rust", chunks_for(id, "rust"), None);
            assert!(corpus.remove_collection(id).is_some());
            assert!(corpus.remove_collection(id).is_none());
        }
        let corpus = CorpusStore::open(store).unwrap();
        assert!(corpus.collections().is_empty());
        assert!(corpus.is_empty());
    }

    #[test]
    fn failed_write_is_retried_by_next_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(StoreDb::open(&tmp.path().join("store.redb")).unwrap());
        let corpus = Arc::new(CorpusStore::open(Arc::clone(&store)).unwrap());

        store.set_fail_writes(true);
        let rust = CollectionId::generate("rust");
        corpus.insert_collection(rust, "rust", chunks_for(rust, "rust"), None);
        assert_eq!(corpus.pending_writes(), vec![rust]);
        assert!(matches!(corpus.flush(), Err(Error::PersistenceFailure(_))));

        // In-memory state keeps serving queries.
        let engine = RetrievalEngine::new(
            Arc::clone(&corpus),
            Arc::new(HashingEmbedder::new(64)),
            RetrievalConfig::default(),
        );
        let results = engine.retrieve("rust", 3, &[]);
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.collection_id == rust));
        assert!(store.load_collections().unwrap().is_empty());

        store.set_fail_writes(false);
        let pasta = CollectionId::generate("pasta");
        corpus.insert_collection(pasta, "pasta", chunks_for(pasta, "pasta"), None);
        assert!(corpus.pending_writes().is_empty());

        let reopened = CorpusStore::open(store).unwrap();
        assert_eq!(reopened.collections().len(), 2);
        assert_eq!(reopened.chunks_of(rust).len(), corpus.chunks_of(rust).len());
    }

    #[test]
    fn flush_retries_a_failed_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(StoreDb::open(&tmp.path().join("store.redb")).unwrap());
        let corpus = CorpusStore::open(Arc::clone(&store)).unwrap();
        let id = CollectionId::generate("rust");
        corpus.insert_collection(id, "rust", chunks_for(id, "rust"), None);

        store.set_fail_writes(true);
        assert!(corpus.remove_collection(id).is_some());
        assert!(corpus.flush().is_err());
        assert_eq!(store.load_collections().unwrap().len(), 1);

        store.set_fail_writes(false);
        corpus.flush().unwrap();
        assert!(store.load_collections().unwrap().is_empty());
    }
}
