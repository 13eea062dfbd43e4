//! Long-term memory: a small capped log of facts about the user.
//!
//! Retrieval is a linear scan; the log never holds more than
//! [`MemoryConfig::capacity`] entries.

use std::{
    collections::{BTreeSet, VecDeque},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    embedding::{EmbeddingProvider, cosine_similarity},
    error::{Error, Result},
    ids::{MemoryId, unix_now},
    store_db::StoreDb,
    tokenizer::{
        PREFIX_MATCH_MIN_CHARS, extract_keywords, overlap_score, tokenize,
    },
};

const SECONDS_PER_DAY: f32 = 86_400.0;

/// Settings key recording which model embedded the stored memories.
pub const MEMORY_MODEL_SETTING: &str = "memory_embedding_model";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub capacity: usize,
    pub keyword_limit: usize,
    /// Minimum cosine similarity on the semantic path.
    pub similarity_threshold: f32,
    pub semantic_recency_weight: f32,
    /// Minimum normalized overlap on the keyword path.
    pub keyword_threshold: f32,
    pub keyword_recency_weight: f32,
    pub prefix_min_len: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            keyword_limit: 8,
            similarity_threshold: 0.3,
            semantic_recency_weight: 0.02,
            keyword_threshold: 0.25,
            keyword_recency_weight: 0.05,
            prefix_min_len: PREFIX_MATCH_MIN_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: MemoryId,
    pub content: String,
    pub keywords: BTreeSet<String>,
    /// Where the fact came from, e.g. "conversation" or "manual".
    pub source_label: String,
    pub created_at: u64,
    /// Insertion counter; orders entries created within the same second.
    pub sequence: u64,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub entry: Arc<MemoryEntry>,
    pub score: f32,
}

/// Recency bonus: `weight / log2(age_days + 1)` with age clamped to a day.
fn recency_bonus(weight: f32, created_at: u64, now: u64) -> f32 {
    let age_days =
        (now.saturating_sub(created_at) as f32 / SECONDS_PER_DAY).max(1.0);
    weight / (age_days + 1.0).log2()
}

/// Write-throughs that failed and wait for the next mutation.
#[derive(Debug, Default)]
struct PendingWrites {
    ids: BTreeSet<MemoryId>,
    /// A [`MemoryStore::clear`] has not reached the store yet.
    clear: bool,
}

impl PendingWrites {
    fn is_empty(&self) -> bool {
        !self.clear && self.ids.is_empty()
    }
}

pub struct MemoryStore {
    /// Oldest first.
    entries: RwLock<VecDeque<Arc<MemoryEntry>>>,
    provider: RwLock<Arc<dyn EmbeddingProvider>>,
    config: MemoryConfig,
    store: Option<Arc<StoreDb>>,
    pending: Mutex<PendingWrites>,
}

impl MemoryStore {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            provider: RwLock::new(provider),
            config,
            store: None,
            pending: Mutex::new(PendingWrites::default()),
        }
    }

    /// Load persisted memories from `store` and write through to it.
    ///
    /// If the store holds more than `capacity` entries the oldest are
    /// dropped.
    pub fn open(
        store: Arc<StoreDb>,
        provider: Arc<dyn EmbeddingProvider>,
        config: MemoryConfig,
    ) -> Result<Self> {
        let mut loaded: VecDeque<Arc<MemoryEntry>> =
            store.load_memories()?.into_iter().map(Arc::new).collect();

        let mut evicted = Vec::new();
        while loaded.len() > config.capacity {
            if let Some(old) = loaded.pop_front() {
                evicted.push(old.id);
            }
        }
        if !evicted.is_empty() {
            store.remove_memories(&evicted)?;
        }
        if provider.is_available()
            && store.get_setting(MEMORY_MODEL_SETTING)?.is_none()
        {
            store.set_setting(
                MEMORY_MODEL_SETTING,
                provider.model_identifier(),
            )?;
        }

        debug!(entries = loaded.len(), "loaded memories");

        Ok(Self {
            entries: RwLock::new(loaded),
            store: Some(store),
            ..Self::new(provider, config)
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, id: MemoryId) -> Option<Arc<MemoryEntry>> {
        self.read().iter().find(|e| e.id == id).cloned()
    }

    /// All entries, most recent first.
    pub fn list(&self) -> Vec<Arc<MemoryEntry>> {
        self.read().iter().rev().cloned().collect()
    }

    /// Remember `content`. Returns the id of the new entry, or of the
    /// existing entry with identical content.
    pub fn insert(
        &self,
        content: &str,
        source_label: &str,
    ) -> Result<MemoryId> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::EmptyMemory);
        }

        let id = MemoryId::for_content(content);
        if self.get(id).is_some() {
            debug!(memory = %id, "memory already known");
            return Ok(id);
        }

        let embedding = self.provider().try_embed(content).ok();

        self.retry_pending();

        let (entry, evicted) = {
            let mut entries = self.write();
            // Another writer may have inserted it while we were embedding.
            if entries.iter().any(|e| e.id == id) {
                return Ok(id);
            }
            let sequence =
                entries.back().map(|e| e.sequence + 1).unwrap_or(0);
            let entry = Arc::new(MemoryEntry {
                id,
                content: content.to_string(),
                keywords: extract_keywords(content, self.config.keyword_limit)
                    .into_iter()
                    .collect(),
                source_label: source_label.to_string(),
                created_at: unix_now(),
                sequence,
                embedding,
            });
            entries.push_back(Arc::clone(&entry));

            let mut evicted = Vec::new();
            while entries.len() > self.config.capacity {
                if let Some(old) = entries.pop_front() {
                    evicted.push(old.id);
                }
            }
            (entry, evicted)
        };

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted oldest memories");
        }
        let touched = std::iter::once(id).chain(evicted.iter().copied());
        self.persist(touched, |store| {
            store.put_memory(&entry)?;
            store.remove_memories(&evicted)
        });
        Ok(id)
    }

    /// Forget one entry. Returns `false` if it did not exist.
    pub fn remove(&self, id: MemoryId) -> bool {
        self.retry_pending();
        let removed = {
            let mut entries = self.write();
            let before = entries.len();
            entries.retain(|e| e.id != id);
            entries.len() != before
        };
        if removed {
            self.persist([id], |store| store.remove_memories(&[id]));
        }
        removed
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.write().clear();
        let Some(store) = &self.store else {
            return;
        };
        *self.lock_pending() = PendingWrites::default();
        if let Err(e) = store.clear_memories() {
            warn!(error = %e, "clearing persisted memories failed, will retry");
            self.lock_pending().clear = true;
        }
    }

    /// True when some entry lacks a vector from the current provider, or
    /// the persisted vectors were produced by another model.
    pub fn needs_reembed(&self) -> bool {
        let provider = self.provider();
        if !provider.is_available() {
            return false;
        }
        let dimension = provider.dimension();
        let missing = self.read().iter().any(|e| {
            e.embedding.as_ref().is_none_or(|v| v.len() != dimension)
        });
        let stamp = match &self.store {
            Some(store) => store.get_setting(MEMORY_MODEL_SETTING).ok().flatten(),
            None => None,
        };
        let stale = stamp.is_some_and(|m| m != provider.model_identifier());
        missing || stale
    }

    /// Switch to `provider` and recompute every embedding with it.
    /// Returns the number of entries that received a vector.
    pub fn reembed(&self, provider: Arc<dyn EmbeddingProvider>) -> usize {
        *self.provider.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::clone(&provider);
        if !provider.is_available() {
            return 0;
        }

        let snapshot: Vec<Arc<MemoryEntry>> =
            self.read().iter().cloned().collect();
        let refreshed: Vec<MemoryEntry> = snapshot
            .iter()
            .map(|e| MemoryEntry {
                embedding: provider.embed(&e.content),
                ..MemoryEntry::clone(e)
            })
            .collect();
        let embedded =
            refreshed.iter().filter(|e| e.embedding.is_some()).count();

        {
            let mut entries = self.write();
            for slot in entries.iter_mut() {
                if let Some(new) = refreshed.iter().find(|r| r.id == slot.id) {
                    *slot = Arc::new(new.clone());
                }
            }
        }

        let model = provider.model_identifier().to_string();
        let ids: Vec<MemoryId> = refreshed.iter().map(|e| e.id).collect();
        self.persist(ids, |store| {
            store.put_memories(&refreshed.iter().collect::<Vec<_>>())?;
            store.set_setting(MEMORY_MODEL_SETTING, &model)
        });
        info!(embedded, model = %model, "re-embedded memories");
        embedded
    }

    /// The `limit` most relevant memories for `query`, best first.
    pub fn retrieve(&self, query: &str, limit: usize) -> Vec<ScoredMemory> {
        self.retrieve_at(query, limit, unix_now())
    }

    /// [`retrieve`](Self::retrieve) with an explicit clock.
    ///
    /// Entries with an embedding are scored by cosine similarity when a
    /// query vector is available; all others by keyword overlap. The
    /// threshold applies to the raw similarity, the recency bonus is added
    /// afterwards.
    pub fn retrieve_at(
        &self,
        query: &str,
        limit: usize,
        now: u64,
    ) -> Vec<ScoredMemory> {
        if limit == 0 {
            return Vec::new();
        }

        let query_vector = self.provider().try_embed(query).ok();
        let query_tokens = tokenize(query);
        let config = &self.config;

        let mut scored: Vec<ScoredMemory> = self
            .read()
            .iter()
            .filter_map(|entry| {
                let semantic = query_vector
                    .as_deref()
                    .zip(entry.embedding.as_deref())
                    .filter(|(q, e)| q.len() == e.len());

                let score = match semantic {
                    Some((q, e)) => {
                        let similarity = cosine_similarity(q, e);
                        (similarity >= config.similarity_threshold).then(|| {
                            similarity
                                + recency_bonus(
                                    config.semantic_recency_weight,
                                    entry.created_at,
                                    now,
                                )
                        })
                    }
                    None => {
                        let mut target = tokenize(&entry.content);
                        target.extend(entry.keywords.iter().cloned());
                        let overlap = overlap_score(
                            &query_tokens,
                            &target,
                            config.prefix_min_len,
                        );
                        (overlap > 0.0 && overlap >= config.keyword_threshold)
                            .then(|| {
                                overlap
                                    + recency_bonus(
                                        config.keyword_recency_weight,
                                        entry.created_at,
                                        now,
                                    )
                            })
                    }
                }?;

                Some(ScoredMemory {
                    entry: Arc::clone(entry),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.entry.sequence.cmp(&a.entry.sequence))
        });
        scored.truncate(limit);
        scored
    }

    /// True while some write-through is still waiting to be retried.
    pub fn has_pending_writes(&self) -> bool {
        !self.lock_pending().is_empty()
    }

    /// Retry every write-through that failed earlier.
    pub fn retry_pending(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let pending = std::mem::take(&mut *self.lock_pending());
        if pending.is_empty() {
            return;
        }

        let result = if pending.clear {
            // Wipe the store, then write the whole log back.
            let entries: Vec<Arc<MemoryEntry>> =
                self.read().iter().cloned().collect();
            let refs: Vec<&MemoryEntry> =
                entries.iter().map(|e| e.as_ref()).collect();
            store.clear_memories().and_then(|()| store.put_memories(&refs))
        } else {
            let (present, gone): (Vec<MemoryId>, Vec<MemoryId>) = pending
                .ids
                .iter()
                .copied()
                .partition(|id| self.get(*id).is_some());
            let entries: Vec<Arc<MemoryEntry>> =
                present.iter().filter_map(|id| self.get(*id)).collect();
            let refs: Vec<&MemoryEntry> =
                entries.iter().map(|e| e.as_ref()).collect();
            store
                .put_memories(&refs)
                .and_then(|()| store.remove_memories(&gone))
        };

        match result {
            Ok(()) => debug!(
                count = pending.ids.len(),
                clear = pending.clear,
                "flushed pending memory writes"
            ),
            Err(e) => {
                warn!(error = %e, count = pending.ids.len(), "memory retry failed");
                let mut current = self.lock_pending();
                current.ids.extend(pending.ids);
                current.clear |= pending.clear;
            }
        }
    }

    /// Retry failed writes now and report any that still did not land.
    pub fn flush(&self) -> Result<()> {
        self.retry_pending();
        let pending = self.lock_pending();
        if pending.is_empty() {
            return Ok(());
        }
        Err(Error::PersistenceFailure(format!(
            "{} memory writes pending{}",
            pending.ids.len(),
            if pending.clear { " after a failed clear" } else { "" }
        )))
    }

    /// Run `write` against the store; on failure remember `ids` so the
    /// next mutation retries them.
    fn persist<I, F>(&self, ids: I, write: F)
    where
        I: IntoIterator<Item = MemoryId>,
        F: FnOnce(&StoreDb) -> Result<()>,
    {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = write(store) {
            warn!(error = %e, "persisting memories failed, will retry");
            self.lock_pending().ids.extend(ids);
        }
    }

    fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        let guard = self.provider.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    fn read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, VecDeque<Arc<MemoryEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, VecDeque<Arc<MemoryEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingWrites> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    const DAY: u64 = 86_400;

    struct Offline;

    impl EmbeddingProvider for Offline {
        fn is_available(&self) -> bool {
            false
        }

        fn dimension(&self) -> usize {
            4
        }

        fn model_identifier(&self) -> &str {
            "offline"
        }

        fn embed(&self, _text: &str) -> Option<Vec<f32>> {
            None
        }
    }

    fn hashing_store() -> MemoryStore {
        MemoryStore::new(
            Arc::new(HashingEmbedder::new(512)),
            MemoryConfig::default(),
        )
    }

    fn offline_store() -> MemoryStore {
        MemoryStore::new(Arc::new(Offline), MemoryConfig::default())
    }

    #[test]
    fn recency_bonus_is_bounded_by_weight() {
        let now = 100 * DAY;
        assert!((recency_bonus(0.02, now, now) - 0.02).abs() < 1e-6);
        assert!((recency_bonus(0.02, now - DAY, now) - 0.02).abs() < 1e-6);
        let old = recency_bonus(0.02, 0, now);
        assert!(old > 0.0 && old < 0.02);
    }

    #[test]
    fn insert_trims_and_rejects_empty() {
        let store = offline_store();
        assert!(matches!(
            store.insert("   ", "manual"),
            Err(Error::EmptyMemory)
        ));

        let id = store.insert("  likes green tea \n", "manual").unwrap();
        assert_eq!(store.get(id).unwrap().content, "likes green tea");
    }

    #[test]
    fn duplicate_content_returns_existing_id() {
        let store = offline_store();
        let a = store.insert("works on a rust compiler", "manual").unwrap();
        let b = store.insert("works on a rust compiler", "other").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(a).unwrap().source_label, "manual");
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = offline_store();
        for i in 0..105 {
            store.insert(&format!("fact number {i}"), "test").unwrap();
        }

        let list = store.list();
        assert_eq!(list.len(), 100);
        assert_eq!(list[0].content, "fact number 104");
        assert_eq!(list[99].content, "fact number 5");
        for i in 0..5 {
            let id = MemoryId::for_content(&format!("fact number {i}"));
            assert!(store.get(id).is_none());
        }
    }

    #[test]
    fn remove_and_clear() {
        let store = offline_store();
        let a = store.insert("owns a bicycle", "manual").unwrap();
        store.insert("speaks portuguese", "manual").unwrap();

        assert!(store.remove(a));
        assert!(!store.remove(a));
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn keyword_path_scores_overlap_plus_recency() {
        let store = offline_store();
        store.insert("favorite language is rust", "manual").unwrap();
        store.insert("allergic to peanuts", "manual").unwrap();
        let created = store.list()[0].created_at;

        let results = store.retrieve_at("which language", 5, created);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.content, "favorite language is rust");
        // "which" is filtered, "language" matches: overlap 1.0 + 0.05.
        assert!((results[0].score - 1.05).abs() < 1e-5);
    }

    #[test]
    fn keyword_threshold_applies_before_bonus() {
        let store = offline_store();
        store.insert("enjoys hiking", "manual").unwrap();
        let created = store.list()[0].created_at;

        // One of five query tokens matches: 0.2 < 0.25 even with bonus.
        let results = store.retrieve_at(
            "hiking swimming running cycling rowing",
            5,
            created,
        );
        assert!(results.is_empty());
    }

    #[test]
    fn semantic_path_ranks_by_similarity() {
        let store = hashing_store();
        let pasta = store
            .insert("favorite food is pasta with basil", "manual")
            .unwrap();
        store.insert("drives an electric car", "manual").unwrap();
        let now = store.list()[0].created_at;

        let results = store.retrieve_at("pasta basil", 5, now);
        assert!(!results.is_empty());
        assert_eq!(results[0].entry.id, pasta);
        assert!(results.iter().all(|r| r.score >= 0.3));
    }

    #[test]
    fn newer_entries_win_ties() {
        let store = offline_store();
        store.insert("tea in the morning", "manual").unwrap();
        store.insert("tea in the evening", "manual").unwrap();
        let now = store.list()[0].created_at;

        let results = store.retrieve_at("tea", 2, now);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].entry.content, "tea in the evening");
    }

    #[test]
    fn reembed_switches_provider() {
        let store = offline_store();
        store.insert("collects vinyl records", "manual").unwrap();
        assert!(store.list()[0].embedding.is_none());

        let embedded = store.reembed(Arc::new(HashingEmbedder::new(64)));
        assert_eq!(embedded, 1);
        assert_eq!(store.list()[0].embedding.as_ref().unwrap().len(), 64);
        assert!(!store.needs_reembed());
    }

    #[test]
    fn persisted_memories_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let db =
            Arc::new(StoreDb::open(&tmp.path().join("store.redb")).unwrap());
        let provider: Arc<dyn EmbeddingProvider> =
            Arc::new(HashingEmbedder::new(32));
        {
            let store = MemoryStore::open(
                Arc::clone(&db),
                Arc::clone(&provider),
                MemoryConfig::default(),
            )
            .unwrap();
            store.insert("first fact", "manual").unwrap();
            let gone = store.insert("second fact", "manual").unwrap();
            store.insert("third fact", "manual").unwrap();
            store.remove(gone);
        }

        let store =
            MemoryStore::open(db, provider, MemoryConfig::default()).unwrap();
        let contents: Vec<String> =
            store.list().iter().map(|e| e.content.clone()).collect();
        assert_eq!(contents, vec!["third fact", "first fact"]);
        assert!(store.list().iter().all(|e| e.embedding.is_some()));
    }

    #[test]
    fn reopen_trims_to_capacity() {
        let tmp = tempfile::tempdir().unwrap();
        let db =
            Arc::new(StoreDb::open(&tmp.path().join("store.redb")).unwrap());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(Offline);
        {
            let store = MemoryStore::open(
                Arc::clone(&db),
                Arc::clone(&provider),
                MemoryConfig::default(),
            )
            .unwrap();
            for i in 0..10 {
                store.insert(&format!("fact {i}"), "test").unwrap();
            }
        }

        let config = MemoryConfig {
            capacity: 4,
            ..MemoryConfig::default()
        };
        let store = MemoryStore::open(db, provider, config).unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(store.list()[0].content, "fact 9");
    }

    fn persisted_offline_store() -> (tempfile::TempDir, Arc<StoreDb>, MemoryStore) {
        let tmp = tempfile::tempdir().unwrap();
        let db =
            Arc::new(StoreDb::open(&tmp.path().join("store.redb")).unwrap());
        let store = MemoryStore::open(
            Arc::clone(&db),
            Arc::new(Offline),
            MemoryConfig::default(),
        )
        .unwrap();
        (tmp, db, store)
    }

    fn persisted_contents(db: Arc<StoreDb>) -> Vec<String> {
        MemoryStore::open(db, Arc::new(Offline), MemoryConfig::default())
            .unwrap()
            .list()
            .iter()
            .map(|e| e.content.clone())
            .collect()
    }

    #[test]
    fn failed_write_is_retried_by_next_insert() {
        let (_tmp, db, store) = persisted_offline_store();

        db.set_fail_writes(true);
        store.insert("favorite language is rust", "manual").unwrap();
        assert!(store.has_pending_writes());
        assert!(matches!(store.flush(), Err(Error::PersistenceFailure(_))));

        // The log stays usable while the store is failing.
        let results = store.retrieve("which language", 5);
        assert_eq!(results.len(), 1);
        assert!(persisted_contents(Arc::clone(&db)).is_empty());

        db.set_fail_writes(false);
        store.insert("allergic to peanuts", "manual").unwrap();
        assert!(!store.has_pending_writes());
        assert_eq!(
            persisted_contents(db),
            vec!["allergic to peanuts", "favorite language is rust"]
        );
    }

    #[test]
    fn failed_clear_is_retried_by_next_mutation() {
        let (_tmp, db, store) = persisted_offline_store();
        store.insert("owns a bicycle", "manual").unwrap();
        store.insert("speaks portuguese", "manual").unwrap();

        db.set_fail_writes(true);
        store.clear();
        assert!(store.is_empty());
        assert!(store.has_pending_writes());
        assert_eq!(persisted_contents(Arc::clone(&db)).len(), 2);

        db.set_fail_writes(false);
        store.insert("plays chess", "manual").unwrap();
        assert!(!store.has_pending_writes());
        assert_eq!(persisted_contents(db), vec!["plays chess"]);
    }

    #[test]
    fn flush_retries_a_failed_remove() {
        let (_tmp, db, store) = persisted_offline_store();
        let id = store.insert("owns a bicycle", "manual").unwrap();

        db.set_fail_writes(true);
        assert!(store.remove(id));
        assert!(store.flush().is_err());

        db.set_fail_writes(false);
        store.flush().unwrap();
        assert!(persisted_contents(db).is_empty());
    }
}
