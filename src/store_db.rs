use std::{collections::HashMap, path::Path};

use redb::{
    Database, ReadableDatabase, ReadableTable, TableDefinition,
    WriteTransaction,
};

use crate::{
    chunking::Chunk,
    corpus::Collection,
    embedding::{from_blob, to_blob},
    error::Result,
    ids::{CollectionId, MemoryId},
    memory::MemoryEntry,
};

const COLLECTIONS: TableDefinition<u64, &str> =
    TableDefinition::new("collections");
/// Keyed by `(collection id, chunk id)` so a collection is one key range.
const CHUNKS: TableDefinition<(u64, u64), &str> =
    TableDefinition::new("chunks");
const EMBEDDINGS: TableDefinition<(u64, u64), &[u8]> =
    TableDefinition::new("embeddings");
const MEMORIES: TableDefinition<u64, &str> = TableDefinition::new("memories");
const MEMORY_EMBEDDINGS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("memory_embeddings");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Durable home of collections, chunks, memories and their embeddings.
///
/// Records are JSON; embeddings live in side tables as little-endian f32
/// blobs so that re-embedding never rewrites chunk text.
pub struct StoreDb {
    db: Database,
    /// Makes every write fail, to exercise the retry paths of callers.
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl StoreDb {
    /// Open or create a store at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use ragweave::StoreDb;
    ///
    /// let store = StoreDb::open(&tmp.path().join("store.redb")).unwrap();
    /// assert!(store.load_collections().unwrap().is_empty());
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(COLLECTIONS)?;
        txn.open_table(CHUNKS)?;
        txn.open_table(EMBEDDINGS)?;
        txn.open_table(MEMORIES)?;
        txn.open_table(MEMORY_EMBEDDINGS)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self {
            db,
            #[cfg(test)]
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn begin_write(&self) -> Result<WriteTransaction> {
        #[cfg(test)]
        if self.fail_writes.load(std::sync::atomic::Ordering::Acquire) {
            return Err(crate::error::Error::PersistenceFailure(
                "writes disabled".into(),
            ));
        }
        Ok(self.db.begin_write()?)
    }

    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::Release);
    }

    // -- Collections --

    /// Write a collection record together with its full chunk list,
    /// replacing whatever was stored for that collection before.
    pub fn replace_collection(
        &self,
        collection: &Collection,
        chunks: &[&Chunk],
    ) -> Result<()> {
        let cid = collection.id.raw();
        let json = serde_json::to_string(collection)?;

        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(COLLECTIONS)?;
            table.insert(cid, json.as_str())?;
        }
        clear_collection_rows(&txn, cid)?;
        {
            let mut chunk_table = txn.open_table(CHUNKS)?;
            let mut embedding_table = txn.open_table(EMBEDDINGS)?;
            for chunk in chunks {
                let key = (cid, chunk.id.raw());
                let json = serde_json::to_string(chunk)?;
                chunk_table.insert(key, json.as_str())?;
                if let Some(embedding) = &chunk.embedding {
                    embedding_table.insert(key, to_blob(embedding).as_slice())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove a collection and every chunk and embedding it owns.
    pub fn remove_collection(&self, id: CollectionId) -> Result<bool> {
        let txn = self.begin_write()?;
        let removed = {
            let mut table = txn.open_table(COLLECTIONS)?;
            table.remove(id.raw())?.is_some()
        };
        clear_collection_rows(&txn, id.raw())?;
        txn.commit()?;
        Ok(removed)
    }

    pub fn load_collections(&self) -> Result<Vec<Collection>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(COLLECTIONS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_str(v.value())?);
        }
        Ok(result)
    }

    /// Load every chunk with its stored embedding attached.
    ///
    /// Embedding blobs that do not decode are dropped; the chunk then
    /// simply has no vector until it is re-embedded.
    pub fn load_chunks(&self) -> Result<Vec<Chunk>> {
        let txn = self.db.begin_read()?;
        let chunk_table = txn.open_table(CHUNKS)?;
        let embedding_table = txn.open_table(EMBEDDINGS)?;

        let mut result = Vec::new();
        for entry in chunk_table.iter()? {
            let (k, v) = entry?;
            let mut chunk: Chunk = serde_json::from_str(v.value())?;
            chunk.embedding = embedding_table
                .get(k.value())?
                .and_then(|blob| from_blob(blob.value()))
                .filter(|v| !v.is_empty());
            result.push(chunk);
        }
        Ok(result)
    }

    // -- Memories --

    pub fn put_memory(&self, entry: &MemoryEntry) -> Result<()> {
        self.put_memories(&[entry])
    }

    /// Write several memory entries in a single transaction.
    pub fn put_memories(&self, entries: &[&MemoryEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(MEMORIES)?;
            let mut embeddings = txn.open_table(MEMORY_EMBEDDINGS)?;
            for entry in entries {
                let key = entry.id.raw();
                let json = serde_json::to_string(entry)?;
                table.insert(key, json.as_str())?;
                match &entry.embedding {
                    Some(v) => {
                        embeddings.insert(key, to_blob(v).as_slice())?;
                    }
                    None => {
                        embeddings.remove(key)?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove multiple memories in a single transaction.
    pub fn remove_memories(&self, ids: &[MemoryId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(MEMORIES)?;
            let mut embeddings = txn.open_table(MEMORY_EMBEDDINGS)?;
            for id in ids {
                table.remove(id.raw())?;
                embeddings.remove(id.raw())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn clear_memories(&self) -> Result<()> {
        let txn = self.begin_write()?;
        txn.delete_table(MEMORIES)?;
        txn.delete_table(MEMORY_EMBEDDINGS)?;
        txn.open_table(MEMORIES)?;
        txn.open_table(MEMORY_EMBEDDINGS)?;
        txn.commit()?;
        Ok(())
    }

    /// Load all memories, oldest first.
    pub fn load_memories(&self) -> Result<Vec<MemoryEntry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(MEMORIES)?;
        let embeddings = txn.open_table(MEMORY_EMBEDDINGS)?;

        let mut blobs: HashMap<u64, Vec<f32>> = HashMap::new();
        for entry in embeddings.iter()? {
            let (k, v) = entry?;
            if let Some(vector) = from_blob(v.value()) {
                blobs.insert(k.value(), vector);
            }
        }

        let mut result: Vec<MemoryEntry> = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let mut memory: MemoryEntry = serde_json::from_str(v.value())?;
            memory.embedding = blobs.remove(&k.value());
            result.push(memory);
        }
        result.sort_by_key(|m| (m.created_at, m.sequence));
        Ok(result)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }
}

/// Drop all chunk and embedding rows of one collection.
fn clear_collection_rows(
    txn: &redb::WriteTransaction,
    cid: u64,
) -> Result<()> {
    let range = (cid, 0)..=(cid, u64::MAX);

    let mut chunks = txn.open_table(CHUNKS)?;
    let keys = chunks
        .range(range.clone())?
        .map(|entry| entry.map(|(k, _)| k.value()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for key in &keys {
        chunks.remove(*key)?;
    }

    let mut embeddings = txn.open_table(EMBEDDINGS)?;
    let keys = embeddings
        .range(range)?
        .map(|entry| entry.map(|(k, _)| k.value()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for key in &keys {
        embeddings.remove(*key)?;
    }
    Ok(())
}

impl std::fmt::Debug for StoreDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreDb").finish_non_exhaustive()
    }
}
