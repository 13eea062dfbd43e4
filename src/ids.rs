use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

static COLLECTION_NONCE: AtomicU64 = AtomicU64::new(0);

fn short_hex(value: u64, len: usize) -> String {
    let full = format!("{value:016x}");
    full[..len.clamp(1, 16)].to_string()
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw key, e.g. one read back from the store.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The numeric key used in redb tables.
            pub const fn raw(self) -> u64 {
                self.0
            }

            /// Short hex form for display (e.g. "a1b2c3").
            pub fn short(self) -> String {
                short_hex(self.0, 6)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "#{}", self.short())
            }
        }
    };
}

id_type!(
    /// Identifies a collection (one ingested document or domain grouping).
    CollectionId
);
id_type!(
    /// Identifies a chunk. Stable for a given (collection, sequence index).
    ChunkId
);
id_type!(
    /// Identifies a memory entry. Derived from the exact content.
    MemoryId
);

impl CollectionId {
    /// Generate a fresh id for a new collection.
    ///
    /// Two collections with the same name get different ids.
    pub fn generate(name: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let nonce = COLLECTION_NONCE.fetch_add(1, Ordering::Relaxed);

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        nanos.hash(&mut hasher);
        nonce.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl ChunkId {
    pub fn derive(collection: CollectionId, sequence_index: usize) -> Self {
        let mut hasher = DefaultHasher::new();
        collection.0.hash(&mut hasher);
        sequence_index.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl MemoryId {
    pub fn for_content(content: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// Current wall-clock time as seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
