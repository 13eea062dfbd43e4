//! ragweave - a local retrieval and context-budget engine for on-device
//! assistants.
//!
//! ragweave turns documents and remembered facts into keyword-tagged,
//! embedded chunks, retrieves the most relevant ones for a query with a
//! hybrid dense/sparse engine, and decides how much of a bounded prompt
//! window goes to conversation history versus retrieved context.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ragweave::{
//!     CorpusStore, DataDir, EmbeddingProvider, EngineConfig,
//!     HashingEmbedder, MemoryStore, RagComposer, RetrievalEngine, StoreDb,
//! };
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = EngineConfig::load(&data_dir.config_file()).unwrap();
//! let store = Arc::new(StoreDb::open(&data_dir.store_db()).unwrap());
//! let provider: Arc<dyn EmbeddingProvider> =
//!     Arc::new(HashingEmbedder::default());
//!
//! let corpus = Arc::new(CorpusStore::open(Arc::clone(&store)).unwrap());
//! let memory = Arc::new(
//!     MemoryStore::open(store, Arc::clone(&provider), config.memory).unwrap(),
//! );
//! let retrieval =
//!     Arc::new(RetrievalEngine::new(corpus, provider, config.retrieval));
//!
//! let composer = RagComposer::new(config.composer)
//!     .with_retrieval(retrieval)
//!     .with_memory(memory);
//! let composed = composer.compose("how do I feed a sourdough starter?", &[]);
//! println!("{}", composed.prompt);
//! ```

pub mod chunking;
pub mod composer;
pub mod config;
pub mod corpus;
pub mod data_dir;
pub mod dense_index;
pub mod embedding;
pub mod error;
pub mod ids;
pub mod ingestion;
pub mod memory;
pub mod retrieval;
pub mod session;
pub mod sparse_index;
pub mod store_db;
pub mod tokenizer;
pub mod topk;

pub use chunking::{Chunk, ChunkingConfig, Section};
pub use composer::{ComposedPrompt, ComposerConfig, RagComposer};
pub use config::EngineConfig;
pub use corpus::{Collection, CorpusStore, IndexSnapshot};
pub use data_dir::DataDir;
pub use embedding::{EmbeddingProvider, HashingEmbedder};
pub use error::{Error, Result};
pub use ids::{ChunkId, CollectionId, MemoryId};
pub use ingestion::{DocumentExtractor, DocumentSource, IngestionQueue};
pub use memory::{MemoryConfig, MemoryEntry, MemoryStore};
pub use retrieval::{RetrievalConfig, RetrievalEngine};
pub use session::{
    CompletionService,
    ContextConfig,
    Conversation,
    SessionContextState,
};
pub use store_db::StoreDb;
