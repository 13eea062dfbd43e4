//! Builds the final prompt for a turn from the user's question plus as much
//! remembered and retrieved context as fits a fixed character budget.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    ids::CollectionId, memory::MemoryStore, retrieval::RetrievalEngine,
};

const MEMORY_HEADER: &str = "Things you remember about the user:\n";
const DOCUMENT_HEADER: &str = "Excerpts from the user's documents:\n";
const CONTEXT_PREAMBLE: &str =
    "Supplementary context (optional; use it only if it is relevant):";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    /// Characters the context blocks may use in total.
    pub budget_chars: usize,
    pub memory_enabled: bool,
    pub max_memory_results: usize,
    pub documents_enabled: bool,
    pub max_document_results: usize,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            budget_chars: 1500,
            memory_enabled: true,
            max_memory_results: 5,
            documents_enabled: true,
            max_document_results: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub prompt: String,
    pub memory_count: usize,
    pub chunk_count: usize,
    /// Characters spent on context blocks, headers included. Never more
    /// than the budget.
    pub context_chars: usize,
}

/// A block of lines that only grows while the whole block fits.
struct Block {
    text: String,
    chars: usize,
    items: usize,
}

impl Block {
    fn new(header: &str) -> Self {
        Self {
            text: header.to_string(),
            chars: header.chars().count(),
            items: 0,
        }
    }

    /// Append `line` if the block stays within `budget`.
    fn try_push(&mut self, line: &str, budget: usize) -> bool {
        let len = line.chars().count();
        if self.chars + len > budget {
            return false;
        }
        self.text.push_str(line);
        self.chars += len;
        self.items += 1;
        true
    }
}

pub struct RagComposer {
    retrieval: Option<Arc<RetrievalEngine>>,
    memory: Option<Arc<MemoryStore>>,
    config: ComposerConfig,
}

impl RagComposer {
    pub fn new(config: ComposerConfig) -> Self {
        Self {
            retrieval: None,
            memory: None,
            config,
        }
    }

    pub fn with_retrieval(mut self, retrieval: Arc<RetrievalEngine>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Compose the prompt for `query`, searching documents in `scope`
    /// (empty means all collections).
    ///
    /// Memories go first. Documents get whatever budget is left; chunks
    /// are added whole, in rank order, until the next one would not fit.
    pub fn compose(
        &self,
        query: &str,
        scope: &[CollectionId],
    ) -> ComposedPrompt {
        let budget = self.config.budget_chars;
        let mut remaining = budget;
        let mut blocks: Vec<Block> = Vec::new();
        let mut memory_count = 0;
        let mut chunk_count = 0;

        if self.config.memory_enabled
            && let Some(memory) = &self.memory
        {
            let mut block = Block::new(MEMORY_HEADER);
            for hit in memory.retrieve(query, self.config.max_memory_results) {
                let line = format!("- {}\n", hit.entry.content);
                if !block.try_push(&line, remaining) {
                    break;
                }
            }
            if block.items > 0 {
                remaining -= block.chars;
                memory_count = block.items;
                blocks.push(block);
            }
        }

        if remaining > 0
            && self.config.documents_enabled
            && let Some(retrieval) = &self.retrieval
        {
            let mut block = Block::new(DOCUMENT_HEADER);
            let chunks = retrieval.retrieve(
                query,
                self.config.max_document_results,
                scope,
            );
            for chunk in chunks {
                let entry = format!(
                    "[{}] {}\n",
                    chunk.location_label,
                    chunk.content.trim()
                );
                if !block.try_push(&entry, remaining) {
                    break;
                }
            }
            if block.items > 0 {
                remaining -= block.chars;
                chunk_count = block.items;
                blocks.push(block);
            }
        }

        let context_chars = budget - remaining;
        debug!(
            memory_count,
            chunk_count,
            context_chars,
            budget,
            "composed prompt"
        );

        if blocks.is_empty() {
            return ComposedPrompt {
                prompt: query.to_string(),
                memory_count,
                chunk_count,
                context_chars,
            };
        }

        let mut prompt = String::with_capacity(query.len() + context_chars * 2);
        prompt.push_str(query);
        prompt.push_str("\n\n");
        prompt.push_str(CONTEXT_PREAMBLE);
        for block in &blocks {
            prompt.push_str("\n\n");
            prompt.push_str(block.text.trim_end());
        }

        ComposedPrompt {
            prompt,
            memory_count,
            chunk_count,
            context_chars,
        }
    }
}

impl std::fmt::Debug for RagComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagComposer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
