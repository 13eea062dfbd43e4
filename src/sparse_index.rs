//! Inverted keyword index: token -> chunk ids.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::{
    chunking::Chunk,
    ids::ChunkId,
    tokenizer::is_prefix_variant,
};

#[derive(Debug, Clone, Default)]
pub struct InvertedIndex {
    postings: HashMap<String, HashSet<ChunkId>>,
}

impl InvertedIndex {
    /// Index each chunk under its keywords and every content token.
    pub fn build<'a, I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = &'a Chunk>,
    {
        let mut postings: HashMap<String, HashSet<ChunkId>> = HashMap::new();
        for chunk in chunks {
            for token in chunk.token_set() {
                postings.entry(token).or_default().insert(chunk.id);
            }
        }
        Self { postings }
    }

    pub fn token_count(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// Chunks containing `token` exactly.
    pub fn lookup(&self, token: &str) -> Option<&HashSet<ChunkId>> {
        self.postings.get(token)
    }

    /// Chunk ids matching any query token.
    ///
    /// Exact matches are always included. Long query tokens additionally
    /// pull in postings of long indexed tokens that share a prefix with
    /// them in either direction, which catches plural and tense variants.
    /// That part is a linear scan over the vocabulary.
    pub fn candidates(
        &self,
        query_tokens: &BTreeSet<String>,
        prefix_min_chars: usize,
    ) -> HashSet<ChunkId> {
        let mut result = HashSet::new();

        for token in query_tokens {
            if let Some(ids) = self.postings.get(token) {
                result.extend(ids.iter().copied());
            }

            if token.chars().count() < prefix_min_chars {
                continue;
            }
            for (indexed, ids) in &self.postings {
                if indexed != token
                    && is_prefix_variant(token, indexed, prefix_min_chars)
                {
                    result.extend(ids.iter().copied());
                }
            }
        }

        result
    }
}
