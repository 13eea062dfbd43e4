use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use rayon::prelude::*;

use crate::{
    chunking::Chunk,
    error::{Error, Result},
    tokenizer::tokenize,
};

/// Source of dense sentence embeddings.
///
/// Implementations return unit-length vectors of [`dimension`] floats, or
/// `None` when the text cannot be embedded (model missing, empty input).
/// Callers treat an unavailable provider as "use keyword search instead".
///
/// [`dimension`]: EmbeddingProvider::dimension
pub trait EmbeddingProvider: Send + Sync {
    fn is_available(&self) -> bool;

    fn dimension(&self) -> usize;

    /// Identifies the model that produced stored vectors. Collections
    /// stamped with a different identifier need re-embedding.
    fn model_identifier(&self) -> &str;

    fn embed(&self, text: &str) -> Option<Vec<f32>>;

    /// Like [`embed`](Self::embed), but reports an offline provider or an
    /// unembeddable text as [`Error::EmbeddingUnavailable`].
    fn try_embed(&self, text: &str) -> Result<Vec<f32>> {
        if !self.is_available() {
            return Err(Error::EmbeddingUnavailable);
        }
        self.embed(text).ok_or(Error::EmbeddingUnavailable)
    }
}

/// Scale `v` to unit length in place. Returns `false` for a zero vector.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 for empty, zero-length or mismatched inputs.
///
/// # Examples
///
/// ```
/// use ragweave::embedding::cosine_similarity;
///
/// let v = [0.6, 0.8];
/// assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
/// assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom <= f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Encode a vector as a little-endian f32 blob (`dimension * 4` bytes).
pub fn to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Decode a blob written by [`to_blob`].
///
/// Returns `None` when the length is not a whole number of floats.
pub fn from_blob(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    // Blobs read from the store are not guaranteed to be 4-byte aligned.
    match bytemuck::try_cast_slice::<u8, f32>(bytes) {
        Ok(floats) if cfg!(target_endian = "little") => Some(floats.to_vec()),
        _ => Some(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ),
    }
}

/// Compute embeddings for a batch of chunks in parallel.
///
/// Chunks the provider cannot embed keep `embedding = None`. Returns the
/// number of chunks that received a vector.
pub fn embed_chunks(
    provider: &dyn EmbeddingProvider,
    chunks: &mut [Chunk],
) -> usize {
    if !provider.is_available() {
        return 0;
    }

    chunks
        .par_iter_mut()
        .map(|chunk| {
            chunk.embedding = provider.embed(&chunk.content);
            usize::from(chunk.embedding.is_some())
        })
        .sum()
}

/// Default dimension of [`HashingEmbedder`].
pub const HASHING_DIMENSION: usize = 256;

/// Deterministic bag-of-words embedder using the hashing trick.
///
/// Each token is hashed into one of `dimension` buckets with a sign bit;
/// the mean of those one-hot vectors is L2-normalized. It needs no model
/// files, so it backs the CLI and keeps tests reproducible.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    identifier: String,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(HASHING_DIMENSION)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            identifier: format!("hashing-bow-{dimension}"),
        }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let h = hasher.finish();
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        ((h % self.dimension as u64) as usize, sign)
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn is_available(&self) -> bool {
        true
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_identifier(&self) -> &str {
        &self.identifier
    }

    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return None;
        }

        let mut vector = vec![0.0f32; self.dimension];
        for token in &tokens {
            let (idx, sign) = self.bucket(token);
            vector[idx] += sign;
        }
        let count = tokens.len() as f32;
        for x in vector.iter_mut() {
            *x /= count;
        }

        normalize(&mut vector).then_some(vector)
    }
}
