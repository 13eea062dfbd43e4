//! Flat embedding matrix with batched cosine scoring.
//!
//! The matrix is derived data: it is built from whatever chunks are in the
//! corpus when a snapshot is taken and is thrown away on the next mutation.

use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::{
    chunking::Chunk,
    embedding::normalize,
    error::{Error, Result},
};

/// Row-major matrix of unit vectors, one row per embedded chunk.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingMatrix {
    /// `data[row * dimension + col]`.
    data: Vec<f32>,
    dimension: usize,
    /// Maps each row back to the chunk it was built from.
    row_map: Vec<Arc<Chunk>>,
}

impl EmbeddingMatrix {
    /// Build a matrix from every chunk carrying a `dimension`-long vector.
    ///
    /// Vectors are re-normalized on the way in so a stale or hand-edited
    /// stored vector cannot skew the scores. Chunks with no embedding, a
    /// different dimension or an all-zero vector are left out.
    pub fn build<'a, I>(chunks: I, dimension: usize) -> Self
    where
        I: IntoIterator<Item = &'a Arc<Chunk>>,
    {
        let mut data = Vec::new();
        let mut row_map = Vec::new();

        for chunk in chunks {
            let Some(embedding) = chunk.embedding.as_ref() else {
                continue;
            };
            if embedding.len() != dimension || dimension == 0 {
                continue;
            }
            let mut row = embedding.clone();
            if !normalize(&mut row) {
                continue;
            }
            data.extend_from_slice(&row);
            row_map.push(Arc::clone(chunk));
        }

        Self {
            data,
            dimension,
            row_map,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn row_count(&self) -> usize {
        self.row_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_map.is_empty()
    }

    /// The chunk a row was built from.
    pub fn chunk(&self, row: usize) -> Option<&Arc<Chunk>> {
        self.row_map.get(row)
    }

    pub fn row(&self, row: usize) -> Option<&[f32]> {
        let start = row.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Build a reduced matrix holding only `rows`, in the given order.
    ///
    /// Out-of-range rows are ignored.
    pub fn sub_matrix(&self, rows: &[usize]) -> Self {
        let mut data = Vec::with_capacity(rows.len() * self.dimension);
        let mut row_map = Vec::with_capacity(rows.len());
        for &row in rows {
            if let (Some(values), Some(chunk)) =
                (self.row(row), self.row_map.get(row))
            {
                data.extend_from_slice(values);
                row_map.push(Arc::clone(chunk));
            }
        }
        Self {
            data,
            dimension: self.dimension,
            row_map,
        }
    }

    /// Score every row against a unit-length query in one matrix product.
    ///
    /// Both sides are unit vectors, so each entry is a cosine similarity.
    pub fn score(&self, query: &[f32]) -> Result<Vec<f32>> {
        if query.len() != self.dimension {
            return Err(Error::Config(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            )));
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let device = Device::Cpu;
        let matrix = Tensor::from_slice(
            &self.data,
            (self.row_count(), self.dimension),
            &device,
        )
        .map_err(map_candle_err)?;
        let query = Tensor::from_slice(query, (self.dimension, 1), &device)
            .map_err(map_candle_err)?;

        matrix
            .matmul(&query)
            .map_err(map_candle_err)?
            .flatten_all()
            .map_err(map_candle_err)?
            .to_vec1::<f32>()
            .map_err(map_candle_err)
    }
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::Config(format!("tensor computation error: {e}"))
}
