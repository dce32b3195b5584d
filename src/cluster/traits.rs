//! Clustering traits.

use crate::error::Result;

/// One pass of grouping items by their embeddings.
///
/// Returns groups of input indices. Groups may overlap (soft clustering) and
/// need not be sorted; callers normalize them. The recursive size control in
/// [`Clusterer`](super::Clusterer) only talks to this trait, so tests can
/// swap in deterministic stand-ins.
pub trait Clustering {
    /// Group `embeddings` (one vector per item).
    fn cluster(&self, embeddings: &[Vec<f32>]) -> Result<Vec<Vec<usize>>>;
}

impl<F> Clustering for F
where
    F: Fn(&[Vec<f32>]) -> Result<Vec<Vec<usize>>>,
{
    fn cluster(&self, embeddings: &[Vec<f32>]) -> Result<Vec<Vec<usize>>> {
        self(embeddings)
    }
}
