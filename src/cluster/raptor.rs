//! Two-stage soft clustering.
//!
//! ```text
//!            all items
//!                │  Isomap (√(N-1) neighbors) → GMM, BIC over k
//!      ┌─────────┼─────────┐
//!   global 0  global 1  global 2          (items may sit in several)
//!      │         │         │  Isomap (local neighbors) → GMM, BIC over k
//!    ┌─┴─┐       │       ┌─┴─┐
//!    0   1       2       3   4            final ids: one running counter
//! ```
//!
//! A global cluster no larger than `dim + 1` is taken whole: there is not
//! enough of it to fit a mixture in `dim` dimensions.

use std::collections::BTreeMap;

use ndarray::Array2;
use tracing::debug;

use super::gmm::{select_by_bic, Gmm};
use super::projection::Isomap;
use super::traits::Clustering;
use crate::config::ClusteringConfig;
use crate::error::Result;

/// Global-then-local GMM clustering over an Isomap projection.
#[derive(Debug, Clone)]
pub struct RaptorClustering {
    config: ClusteringConfig,
}

impl RaptorClustering {
    /// Create from clustering parameters. Fails if `config` is invalid.
    pub fn new(config: ClusteringConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Parameters in use.
    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    fn mixture_template(&self) -> Gmm {
        Gmm::new()
            .with_max_iter(self.config.max_em_iter)
            .with_tol(self.config.em_tol)
            .with_seed(self.config.seed)
            .with_covariance_floor(self.config.covariance_floor)
    }

    /// Project, sweep k, and return the items of each component (ascending
    /// component order; empty components dropped).
    fn soft_partition(&self, embeddings: &[Vec<f32>], dim: usize, neighbors: usize) -> Result<Vec<Vec<usize>>> {
        let n = embeddings.len();
        let reduced: Array2<f64> = Isomap::new(dim, neighbors).fit_transform(embeddings)?;
        let max_k = self.config.max_clusters.min(n - 1).max(1);
        let fit = select_by_bic(&reduced, max_k, &self.mixture_template())?;

        let mut by_component: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (item, components) in fit.memberships(self.config.threshold).into_iter().enumerate() {
            for c in components {
                by_component.entry(c).or_default().push(item);
            }
        }
        debug!(
            items = n,
            dim,
            neighbors,
            components = fit.n_components(),
            non_empty = by_component.len(),
            "mixture selected"
        );
        Ok(by_component.into_values().filter(|items| !items.is_empty()).collect())
    }
}

impl Default for RaptorClustering {
    fn default() -> Self {
        Self {
            config: ClusteringConfig::default(),
        }
    }
}

/// `floor(sqrt(n - 1))` clamped to `[2, n - 1]`.
fn global_neighbors(n: usize) -> usize {
    let k = ((n - 1) as f64).sqrt().floor() as usize;
    k.clamp(2, (n - 1).max(2))
}

impl Clustering for RaptorClustering {
    fn cluster(&self, embeddings: &[Vec<f32>]) -> Result<Vec<Vec<usize>>> {
        let n = embeddings.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        if n <= 3 {
            return Ok(vec![(0..n).collect()]);
        }

        let dim = self.config.reduction_dimension.min(n - 2);
        let global = self.soft_partition(embeddings, dim, global_neighbors(n))?;

        let mut clusters = Vec::new();
        for members in global {
            if members.len() <= dim + 1 {
                clusters.push(members);
                continue;
            }
            let local_embeddings: Vec<Vec<f32>> =
                members.iter().map(|&i| embeddings[i].clone()).collect();
            let m = members.len();
            let local_dim = dim.min(m - 2);
            let local_neighbors = self.config.local_neighbors.clamp(2, m - 1);
            for local in self.soft_partition(&local_embeddings, local_dim, local_neighbors)? {
                clusters.push(local.into_iter().map(|j| members[j]).collect());
            }
        }

        debug!(items = n, clusters = clusters.len(), "two-stage clustering done");
        Ok(clusters)
    }
}
