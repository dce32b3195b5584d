//! Size-controlled clustering.
//!
//! A cluster's children are summarized together, so a cluster whose text
//! exceeds the summarizer's budget is split again. Pending item sets sit on an
//! explicit stack; each set is re-clustered at most once, keyed by its content.
//!
//! | Group state | Outcome |
//! |-------------|---------|
//! | within budget | kept |
//! | one item | kept (cannot split) |
//! | content already attempted | kept, warned |
//! | re-split gives ≤ 1 group | kept, warned |
//! | re-split gives ≥ 2 groups | each pushed back on the stack |

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::raptor::RaptorClustering;
use super::traits::Clustering;
use crate::config::ClusteringConfig;
use crate::embed::sha256_hex;
use crate::error::{Error, Result};
use crate::summarize::Tokenizer;

/// Clustering with recursive token-budget control.
pub struct Clusterer {
    algorithm: Box<dyn Clustering + Send + Sync>,
    max_length_in_cluster: usize,
}

impl std::fmt::Debug for Clusterer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clusterer")
            .field("max_length_in_cluster", &self.max_length_in_cluster)
            .finish_non_exhaustive()
    }
}

impl Clusterer {
    /// Two-stage GMM clustering with the configured token budget. Fails if
    /// `config` is invalid.
    pub fn new(config: &ClusteringConfig) -> Result<Self> {
        Ok(Self {
            algorithm: Box::new(RaptorClustering::new(config.clone())?),
            max_length_in_cluster: config.max_length_in_cluster,
        })
    }

    /// Any clustering pass with a token budget.
    pub fn with_algorithm(
        algorithm: impl Clustering + Send + Sync + 'static,
        max_length_in_cluster: usize,
    ) -> Self {
        Self {
            algorithm: Box::new(algorithm),
            max_length_in_cluster,
        }
    }

    /// Token budget per group.
    pub fn max_length_in_cluster(&self) -> usize {
        self.max_length_in_cluster
    }

    /// Group items given their texts and embeddings.
    ///
    /// Output groups hold ascending indices into the inputs. An item may be
    /// in more than one group.
    pub fn cluster<S: AsRef<str>>(
        &self,
        texts: &[S],
        embeddings: &[Vec<f32>],
        tokenizer: &dyn Tokenizer,
    ) -> Result<Vec<Vec<usize>>> {
        if texts.len() != embeddings.len() {
            return Err(Error::InvariantViolation(format!(
                "{} texts but {} embeddings",
                texts.len(),
                embeddings.len()
            )));
        }
        let n = texts.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let tokens: Vec<usize> = texts
            .iter()
            .map(|t| tokenizer.count_tokens(t.as_ref()))
            .collect();
        let digests: Vec<String> = texts.iter().map(|t| sha256_hex(t.as_ref())).collect();

        let all: Vec<usize> = (0..n).collect();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut stack: Vec<Vec<usize>> = self.partition(&all, embeddings)?;
        stack.reverse();
        let mut out = Vec::new();

        while let Some(group) = stack.pop() {
            let total: usize = group.iter().map(|&i| tokens[i]).sum();
            if group.len() <= 1 || total <= self.max_length_in_cluster {
                out.push(group);
                continue;
            }
            if !attempted.insert(content_key(&group, &digests)) {
                warn!(
                    items = group.len(),
                    tokens = total,
                    budget = self.max_length_in_cluster,
                    "oversized cluster already attempted, keeping as-is"
                );
                out.push(group);
                continue;
            }

            let parts = self.partition(&group, embeddings)?;
            if parts.len() <= 1 {
                warn!(
                    items = group.len(),
                    tokens = total,
                    budget = self.max_length_in_cluster,
                    "oversized cluster did not split, keeping as-is"
                );
                out.push(group);
                continue;
            }
            debug!(items = group.len(), parts = parts.len(), "re-split oversized cluster");
            for part in parts.into_iter().rev() {
                stack.push(part);
            }
        }
        Ok(out)
    }

    /// One clustering pass over `indices`, mapped back to input indices.
    fn partition(&self, indices: &[usize], embeddings: &[Vec<f32>]) -> Result<Vec<Vec<usize>>> {
        let subset: Vec<Vec<f32>> = indices.iter().map(|&i| embeddings[i].clone()).collect();
        let groups = self.algorithm.cluster(&subset)?;

        let mut mapped = Vec::with_capacity(groups.len());
        for group in groups {
            let mut items = Vec::with_capacity(group.len());
            for local in group {
                let Some(&global) = indices.get(local) else {
                    return Err(Error::InvariantViolation(format!(
                        "clustering returned index {local} for {} items",
                        indices.len()
                    )));
                };
                items.push(global);
            }
            items.sort_unstable();
            items.dedup();
            if !items.is_empty() {
                mapped.push(items);
            }
        }
        Ok(mapped)
    }
}

/// Order-independent content key of an item set.
fn content_key(items: &[usize], digests: &[String]) -> String {
    let mut parts: Vec<&str> = items.iter().map(|&i| digests[i].as_str()).collect();
    parts.sort_unstable();
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn items(n: usize) -> (Vec<String>, Vec<Vec<f32>>) {
        let texts = (0..n).map(|i| format!("item {i}")).collect();
        let embeddings = (0..n).map(|i| vec![i as f32, 1.0]).collect();
        (texts, embeddings)
    }

    fn fixed_tokens(per_item: usize) -> impl Fn(&str) -> usize {
        move |_: &str| per_item
    }

    fn halves(e: &[Vec<f32>]) -> Result<Vec<Vec<usize>>> {
        let mid = e.len() / 2;
        if mid == 0 {
            return Ok(vec![(0..e.len()).collect()]);
        }
        Ok(vec![(0..mid).collect(), (mid..e.len()).collect()])
    }

    fn everything(e: &[Vec<f32>]) -> Result<Vec<Vec<usize>>> {
        Ok(vec![(0..e.len()).collect()])
    }

    #[test]
    fn test_within_budget_is_untouched() {
        let (texts, emb) = items(6);
        let c = Clusterer::with_algorithm(halves, 10_000);
        let groups = c.cluster(&texts, &emb, &fixed_tokens(10)).unwrap();
        assert_eq!(groups, vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[test]
    fn test_oversized_group_is_split_until_it_fits() {
        // 10 items x 300 tokens = 3000 > 1500; halves of 1500 fit.
        let (texts, emb) = items(10);
        let c = Clusterer::with_algorithm(everything_then_halves(), 1500);
        let groups = c.cluster(&texts, &emb, &fixed_tokens(300)).unwrap();
        assert_eq!(groups, vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 9]]);
    }

    /// First call returns everything, later calls split in half.
    fn everything_then_halves() -> impl Fn(&[Vec<f32>]) -> Result<Vec<Vec<usize>>> + Send + Sync {
        let calls = Arc::new(AtomicUsize::new(0));
        move |e: &[Vec<f32>]| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                everything(e)
            } else {
                halves(e)
            }
        }
    }

    #[test]
    fn test_unsplittable_group_is_kept() {
        let (texts, emb) = items(10);
        let c = Clusterer::with_algorithm(everything, 1500);
        let groups = c.cluster(&texts, &emb, &fixed_tokens(300)).unwrap();
        assert_eq!(groups, vec![(0..10).collect::<Vec<_>>()]);
    }

    #[test]
    fn test_single_item_never_split() {
        let (texts, emb) = items(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let c = Clusterer::with_algorithm(
            move |e: &[Vec<f32>]| {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                everything(e)
            },
            1,
        );
        let groups = c.cluster(&texts, &emb, &fixed_tokens(50)).unwrap();
        assert_eq!(groups, vec![vec![0]]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repeated_content_terminates() {
        // Duplicate-text items make every subset hash like its twin.
        let texts = vec!["same".to_string(); 8];
        let emb: Vec<Vec<f32>> = (0..8).map(|i| vec![i as f32]).collect();
        let doubled = |e: &[Vec<f32>]| -> Result<Vec<Vec<usize>>> {
            let all: Vec<usize> = (0..e.len()).collect();
            Ok(vec![all.clone(), all])
        };
        let c = Clusterer::with_algorithm(doubled, 10);
        let groups = c.cluster(&texts, &emb, &fixed_tokens(5)).unwrap();
        assert!(!groups.is_empty());
        assert!(groups.iter().all(|g| g.len() == 8));
    }

    #[test]
    fn test_out_of_range_index_is_invariant_violation() {
        let (texts, emb) = items(3);
        let c = Clusterer::with_algorithm(
            |_: &[Vec<f32>]| -> Result<Vec<Vec<usize>>> { Ok(vec![vec![0, 7]]) },
            100,
        );
        let err = c.cluster(&texts, &emb, &fixed_tokens(1)).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let c = Clusterer::with_algorithm(everything, 100);
        let texts = vec!["a".to_string()];
        assert!(c.cluster(&texts, &[], &fixed_tokens(1)).is_err());
    }

    #[test]
    fn test_content_key_ignores_order() {
        let digests: Vec<String> = ["a", "b", "c"].iter().map(|t| sha256_hex(t)).collect();
        assert_eq!(content_key(&[0, 2], &digests), content_key(&[2, 0], &digests));
        assert_ne!(content_key(&[0, 1], &digests), content_key(&[0, 2], &digests));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ClusteringConfig::default().with_reduction_dimension(0);
        let err = Clusterer::new(&config).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { name: "clustering.reduction_dimension", .. }));

        let c = Clusterer::new(&ClusteringConfig::default().with_max_length_in_cluster(900)).unwrap();
        assert_eq!(c.max_length_in_cluster(), 900);
    }
}
