//! Bottom-up tree construction (RAPTOR).
//!
//! RAPTOR (Recursive Abstractive Processing for Tree-Organized Retrieval)
//! builds a tree by:
//! 1. Clustering nodes of the current layer
//! 2. Summarizing each cluster into one parent
//! 3. Embedding the summaries and recursing on the new layer
//!
//! ```text
//! layer 0   c0 c1 c2 c3 c4 c5 c6 c7      embed_batch(all chunks)
//!              \  |  /     \  |  /
//! layer 1       [s8]        [s9]          one summarize call per group,
//!                  \        /             one embed_batch per layer
//! layer 2            [s10]
//! ```
//!
//! With `auto_depth`, construction stops once a layer is small enough to be
//! the top (`target_top_nodes`) or too small to cluster meaningfully
//! (`reduction_dimension + 1`).
//!
//! ## References
//!
//! Sarthi et al. (2024). "RAPTOR: Recursive Abstractive Processing for
//! Tree-Organized Retrieval." ICLR 2024.

use tracing::{debug, info, warn};

use super::node::{Node, NodeId};
use super::tree::Tree;
use crate::cluster::Clusterer;
use crate::config::{BuildConfig, RaptorConfig};
use crate::embed::Embed;
use crate::error::{Error, Phase, Result};
use crate::retry::RetryPolicy;
use crate::summarize::{bounded_context, CharRatioTokenizer, Summarizer, Tokenizer};

/// Builds trees from chunks, and rebuilds upper layers of existing trees.
pub struct TreeBuilder<E, S> {
    embedder: E,
    summarizer: S,
    clusterer: Clusterer,
    tokenizer: Box<dyn Tokenizer + Send + Sync>,
    config: BuildConfig,
    reduction_dimension: usize,
    retry: RetryPolicy,
}

impl<E: Embed, S: Summarizer> TreeBuilder<E, S> {
    /// Create a builder. Fails if `config` is invalid.
    pub fn new(embedder: E, summarizer: S, config: &RaptorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            embedder,
            summarizer,
            clusterer: Clusterer::new(&config.clustering)?,
            tokenizer: Box::new(CharRatioTokenizer::default()),
            config: config.build.clone(),
            reduction_dimension: config.clustering.reduction_dimension,
            retry: config.retry.clone(),
        })
    }

    /// Count tokens with `tokenizer` instead of the 4-chars-per-token estimate.
    pub fn with_tokenizer(mut self, tokenizer: impl Tokenizer + Send + Sync + 'static) -> Self {
        self.tokenizer = Box::new(tokenizer);
        self
    }

    /// Replace the clusterer (e.g. a custom [`Clustering`](crate::cluster::Clustering) pass).
    pub fn with_clusterer(mut self, clusterer: Clusterer) -> Self {
        self.clusterer = clusterer;
        self
    }

    /// Build parameters.
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// The embedding capability.
    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    /// The summarization capability.
    pub fn summarizer(&self) -> &S {
        &self.summarizer
    }

    /// The token counter.
    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    /// Retry policy for summarizer calls.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Model id under which embeddings are stored.
    pub fn model_id(&self) -> &str {
        self.embedder.model_id()
    }

    /// Build a tree over `chunks`.
    ///
    /// Leaves get ids `0..chunks.len()` in input order.
    pub fn build<T: AsRef<str>>(&self, chunks: &[T]) -> Result<Tree> {
        if chunks.is_empty() {
            return Err(Error::EmptyInput);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.as_ref().to_string()).collect();
        let vectors = self.embedder.embed_batch(&texts)?;
        if vectors.len() != texts.len() {
            return Err(Error::InvariantViolation(format!(
                "{} embeddings for {} chunks",
                vectors.len(),
                texts.len()
            )));
        }

        let model_id = self.model_id().to_string();
        let mut tree = Tree::new();
        for (id, (text, vector)) in texts.into_iter().zip(vectors).enumerate() {
            tree.insert_node(Node::leaf(id, text).with_embedding(model_id.as_str(), vector))?;
        }
        info!(leaves = tree.len(), model_id = %model_id, "building tree");

        self.construct_layers(&mut tree, 0)?;
        info!(
            nodes = tree.len(),
            layers = tree.num_layers(),
            roots = tree.root_nodes().len(),
            "tree built"
        );
        Ok(tree)
    }

    /// Grow summary layers on top of `from_layer`, which must be the top layer.
    pub fn construct_layers(&self, tree: &mut Tree, from_layer: usize) -> Result<()> {
        if from_layer != tree.num_layers() {
            return Err(Error::invalid(
                "from_layer",
                format!(
                    "layers are built on the top layer {}, not {from_layer}",
                    tree.num_layers()
                ),
            ));
        }
        self.ensure_embeddings(tree, from_layer)?;

        let mut layer = from_layer;
        while layer < self.config.max_layers {
            let ids: Vec<NodeId> = tree.layer(layer).to_vec();
            if self.should_stop(ids.len()) {
                debug!(layer, nodes = ids.len(), "layer small enough, stopping");
                break;
            }

            let groups = self.group_layer(tree, &ids)?;
            if groups.is_empty() {
                break;
            }

            let summaries = groups
                .iter()
                .map(|group| self.summarize_children(tree, group, layer + 1))
                .collect::<Result<Vec<String>>>()?;
            let vectors = self.embedder.embed_batch(&summaries)?;
            if vectors.len() != summaries.len() {
                return Err(Error::InvariantViolation(format!(
                    "{} embeddings for {} summaries",
                    vectors.len(),
                    summaries.len()
                )));
            }

            let model_id = self.model_id().to_string();
            let mut next = tree.next_id();
            for ((group, summary), vector) in groups.into_iter().zip(summaries).zip(vectors) {
                let node = Node::internal(next, summary, layer + 1, group)
                    .with_embedding(model_id.as_str(), vector);
                tree.insert_node(node)?;
                next += 1;
            }
            info!(
                layer = layer + 1,
                parents = tree.layer(layer + 1).len(),
                children = ids.len(),
                "layer built"
            );
            layer += 1;
        }

        tree.refresh_roots();
        Ok(())
    }

    fn should_stop(&self, layer_size: usize) -> bool {
        if self.config.auto_depth {
            layer_size <= self.config.target_top_nodes || layer_size <= self.reduction_dimension + 1
        } else {
            layer_size <= 1
        }
    }

    /// Cluster a layer into child-id groups, capped at `max_children_per_parent`.
    fn group_layer(&self, tree: &Tree, ids: &[NodeId]) -> Result<Vec<Vec<NodeId>>> {
        let model_id = self.model_id();
        let mut texts = Vec::with_capacity(ids.len());
        let mut embeddings = Vec::with_capacity(ids.len());
        for &id in ids {
            let node = tree
                .get(id)
                .ok_or_else(|| Error::InvariantViolation(format!("layer lists missing node {id}")))?;
            let vector = node.embedding(model_id).ok_or_else(|| {
                Error::InvariantViolation(format!("node {id} has no '{model_id}' embedding"))
            })?;
            texts.push(node.text.as_str());
            embeddings.push(vector.to_vec());
        }

        let clusters = self
            .clusterer
            .cluster(&texts, &embeddings, self.tokenizer.as_ref())?;
        debug!(nodes = ids.len(), clusters = clusters.len(), "layer clustered");

        let cap = self.config.max_children_per_parent;
        let mut groups = Vec::new();
        for cluster in clusters {
            let mut children: Vec<NodeId> = cluster.into_iter().map(|i| ids[i]).collect();
            children.sort_unstable();
            children.dedup();
            if children.len() > cap {
                debug!(children = children.len(), cap, "splitting over-wide cluster");
            }
            groups.extend(children.chunks(cap).map(<[NodeId]>::to_vec));
        }
        Ok(groups)
    }

    /// Summarize `children` (in id order) for a node on `layer`.
    pub(crate) fn summarize_children(
        &self,
        tree: &Tree,
        children: &[NodeId],
        layer: usize,
    ) -> Result<String> {
        let texts = children
            .iter()
            .map(|&id| {
                tree.get(id)
                    .map(|n| n.text.as_str())
                    .ok_or_else(|| Error::InvariantViolation(format!("missing child {id}")))
            })
            .collect::<Result<Vec<&str>>>()?;
        let context = bounded_context(&texts, self.tokenizer.as_ref(), self.config.max_context_tokens);
        self.summarize_context(&context, layer)
    }

    /// One summarizer call through the retry policy.
    pub(crate) fn summarize_context(&self, context: &str, layer: usize) -> Result<String> {
        let max_tokens = self.config.summary_max_tokens;
        let summary = self.retry.run(Phase::Summarization, || {
            self.summarizer.summarize(context, layer, max_tokens)
        })?;
        let produced = self.tokenizer.count_tokens(&summary);
        if produced > 2 * max_tokens {
            warn!(layer, produced, budget = max_tokens, "summary well over its token budget");
        }
        Ok(summary)
    }

    /// Embed every node of `layer` that has no vector for the active model.
    pub(crate) fn ensure_embeddings(&self, tree: &mut Tree, layer: usize) -> Result<()> {
        let model_id = self.model_id().to_string();
        let missing: Vec<(NodeId, String)> = tree
            .layer_nodes(layer)
            .filter(|n| n.embedding(&model_id).is_none())
            .map(|n| (n.id, n.text.clone()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        debug!(layer, missing = missing.len(), model_id = %model_id, "embedding nodes without vectors");
        let texts: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts)?;
        if vectors.len() != texts.len() {
            return Err(Error::InvariantViolation(format!(
                "{} embeddings for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        for ((id, _), vector) in missing.into_iter().zip(vectors) {
            tree.set_embedding(id, &model_id, vector)?;
        }
        Ok(())
    }
}

impl<E, S> std::fmt::Debug for TreeBuilder<E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeBuilder")
            .field("config", &self.config)
            .field("clusterer", &self.clusterer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::summarize::{from_fn, ConcatSummarizer};
    use std::cell::Cell;

    /// Embeds by text length; enough for stub clusterings.
    struct LengthEmbedder;

    impl Embed for LengthEmbedder {
        fn model_id(&self) -> &str {
            "length"
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn pairs(e: &[Vec<f32>]) -> Result<Vec<Vec<usize>>> {
        Ok((0..e.len()).collect::<Vec<_>>().chunks(2).map(<[usize]>::to_vec).collect())
    }

    fn config(build: BuildConfig) -> RaptorConfig {
        RaptorConfig::default()
            .with_build(build)
            .with_retry(RetryPolicy::immediate(3))
    }

    fn builder(build: BuildConfig) -> TreeBuilder<LengthEmbedder, ConcatSummarizer> {
        TreeBuilder::new(LengthEmbedder, ConcatSummarizer::new(), &config(build))
            .unwrap()
            .with_clusterer(Clusterer::with_algorithm(pairs, usize::MAX))
    }

    fn chunks(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("chunk {i}")).collect()
    }

    #[test]
    fn test_empty_input() {
        let b = builder(BuildConfig::default());
        let empty: Vec<String> = Vec::new();
        assert!(matches!(b.build(&empty), Err(Error::EmptyInput)));
    }

    #[test]
    fn test_fixed_depth_halves_each_layer() {
        let b = builder(BuildConfig::default().with_auto_depth(false).with_max_layers(10));
        let tree = b.build(&chunks(8)).unwrap();
        assert_eq!(tree.num_layers(), 3);
        assert_eq!(tree.layer(1).len(), 4);
        assert_eq!(tree.layer(2).len(), 2);
        assert_eq!(tree.root_nodes().len(), 1);
        tree.check_invariants().unwrap();
        for node in tree.nodes() {
            assert!(node.embedding("length").is_some());
        }
    }

    #[test]
    fn test_max_layers_bounds_height() {
        let b = builder(BuildConfig::default().with_auto_depth(false).with_max_layers(2));
        let tree = b.build(&chunks(16)).unwrap();
        assert_eq!(tree.num_layers(), 2);
        assert_eq!(tree.root_nodes().len(), 4);
    }

    #[test]
    fn test_auto_depth_stops_at_target() {
        let b = builder(BuildConfig::default().with_target_top_nodes(20).with_max_layers(5));
        let tree = b.build(&chunks(30)).unwrap();
        // 30 > 20 → 15 parents, 15 <= 20 → stop.
        assert_eq!(tree.num_layers(), 1);
        assert_eq!(tree.root_nodes().len(), 15);
    }

    #[test]
    fn test_children_cap_splits_groups() {
        let everything = |e: &[Vec<f32>]| -> Result<Vec<Vec<usize>>> { Ok(vec![(0..e.len()).collect()]) };
        let b = TreeBuilder::new(
            LengthEmbedder,
            ConcatSummarizer::new(),
            &config(
                BuildConfig::default()
                    .with_auto_depth(false)
                    .with_max_layers(1)
                    .with_max_children_per_parent(3),
            ),
        )
        .unwrap()
        .with_clusterer(Clusterer::with_algorithm(everything, usize::MAX));
        let tree = b.build(&chunks(7)).unwrap();
        let sizes: Vec<usize> = tree.layer_nodes(1).map(|n| n.children.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_summarizer_sees_layer_and_budget() {
        let seen = std::sync::Mutex::new(Vec::new());
        let summarizer = from_fn(|ctx: &str, layer: usize, max: usize| {
            seen.lock().unwrap().push((layer, max));
            Ok(format!("summary of {} chars", ctx.len()))
        });
        let b = TreeBuilder::new(
            LengthEmbedder,
            &summarizer,
            &config(BuildConfig::default().with_auto_depth(false).with_max_layers(2)),
        )
        .unwrap()
        .with_clusterer(Clusterer::with_algorithm(pairs, usize::MAX));
        let _ = b.build(&chunks(4)).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[..2].iter().all(|&(layer, max)| layer == 1 && max == 100));
        assert_eq!(seen[2].0, 2);
    }

    #[test]
    fn test_transient_summarizer_errors_are_retried() {
        let failures = Cell::new(2);
        let summarizer = from_fn(|ctx: &str, _layer: usize, _max: usize| {
            if failures.get() > 0 {
                failures.set(failures.get() - 1);
                return Err(ProviderError::Server("503".into()));
            }
            Ok(ctx.to_string())
        });
        let b = TreeBuilder::new(
            LengthEmbedder,
            &summarizer,
            &config(BuildConfig::default().with_auto_depth(false).with_max_layers(1)),
        )
        .unwrap()
        .with_clusterer(Clusterer::with_algorithm(pairs, usize::MAX));
        let tree = b.build(&chunks(2)).unwrap();
        assert_eq!(tree.num_layers(), 1);
    }

    #[test]
    fn test_fatal_summarizer_error_surfaces_phase() {
        let summarizer = from_fn(|_: &str, _: usize, _: usize| Err(ProviderError::Fatal("bad prompt".into())));
        let b = TreeBuilder::new(
            LengthEmbedder,
            summarizer,
            &config(BuildConfig::default().with_auto_depth(false)),
        )
        .unwrap()
        .with_clusterer(Clusterer::with_algorithm(pairs, usize::MAX));
        let err = b.build(&chunks(4)).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Summarization));
    }

    #[test]
    fn test_construct_layers_requires_top_layer() {
        let b = builder(BuildConfig::default().with_auto_depth(false));
        let mut tree = b.build(&chunks(4)).unwrap();
        assert!(matches!(
            b.construct_layers(&mut tree, 0),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_missing_embeddings_are_filled_before_clustering() {
        let b = builder(BuildConfig::default().with_auto_depth(false).with_max_layers(1));
        let mut tree = Tree::new();
        for id in 0..4 {
            tree.insert_node(Node::leaf(id, format!("text {id}"))).unwrap();
        }
        b.construct_layers(&mut tree, 0).unwrap();
        assert!(tree.layer_nodes(0).all(|n| n.embedding("length").is_some()));
        assert_eq!(tree.num_layers(), 1);
    }
}
