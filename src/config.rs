//! Configuration for embedding, clustering, building and incremental updates.
//!
//! Every section deserializes with defaults for missing fields, so a config
//! file only needs to name what it overrides:
//!
//! ```toml
//! [embedding]
//! model_id = "text-embedding-3-large"
//!
//! [build]
//! max_layers = 3
//! target_top_nodes = 20
//! ```
//!
//! Values are checked once by [`RaptorConfig::validate`], which every
//! builder and updater constructor calls.

use serde::{Deserialize, Serialize};

use crate::embed::tokens_for_chars;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RaptorConfig {
    /// Embedding provider settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Clustering settings.
    #[serde(default)]
    pub clustering: ClusteringConfig,

    /// Bottom-up build settings.
    #[serde(default)]
    pub build: BuildConfig,

    /// Incremental maintenance settings.
    #[serde(default)]
    pub incremental: IncrementalConfig,

    /// Backoff for embedding and summarization calls.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl RaptorConfig {
    /// Create a configuration with defaults everywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        self.embedding.validate()?;
        self.clustering.validate()?;
        self.build.validate()?;
        self.incremental.validate()?;
        self.retry.validate()
    }

    /// Replace the embedding section.
    pub fn with_embedding(mut self, embedding: EmbeddingConfig) -> Self {
        self.embedding = embedding;
        self
    }

    /// Replace the clustering section.
    pub fn with_clustering(mut self, clustering: ClusteringConfig) -> Self {
        self.clustering = clustering;
        self
    }

    /// Replace the build section.
    pub fn with_build(mut self, build: BuildConfig) -> Self {
        self.build = build;
        self
    }

    /// Replace the incremental section.
    pub fn with_incremental(mut self, incremental: IncrementalConfig) -> Self {
        self.incremental = incremental;
        self
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Embedding provider limits and identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model id; also the key into `Node::embeddings`.
    pub model_id: String,
    /// Maximum number of texts per backend call.
    pub max_batch_items: usize,
    /// Maximum estimated tokens per backend call (~4 chars per token).
    pub max_batch_tokens: usize,
    /// Texts are truncated to this many characters after normalization.
    /// A text of this length must fit in one call: `max_batch_tokens` is at
    /// least `max_text_chars / 4`, rounded up.
    pub max_text_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_id: "text-embedding-3-small".to_string(),
            max_batch_items: 2048,
            max_batch_tokens: 300_000,
            max_text_chars: 32_000,
        }
    }
}

impl EmbeddingConfig {
    /// Set the model id.
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Set both per-call limits.
    pub fn with_batch_limits(mut self, max_items: usize, max_tokens: usize) -> Self {
        self.max_batch_items = max_items;
        self.max_batch_tokens = max_tokens;
        self
    }

    /// Set the truncation length for normalized texts.
    pub fn with_max_text_chars(mut self, max_chars: usize) -> Self {
        self.max_text_chars = max_chars;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(Error::invalid("embedding.model_id", "must not be empty"));
        }
        if self.max_batch_items == 0 {
            return Err(Error::invalid("embedding.max_batch_items", "must be > 0"));
        }
        if self.max_batch_tokens == 0 {
            return Err(Error::invalid("embedding.max_batch_tokens", "must be > 0"));
        }
        if self.max_text_chars == 0 {
            return Err(Error::invalid("embedding.max_text_chars", "must be > 0"));
        }
        let longest = tokens_for_chars(self.max_text_chars);
        if self.max_batch_tokens < longest {
            return Err(Error::invalid(
                "embedding.max_batch_tokens",
                format!("must be >= {longest} so a text of max_text_chars fits in one call"),
            ));
        }
        Ok(())
    }
}

/// Two-stage clustering parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Target dimension of the manifold projection.
    pub reduction_dimension: usize,
    /// Posterior probability above which an item joins a component.
    pub threshold: f64,
    /// Upper bound of the BIC sweep.
    pub max_clusters: usize,
    /// Token budget of one cluster before it is re-split.
    pub max_length_in_cluster: usize,
    /// Neighbor count of the local-stage projection.
    pub local_neighbors: usize,
    /// Seed for projection and mixture fitting. `None` draws from the OS.
    pub seed: Option<u64>,
    /// EM iteration cap.
    pub max_em_iter: usize,
    /// EM stops once the mean log-likelihood improves by less than this.
    pub em_tol: f64,
    /// Variance floor as a fraction of the projected data's total variance.
    pub covariance_floor: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            reduction_dimension: 10,
            threshold: 0.1,
            max_clusters: 50,
            max_length_in_cluster: 3500,
            local_neighbors: 10,
            seed: Some(224),
            max_em_iter: 100,
            em_tol: 1e-3,
            covariance_floor: 1e-3,
        }
    }
}

impl ClusteringConfig {
    /// Set projection dimension.
    pub fn with_reduction_dimension(mut self, dim: usize) -> Self {
        self.reduction_dimension = dim;
        self
    }

    /// Set membership threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the BIC sweep bound.
    pub fn with_max_clusters(mut self, max_clusters: usize) -> Self {
        self.max_clusters = max_clusters;
        self
    }

    /// Set the per-cluster token budget.
    pub fn with_max_length_in_cluster(mut self, tokens: usize) -> Self {
        self.max_length_in_cluster = tokens;
        self
    }

    /// Set (or clear) the seed.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.reduction_dimension == 0 {
            return Err(Error::invalid("clustering.reduction_dimension", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::invalid("clustering.threshold", "must be within [0, 1]"));
        }
        if self.max_clusters == 0 {
            return Err(Error::invalid("clustering.max_clusters", "must be > 0"));
        }
        if self.max_length_in_cluster == 0 {
            return Err(Error::invalid("clustering.max_length_in_cluster", "must be > 0"));
        }
        if self.local_neighbors == 0 {
            return Err(Error::invalid("clustering.local_neighbors", "must be > 0"));
        }
        if self.max_em_iter == 0 {
            return Err(Error::invalid("clustering.max_em_iter", "must be > 0"));
        }
        if !(self.em_tol.is_finite() && self.em_tol >= 0.0) {
            return Err(Error::invalid("clustering.em_tol", "must be finite and >= 0"));
        }
        if !(0.0..1.0).contains(&self.covariance_floor) {
            return Err(Error::invalid("clustering.covariance_floor", "must be within [0, 1)"));
        }
        Ok(())
    }
}

/// Bottom-up construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Maximum number of summary layers.
    pub max_layers: usize,
    /// Auto-depth stops once a layer has at most this many nodes.
    pub target_top_nodes: usize,
    /// Stop early at `target_top_nodes`; otherwise build `max_layers` unconditionally.
    pub auto_depth: bool,
    /// Hard cap on children per summary node.
    pub max_children_per_parent: usize,
    /// Token budget of one summarization context.
    pub max_context_tokens: usize,
    /// Token budget handed to the summarizer for its output.
    pub summary_max_tokens: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_layers: 5,
            target_top_nodes: 75,
            auto_depth: true,
            max_children_per_parent: 300,
            max_context_tokens: 12_000,
            summary_max_tokens: 100,
        }
    }
}

impl BuildConfig {
    /// Set maximum number of layers.
    pub fn with_max_layers(mut self, layers: usize) -> Self {
        self.max_layers = layers;
        self
    }

    /// Set target top-layer size.
    pub fn with_target_top_nodes(mut self, nodes: usize) -> Self {
        self.target_top_nodes = nodes;
        self
    }

    /// Toggle auto-depth.
    pub fn with_auto_depth(mut self, auto_depth: bool) -> Self {
        self.auto_depth = auto_depth;
        self
    }

    /// Set the children cap.
    pub fn with_max_children_per_parent(mut self, cap: usize) -> Self {
        self.max_children_per_parent = cap;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_layers == 0 {
            return Err(Error::invalid("build.max_layers", "must be > 0"));
        }
        if self.target_top_nodes == 0 {
            return Err(Error::invalid("build.target_top_nodes", "must be > 0"));
        }
        if self.max_children_per_parent == 0 {
            return Err(Error::invalid("build.max_children_per_parent", "must be > 0"));
        }
        if self.max_context_tokens == 0 {
            return Err(Error::invalid("build.max_context_tokens", "must be > 0"));
        }
        if self.summary_max_tokens == 0 {
            return Err(Error::invalid("build.summary_max_tokens", "must be > 0"));
        }
        Ok(())
    }
}

/// Incremental maintenance parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalConfig {
    /// Minimum cosine similarity for attaching to an existing parent.
    pub similarity_threshold: f64,
    /// Children considered when a parent is re-summarized.
    pub max_children_for_summary: usize,
    /// Token budget of a re-summarization context.
    pub max_context_tokens: usize,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.25,
            max_children_for_summary: 50,
            max_context_tokens: 8000,
        }
    }
}

impl IncrementalConfig {
    /// Set the similarity threshold.
    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::invalid(
                "incremental.similarity_threshold",
                "must be within [0, 1]",
            ));
        }
        if self.max_children_for_summary == 0 {
            return Err(Error::invalid(
                "incremental.max_children_for_summary",
                "must be > 0",
            ));
        }
        if self.max_context_tokens == 0 {
            return Err(Error::invalid("incremental.max_context_tokens", "must be > 0"));
        }
        Ok(())
    }
}
