//! # strata
//!
//! RAPTOR-style retrieval trees: chunks at the bottom, summaries of clusters
//! above, maintained incrementally as new content arrives.
//!
//! ```text
//! chunks ──embed──► layer 0 ──cluster──► groups ──summarize──► layer 1 ──► ...
//! ```
//!
//! The engine is synchronous. Embedding and summarization are capabilities
//! supplied by the caller ([`Embed`], [`Summarizer`]); everything else
//! (projection, mixture fitting, size control, tree bookkeeping) lives here.
//!
//! ```rust
//! use strata::{ConcatSummarizer, Embed, RaptorConfig, TreeBuilder};
//!
//! struct Lengths;
//!
//! impl Embed for Lengths {
//!     fn model_id(&self) -> &str {
//!         "lengths"
//!     }
//!
//!     fn embed_batch(&self, texts: &[String]) -> strata::Result<Vec<Vec<f32>>> {
//!         Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
//!     }
//! }
//!
//! let builder = TreeBuilder::new(Lengths, ConcatSummarizer::new(), &RaptorConfig::default())?;
//! let tree = builder.build(&["one chunk", "another chunk"])?;
//! assert_eq!(tree.leaf_nodes().len(), 2);
//! # Ok::<(), strata::Error>(())
//! ```

pub mod cluster;
pub mod config;
pub mod embed;
/// Error types used across `strata`.
pub mod error;
pub mod hierarchy;
pub mod retry;
pub mod summarize;

pub use config::RaptorConfig;
pub use embed::{Embed, EmbeddingBackend, EmbeddingProvider};
pub use error::{Error, Phase, ProviderError, Result};
pub use hierarchy::{
    HealthCheck, IncrementalUpdater, Node, NodeId, Tree, TreeBuilder, UpdateReport,
};
pub use summarize::{ConcatSummarizer, Summarizer, Tokenizer};
