//! Multi-layer retrieval trees.
//!
//! # The Core Insight
//!
//! Information exists at multiple scales. A single question might need:
//!
//! ```text
//! Question                        │ Scale Needed
//! ────────────────────────────────┼──────────────────────
//! "What year was X founded?"      │ Single chunk (layer 0)
//! "Summarize the main themes"     │ Top-layer summaries
//! "How does A relate to B?"       │ Cross-section synthesis
//! ```
//!
//! A RAPTOR tree (Sarthi et al., ICLR 2024) answers all three from one index:
//! leaves hold the original chunks, each layer above holds LLM summaries of
//! clusters of the layer below.
//!
//! ```text
//! Layer 3:        [Root Summary]
//!                 /             \
//! Layer 2:  [Summary A]      [Summary B]
//!           /    |    \      /    |    \
//! Layer 1: [s1] [s2] [s3]  [s4] [s5] [s6]
//!          /|\   |     |\   |     |   /|\
//! Layer 0: ... original chunks ...
//! ```
//!
//! Clustering is soft, so a chunk can sit under more than one summary: the
//! structure is a layered DAG, not a strict tree.
//!
//! # Module Overview
//!
//! | Type | Role |
//! |------|------|
//! | [`Node`], [`Tree`] | data model; structural checks on every mutation |
//! | [`TreeBuilder`] | bottom-up construction |
//! | [`IncrementalUpdater`] | attach, propagate, merge, rebuild |
//! | [`HealthCheck`] | drift and structure report |
//!
//! # References
//!
//! - Sarthi et al. (2024). "RAPTOR: Recursive Abstractive Processing for
//!   Tree-Organized Retrieval." ICLR.

pub mod builder;
pub mod incremental;
mod node;
pub mod tree;
mod validate;

pub use builder::TreeBuilder;
pub use incremental::{IncrementalUpdater, NodeFailure, UpdateReport};
pub use node::{Node, NodeId};
pub use tree::Tree;
pub use validate::{
    validate_tree_structure, HealthCheck, HealthReport, Severity, ValidationIssue, ValidationReport,
};
