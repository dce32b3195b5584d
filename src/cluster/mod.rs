//! Clustering algorithms for grouping similar items.
//!
//! Items are grouped before summarization: every group becomes one parent
//! node. Grouping is **soft**: a text chunk that is 60% about "machine
//! learning" and 30% about "statistics" may sit under both parents.
//!
//! ## Pipeline
//!
//! | Stage | Type | Purpose |
//! |-------|------|---------|
//! | Projection | [`Isomap`] | geodesic-preserving reduction to a few dims |
//! | Mixture | [`Gmm`] | diagonal GMM, k chosen by BIC |
//! | Two stages | [`RaptorClustering`] | global topics, then local sub-topics |
//! | Size control | [`Clusterer`] | re-split groups over the token budget |
//!
//! ### Gaussian Mixture Model (GMM)
//!
//! Models data as a mixture of k Gaussian distributions:
//!
//! ```text
//! P(x) = Σ π_k × N(x | μ_k, Σ_k)
//! ```
//!
//! Where π_k is the mixture weight (probability of cluster k), and N is the
//! Gaussian density with mean μ_k and covariance Σ_k.
//!
//! ## Usage
//!
//! ```rust
//! use strata::cluster::{Clustering, RaptorClustering};
//! use strata::config::ClusteringConfig;
//!
//! let data = vec![
//!     vec![1.0, 0.0],
//!     vec![0.99, 0.01],
//!     vec![0.0, 1.0],
//! ];
//!
//! // Three items are too few to cluster: one group.
//! let groups = RaptorClustering::new(ClusteringConfig::default())?.cluster(&data)?;
//! assert_eq!(groups, vec![vec![0, 1, 2]]);
//! # Ok::<(), strata::Error>(())
//! ```

pub mod gmm;
pub mod projection;
pub mod raptor;
pub mod recursive;
mod traits;

pub use gmm::{select_by_bic, Gmm, GmmFit};
pub use projection::Isomap;
pub use raptor::RaptorClustering;
pub use recursive::Clusterer;
pub use traits::Clustering;
