//! Tree validation and health checking utilities.
//!
//! `Tree` refuses structural damage at insert time; the health check looks
//! for what the invariants allow but a reader may still care about:
//!
//! - Nodes no longer reachable from the roots (drift after layer-1 attaches)
//! - Children shared by several parents (soft clustering)
//! - Layers that grew instead of shrinking
//! - Nodes without any embedding
//!
//! Structural damage (missing children, childless internal nodes, layer
//! order, cycles) is still reported, for trees assembled by other means.
//!
//! # Example
//!
//! ```rust
//! use strata::hierarchy::{HealthCheck, Node, Tree};
//!
//! let mut tree = Tree::new();
//! tree.insert_node(Node::leaf(0, "chunk")).unwrap();
//! tree.insert_node(Node::internal(1, "summary", 1, [0])).unwrap();
//!
//! let report = tree.health_check();
//! assert!(report.is_healthy(), "{report}");
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::node::NodeId;
use super::tree::Tree;

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational, not a problem.
    Info,
    /// Something unusual but not necessarily wrong.
    Warning,
    /// A problem that should be fixed.
    Error,
    /// A critical issue that may cause failures.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A single validation issue found during health check.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Node involved, if any.
    pub node_id: Option<NodeId>,
    /// Optional additional context.
    pub context: Option<String>,
}

impl ValidationIssue {
    /// Create a new validation issue.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            node_id: None,
            context: None,
        }
    }

    /// Add a node ID to this issue.
    pub fn with_node(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    /// Add context to this issue.
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)?;
        if let Some(id) = self.node_id {
            write!(f, " (node {id})")?;
        }
        if let Some(ctx) = &self.context {
            write!(f, " - {ctx}")?;
        }
        Ok(())
    }
}

/// Issues found by a validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// All issues found.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Create an empty report.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Add an issue to the report.
    pub fn add(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// Add an info-level issue.
    pub fn info(&mut self, message: impl Into<String>) {
        self.add(ValidationIssue::new(Severity::Info, message));
    }

    /// Add a warning-level issue.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.add(ValidationIssue::new(Severity::Warning, message));
    }

    /// Add an error-level issue.
    pub fn error(&mut self, message: impl Into<String>) {
        self.add(ValidationIssue::new(Severity::Error, message));
    }

    /// Add a critical-level issue.
    pub fn critical(&mut self, message: impl Into<String>) {
        self.add(ValidationIssue::new(Severity::Critical, message));
    }

    /// No errors or critical issues.
    pub fn is_healthy(&self) -> bool {
        !self.issues.iter().any(|i| i.severity >= Severity::Error)
    }

    /// No issues at all.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Issues of a specific severity or higher.
    pub fn issues_at_level(&self, min_severity: Severity) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity >= min_severity)
            .collect()
    }

    /// Count issues by severity.
    pub fn counts(&self) -> HashMap<Severity, usize> {
        let mut counts = HashMap::new();
        for issue in &self.issues {
            *counts.entry(issue.severity).or_default() += 1;
        }
        counts
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_clean() {
            return write!(f, "Validation passed: no issues found");
        }

        let counts = self.counts();
        write!(f, "Validation report: ")?;

        let parts: Vec<String> = [
            (Severity::Critical, "critical"),
            (Severity::Error, "errors"),
            (Severity::Warning, "warnings"),
            (Severity::Info, "info"),
        ]
        .iter()
        .filter_map(|(sev, name)| counts.get(sev).map(|c| format!("{c} {name}")))
        .collect();

        writeln!(f, "{}", parts.join(", "))?;

        for issue in &self.issues {
            writeln!(f, "  {issue}")?;
        }

        Ok(())
    }
}

/// Health report with tree statistics.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Validation issues.
    pub validation: ValidationReport,
    /// Total number of nodes.
    pub node_count: usize,
    /// Number of leaf nodes.
    pub leaf_count: usize,
    /// Height (top layer index).
    pub num_layers: usize,
    /// Nodes per layer, bottom up.
    pub layer_sizes: Vec<usize>,
    /// Mean child count over internal nodes.
    pub avg_branching_factor: f64,
    /// Nodes listed as a child by more than one parent.
    pub shared_children: usize,
    /// Nodes not reachable from the roots.
    pub unreachable: usize,
}

impl HealthReport {
    /// No errors or critical issues.
    pub fn is_healthy(&self) -> bool {
        self.validation.is_healthy()
    }
}

impl std::fmt::Display for HealthReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Tree Health Report")?;
        writeln!(f, "==================")?;
        writeln!(f, "Nodes: {} ({} leaves)", self.node_count, self.leaf_count)?;
        writeln!(f, "Layers: {} {:?}", self.num_layers, self.layer_sizes)?;
        writeln!(f, "Avg branching factor: {:.2}", self.avg_branching_factor)?;
        writeln!(
            f,
            "Shared children: {}, unreachable: {}",
            self.shared_children, self.unreachable
        )?;
        writeln!(f)?;
        write!(f, "{}", self.validation)
    }
}

/// Trait for types that can be health-checked.
pub trait HealthCheck {
    /// Perform a health check and return a report.
    fn health_check(&self) -> HealthReport;

    /// Quick check: returns true if healthy.
    fn is_healthy(&self) -> bool {
        self.health_check().is_healthy()
    }
}

impl HealthCheck for Tree {
    fn health_check(&self) -> HealthReport {
        let mut children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        let mut parent_count: BTreeMap<NodeId, usize> = BTreeMap::new();
        for node in self.nodes() {
            if !node.children.is_empty() {
                let _ = children.insert(node.id, node.children.iter().copied().collect());
            }
            for &child in &node.children {
                *parent_count.entry(child).or_default() += 1;
            }
        }
        let ids: BTreeSet<NodeId> = self.nodes().map(|n| n.id).collect();

        let mut validation = validate_tree_structure(&children, self.root_nodes(), &ids);

        if let Err(err) = self.check_invariants() {
            validation.critical(err.to_string());
        }

        for node in self.nodes() {
            if node.is_leaf() {
                if !node.children.is_empty() {
                    validation.add(
                        ValidationIssue::new(Severity::Error, "leaf node has children")
                            .with_node(node.id),
                    );
                }
            } else if node.children.is_empty() {
                validation.add(
                    ValidationIssue::new(Severity::Error, "internal node has no children")
                        .with_node(node.id),
                );
            }
            for &child_id in &node.children {
                match self.get(child_id) {
                    Some(child) if child.layer >= node.layer => validation.add(
                        ValidationIssue::new(
                            Severity::Error,
                            "child layer violation (child.layer >= parent.layer)",
                        )
                        .with_node(node.id)
                        .with_context(format!(
                            "parent layer {}, child {} layer {}",
                            node.layer, child_id, child.layer
                        )),
                    ),
                    Some(_) => {}
                    None => validation.add(
                        ValidationIssue::new(Severity::Error, "child id does not exist")
                            .with_node(node.id)
                            .with_context(format!("missing child id {child_id}")),
                    ),
                }
            }
            if node.embeddings.is_empty() {
                validation.add(
                    ValidationIssue::new(Severity::Warning, "node has no embeddings")
                        .with_node(node.id),
                );
            }
        }

        let shared_children = parent_count.values().filter(|&&c| c > 1).count();
        if shared_children > 0 {
            validation.info(format!("{shared_children} nodes have more than one parent"));
        }

        // Layers normally shrink going up.
        let layer_sizes: Vec<usize> = (0..=self.num_layers()).map(|l| self.layer(l).len()).collect();
        for (level, pair) in layer_sizes.windows(2).enumerate() {
            if pair[1] > pair[0] {
                validation.warn(format!(
                    "layer {} has more nodes than layer {level} ({} > {})",
                    level + 1,
                    pair[1],
                    pair[0]
                ));
            }
        }

        let reachable = reachable_from(&children, self.root_nodes());
        let unreachable = ids.iter().filter(|id| !reachable.contains(id)).count();
        let internal = self.nodes().filter(|n| !n.is_leaf()).count();
        let avg_branching_factor = if internal == 0 {
            0.0
        } else {
            children.values().map(Vec::len).sum::<usize>() as f64 / internal as f64
        };

        HealthReport {
            validation,
            node_count: self.len(),
            leaf_count: self.leaf_nodes().len(),
            num_layers: self.num_layers(),
            layer_sizes,
            avg_branching_factor,
            shared_children,
            unreachable,
        }
    }
}

fn reachable_from(children: &BTreeMap<NodeId, Vec<NodeId>>, roots: &[NodeId]) -> BTreeSet<NodeId> {
    let mut reachable = BTreeSet::new();
    let mut stack = roots.to_vec();
    while let Some(node) = stack.pop() {
        if reachable.insert(node) {
            if let Some(node_children) = children.get(&node) {
                stack.extend(node_children);
            }
        }
    }
    reachable
}

/// Validate a parent -> children graph as a rooted DAG.
///
/// Children may be shared. Reports:
/// - no roots, or cycles (critical)
/// - nodes unreachable from `roots` (warning: drift, not damage)
/// - children that are not in `nodes` (error)
pub fn validate_tree_structure(
    children: &BTreeMap<NodeId, Vec<NodeId>>,
    roots: &[NodeId],
    nodes: &BTreeSet<NodeId>,
) -> ValidationReport {
    let mut report = ValidationReport::new();

    if roots.is_empty() && !nodes.is_empty() {
        report.critical("No root node found");
    }
    for root in roots {
        if !nodes.contains(root) {
            report.add(ValidationIssue::new(Severity::Critical, "root does not exist").with_node(*root));
        }
    }

    for (parent, kids) in children {
        for child in kids {
            if !nodes.contains(child) {
                report.add(
                    ValidationIssue::new(Severity::Error, "child id does not exist")
                        .with_node(*parent)
                        .with_context(format!("missing child id {child}")),
                );
            }
        }
    }

    let reachable = reachable_from(children, roots);
    let unreachable: Vec<NodeId> = nodes.difference(&reachable).copied().collect();
    if !unreachable.is_empty() {
        report.add(
            ValidationIssue::new(
                Severity::Warning,
                format!("{} nodes not reachable from the roots", unreachable.len()),
            )
            .with_context(format!("first few: {:?}", &unreachable[..unreachable.len().min(5)])),
        );
    }

    // Three-colour DFS from every node so cycles off the root paths are found too.
    fn detect_cycle(
        node: NodeId,
        children: &BTreeMap<NodeId, Vec<NodeId>>,
        visited: &mut BTreeSet<NodeId>,
        in_stack: &mut BTreeSet<NodeId>,
    ) -> bool {
        if in_stack.contains(&node) {
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        let _ = in_stack.insert(node);
        if let Some(node_children) = children.get(&node) {
            for &child in node_children {
                if detect_cycle(child, children, visited, in_stack) {
                    return true;
                }
            }
        }
        let _ = in_stack.remove(&node);
        false
    }

    let mut visited = BTreeSet::new();
    let mut in_stack = BTreeSet::new();
    for &start in children.keys() {
        if detect_cycle(start, children, &mut visited, &mut in_stack) {
            report.critical("Cycle detected in tree structure");
            break;
        }
    }

    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used, unused_results)]
mod tests {
    use super::*;
    use crate::cluster::Clusterer;
    use crate::config::{BuildConfig, RaptorConfig};
    use crate::embed::Embed;
    use crate::error::Result;
    use crate::hierarchy::{IncrementalUpdater, Node, TreeBuilder};
    use crate::retry::RetryPolicy;
    use crate::summarize::ConcatSummarizer;
    use proptest::prelude::*;

    struct LengthEmbedder;

    impl Embed for LengthEmbedder {
        fn model_id(&self) -> &str {
            "length"
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| vec![t.chars().count() as f32, 1.0])
                .collect())
        }
    }

    fn chunk_cluster(fanout: usize) -> impl Fn(&[Vec<f32>]) -> Result<Vec<Vec<usize>>> {
        move |e: &[Vec<f32>]| {
            let ids: Vec<usize> = (0..e.len()).collect();
            Ok(ids.chunks(fanout).map(<[usize]>::to_vec).collect())
        }
    }

    fn config(max_layers: usize) -> RaptorConfig {
        RaptorConfig::default()
            .with_build(
                BuildConfig::default()
                    .with_auto_depth(false)
                    .with_max_layers(max_layers),
            )
            .with_retry(RetryPolicy::immediate(1))
    }

    fn builder(fanout: usize, max_layers: usize) -> TreeBuilder<LengthEmbedder, ConcatSummarizer> {
        TreeBuilder::new(LengthEmbedder, ConcatSummarizer::new(), &config(max_layers))
            .unwrap()
            .with_clusterer(Clusterer::with_algorithm(chunk_cluster(fanout), usize::MAX))
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_validation_report_healthy() {
        let mut report = ValidationReport::new();
        report.info("Just some info");
        report.warn("A warning");
        assert!(report.is_healthy());

        report.error("An error");
        assert!(!report.is_healthy());
        assert_eq!(report.issues_at_level(Severity::Warning).len(), 2);
    }

    #[test]
    fn test_validation_issue_display() {
        let issue = ValidationIssue::new(Severity::Error, "Something wrong")
            .with_node(42)
            .with_context("additional info");

        let s = issue.to_string();
        assert!(s.contains("ERROR"));
        assert!(s.contains("Something wrong"));
        assert!(s.contains("42"));
        assert!(s.contains("additional info"));
    }

    #[test]
    fn test_shared_children_are_fine() {
        // 3 -> [0, 1], 4 -> [1, 2], 5 -> [3, 4]
        let children: BTreeMap<NodeId, Vec<NodeId>> =
            [(3, vec![0, 1]), (4, vec![1, 2]), (5, vec![3, 4])].into_iter().collect();
        let nodes: BTreeSet<NodeId> = (0..6).collect();
        let report = validate_tree_structure(&children, &[5], &nodes);
        assert!(report.is_clean(), "{report}");
    }

    #[test]
    fn test_unreachable_nodes_warn() {
        let children: BTreeMap<NodeId, Vec<NodeId>> = [(2, vec![0])].into_iter().collect();
        let nodes: BTreeSet<NodeId> = (0..3).collect();
        let report = validate_tree_structure(&children, &[2], &nodes);
        assert!(report.is_healthy());
        assert!(report.issues.iter().any(|i| i.message.contains("not reachable")));
    }

    #[test]
    fn test_cycle_is_critical() {
        let children: BTreeMap<NodeId, Vec<NodeId>> =
            [(0, vec![1]), (1, vec![2]), (2, vec![1])].into_iter().collect();
        let nodes: BTreeSet<NodeId> = (0..3).collect();
        let report = validate_tree_structure(&children, &[0], &nodes);
        assert!(!report.is_healthy());
        assert!(report.issues.iter().any(|i| i.message.contains("Cycle")));
    }

    #[test]
    fn test_missing_child_is_error() {
        let children: BTreeMap<NodeId, Vec<NodeId>> = [(1, vec![0, 9])].into_iter().collect();
        let nodes: BTreeSet<NodeId> = (0..2).collect();
        let report = validate_tree_structure(&children, &[1], &nodes);
        assert!(!report.is_healthy());
    }

    #[test]
    fn test_attach_drift_is_a_warning() {
        let mut tree = Tree::new();
        tree.insert_node(Node::leaf(0, "a").with_embedding("m", vec![1.0])).unwrap();
        tree.insert_node(Node::leaf(1, "b").with_embedding("m", vec![1.0])).unwrap();
        tree.insert_node(Node::internal(2, "a", 1, [0]).with_embedding("m", vec![1.0])).unwrap();
        tree.insert_node(Node::internal(3, "top", 2, [2]).with_embedding("m", vec![1.0])).unwrap();
        // A layer-1 parent the top layer does not know about.
        tree.insert_node(Node::internal(4, "b", 1, [1]).with_embedding("m", vec![1.0])).unwrap();

        let report = tree.health_check();
        assert!(report.is_healthy(), "{report}");
        assert_eq!(report.unreachable, 2);
        assert!(report
            .validation
            .issues_at_level(Severity::Warning)
            .iter()
            .any(|i| i.message.contains("not reachable")));
    }

    #[test]
    fn test_health_after_build_and_ingest() {
        let b = builder(3, 4);
        let chunks: Vec<String> = (0..10).map(|i| format!("chunk {i}")).collect();
        let mut tree = b.build(&chunks).unwrap();
        let report = tree.health_check();
        assert!(report.is_healthy(), "{report}");
        assert_eq!(report.unreachable, 0);
        assert_eq!(report.layer_sizes, vec![10, 4, 2, 1]);

        let updater =
            IncrementalUpdater::from_builder(b, RaptorConfig::default().incremental).unwrap();
        updater.ingest(&mut tree, &["chunk 10", "chunk 11"]).unwrap();
        let report = tree.health_check();
        assert!(report.is_healthy(), "{report}");
        assert_eq!(report.unreachable, 0);
    }

    proptest! {
        #[test]
        fn prop_built_trees_are_healthy(
            items in proptest::collection::vec(".{1,40}", 1..60),
            fanout in 2usize..8,
            max_layers in 1usize..6,
        ) {
            let tree = builder(fanout, max_layers).build(&items).unwrap();
            let report = tree.health_check();
            prop_assert!(report.is_healthy(), "{}", report);
            prop_assert_eq!(report.unreachable, 0);
            prop_assert!(tree.num_layers() <= max_layers);
        }
    }
}
