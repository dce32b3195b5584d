//! Manifold projection of embeddings (Isomap).
//!
//! Mixture models in a thousand-odd dimensions are hopeless: every point is
//! roughly equidistant from every other. Projecting onto a handful of
//! dimensions that preserve *geodesic* distances keeps topical neighborhoods
//! intact while making the densities estimable.
//!
//! ```text
//!  embeddings ──L2 normalize──► kNN graph ──Dijkstra──► geodesic matrix G
//!                                                            │
//!  coordinates ◄── top eigenpairs ◄── B = -½ J (G∘G) J ◄─────┘
//! ```
//!
//! | Step | Detail |
//! |------|--------|
//! | Graph | symmetric kNN over Euclidean distance of unit vectors (`petgraph::UnGraph`) |
//! | Geodesics | `petgraph::algo::dijkstra` from every node (parallel with `parallel`) |
//! | Disconnected pairs | `max finite geodesic + direct distance` |
//! | Eigenpairs | `faer` self-adjoint eigendecomposition of B |
//!
//! Eigenvector signs are fixed (largest-magnitude entry positive) so the
//! same input always yields the same coordinates.

use faer::{Mat, Side};
use ndarray::{Array1, Array2};
use petgraph::algo::dijkstra;
use petgraph::graph::{NodeIndex, UnGraph};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{Error, Result};

/// Isomap projection.
#[derive(Debug, Clone)]
pub struct Isomap {
    n_components: usize,
    n_neighbors: usize,
}

impl Isomap {
    /// Project to `n_components` dimensions over a `n_neighbors` graph.
    pub fn new(n_components: usize, n_neighbors: usize) -> Self {
        Self {
            n_components,
            n_neighbors,
        }
    }

    /// Compute `n × n_components` coordinates for `data`.
    pub fn fit_transform(&self, data: &[Vec<f32>]) -> Result<Array2<f64>> {
        let n = data.len();
        if n == 0 {
            return Err(Error::EmptyInput);
        }
        let d = data[0].len();
        if let Some(bad) = data.iter().find(|v| v.len() != d) {
            return Err(Error::DimensionMismatch {
                expected: d,
                found: bad.len(),
            });
        }
        if self.n_components == 0 {
            return Err(Error::invalid("n_components", "must be > 0"));
        }
        let m = self.n_components.min(n);
        if n == 1 {
            return Ok(Array2::zeros((1, m)));
        }

        let points = normalized(data);
        let direct = pairwise_distances(&points);
        let k = self.n_neighbors.clamp(1, n - 1);
        let graph = knn_graph(&direct, k);
        let geodesic = geodesic_distances(&graph, &direct);
        let gram = double_center_squared(&geodesic);

        let (values, vectors) = top_eigenpairs(&gram, m)?;
        let mut coords = Array2::zeros((n, m));
        for j in 0..m {
            let scale = values[j].max(0.0).sqrt();
            for i in 0..n {
                coords[[i, j]] = vectors[[i, j]] * scale;
            }
        }
        Ok(coords)
    }
}

fn normalized(data: &[Vec<f32>]) -> Vec<Vec<f64>> {
    data.iter()
        .map(|v| {
            let norm = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
            if norm > 0.0 {
                v.iter().map(|&x| x as f64 / norm).collect()
            } else {
                vec![0.0; v.len()]
            }
        })
        .collect()
}

fn pairwise_distances(points: &[Vec<f64>]) -> Array2<f64> {
    let n = points.len();
    let mut dist = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = points[i]
                .iter()
                .zip(&points[j])
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            dist[[i, j]] = d;
            dist[[j, i]] = d;
        }
    }
    dist
}

/// Symmetric kNN graph weighted by direct distance. Ties break toward the
/// lower index. Node `i` of the graph is item `i`.
fn knn_graph(dist: &Array2<f64>, k: usize) -> UnGraph<(), f64> {
    let n = dist.nrows();
    let mut graph = UnGraph::with_capacity(n, n * k);
    let nodes: Vec<NodeIndex> = (0..n).map(|_| graph.add_node(())).collect();
    for i in 0..n {
        let mut order: Vec<usize> = (0..n).filter(|&j| j != i).collect();
        order.sort_by(|&a, &b| dist[[i, a]].total_cmp(&dist[[i, b]]).then(a.cmp(&b)));
        for &j in order.iter().take(k) {
            // update_edge keeps a mutual neighbor pair to one edge.
            let _ = graph.update_edge(nodes[i], nodes[j], dist[[i, j]]);
        }
    }
    graph
}

fn shortest_paths(graph: &UnGraph<(), f64>, source: usize) -> Vec<f64> {
    let reached = dijkstra(graph, NodeIndex::new(source), None, |edge| *edge.weight());
    let mut row = vec![f64::INFINITY; graph.node_count()];
    for (node, d) in reached {
        row[node.index()] = d;
    }
    row
}

/// All-pairs shortest paths over the graph. Pairs in different components
/// get the largest finite geodesic plus their direct distance.
fn geodesic_distances(graph: &UnGraph<(), f64>, direct: &Array2<f64>) -> Array2<f64> {
    let n = graph.node_count();

    #[cfg(feature = "parallel")]
    let rows: Vec<Vec<f64>> = (0..n).into_par_iter().map(|s| shortest_paths(graph, s)).collect();

    #[cfg(not(feature = "parallel"))]
    let rows: Vec<Vec<f64>> = (0..n).map(|s| shortest_paths(graph, s)).collect();

    let max_finite = rows
        .iter()
        .flatten()
        .copied()
        .filter(|d| d.is_finite())
        .fold(0.0, f64::max);

    let mut g = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            let d = rows[i][j];
            g[[i, j]] = if d.is_finite() {
                d
            } else {
                max_finite + direct[[i, j]]
            };
        }
    }
    // Dijkstra is symmetric up to rounding; make it exact.
    let gt = g.t().to_owned();
    (g + gt) * 0.5
}

/// Classical MDS kernel: `B = -½ J (G∘G) J`.
fn double_center_squared(g: &Array2<f64>) -> Array2<f64> {
    let n = g.nrows();
    let sq = g.mapv(|d| d * d);
    let row_means: Array1<f64> = sq.rows().into_iter().map(|r| r.sum() / n as f64).collect();
    let grand = row_means.sum() / n as f64;
    Array2::from_shape_fn((n, n), |(i, j)| {
        -0.5 * (sq[[i, j]] - row_means[i] - row_means[j] + grand)
    })
}

/// Largest `m` eigenpairs of symmetric `b`, descending by eigenvalue.
fn top_eigenpairs(b: &Array2<f64>, m: usize) -> Result<(Vec<f64>, Array2<f64>)> {
    let n = b.nrows();
    let mat = Mat::<f64>::from_fn(n, n, |i, j| b[[i, j]]);
    let evd = mat.selfadjoint_eigendecomposition(Side::Lower);
    let (s, u) = (evd.s(), evd.u());

    let values: Vec<f64> = (0..n).map(|i| s.column_vector().read(i)).collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::Clustering("eigen-solver produced non-finite values".into()));
    }

    // faer returns eigenvalues in ascending order.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));

    let mut top_values = Vec::with_capacity(m);
    let mut top_vectors = Array2::zeros((n, m));
    for (slot, &idx) in order.iter().take(m).enumerate() {
        top_values.push(values[idx]);
        let mut col: Array1<f64> = (0..n).map(|i| u.read(i, idx)).collect();
        let pivot = col
            .iter()
            .fold(0.0f64, |acc, &x| if x.abs() > acc.abs() + 1e-12 { x } else { acc });
        if pivot < 0.0 {
            col.mapv_inplace(|x| -x);
        }
        top_vectors.column_mut(slot).assign(&col);
    }
    Ok((top_values, top_vectors))
}
