//! Gaussian Mixture Model clustering.
//!
//! GMM provides **soft clustering** with probabilistic assignments,
//! allowing items to belong to multiple clusters with different probabilities.
//!
//! # The Probabilistic Model
//!
//! GMM assumes data is generated from K Gaussian distributions:
//!
//! ```text
//! P(x) = Σₖ πₖ × N(x | μₖ, Σₖ)
//! ```
//!
//! Covariances here are diagonal: one variance per component and dimension.
//!
//! # The EM Algorithm
//!
//! **E-step**: Compute "responsibilities" (soft assignments):
//! ```text
//! γₙₖ = P(z=k | xₙ) = πₖ × N(xₙ | μₖ, Σₖ) / Σⱼ πⱼ × N(xₙ | μⱼ, Σⱼ)
//! ```
//!
//! **M-step**: Update parameters using responsibilities:
//! - μₖ = Σₙ γₙₖ xₙ / Σₙ γₙₖ  (weighted mean)
//! - σ²ₖ = Σₙ γₙₖ (xₙ - μₖ)² / Σₙ γₙₖ + floor
//! - πₖ = (1/N) Σₙ γₙₖ  (fraction of responsibility)
//!
//! EM stops once the mean log-likelihood moves by less than `tol`.
//!
//! # Choosing K
//!
//! [`select_by_bic`] fits every K in `1..=max_k` and keeps the lowest
//!
//! ```text
//! BIC = -2 ln L + p ln N,   p = 2Kd + K - 1
//! ```
//!
//! # Failure Modes
//!
//! - **Local optima**: EM converges to local maxima; k-means++ seeding helps
//! - **Singular covariance**: a component sitting on one point collapses its
//!   variance. The floor is `reg_covar + covariance_floor × total variance`,
//!   which keeps such components from winning the BIC sweep on small inputs
//! - **Wrong K**: Too many components overfit; too few underfit

use ndarray::{Array1, Array2, ArrayView1};
use rand::prelude::*;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{Error, Result};

/// Gaussian Mixture Model clustering.
#[derive(Debug, Clone)]
pub struct Gmm {
    /// Number of components (clusters).
    n_components: usize,
    /// Maximum EM iterations.
    max_iter: usize,
    /// Convergence tolerance on the mean log-likelihood.
    tol: f64,
    /// Random seed.
    seed: Option<u64>,
    /// Absolute regularization for variances.
    reg_covar: f64,
    /// Variance floor relative to the data's total variance.
    covariance_floor: f64,
}

/// Parameters and responsibilities of a fitted mixture.
#[derive(Debug, Clone)]
pub struct GmmFit {
    /// Component means, `k × d`.
    pub means: Array2<f64>,
    /// Diagonal variances, `k × d`.
    pub variances: Array2<f64>,
    /// Mixing weights, length `k`.
    pub weights: Array1<f64>,
    /// Responsibilities, `n × k`; rows sum to one.
    pub responsibilities: Array2<f64>,
    /// Total log-likelihood of the data.
    pub log_likelihood: f64,
    /// EM iterations run.
    pub n_iter: usize,
    /// Whether EM met the tolerance before the iteration cap.
    pub converged: bool,
}

impl GmmFit {
    /// Number of components.
    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    /// Bayesian Information Criterion (lower is better).
    pub fn bic(&self) -> f64 {
        let n = self.responsibilities.nrows() as f64;
        let k = self.means.nrows() as f64;
        let d = self.means.ncols() as f64;
        let params = 2.0 * k * d + (k - 1.0);
        -2.0 * self.log_likelihood + params * n.ln()
    }

    /// Component set of each item.
    ///
    /// An item belongs to every component whose responsibility exceeds
    /// `threshold`. An item with no such component belongs to its most
    /// responsible one, so every item lands in at least one cluster.
    pub fn memberships(&self, threshold: f64) -> Vec<Vec<usize>> {
        self.responsibilities
            .rows()
            .into_iter()
            .map(|row| {
                let above: Vec<usize> = row
                    .iter()
                    .enumerate()
                    .filter(|(_, &p)| p > threshold)
                    .map(|(c, _)| c)
                    .collect();
                if above.is_empty() {
                    vec![argmax(&row)]
                } else {
                    above
                }
            })
            .collect()
    }

    /// Hard assignment (arg-max responsibility).
    pub fn labels(&self) -> Vec<usize> {
        self.responsibilities.rows().into_iter().map(|row| argmax(&row)).collect()
    }
}

fn argmax(row: &ArrayView1<'_, f64>) -> usize {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

impl Gmm {
    /// Create a new GMM with specified number of components.
    pub fn new() -> Self {
        Self {
            n_components: 8,
            max_iter: 100,
            tol: 1e-3,
            seed: None,
            reg_covar: 1e-6,
            covariance_floor: 0.0,
        }
    }

    /// Set number of components.
    pub fn with_n_components(mut self, n: usize) -> Self {
        self.n_components = n;
        self
    }

    /// Set maximum iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set convergence tolerance.
    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    /// Set (or clear) random seed.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Set the relative variance floor.
    pub fn with_covariance_floor(mut self, fraction: f64) -> Self {
        self.covariance_floor = fraction;
        self
    }

    /// Number of components this model fits.
    pub fn n_components(&self) -> usize {
        self.n_components
    }

    /// Compute log-likelihood of a point under a diagonal Gaussian.
    fn log_gaussian(
        point: &ArrayView1<'_, f64>,
        mean: &ArrayView1<'_, f64>,
        var: &ArrayView1<'_, f64>,
    ) -> f64 {
        let d = point.len() as f64;
        let mut log_prob = -0.5 * d * (2.0 * std::f64::consts::PI).ln();

        for i in 0..point.len() {
            let diff = point[i] - mean[i];
            log_prob -= 0.5 * var[i].ln();
            log_prob -= 0.5 * diff * diff / var[i];
        }

        log_prob
    }

    /// Log-sum-exp for numerical stability.
    fn logsumexp(values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NEG_INFINITY;
        }
        let max_val = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max_val.is_infinite() {
            return max_val;
        }
        max_val
            + values
                .iter()
                .map(|&v| (v - max_val).exp())
                .sum::<f64>()
                .ln()
    }

    /// k-means++ seeding of the component means.
    fn init_means(data: &Array2<f64>, k: usize, rng: &mut impl Rng) -> Array2<f64> {
        let n = data.nrows();
        let d = data.ncols();
        let mut means = Array2::zeros((k, d));

        // First mean: random point
        let first = rng.random_range(0..n);
        means.row_mut(0).assign(&data.row(first));

        for i in 1..k {
            let distances: Vec<f64> = (0..n)
                .map(|j| {
                    let point = data.row(j);
                    (0..i)
                        .map(|c| {
                            point
                                .iter()
                                .zip(means.row(c).iter())
                                .map(|(a, b)| (a - b).powi(2))
                                .sum::<f64>()
                        })
                        .fold(f64::MAX, f64::min)
                })
                .collect();

            // Sample proportional to squared distance
            let total: f64 = distances.iter().sum();
            if total <= 0.0 {
                let idx = rng.random_range(0..n);
                means.row_mut(i).assign(&data.row(idx));
                continue;
            }

            let threshold = rng.random::<f64>() * total;
            let mut cumsum = 0.0;
            let mut selected = n - 1;
            for (j, &dist) in distances.iter().enumerate() {
                cumsum += dist;
                if cumsum >= threshold && dist > 0.0 {
                    selected = j;
                    break;
                }
            }

            means.row_mut(i).assign(&data.row(selected));
        }

        means
    }

    /// E-step. Fills `resp` and returns the total log-likelihood.
    fn expectation(
        data: &Array2<f64>,
        means: &Array2<f64>,
        variances: &Array2<f64>,
        weights: &Array1<f64>,
        resp: &mut Array2<f64>,
    ) -> f64 {
        let k = weights.len();
        let mut total = 0.0;
        let mut log_probs = vec![0.0; k];
        for i in 0..data.nrows() {
            let point = data.row(i);
            for c in 0..k {
                log_probs[c] = weights[c].max(f64::MIN_POSITIVE).ln()
                    + Self::log_gaussian(&point, &means.row(c), &variances.row(c));
            }
            let log_sum = Self::logsumexp(&log_probs);
            for c in 0..k {
                resp[[i, c]] = (log_probs[c] - log_sum).exp();
            }
            total += log_sum;
        }
        total
    }

    /// Fit the mixture to `data` (`n × d`).
    pub fn fit(&self, data: &Array2<f64>) -> Result<GmmFit> {
        let n = data.nrows();
        let d = data.ncols();
        if n == 0 {
            return Err(Error::EmptyInput);
        }
        let k = self.n_components.min(n);
        if k == 0 {
            return Err(Error::invalid("n_components", "must be > 0"));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(Error::Clustering("non-finite value in mixture input".into()));
        }

        // Per-dimension data variance drives both the initial variances and the floor.
        let data_mean = data
            .mean_axis(ndarray::Axis(0))
            .ok_or_else(|| Error::Clustering("cannot average empty data".into()))?;
        let data_var: Array1<f64> = (0..d)
            .map(|j| {
                data.column(j)
                    .iter()
                    .map(|&x| (x - data_mean[j]).powi(2))
                    .sum::<f64>()
                    / n as f64
            })
            .collect();
        let floor = self.reg_covar + self.covariance_floor * data_var.sum();

        let mut rng: Box<dyn RngCore> = match self.seed {
            Some(s) => Box::new(StdRng::seed_from_u64(s)),
            None => Box::new(rand::rng()),
        };

        let mut means = Self::init_means(data, k, &mut rng);
        let mut variances = Array2::from_shape_fn((k, d), |(_, j)| data_var[j] + floor);
        let mut weights = Array1::from_elem(k, 1.0 / k as f64);
        let mut resp = Array2::zeros((n, k));

        let mut prev_mean_ll = f64::NEG_INFINITY;
        let mut log_likelihood = f64::NEG_INFINITY;
        let mut converged = false;
        let mut n_iter = 0;

        for _iter in 0..self.max_iter {
            n_iter += 1;
            log_likelihood = Self::expectation(data, &means, &variances, &weights, &mut resp);
            let mean_ll = log_likelihood / n as f64;
            if (mean_ll - prev_mean_ll).abs() < self.tol {
                converged = true;
                break;
            }
            prev_mean_ll = mean_ll;

            // M-step: update parameters
            let resp_sum: Vec<f64> = (0..k).map(|c| resp.column(c).sum()).collect();
            let total: f64 = resp_sum.iter().sum();

            for c in 0..k {
                weights[c] = resp_sum[c] / total;
            }

            let mut new_means = Array2::zeros((k, d));
            for c in 0..k {
                if resp_sum[c] > 1e-10 {
                    for i in 0..n {
                        for j in 0..d {
                            new_means[[c, j]] += resp[[i, c]] * data[[i, j]];
                        }
                    }
                    for j in 0..d {
                        new_means[[c, j]] /= resp_sum[c];
                    }
                } else {
                    new_means.row_mut(c).assign(&means.row(c));
                }
            }

            let mut new_variances = Array2::from_elem((k, d), floor);
            for c in 0..k {
                if resp_sum[c] > 1e-10 {
                    for j in 0..d {
                        let mut acc = 0.0;
                        for i in 0..n {
                            let diff = data[[i, j]] - new_means[[c, j]];
                            acc += resp[[i, c]] * diff * diff;
                        }
                        new_variances[[c, j]] = acc / resp_sum[c] + floor;
                    }
                } else {
                    new_variances.row_mut(c).assign(&variances.row(c));
                }
            }

            means = new_means;
            variances = new_variances;
        }

        if !converged {
            log_likelihood = Self::expectation(data, &means, &variances, &weights, &mut resp);
        }

        if !log_likelihood.is_finite() {
            return Err(Error::Clustering(format!(
                "mixture with {k} components produced a non-finite likelihood"
            )));
        }

        Ok(GmmFit {
            means,
            variances,
            weights,
            responsibilities: resp,
            log_likelihood,
            n_iter,
            converged,
        })
    }
}

impl Default for Gmm {
    fn default() -> Self {
        Self::new()
    }
}

/// Fit `template` with every component count in `1..=max_k` and keep the
/// lowest BIC. Ties go to the smaller count, so the choice does not depend on
/// evaluation order.
pub fn select_by_bic(data: &Array2<f64>, max_k: usize, template: &Gmm) -> Result<GmmFit> {
    let n = data.nrows();
    if n == 0 {
        return Err(Error::EmptyInput);
    }
    let max_k = max_k.clamp(1, n);

    #[cfg(feature = "parallel")]
    let fits: Vec<Result<GmmFit>> = (1..=max_k)
        .into_par_iter()
        .map(|k| template.clone().with_n_components(k).fit(data))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let fits: Vec<Result<GmmFit>> = (1..=max_k)
        .map(|k| template.clone().with_n_components(k).fit(data))
        .collect();

    let mut best: Option<(f64, GmmFit)> = None;
    let mut last_err = None;
    for fit in fits {
        match fit {
            Ok(fit) => {
                let bic = fit.bic();
                if !bic.is_finite() {
                    continue;
                }
                let better = best.as_ref().map_or(true, |(b, _)| bic < *b);
                if better {
                    best = Some((bic, fit));
                }
            }
            Err(e) => last_err = Some(e),
        }
    }

    match (best, last_err) {
        (Some((_, fit)), _) => Ok(fit),
        (None, Some(err)) => Err(err),
        (None, None) => Err(Error::Clustering("no mixture produced a finite BIC".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_blobs() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [0.1, 0.1],
            [0.0, 0.1],
            [10.0, 10.0],
            [10.1, 10.1],
            [10.0, 10.1],
        ]
    }

    #[test]
    fn test_gmm_basic() {
        let gmm = Gmm::new().with_n_components(2).with_seed(Some(42));
        let labels = gmm.fit(&two_blobs()).unwrap().labels();

        // Should find 2 clusters
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn test_gmm_soft_assignments() {
        let data = array![
            [0.0, 0.0],
            [5.0, 5.0], // Point between clusters
            [10.0, 10.0],
        ];

        let gmm = Gmm::new().with_n_components(2).with_seed(Some(42));
        let fit = gmm.fit(&data).unwrap();

        // Each row should sum to ~1
        for row in fit.responsibilities.rows() {
            let sum: f64 = row.sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_membership_falls_back_to_argmax() {
        let fit = GmmFit {
            means: Array2::zeros((3, 1)),
            variances: Array2::ones((3, 1)),
            weights: array![0.34, 0.33, 0.33],
            responsibilities: array![[0.34, 0.33, 0.33], [0.9, 0.05, 0.05], [0.5, 0.45, 0.05]],
            log_likelihood: 0.0,
            n_iter: 1,
            converged: true,
        };
        let members = fit.memberships(0.4);
        assert_eq!(members[0], vec![0]); // nothing above 0.4
        assert_eq!(members[1], vec![0]);
        assert_eq!(members[2], vec![0, 1]); // boundary point joins both
    }

    #[test]
    fn test_bic_prefers_two_components_for_two_blobs() {
        let template = Gmm::new().with_seed(Some(7)).with_covariance_floor(1e-3);
        let fit = select_by_bic(&two_blobs(), 5, &template).unwrap();
        assert_eq!(fit.n_components(), 2);
    }

    #[test]
    fn test_bic_single_blob_keeps_one_component() {
        let data = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        let template = Gmm::new().with_seed(Some(7)).with_covariance_floor(1e-3);
        let fit = select_by_bic(&data, 3, &template).unwrap();
        assert_eq!(fit.n_components(), 1);
    }

    #[test]
    fn test_seeded_fit_is_deterministic() {
        let template = Gmm::new().with_seed(Some(3)).with_covariance_floor(1e-3);
        let a = select_by_bic(&two_blobs(), 5, &template).unwrap();
        let b = select_by_bic(&two_blobs(), 5, &template).unwrap();
        assert_eq!(a.responsibilities, b.responsibilities);
        assert_eq!(a.means, b.means);
    }

    #[test]
    fn test_empty_input() {
        let data: Array2<f64> = Array2::zeros((0, 2));
        assert!(matches!(Gmm::new().fit(&data), Err(Error::EmptyInput)));
    }
}
