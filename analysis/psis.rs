//! # Pareto-Smoothed Importance Sampling Leave-One-Out
//!
//! Approximates leave-one-out predictive density from a single posterior fit
//! (Vehtari, Gelman & Gabry 2017). For each observation the importance ratios
//! `1 / p(y_i | θ_s)` have their upper tail replaced by order statistics of a
//! generalized Pareto fit; the fitted shape `k` measures how trustworthy the
//! estimate is.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// k above this is questionable.
pub const K_QUESTIONABLE: f64 = 0.5;
/// k above this is problematic.
pub const K_PROBLEMATIC: f64 = 0.7;
/// k above this is unreliable.
pub const K_UNRELIABLE: f64 = 1.0;

const MIN_TAIL_LENGTH: usize = 5;
const GPD_MIN_GRID_POINTS: usize = 30;
const GPD_PRIOR: f64 = 3.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PsisError {
    #[error("The log-likelihood matrix is empty.")]
    Empty,
    #[error("Relative efficiencies have length {got}, expected {expected}.")]
    RelativeEfficiencyLength { expected: usize, got: usize },
    #[error("Log-likelihood for observation {0} contains NaN or +inf.")]
    InvalidLogLikelihood(usize),
}

/// Reliability class of one PSIS estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParetoKCategory {
    Good,
    Questionable,
    Problematic,
    Unreliable,
}

impl ParetoKCategory {
    pub fn classify(k: f64) -> Self {
        if k.is_nan() || k > K_UNRELIABLE {
            ParetoKCategory::Unreliable
        } else if k > K_PROBLEMATIC {
            ParetoKCategory::Problematic
        } else if k > K_QUESTIONABLE {
            ParetoKCategory::Questionable
        } else {
            ParetoKCategory::Good
        }
    }

    pub const ALL: [ParetoKCategory; 4] = [
        ParetoKCategory::Good,
        ParetoKCategory::Questionable,
        ParetoKCategory::Problematic,
        ParetoKCategory::Unreliable,
    ];
}

impl fmt::Display for ParetoKCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ParetoKCategory::Good => "good (k <= 0.5)",
            ParetoKCategory::Questionable => "questionable (0.5 < k <= 0.7)",
            ParetoKCategory::Problematic => "problematic (0.7 < k <= 1)",
            ParetoKCategory::Unreliable => "unreliable (k > 1)",
        };
        f.write_str(label)
    }
}

/// Generalized Pareto fit by the Zhang & Stephens (2009) empirical Bayes
/// procedure, with the weakly informative shrinkage of k toward 0.5.
/// `x` must be sorted ascending and non-negative. Returns `(k, sigma)`.
pub fn gpd_fit(x: &[f64]) -> (f64, f64) {
    let n = x.len();
    let nf = n as f64;
    let m = GPD_MIN_GRID_POINTS + (nf.sqrt().floor() as usize);
    let quartile = ((nf / 4.0 + 0.5).floor() as usize).clamp(1, n) - 1;
    let xstar = x[quartile];
    let x_max = x[n - 1];

    let theta: Vec<f64> = (1..=m)
        .map(|j| 1.0 / x_max + (1.0 - (m as f64 / (j as f64 - 0.5)).sqrt()) / GPD_PRIOR / xstar)
        .collect();
    let profile: Vec<f64> = theta
        .iter()
        .map(|&t| {
            let k = x.iter().map(|&xi| (-t * xi).ln_1p()).sum::<f64>() / nf;
            let l = nf * ((-t / k).ln() - k - 1.0);
            if l.is_nan() { f64::NEG_INFINITY } else { l }
        })
        .collect();
    let normalizer = log_sum_exp(&profile);
    let theta_hat: f64 = theta
        .iter()
        .zip(&profile)
        .map(|(&t, &l)| t * (l - normalizer).exp())
        .sum();

    let k = x.iter().map(|&xi| (-theta_hat * xi).ln_1p()).sum::<f64>() / nf;
    let sigma = -k / theta_hat;
    let k = k * nf / (nf + 10.0) + 5.0 / (nf + 10.0);
    (if k.is_nan() { f64::INFINITY } else { k }, sigma)
}

/// Quantile function of the generalized Pareto distribution.
fn gpd_quantile(p: f64, k: f64, sigma: f64) -> f64 {
    if k.abs() < 1e-12 {
        -sigma * (-p).ln_1p()
    } else {
        sigma * (-k * (-p).ln_1p()).exp_m1() / k
    }
}

pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Tail length used for the Pareto fit with `s` draws.
pub fn tail_length(s: usize, r_eff: f64) -> usize {
    let s = s as f64;
    (0.2 * s).min(3.0 * (s / r_eff).sqrt()).ceil() as usize
}

/// Smoothed, self-normalized log weights for one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct PsisWeights {
    pub log_weights: Vec<f64>,
    pub pareto_k: f64,
}

/// Pareto-smooths one vector of log importance ratios. Tails that are too
/// short or constant cannot be fit and get `k = inf`.
pub fn psis_smooth(log_ratios: &[f64], r_eff: f64) -> PsisWeights {
    let s = log_ratios.len();
    let max = log_ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut lw: Vec<f64> = log_ratios.iter().map(|v| v - max).collect();
    let mut khat = f64::INFINITY;

    let tail_len = tail_length(s, r_eff);
    if tail_len >= MIN_TAIL_LENGTH && tail_len < s {
        let mut order: Vec<usize> = (0..s).collect();
        order.sort_by(|&a, &b| lw[a].total_cmp(&lw[b]));
        let tail_ids = &order[s - tail_len..];
        let tail: Vec<f64> = tail_ids.iter().map(|&i| lw[i]).collect();
        let spread = tail[tail_len - 1] - tail[0];
        if spread.abs() >= f64::EPSILON / 100.0 {
            let cutoff = lw[order[s - tail_len - 1]];
            let exp_cutoff = cutoff.exp();
            let excess: Vec<f64> = tail.iter().map(|v| v.exp() - exp_cutoff).collect();
            let (k, sigma) = gpd_fit(&excess);
            if k.is_finite() && sigma.is_finite() && sigma > 0.0 {
                for (rank, &i) in tail_ids.iter().enumerate() {
                    let p = (rank as f64 + 0.5) / tail_len as f64;
                    lw[i] = (gpd_quantile(p, k, sigma) + exp_cutoff).ln();
                }
            }
            khat = k;
        }
    }

    for v in lw.iter_mut() {
        if *v > 0.0 {
            *v = 0.0;
        }
    }
    let normalizer = log_sum_exp(&lw);
    for v in lw.iter_mut() {
        *v -= normalizer;
    }
    PsisWeights {
        log_weights: lw,
        pareto_k: khat,
    }
}

/// Pointwise PSIS-LOO quantities for one observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LooPointwise {
    pub elpd_loo: f64,
    pub p_loo: f64,
    pub looic: f64,
    pub pareto_k: f64,
    pub category: ParetoKCategory,
}

/// Totals with standard errors `sqrt(N · var(pointwise))`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LooResult {
    pub elpd_loo: f64,
    pub se_elpd_loo: f64,
    pub p_loo: f64,
    pub se_p_loo: f64,
    pub looic: f64,
    pub se_looic: f64,
    #[serde(skip)]
    pub pointwise: Vec<LooPointwise>,
}

impl LooResult {
    pub fn n_obs(&self) -> usize {
        self.pointwise.len()
    }

    pub fn pareto_k(&self) -> Vec<f64> {
        self.pointwise.iter().map(|p| p.pareto_k).collect()
    }

    /// Observation count per k category, in `ParetoKCategory::ALL` order.
    pub fn category_counts(&self) -> [usize; 4] {
        let mut counts = [0; 4];
        for point in &self.pointwise {
            counts[point.category as usize] += 1;
        }
        counts
    }

    /// Indices of observations with k above the questionable threshold.
    pub fn flagged(&self) -> Vec<usize> {
        self.pointwise
            .iter()
            .enumerate()
            .filter(|(_, p)| p.category != ParetoKCategory::Good)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn elpd_pointwise(&self) -> Vec<f64> {
        self.pointwise.iter().map(|p| p.elpd_loo).collect()
    }
}

fn total_and_se(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count() as f64;
    let total: f64 = values.clone().sum();
    if n < 2.0 {
        return (total, f64::NAN);
    }
    let mean = total / n;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (total, (n * var).sqrt())
}

/// PSIS-LOO from an `S × N` log-likelihood matrix (draws by observations)
/// and one relative efficiency per observation.
pub fn psis_loo(log_lik: ArrayView2<f64>, r_eff: &[f64]) -> Result<LooResult, PsisError> {
    let (s, n) = log_lik.dim();
    if s == 0 || n == 0 {
        return Err(PsisError::Empty);
    }
    if r_eff.len() != n {
        return Err(PsisError::RelativeEfficiencyLength {
            expected: n,
            got: r_eff.len(),
        });
    }

    let mut pointwise = Vec::with_capacity(n);
    for (i, column) in log_lik.axis_iter(Axis(1)).enumerate() {
        if column.iter().any(|v| v.is_nan() || *v == f64::INFINITY) {
            return Err(PsisError::InvalidLogLikelihood(i));
        }
        pointwise.push(loo_point(column, r_eff[i]));
    }

    let (elpd_loo, se_elpd_loo) = total_and_se(pointwise.iter().map(|p| p.elpd_loo));
    let (p_loo, se_p_loo) = total_and_se(pointwise.iter().map(|p| p.p_loo));
    let (looic, se_looic) = total_and_se(pointwise.iter().map(|p| p.looic));
    Ok(LooResult {
        elpd_loo,
        se_elpd_loo,
        p_loo,
        se_p_loo,
        looic,
        se_looic,
        pointwise,
    })
}

fn loo_point(log_lik: ArrayView1<f64>, r_eff: f64) -> LooPointwise {
    let ll: Vec<f64> = log_lik.to_vec();
    let log_ratios: Vec<f64> = ll.iter().map(|v| -v).collect();
    let r_eff = if r_eff.is_finite() && r_eff > 0.0 { r_eff } else { 1.0 };
    let weights = psis_smooth(&log_ratios, r_eff);

    let weighted: Vec<f64> = ll
        .iter()
        .zip(&weights.log_weights)
        .map(|(l, w)| l + w)
        .collect();
    let elpd_loo = log_sum_exp(&weighted);
    let lpd = log_sum_exp(&ll) - (ll.len() as f64).ln();
    LooPointwise {
        elpd_loo,
        p_loo: lpd - elpd_loo,
        looic: -2.0 * elpd_loo,
        pareto_k: weights.pareto_k,
        category: ParetoKCategory::classify(weights.pareto_k),
    }
}

/// Stacks per-chain `draws × N` matrices into one `S × N` matrix, chain-major.
pub fn stack_chains(chains: &[Array2<f64>]) -> Option<Array2<f64>> {
    let views: Vec<_> = chains.iter().map(|c| c.view()).collect();
    ndarray::concatenate(Axis(0), &views).ok()
}
