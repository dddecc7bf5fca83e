//! Convergence diagnostics and interval summaries for multi-chain draws.

use crate::hmc::ChainStats;
use itertools::Itertools;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiagnosticError {
    #[error("No draws were supplied.")]
    NoDraws,
    #[error("Chains have unequal lengths ({first} vs {other}).")]
    UnequalChains { first: usize, other: usize },
    #[error("Interval mass must lie in (0, 1), got {0}.")]
    InvalidMass(f64),
    #[error("Draws contain non-finite values.")]
    NonFiniteDraws,
}

fn check_chains(chains: &[ArrayView1<f64>]) -> Result<usize, DiagnosticError> {
    let first = chains.first().ok_or(DiagnosticError::NoDraws)?.len();
    if first == 0 {
        return Err(DiagnosticError::NoDraws);
    }
    if let Some(other) = chains.iter().map(|c| c.len()).find(|&n| n != first) {
        return Err(DiagnosticError::UnequalChains { first, other });
    }
    Ok(first)
}

/// Splits every chain into halves, dropping the middle draw of odd chains.
fn split_chains(chains: &[ArrayView1<f64>]) -> Vec<Vec<f64>> {
    let mut halves = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        let half = chain.len() / 2;
        let offset = chain.len() - half;
        halves.push(chain.iter().take(half).copied().collect());
        halves.push(chain.iter().skip(offset).copied().collect());
    }
    halves
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() as f64 - 1.0)
}

/// Split R-hat (Gelman et al., BDA3 §11.4). NaN when there are fewer than
/// four draws per chain or the draws are constant.
pub fn split_rhat(chains: &[ArrayView1<f64>]) -> Result<f64, DiagnosticError> {
    let n_draws = check_chains(chains)?;
    if n_draws < 4 {
        return Ok(f64::NAN);
    }
    let halves = split_chains(chains);
    let n = halves[0].len() as f64;
    let means: Vec<f64> = halves.iter().map(|h| mean(h)).collect();
    let within = mean(&halves.iter().map(|h| sample_variance(h)).collect::<Vec<_>>());
    let between = n * sample_variance(&means);
    if !(within > 0.0) {
        return Ok(f64::NAN);
    }
    let var_plus = (n - 1.0) / n * within + between / n;
    Ok((var_plus / within).sqrt())
}

/// Autocovariance at `lag`, normalized by the series length.
fn autocovariance(values: &[f64], center: f64, lag: usize) -> f64 {
    let n = values.len();
    values[..n - lag]
        .iter()
        .zip(&values[lag..])
        .map(|(a, b)| (a - center) * (b - center))
        .sum::<f64>()
        / n as f64
}

/// Multi-chain bulk effective sample size on split chains, using Geyer's
/// initial monotone sequence as in Stan. Capped at `S·log10(S)` for `S`
/// total draws. Lags are computed on demand, since the sequence usually
/// truncates after a few dozen.
pub fn effective_sample_size(chains: &[ArrayView1<f64>]) -> Result<f64, DiagnosticError> {
    let n_draws = check_chains(chains)?;
    if n_draws < 4 {
        return Ok(f64::NAN);
    }
    let halves = split_chains(chains);
    let m = halves.len();
    let n = halves[0].len();
    let nf = n as f64;

    let means: Vec<f64> = halves.iter().map(|h| mean(h)).collect();
    let mean_acov = |lag: usize| -> f64 {
        halves
            .iter()
            .zip(&means)
            .map(|(h, &c)| autocovariance(h, c, lag))
            .sum::<f64>()
            / m as f64
    };

    let mean_var = mean_acov(0) * nf / (nf - 1.0);
    let mut var_plus = mean_var * (nf - 1.0) / nf;
    if m > 1 {
        var_plus += sample_variance(&means);
    }
    if !(var_plus > 0.0) || !var_plus.is_finite() {
        return Ok(f64::NAN);
    }

    let mut rho = vec![0.0; n];
    let mut rho_even = 1.0;
    rho[0] = rho_even;
    let mut rho_odd = 1.0 - (mean_var - mean_acov(1)) / var_plus;
    rho[1] = rho_odd;

    let mut t = 1;
    while t + 4 < n && rho_even + rho_odd > 0.0 {
        rho_even = 1.0 - (mean_var - mean_acov(t + 1)) / var_plus;
        rho_odd = 1.0 - (mean_var - mean_acov(t + 2)) / var_plus;
        if rho_even + rho_odd >= 0.0 {
            rho[t + 1] = rho_even;
            rho[t + 2] = rho_odd;
        }
        t += 2;
    }
    let max_t = t;
    if rho_even > 0.0 && max_t + 1 < n {
        rho[max_t + 1] = rho_even;
    }

    let mut t = 1;
    while t + 3 <= max_t {
        if rho[t + 1] + rho[t + 2] > rho[t - 1] + rho[t] {
            rho[t + 1] = (rho[t - 1] + rho[t]) / 2.0;
            rho[t + 2] = rho[t + 1];
        }
        t += 2;
    }

    let total = (m * n) as f64;
    let tail = if max_t + 1 < n { rho[max_t + 1] } else { 0.0 };
    let tau = -1.0 + 2.0 * rho[..max_t].iter().sum::<f64>() + tail;
    Ok((total / tau).min(total * total.log10()))
}

/// Highest posterior density interval: the narrowest window containing
/// `floor(mass · n)` sorted draws.
pub fn hpdi(values: &[f64], mass: f64) -> Result<(f64, f64), DiagnosticError> {
    if !(mass > 0.0 && mass < 1.0) {
        return Err(DiagnosticError::InvalidMass(mass));
    }
    if values.is_empty() {
        return Err(DiagnosticError::NoDraws);
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DiagnosticError::NonFiniteDraws);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let width = ((mass * n as f64).floor() as usize).clamp(1, n);
    let intervals = n - width + 1;
    let best = (0..intervals)
        .min_by(|&a, &b| {
            (sorted[a + width - 1] - sorted[a]).total_cmp(&(sorted[b + width - 1] - sorted[b]))
        })
        .unwrap_or(0);
    Ok((sorted[best], sorted[best + width - 1]))
}

/// Limits beyond which a parameter is flagged as not converged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConvergenceThresholds {
    pub max_rhat: f64,
    /// Minimum of ESS divided by the total number of draws.
    pub min_ess_ratio: f64,
}

impl Default for ConvergenceThresholds {
    fn default() -> Self {
        Self {
            max_rhat: 1.01,
            min_ess_ratio: 0.05,
        }
    }
}

/// Posterior summary of one named parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub hdi_lower: f64,
    pub hdi_upper: f64,
    pub rhat: f64,
    pub ess: f64,
    pub ess_ratio: f64,
}

impl ParameterSummary {
    pub fn from_chains(
        name: &str,
        chains: &[ArrayView1<f64>],
        hdi_prob: f64,
    ) -> Result<Self, DiagnosticError> {
        check_chains(chains)?;
        let pooled: Vec<f64> = chains.iter().flat_map(|c| c.iter().copied()).collect();
        let (hdi_lower, hdi_upper) = hpdi(&pooled, hdi_prob)?;
        let ess = effective_sample_size(chains)?;
        let sd = if pooled.len() > 1 {
            sample_variance(&pooled).sqrt()
        } else {
            0.0
        };
        Ok(Self {
            name: name.to_string(),
            mean: mean(&pooled),
            sd,
            hdi_lower,
            hdi_upper,
            rhat: split_rhat(chains)?,
            ess,
            ess_ratio: ess / pooled.len() as f64,
        })
    }

    /// True when both R-hat and the ESS ratio are within limits. NaN
    /// diagnostics count as failures.
    pub fn within(&self, thresholds: &ConvergenceThresholds) -> bool {
        self.rhat <= thresholds.max_rhat && self.ess_ratio >= thresholds.min_ess_ratio
    }
}

/// A chain that changes position on fewer than this share of its draws is
/// treated as stuck.
pub const MIN_MOVE_RATE: f64 = 0.2;

/// Whether a fit can be trusted, with the parameters that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub thresholds: ConvergenceThresholds,
    pub max_rhat: f64,
    pub min_ess_ratio: f64,
    pub flagged: Vec<String>,
    /// Chains whose move rate is below [`MIN_MOVE_RATE`].
    pub stuck_chains: Vec<usize>,
    pub converged: bool,
}

impl ConvergenceReport {
    pub fn new(
        summaries: &[ParameterSummary],
        stats: &[ChainStats],
        thresholds: ConvergenceThresholds,
    ) -> Self {
        let flagged: Vec<String> = summaries
            .iter()
            .filter(|s| !s.within(&thresholds))
            .map(|s| s.name.clone())
            .collect();
        let max_rhat = summaries
            .iter()
            .map(|s| s.rhat)
            .fold(f64::NEG_INFINITY, |acc, r| if r.is_nan() { f64::NAN } else { acc.max(r) });
        let min_ess_ratio = summaries
            .iter()
            .map(|s| s.ess_ratio)
            .fold(f64::INFINITY, |acc, r| if r.is_nan() { f64::NAN } else { acc.min(r) });
        let stuck_chains: Vec<usize> = stats
            .iter()
            .filter(|s| !(s.move_rate >= MIN_MOVE_RATE))
            .map(|s| s.chain)
            .collect();
        Self {
            thresholds,
            max_rhat,
            min_ess_ratio,
            converged: flagged.is_empty() && stuck_chains.is_empty(),
            flagged,
            stuck_chains,
        }
    }

    /// One line per problem, empty when converged.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.flagged.is_empty() {
            out.push(format!(
                "{} parameter(s) exceed R-hat {} or fall below ESS ratio {}: {}",
                self.flagged.len(),
                self.thresholds.max_rhat,
                self.thresholds.min_ess_ratio,
                self.flagged.join(", ")
            ));
        }
        if !self.stuck_chains.is_empty() {
            out.push(format!(
                "chain(s) {} rarely moved after warmup (move rate below {MIN_MOVE_RATE})",
                self.stuck_chains.iter().join(", ")
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array1;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn iid_chains(n_chains: usize, n: usize, shift: &[f64], seed: u64) -> Vec<Array1<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n_chains)
            .map(|c| (0..n).map(|_| normal.sample(&mut rng) + shift[c]).collect())
            .collect()
    }

    fn views(chains: &[Array1<f64>]) -> Vec<ArrayView1<'_, f64>> {
        chains.iter().map(|c| c.view()).collect()
    }

    #[test]
    fn rhat_near_one_for_well_mixed_chains() {
        let chains = iid_chains(4, 1000, &[0.0; 4], 1);
        let rhat = split_rhat(&views(&chains)).unwrap();
        assert!((rhat - 1.0).abs() < 0.01, "rhat = {rhat}");
    }

    #[test]
    fn rhat_detects_a_shifted_chain() {
        let chains = iid_chains(4, 1000, &[0.0, 0.0, 0.0, 3.0], 2);
        let rhat = split_rhat(&views(&chains)).unwrap();
        assert!(rhat > 1.1, "rhat = {rhat}");
    }

    #[test]
    fn rhat_detects_within_chain_drift() {
        let chains: Vec<Array1<f64>> = (0..2)
            .map(|_| Array1::from_iter((0..400).map(|i| i as f64 / 100.0)))
            .collect();
        assert!(split_rhat(&views(&chains)).unwrap() > 1.5);
    }

    #[test]
    fn ess_close_to_draw_count_for_independent_draws() {
        let chains = iid_chains(4, 1000, &[0.0; 4], 3);
        let ess = effective_sample_size(&views(&chains)).unwrap();
        assert!(ess > 3000.0 && ess < 5000.0, "ess = {ess}");
    }

    #[test]
    fn ess_small_for_autocorrelated_draws() {
        let mut rng = StdRng::seed_from_u64(4);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let chains: Vec<Array1<f64>> = (0..4)
            .map(|_| {
                let mut x = 0.0;
                (0..1000)
                    .map(|_| {
                        x = 0.95 * x + normal.sample(&mut rng);
                        x
                    })
                    .collect()
            })
            .collect();
        let ess = effective_sample_size(&views(&chains)).unwrap();
        // AR(1) with φ = 0.95 has ESS ≈ S·(1-φ)/(1+φ) ≈ 103.
        assert!(ess > 40.0 && ess < 250.0, "ess = {ess}");
    }

    #[test]
    fn constant_draws_give_nan_diagnostics() {
        let chains = vec![Array1::from_elem(100, 2.0), Array1::from_elem(100, 2.0)];
        assert!(split_rhat(&views(&chains)).unwrap().is_nan());
        assert!(effective_sample_size(&views(&chains)).unwrap().is_nan());
    }

    #[test]
    fn unequal_chains_are_rejected() {
        let chains = vec![Array1::zeros(10), Array1::zeros(12)];
        assert_eq!(
            split_rhat(&views(&chains)),
            Err(DiagnosticError::UnequalChains {
                first: 10,
                other: 12
            })
        );
    }

    #[test]
    fn hpdi_prefers_the_dense_region() {
        let mut values: Vec<f64> = (0..90).map(|i| i as f64 / 100.0).collect();
        values.extend((0..10).map(|i| 10.0 + i as f64));
        let (lo, hi) = hpdi(&values, 0.9).unwrap();
        assert_relative_eq!(lo, 0.0);
        assert_relative_eq!(hi, 0.89);
    }

    #[test]
    fn hpdi_of_normal_draws_matches_quantiles() {
        let chains = iid_chains(1, 20000, &[0.0], 5);
        let (lo, hi) = hpdi(chains[0].as_slice().unwrap(), 0.95).unwrap();
        assert!((lo + 1.96).abs() < 0.1 && (hi - 1.96).abs() < 0.1, "({lo}, {hi})");
    }

    #[test]
    fn hpdi_rejects_bad_mass() {
        assert_eq!(hpdi(&[1.0, 2.0], 1.0), Err(DiagnosticError::InvalidMass(1.0)));
        assert_eq!(hpdi(&[], 0.5), Err(DiagnosticError::NoDraws));
    }

    #[test]
    fn report_flags_nonconverged_parameters() {
        let good = iid_chains(4, 500, &[0.0; 4], 6);
        let bad = iid_chains(4, 500, &[0.0, 0.0, 0.0, 4.0], 7);
        let summaries = vec![
            ParameterSummary::from_chains("good", &views(&good), 0.95).unwrap(),
            ParameterSummary::from_chains("bad", &views(&bad), 0.95).unwrap(),
        ];
        let report = ConvergenceReport::new(&summaries, &[], ConvergenceThresholds::default());
        assert!(!report.converged);
        assert_eq!(report.flagged, vec!["bad".to_string()]);
        assert!(report.max_rhat > 1.1);
        assert_eq!(report.warnings().len(), 1);
    }

    #[test]
    fn stuck_chain_blocks_convergence() {
        let good = iid_chains(2, 500, &[0.0; 2], 8);
        let summaries = vec![ParameterSummary::from_chains("a", &views(&good), 0.95).unwrap()];
        let stats = [
            ChainStats {
                chain: 0,
                move_rate: 0.93,
                warmup_secs: 0.1,
                sampling_secs: 0.1,
            },
            ChainStats {
                chain: 1,
                move_rate: 0.01,
                warmup_secs: 0.1,
                sampling_secs: 0.1,
            },
        ];
        let lenient = ConvergenceThresholds {
            max_rhat: 1.2,
            min_ess_ratio: 0.01,
        };
        let report = ConvergenceReport::new(&summaries, &stats, lenient);
        assert!(report.flagged.is_empty());
        assert_eq!(report.stuck_chains, vec![1]);
        assert!(!report.converged);
        assert!(report.warnings()[0].contains("chain(s) 1"));
    }
}
