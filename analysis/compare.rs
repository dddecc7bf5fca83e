//! Model comparison by PSIS-LOO.
//!
//! Models are ranked by looic; the smallest wins outright. Differences are
//! reported against the winner and between every pair, each with the
//! standard error of the pointwise difference. Whether a difference is
//! within one standard error is reported, but does not change the winner.

use crate::fit::ModelFit;
use crate::model::Design;
use crate::psis::{LooResult, ParetoKCategory, PsisError};
use itertools::Itertools;
use ndarray::ArrayView1;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComparisonError {
    #[error("At least two models are needed for a comparison, got {0}.")]
    TooFewModels(usize),

    #[error(
        "Models '{first}' and '{other}' were fit on different data ({reason}); refit them on common rows before comparing."
    )]
    DatasetMismatch {
        first: String,
        other: String,
        reason: String,
    },

    #[error("Model name '{0}' appears more than once.")]
    DuplicateName(String),

    #[error("PSIS-LOO failed for model '{model}': {source}")]
    Loo {
        model: String,
        #[source]
        source: PsisError,
    },
}

/// One model's row in the comparison, relative to the best model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonEntry {
    pub name: String,
    pub elpd_loo: f64,
    pub se_elpd_loo: f64,
    pub p_loo: f64,
    pub looic: f64,
    pub se_looic: f64,
    /// elpd of this model minus elpd of the best (≤ 0).
    pub elpd_diff: f64,
    /// looic of this model minus looic of the best (≥ 0).
    pub looic_diff: f64,
    pub se_diff: f64,
    pub within_one_se: bool,
    /// Observations with Pareto k above 0.7.
    pub high_k: usize,
}

/// elpd of `first` minus elpd of `second`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairwiseDifference {
    pub first: String,
    pub second: String,
    pub elpd_diff: f64,
    pub se_diff: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub best: String,
    /// Sorted by looic, best first.
    pub entries: Vec<ComparisonEntry>,
    /// Every unordered pair once, in input order.
    pub pairwise: Vec<PairwiseDifference>,
}

/// The observations a LOO result was computed on: source rows, stress
/// responses and the user of every row, all in design order.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFingerprint<'a> {
    pub rows: &'a [usize],
    pub response: ArrayView1<'a, f64>,
    pub users: Vec<&'a str>,
}

impl<'a> DataFingerprint<'a> {
    pub fn of_design(design: &'a Design) -> Self {
        Self {
            rows: &design.rows,
            response: design.y.view(),
            users: design
                .group
                .iter()
                .map(|&g| design.users.get(g).map_or("", String::as_str))
                .collect(),
        }
    }

    /// Why `other` describes different observations, if it does.
    fn mismatch(&self, other: &Self) -> Option<String> {
        if self.rows.len() != other.rows.len() {
            Some(format!("{} vs {} rows", self.rows.len(), other.rows.len()))
        } else if self.rows != other.rows {
            Some("different source rows".to_string())
        } else if self.response != other.response {
            Some("different stress responses on the same rows".to_string())
        } else if self.users != other.users {
            Some("different users on the same rows".to_string())
        } else {
            None
        }
    }
}

/// A model's LOO result together with the data it was computed on.
pub struct NamedLoo<'a> {
    pub name: &'a str,
    pub loo: &'a LooResult,
    pub data: DataFingerprint<'a>,
}

fn ensure_same_data<'s, 'a: 's, I>(mut models: I) -> Result<(), ComparisonError>
where
    I: Iterator<Item = (&'s str, &'s DataFingerprint<'a>)>,
{
    let Some((first, reference)) = models.next() else {
        return Ok(());
    };
    for (other, data) in models {
        if let Some(reason) = reference.mismatch(data) {
            return Err(ComparisonError::DatasetMismatch {
                first: first.to_string(),
                other: other.to_string(),
                reason,
            });
        }
    }
    Ok(())
}

/// Returns `(elpd_a − elpd_b, se)` with `se = sqrt(N · var(pointwise diff))`.
pub fn elpd_difference(a: &LooResult, b: &LooResult) -> (f64, f64) {
    let diffs: Vec<f64> = a
        .pointwise
        .iter()
        .zip(&b.pointwise)
        .map(|(x, y)| x.elpd_loo - y.elpd_loo)
        .collect();
    let n = diffs.len() as f64;
    let total: f64 = diffs.iter().sum();
    if n < 2.0 {
        return (total, 0.0);
    }
    let mean = total / n;
    let var = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (total, (n * var).sqrt())
}

/// Compares already computed LOO results.
pub fn compare_loo(models: &[NamedLoo<'_>]) -> Result<Comparison, ComparisonError> {
    if models.len() < 2 {
        return Err(ComparisonError::TooFewModels(models.len()));
    }
    if let Some(name) = models.iter().map(|m| m.name).duplicates().next() {
        return Err(ComparisonError::DuplicateName(name.to_string()));
    }
    ensure_same_data(models.iter().map(|m| (m.name, &m.data)))?;
    let reference = &models[0];
    if let Some(other) = models.iter().find(|m| m.loo.n_obs() != reference.loo.n_obs()) {
        return Err(ComparisonError::DatasetMismatch {
            first: reference.name.to_string(),
            other: other.name.to_string(),
            reason: format!(
                "{} vs {} pointwise LOO values",
                reference.loo.n_obs(),
                other.loo.n_obs()
            ),
        });
    }

    let best_index = (0..models.len())
        .min_by(|&a, &b| models[a].loo.looic.total_cmp(&models[b].loo.looic))
        .unwrap_or(0);
    let best = &models[best_index];

    let mut entries: Vec<ComparisonEntry> = models
        .iter()
        .map(|m| {
            let (elpd_diff, se_diff) = elpd_difference(m.loo, best.loo);
            let high_k = m
                .loo
                .pointwise
                .iter()
                .filter(|p| p.category >= ParetoKCategory::Problematic)
                .count();
            ComparisonEntry {
                name: m.name.to_string(),
                elpd_loo: m.loo.elpd_loo,
                se_elpd_loo: m.loo.se_elpd_loo,
                p_loo: m.loo.p_loo,
                looic: m.loo.looic,
                se_looic: m.loo.se_looic,
                elpd_diff,
                looic_diff: m.loo.looic - best.loo.looic,
                se_diff,
                within_one_se: elpd_diff.abs() <= se_diff,
                high_k,
            }
        })
        .collect();
    entries.sort_by(|a, b| a.looic.total_cmp(&b.looic));

    let pairwise = models
        .iter()
        .tuple_combinations()
        .map(|(a, b)| {
            let (elpd_diff, se_diff) = elpd_difference(a.loo, b.loo);
            PairwiseDifference {
                first: a.name.to_string(),
                second: b.name.to_string(),
                elpd_diff,
                se_diff,
            }
        })
        .collect();

    log::info!(
        "Model comparison: '{}' has the smallest looic ({:.2})",
        best.name,
        best.loo.looic
    );
    Ok(Comparison {
        best: best.name.to_string(),
        entries,
        pairwise,
    })
}

/// Computes PSIS-LOO for every fit (in parallel) and compares them. All fits
/// must have used exactly the same recordings, responses and users.
pub fn compare_fits(fits: &[ModelFit]) -> Result<Comparison, ComparisonError> {
    if fits.len() < 2 {
        return Err(ComparisonError::TooFewModels(fits.len()));
    }
    let fingerprints: Vec<DataFingerprint<'_>> = fits
        .iter()
        .map(|fit| DataFingerprint::of_design(fit.design()))
        .collect();
    ensure_same_data(
        fits.iter()
            .map(|fit| fit.spec().name.as_str())
            .zip(&fingerprints),
    )?;
    let loos = fits
        .par_iter()
        .map(|fit| {
            fit.loo().map_err(|source| ComparisonError::Loo {
                model: fit.spec().name.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let named: Vec<NamedLoo<'_>> = fits
        .iter()
        .zip(&loos)
        .zip(fingerprints)
        .map(|((fit, loo), data)| NamedLoo {
            name: &fit.spec().name,
            loo,
            data,
        })
        .collect();
    compare_loo(&named)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psis::LooPointwise;
    use ndarray::{Array1, Array2, array};

    /// Alternating responses over `n` rows, users `a` and `b` in turn.
    fn design(n: usize) -> Design {
        Design {
            x: Array2::zeros((n, 0)),
            y: Array1::from_shape_fn(n, |i| (i % 2) as f64),
            group: (0..n).map(|i| i % 2).collect(),
            users: vec!["a".to_string(), "b".to_string()],
            columns: Vec::new(),
            rows: (0..n).collect(),
        }
    }

    fn named<'a>(name: &'a str, loo: &'a LooResult, design: &'a Design) -> NamedLoo<'a> {
        NamedLoo {
            name,
            loo,
            data: DataFingerprint::of_design(design),
        }
    }

    fn loo_from(elpd: &[f64]) -> LooResult {
        let pointwise: Vec<LooPointwise> = elpd
            .iter()
            .map(|&e| LooPointwise {
                elpd_loo: e,
                p_loo: 0.1,
                looic: -2.0 * e,
                pareto_k: 0.2,
                category: ParetoKCategory::Good,
            })
            .collect();
        let total: f64 = elpd.iter().sum();
        LooResult {
            elpd_loo: total,
            se_elpd_loo: 1.0,
            p_loo: 0.1 * elpd.len() as f64,
            se_p_loo: 0.0,
            looic: -2.0 * total,
            se_looic: 2.0,
            pointwise,
        }
    }

    #[test]
    fn smallest_looic_wins_and_differences_are_relative_to_it() {
        let data = design(4);
        let a = loo_from(&[-0.7, -0.6, -0.8, -0.7]);
        let b = loo_from(&[-0.5, -0.4, -0.9, -0.6]);
        let c = loo_from(&[-1.0, -1.1, -0.9, -1.2]);
        let comparison = compare_loo(&[
            named("a", &a, &data),
            named("b", &b, &data),
            named("c", &c, &data),
        ])
        .unwrap();
        assert_eq!(comparison.best, "b");
        assert_eq!(comparison.entries[0].name, "b");
        assert_eq!(comparison.entries[0].elpd_diff, 0.0);
        assert_eq!(comparison.entries[0].se_diff, 0.0);
        assert_eq!(comparison.entries[2].name, "c");
        assert!(comparison.entries[2].elpd_diff < 0.0);
        assert!(comparison.entries[2].looic_diff > 0.0);
        assert_eq!(comparison.pairwise.len(), 3);
        assert_eq!(comparison.pairwise[0].first, "a");
        assert_eq!(comparison.pairwise[0].second, "b");
    }

    #[test]
    fn near_ties_still_pick_the_strict_minimum() {
        let data = design(3);
        let a = loo_from(&[-0.50, -0.60, -0.70]);
        let b = loo_from(&[-0.52, -0.57, -0.70]);
        let comparison = compare_loo(&[named("a", &a, &data), named("b", &b, &data)])
        .unwrap();
        assert_eq!(comparison.best, "b");
        assert!(comparison.entries[1].within_one_se);
    }

    #[test]
    fn mismatched_rows_are_rejected() {
        let a = loo_from(&[-0.5, -0.6, -0.7]);
        let b = loo_from(&[-0.5, -0.6, -0.7]);
        let first = design(3);
        let mut second = design(3);
        second.rows = vec![0, 1, 3];
        let result = compare_loo(&[named("a", &a, &first), named("b", &b, &second)]);
        assert!(matches!(
            result,
            Err(ComparisonError::DatasetMismatch { reason, .. }) if reason == "different source rows"
        ));
    }

    #[test]
    fn same_rows_with_flipped_responses_are_rejected() {
        let a = loo_from(&[-0.5, -0.6, -0.7, -0.4]);
        let b = loo_from(&[-0.5, -0.6, -0.7, -0.4]);
        let first = design(4);
        let mut flipped = design(4);
        flipped.y.mapv_inplace(|v| 1.0 - v);
        assert_eq!(first.rows, flipped.rows);
        let result = compare_loo(&[named("a", &a, &first), named("b", &b, &flipped)]);
        assert!(matches!(
            result,
            Err(ComparisonError::DatasetMismatch { first, other, reason })
                if first == "a" && other == "b" && reason.contains("responses")
        ));
    }

    #[test]
    fn same_rows_with_reassigned_users_are_rejected() {
        let a = loo_from(&[-0.5, -0.6, -0.7, -0.4]);
        let first = design(4);
        let mut relabelled = design(4);
        relabelled.users = vec!["b".to_string(), "a".to_string()];
        let result = compare_loo(&[named("a", &a, &first), named("b", &a, &relabelled)]);
        assert!(matches!(
            result,
            Err(ComparisonError::DatasetMismatch { reason, .. }) if reason.contains("users")
        ));

        // Same per-row users under a different index order still match.
        let mut reindexed = design(4);
        reindexed.users = vec!["b".to_string(), "a".to_string()];
        reindexed.group = vec![1, 0, 1, 0];
        assert_eq!(
            DataFingerprint::of_design(&first),
            DataFingerprint::of_design(&reindexed)
        );
        assert_eq!(DataFingerprint::of_design(&first).response, array![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn needs_two_distinct_models() {
        let a = loo_from(&[-0.5, -0.6]);
        let data = design(2);
        assert_eq!(
            compare_loo(&[named("a", &a, &data)]),
            Err(ComparisonError::TooFewModels(1))
        );
        assert_eq!(
            compare_loo(&[named("a", &a, &data), named("a", &a, &data)]),
            Err(ComparisonError::DuplicateName("a".to_string()))
        );
    }

    #[test]
    fn difference_standard_error_uses_pointwise_spread() {
        let a = loo_from(&[-1.0, -2.0, -3.0, -4.0]);
        let b = loo_from(&[-1.0, -1.0, -1.0, -1.0]);
        let (diff, se) = elpd_difference(&a, &b);
        assert_eq!(diff, -6.0);
        // diffs 0, -1, -2, -3: sample variance 5/3.
        assert!((se - (4.0f64 * 5.0 / 3.0).sqrt()).abs() < 1e-12);
    }
}
