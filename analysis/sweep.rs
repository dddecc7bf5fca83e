//! Sensitivity of the fitted coefficients to the minimum-trajectory filter.
//!
//! Every threshold is an independent pipeline run (filter, standardize, fit)
//! mapped to an immutable [`SweepPoint`]. Points are computed in parallel and
//! returned sorted by threshold. A failure at one threshold is recorded in its
//! point and does not stop the others.

use crate::data::Dataset;
use crate::diagnostics::{ConvergenceReport, DiagnosticError, ParameterSummary};
use crate::filter::{FilterSummary, filter_with_summary};
use crate::fit::{FitError, FitSettings, fit_spec};
use crate::model::ModelSpec;
use crate::standardize::{StandardizeError, StandardizedDataset};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error(transparent)]
    Standardize(#[from] StandardizeError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Diagnostic(#[from] DiagnosticError),
}

/// What a successful fit at one threshold produced.
#[derive(Debug, Clone)]
pub struct SweepFit {
    pub n_obs: usize,
    pub n_users: usize,
    /// Intercept and slopes.
    pub coefficients: Vec<ParameterSummary>,
    pub convergence: ConvergenceReport,
}

#[derive(Debug)]
pub struct SweepPoint {
    pub threshold: u32,
    pub filter: FilterSummary,
    pub outcome: Result<SweepFit, SweepError>,
}

impl SweepPoint {
    pub fn coefficient(&self, name: &str) -> Option<&ParameterSummary> {
        self.outcome
            .as_ref()
            .ok()?
            .coefficients
            .iter()
            .find(|c| c.name == name)
    }
}

/// Sorted, de-duplicated thresholds.
fn ordered(thresholds: &[u32]) -> Vec<u32> {
    let mut out = thresholds.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// Filter bookkeeping at every threshold, without fitting.
pub fn sweep_counts(dataset: &Dataset, thresholds: &[u32]) -> Vec<FilterSummary> {
    ordered(thresholds)
        .into_iter()
        .map(|t| filter_with_summary(dataset, t).1)
        .collect()
}

fn fit_at(
    dataset: &Dataset,
    threshold: u32,
    spec: &ModelSpec,
    settings: &FitSettings,
    hdi_prob: f64,
) -> SweepPoint {
    let (filtered, filter) = filter_with_summary(dataset, threshold);
    let outcome = (|| -> Result<SweepFit, SweepError> {
        let data = StandardizedDataset::from_filtered(filtered)?;
        let fit = fit_spec(&data, spec, None, settings)?;
        Ok(SweepFit {
            n_obs: fit.design().n_obs(),
            n_users: fit.design().n_groups(),
            coefficients: fit.population_summary(hdi_prob)?,
            convergence: fit.convergence(settings.convergence)?,
        })
    })();
    if let Err(e) = &outcome {
        log::warn!("Sweep threshold {threshold}: {e}");
    }
    SweepPoint {
        threshold,
        filter,
        outcome,
    }
}

/// Fits `spec` at every threshold. Results are ordered by threshold.
pub fn run_sweep(
    dataset: &Dataset,
    thresholds: &[u32],
    spec: &ModelSpec,
    settings: &FitSettings,
    hdi_prob: f64,
) -> Vec<SweepPoint> {
    let mut settings = settings.clone();
    settings.sampler.progress = false;
    let thresholds = ordered(thresholds);
    log::info!(
        "Sensitivity sweep of model '{}' over {} thresholds",
        spec.name,
        thresholds.len()
    );
    thresholds
        .par_iter()
        .map(|&t| fit_at(dataset, t, spec, &settings, hdi_prob))
        .collect()
}
