//! # Model Fitting
//!
//! Runs the full estimation for one model: validate the design, locate the
//! posterior mode, whiten with the Hessian there, and draw NUTS chains.
//!
//! A [`ModelFit`] owns its draws. Everything derived from them (parameter
//! summaries, convergence flags, pointwise log-likelihood, PSIS-LOO) is
//! recomputed on each call.

use crate::diagnostics::{
    ConvergenceReport, ConvergenceThresholds, DiagnosticError, ParameterSummary,
    effective_sample_size,
};
use crate::hmc::{ChainStats, SamplerConfig, SamplerError, Whitening, run_nuts};
use crate::model::{Design, ModelError, ModelSpec, build_design};
use crate::posterior::{HierarchicalLogit, ModeEstimate, ParameterLayout};
use crate::priors::{PriorError, PriorSpec};
use crate::psis::{LooResult, PsisError, psis_loo, stack_chains};
use crate::standardize::StandardizedDataset;
use ndarray::{Array2, ArrayView1, Axis};
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

const MODE_TOLERANCE: f64 = 1e-6;
const MODE_MAX_ITERATIONS: usize = 1000;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Invalid model design: {0}")]
    Design(#[from] ModelError),
    #[error("Invalid priors: {0}")]
    Prior(#[from] PriorError),
    #[error("Sampler failed: {0}")]
    Sampler(SamplerError),
    #[error("Fitting model '{model}' exceeded the {limit_secs}s time limit.")]
    Timeout { model: String, limit_secs: u64 },
}

/// Everything that controls a fit besides the data and the model terms.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FitSettings {
    pub priors: PriorSpec,
    pub sampler: SamplerConfig,
    pub convergence: ConvergenceThresholds,
    pub seed: u64,
}

/// Builds the design of `spec` over `data` (optionally restricted to the
/// listed source rows) and fits it.
pub fn fit_spec(
    data: &StandardizedDataset,
    spec: &ModelSpec,
    restrict_to: Option<&[usize]>,
    settings: &FitSettings,
) -> Result<ModelFit, FitError> {
    let design = build_design(data, spec, restrict_to)?;
    fit_model(design, spec, settings)
}

/// Fits one model to a prepared design.
pub fn fit_model(
    design: Design,
    spec: &ModelSpec,
    settings: &FitSettings,
) -> Result<ModelFit, FitError> {
    settings.priors.validate()?;
    settings.sampler.validate().map_err(FitError::Sampler)?;
    design.validate()?;

    let target = HierarchicalLogit::new(Arc::new(design), settings.priors);
    let mode = target.find_mode(MODE_TOLERANCE, MODE_MAX_ITERATIONS);
    let whitening = if mode.converged {
        let hessian = target.negative_hessian(mode.theta.view());
        Whitening::from_hessian(mode.theta.clone(), &hessian)
    } else {
        Whitening::identity(mode.theta.clone())
    };

    log::info!(
        "Model '{}': sampling {} chains x ({} warmup + {} draws), seed {}",
        spec.name,
        settings.sampler.chains,
        settings.sampler.warmup,
        settings.sampler.draws,
        settings.seed
    );
    let outputs = run_nuts(&target, &whitening, &settings.sampler, settings.seed).map_err(
        |e| match e {
            SamplerError::Timeout { limit_secs, .. } => FitError::Timeout {
                model: spec.name.clone(),
                limit_secs,
            },
            other => FitError::Sampler(other),
        },
    )?;

    let (chains, stats) = outputs.into_iter().map(|o| (o.draws, o.stats)).unzip();
    let fit = ModelFit {
        spec: spec.clone(),
        settings: settings.clone(),
        target,
        mode,
        chains,
        stats,
    };

    match fit.convergence(settings.convergence) {
        Ok(report) => {
            for warning in report.warnings() {
                log::warn!("Model '{}': {}", spec.name, warning);
            }
        }
        Err(e) => log::warn!("Model '{}': convergence diagnostics failed: {e}", spec.name),
    }
    Ok(fit)
}

/// The posterior draws of one fitted model.
pub struct ModelFit {
    spec: ModelSpec,
    settings: FitSettings,
    target: HierarchicalLogit,
    mode: ModeEstimate,
    /// Unconstrained draws per chain, shape `(draws, dim)`.
    chains: Vec<Array2<f64>>,
    stats: Vec<ChainStats>,
}

impl ModelFit {
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn settings(&self) -> &FitSettings {
        &self.settings
    }

    pub fn design(&self) -> &Design {
        self.target.design()
    }

    pub fn layout(&self) -> ParameterLayout {
        self.target.layout()
    }

    pub fn mode(&self) -> &ModeEstimate {
        &self.mode
    }

    pub fn chain_stats(&self) -> &[ChainStats] {
        &self.stats
    }

    /// Source rows of the observations, in design order.
    pub fn data_rows(&self) -> &[usize] {
        &self.design().rows
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn total_draws(&self) -> usize {
        self.chains.iter().map(|c| c.nrows()).sum()
    }

    /// Intercept plus slopes.
    pub fn n_population(&self) -> usize {
        1 + self.layout().n_coefficients
    }

    /// Reported parameter names in layout order.
    pub fn parameter_names(&self) -> Vec<String> {
        let design = self.design();
        let mut names = Vec::with_capacity(self.layout().dim());
        names.push("Intercept".to_string());
        names.extend(design.columns.iter().cloned());
        names.push("sd(user)".to_string());
        names.extend(design.users.iter().map(|u| format!("r_user[{u}]")));
        names
    }

    /// Draws per chain on the reported scale: τ instead of log τ, and user
    /// deviations τ·z instead of z.
    pub fn constrained_chains(&self) -> Vec<Array2<f64>> {
        let layout = self.layout();
        self.chains
            .iter()
            .map(|chain| {
                let mut out = chain.clone();
                for (mut row, draw) in out.axis_iter_mut(Axis(0)).zip(chain.axis_iter(Axis(0))) {
                    row.assign(&layout.constrain(draw));
                }
                out
            })
            .collect()
    }

    /// Mean, sd, HPDI, R-hat and ESS for every reported parameter.
    pub fn summary(&self, hdi_prob: f64) -> Result<Vec<ParameterSummary>, DiagnosticError> {
        let chains = self.constrained_chains();
        self.parameter_names()
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let columns: Vec<ArrayView1<f64>> = chains.iter().map(|c| c.column(j)).collect();
                ParameterSummary::from_chains(name, &columns, hdi_prob)
            })
            .collect()
    }

    /// Summaries of the intercept and slopes only.
    pub fn population_summary(&self, hdi_prob: f64) -> Result<Vec<ParameterSummary>, DiagnosticError> {
        let mut all = self.summary(hdi_prob)?;
        all.truncate(self.n_population());
        Ok(all)
    }

    pub fn convergence(
        &self,
        thresholds: ConvergenceThresholds,
    ) -> Result<ConvergenceReport, DiagnosticError> {
        let summaries = self.summary(0.95)?;
        Ok(ConvergenceReport::new(&summaries, &self.stats, thresholds))
    }

    /// Pointwise log-likelihood per chain, shape `(draws, n_obs)`.
    pub fn log_likelihood(&self) -> Vec<Array2<f64>> {
        let n_obs = self.design().n_obs();
        self.chains
            .iter()
            .map(|chain| {
                let mut out = Array2::<f64>::zeros((chain.nrows(), n_obs));
                for (mut row, draw) in out.axis_iter_mut(Axis(0)).zip(chain.axis_iter(Axis(0))) {
                    row.assign(&self.target.pointwise_log_likelihood(draw));
                }
                out
            })
            .collect()
    }

    /// Relative efficiency of exp(log-likelihood) per observation, the
    /// ratio used to size the PSIS tail.
    fn relative_efficiency(&self, log_lik: &[Array2<f64>]) -> Vec<f64> {
        let total = self.total_draws() as f64;
        (0..self.design().n_obs())
            .into_par_iter()
            .map(|i| {
                let likelihood: Vec<_> = log_lik.iter().map(|c| c.column(i).mapv(f64::exp)).collect();
                let views: Vec<ArrayView1<f64>> = likelihood.iter().map(|c| c.view()).collect();
                match effective_sample_size(&views) {
                    Ok(ess) if ess.is_finite() && ess > 0.0 => ess / total,
                    _ => 1.0,
                }
            })
            .collect()
    }

    /// PSIS-LOO over all observations of the design.
    pub fn loo(&self) -> Result<LooResult, PsisError> {
        let log_lik = self.log_likelihood();
        let r_eff = self.relative_efficiency(&log_lik);
        let stacked = stack_chains(&log_lik).ok_or(PsisError::Empty)?;
        let result = psis_loo(stacked.view(), &r_eff)?;
        let flagged = result.flagged().len();
        if flagged > 0 {
            log::warn!(
                "Model '{}': {} observation(s) have Pareto k above 0.5; LOO may be unreliable for them",
                self.spec.name,
                flagged
            );
        }
        Ok(result)
    }
}
