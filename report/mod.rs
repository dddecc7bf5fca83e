//! # Reporting
//!
//! Read-only consumers of analysis results: terminal tables, tab-separated
//! files, a TOML summary of a fit, and SVG charts. Nothing here feeds back
//! into the analysis.

pub mod plots;
pub mod tables;

use crate::compare::Comparison;
use crate::data::Dataset;
use crate::diagnostics::{ConvergenceReport, DiagnosticError, ParameterSummary};
use crate::fit::ModelFit;
use crate::hmc::{ChainStats, SamplerConfig};
use crate::priors::PriorSpec;
use crate::psis::{LooResult, ParetoKCategory, PsisError};
use crate::standardize::{Moments, sample_moments};
use crate::sweep::SweepPoint;
use csv::WriterBuilder;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write tab-separated output: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Failed to serialize report to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to draw chart '{path}': {message}")]
    PlotError { path: PathBuf, message: String },
    #[error(transparent)]
    Diagnostic(#[from] DiagnosticError),
    #[error(transparent)]
    Loo(#[from] PsisError),
}

/// Output file names inside the output directory.
pub const PARAMETERS_FILE: &str = "parameters.tsv";
pub const LOO_FILE: &str = "loo.tsv";
pub const COMPARISON_FILE: &str = "comparison.tsv";
pub const SWEEP_FILE: &str = "sweep.tsv";
pub const FIT_REPORT_FILE: &str = "fit_report.toml";

pub fn ensure_dir(dir: &Path) -> Result<(), ReportError> {
    fs::create_dir_all(dir)?;
    Ok(())
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<fs::File>, ReportError> {
    log::info!("Writing {}", path.display());
    Ok(WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?)
}

fn fmt(value: f64) -> String {
    format!("{value:.6}")
}

/// Column summaries of the raw (unstandardized) data, split by stress label.
#[derive(Debug, Clone, Serialize)]
pub struct DescriptiveSummary {
    pub recordings: usize,
    pub users: usize,
    pub stressed: usize,
    pub columns: Vec<ColumnSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnSummary {
    pub name: String,
    pub missing: usize,
    pub calm: Option<Moments>,
    pub stressed: Option<Moments>,
}

pub fn describe(dataset: &Dataset) -> DescriptiveSummary {
    type Getter = fn(&crate::data::Recording) -> Option<f64>;
    let getters: [(&str, Getter); 7] = [
        ("speed", |r| r.speed),
        ("accuracy", |r| r.accuracy),
        ("wheels", |r| r.wheels),
        ("clicks", |r| r.clicks),
        ("valence", |r| r.valence),
        ("arousal", |r| r.arousal),
        ("n_traj", |r| Some(f64::from(r.n_traj))),
    ];
    let columns = getters
        .iter()
        .map(|(name, get)| {
            let split = |stress: bool| -> Vec<Option<f64>> {
                dataset
                    .recordings
                    .iter()
                    .filter(|r| r.stress == stress)
                    .map(get)
                    .collect()
            };
            ColumnSummary {
                name: name.to_string(),
                missing: dataset.recordings.iter().filter(|r| get(r).is_none()).count(),
                calm: sample_moments(&split(false)),
                stressed: sample_moments(&split(true)),
            }
        })
        .collect();
    DescriptiveSummary {
        recordings: dataset.len(),
        users: dataset.users().len(),
        stressed: dataset.recordings.iter().filter(|r| r.stress).count(),
        columns,
    }
}

pub fn write_parameters_tsv(
    path: &Path,
    model: &str,
    summaries: &[ParameterSummary],
) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "model", "parameter", "mean", "sd", "hdi_lower", "hdi_upper", "rhat", "ess", "ess_ratio",
    ])?;
    for s in summaries {
        wtr.write_record([
            model.to_string(),
            s.name.clone(),
            fmt(s.mean),
            fmt(s.sd),
            fmt(s.hdi_lower),
            fmt(s.hdi_upper),
            fmt(s.rhat),
            format!("{:.1}", s.ess),
            fmt(s.ess_ratio),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Pointwise LOO with the source row of each observation.
pub fn write_loo_tsv(
    path: &Path,
    model: &str,
    loo: &LooResult,
    rows: &[usize],
) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record(["model", "row", "elpd_loo", "p_loo", "looic", "pareto_k", "category"])?;
    for (point, row) in loo.pointwise.iter().zip(rows) {
        wtr.write_record([
            model.to_string(),
            row.to_string(),
            fmt(point.elpd_loo),
            fmt(point.p_loo),
            fmt(point.looic),
            fmt(point.pareto_k),
            format!("{:?}", point.category).to_lowercase(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_comparison_tsv(path: &Path, comparison: &Comparison) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "model",
        "elpd_loo",
        "se_elpd_loo",
        "p_loo",
        "looic",
        "se_looic",
        "elpd_diff",
        "looic_diff",
        "se_diff",
        "within_one_se",
        "high_k",
    ])?;
    for e in &comparison.entries {
        wtr.write_record([
            e.name.clone(),
            fmt(e.elpd_loo),
            fmt(e.se_elpd_loo),
            fmt(e.p_loo),
            fmt(e.looic),
            fmt(e.se_looic),
            fmt(e.elpd_diff),
            fmt(e.looic_diff),
            fmt(e.se_diff),
            e.within_one_se.to_string(),
            e.high_k.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// One row per threshold and population parameter. Failed thresholds get a
/// single row carrying the error.
pub fn write_sweep_tsv(path: &Path, points: &[SweepPoint]) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "threshold",
        "rows_kept",
        "users_kept",
        "parameter",
        "mean",
        "sd",
        "hdi_lower",
        "hdi_upper",
        "rhat",
        "ess_ratio",
        "converged",
        "error",
    ])?;
    for point in points {
        let prefix = [
            point.threshold.to_string(),
            point.filter.rows_kept.to_string(),
            point.filter.users_kept.to_string(),
        ];
        match &point.outcome {
            Ok(fit) => {
                for c in &fit.coefficients {
                    let mut record: Vec<String> = prefix.to_vec();
                    record.extend([
                        c.name.clone(),
                        fmt(c.mean),
                        fmt(c.sd),
                        fmt(c.hdi_lower),
                        fmt(c.hdi_upper),
                        fmt(c.rhat),
                        fmt(c.ess_ratio),
                        fit.convergence.converged.to_string(),
                        String::new(),
                    ]);
                    wtr.write_record(&record)?;
                }
            }
            Err(e) => {
                let mut record: Vec<String> = prefix.to_vec();
                record.extend(std::iter::repeat_n(String::new(), 8));
                record.push(e.to_string());
                wtr.write_record(&record)?;
            }
        }
    }
    wtr.flush()?;
    Ok(())
}

/// LOO totals without the pointwise vectors.
#[derive(Debug, Clone, Serialize)]
pub struct LooSummary {
    pub elpd_loo: f64,
    pub se_elpd_loo: f64,
    pub p_loo: f64,
    pub se_p_loo: f64,
    pub looic: f64,
    pub se_looic: f64,
    pub k_good: usize,
    pub k_questionable: usize,
    pub k_problematic: usize,
    pub k_unreliable: usize,
}

impl From<&LooResult> for LooSummary {
    fn from(loo: &LooResult) -> Self {
        let counts = loo.category_counts();
        Self {
            elpd_loo: loo.elpd_loo,
            se_elpd_loo: loo.se_elpd_loo,
            p_loo: loo.p_loo,
            se_p_loo: loo.se_p_loo,
            looic: loo.looic,
            se_looic: loo.se_looic,
            k_good: counts[ParetoKCategory::Good as usize],
            k_questionable: counts[ParetoKCategory::Questionable as usize],
            k_problematic: counts[ParetoKCategory::Problematic as usize],
            k_unreliable: counts[ParetoKCategory::Unreliable as usize],
        }
    }
}

/// Everything needed to audit one fit, written as TOML.
#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub model: String,
    pub terms: Vec<String>,
    pub n_obs: usize,
    pub n_users: usize,
    pub seed: u64,
    pub hdi_prob: f64,
    pub mode_converged: bool,
    pub priors: PriorSpec,
    pub sampler: SamplerConfig,
    pub convergence: ConvergenceReport,
    pub loo: Option<LooSummary>,
    pub chains: Vec<ChainStats>,
    pub parameters: Vec<ParameterSummary>,
}

impl FitReport {
    pub fn new(fit: &ModelFit, hdi_prob: f64, loo: Option<&LooResult>) -> Result<Self, ReportError> {
        let settings = fit.settings();
        Ok(Self {
            model: fit.spec().name.clone(),
            terms: fit.spec().terms.iter().map(|t| t.label()).collect(),
            n_obs: fit.design().n_obs(),
            n_users: fit.design().n_groups(),
            seed: settings.seed,
            hdi_prob,
            mode_converged: fit.mode().converged,
            priors: settings.priors,
            sampler: settings.sampler.clone(),
            convergence: fit.convergence(settings.convergence)?,
            loo: loo.map(LooSummary::from),
            chains: fit.chain_stats().to_vec(),
            parameters: fit.summary(hdi_prob)?,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        log::info!("Writing {}", path.display());
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
