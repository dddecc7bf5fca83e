//! # Model Specification and Design Construction
//!
//! A [`ModelSpec`] lists the population-level terms of a hierarchical logistic
//! regression; every model additionally carries a population intercept and a
//! per-user random intercept. [`build_design`] turns a spec and a
//! [`StandardizedDataset`] into the numeric [`Design`] the sampler consumes.
//!
//! - Complete Cases: a recording enters the design only when every term of the
//!   spec is present for it. The rows used are recorded so that models can
//!   later be checked for having seen identical data.
//! - Categorical Terms: weekday (and a categorical daytime) are treatment
//!   coded against the first level in natural sort order.
//! - Identifiability: a design whose `[1, X]` is rank deficient is rejected
//!   before any sampling starts.

use crate::data::Daytime;
use crate::standardize::{Feature, StandardizedDataset};
use ahash::{AHashMap, AHashSet};
use ndarray::{Array1, Array2, Axis, concatenate};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest admissible ratio of the extreme eigenvalues of `[1, X]ᵀ[1, X]`
/// after each column is scaled to unit norm.
const RANK_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model '{model}' has no complete recordings to fit.")]
    EmptyDesign { model: String },
    #[error("Covariate '{0}' was requested but is not a numeric column of the input file.")]
    UnknownCovariate(String),
    #[error("User group '{0}' has no members in the design.")]
    EmptyGroup(String),
    #[error(
        "Predictor '{column}' is constant across all {rows} rows of the design, which makes the design matrix rank deficient."
    )]
    ConstantColumn { column: String, rows: usize },
    #[error(
        "The design matrix is rank deficient (smallest/largest eigenvalue ratio of XᵀX is {ratio:.3e}); some predictors are collinear."
    )]
    RankDeficient { ratio: f64 },
    #[error("The daytime column mixes numeric and categorical values.")]
    MixedDaytime,
    #[error("The response must be 0 or 1, found {0}.")]
    NonBinaryResponse(f64),
    #[error("Design dimensions are inconsistent: {0}")]
    DimensionMismatch(String),
    #[error("Eigendecomposition of the design cross-product failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

/// A population-level term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    Speed,
    Accuracy,
    Tradeoff,
    Clicks,
    Wheels,
    Daytime,
    Weekday,
    /// A numeric extra column of the input file, used on its raw scale.
    Covariate(String),
}

impl Term {
    pub fn label(&self) -> String {
        match self {
            Term::Speed => "speed".to_string(),
            Term::Accuracy => "accuracy".to_string(),
            Term::Tradeoff => "tradeoff".to_string(),
            Term::Clicks => "clicks".to_string(),
            Term::Wheels => "wheels".to_string(),
            Term::Daytime => "daytime".to_string(),
            Term::Weekday => "weekday".to_string(),
            Term::Covariate(name) => name.clone(),
        }
    }

    fn feature(&self) -> Option<Feature> {
        match self {
            Term::Speed => Some(Feature::Speed),
            Term::Accuracy => Some(Feature::Accuracy),
            Term::Tradeoff => Some(Feature::Tradeoff),
            Term::Clicks => Some(Feature::Clicks),
            Term::Wheels => Some(Feature::Wheels),
            _ => None,
        }
    }
}

/// The population-level structure of one candidate model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub terms: Vec<Term>,
}

impl ModelSpec {
    pub fn new(name: &str, terms: Vec<Term>) -> Self {
        Self {
            name: name.to_string(),
            terms,
        }
    }

    pub fn intercept_only() -> Self {
        Self::new("intercept", Vec::new())
    }

    /// Speed, accuracy and their tradeoff.
    pub fn mouse() -> Self {
        Self::new("mouse", vec![Term::Speed, Term::Accuracy, Term::Tradeoff])
    }

    /// Mouse features plus click and wheel counts.
    pub fn usage() -> Self {
        let mut spec = Self::mouse();
        spec.name = "usage".to_string();
        spec.terms.extend([Term::Clicks, Term::Wheels]);
        spec
    }

    /// Usage model plus time-of-day and day-of-week.
    pub fn temporal() -> Self {
        let mut spec = Self::usage();
        spec.name = "temporal".to_string();
        spec.terms.extend([Term::Daytime, Term::Weekday]);
        spec
    }

    /// The nested sequence used for model comparison, smallest first.
    pub fn nested() -> Vec<ModelSpec> {
        vec![
            Self::intercept_only(),
            Self::mouse(),
            Self::usage(),
            Self::temporal(),
        ]
    }

    pub fn by_name(name: &str) -> Option<ModelSpec> {
        Self::nested().into_iter().find(|spec| spec.name == name)
    }

    /// Appends extra covariate columns, skipping names already present.
    pub fn with_covariates(mut self, covariates: &[String]) -> Self {
        for name in covariates {
            let term = Term::Covariate(name.clone());
            if !self.terms.contains(&term) {
                self.terms.push(term);
            }
        }
        self
    }
}

/// Numeric inputs of one fit.
#[derive(Debug, Clone)]
pub struct Design {
    /// Population-level predictors without the intercept column, `[n, p]`.
    pub x: Array2<f64>,
    /// Stress labels as 0.0 / 1.0.
    pub y: Array1<f64>,
    /// Index into `users` for every row.
    pub group: Vec<usize>,
    /// User identifiers, in natural sort order.
    pub users: Vec<String>,
    /// Names of the columns of `x`.
    pub columns: Vec<String>,
    /// Source rows of the recordings in the design, in design order.
    pub rows: Vec<usize>,
}

impl Design {
    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_coefficients(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_groups(&self) -> usize {
        self.users.len()
    }

    pub fn group_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.users.len()];
        for &g in &self.group {
            sizes[g] += 1;
        }
        sizes
    }

    /// Checks shape consistency, binary response, non-empty groups and full
    /// column rank of `[1, X]`.
    pub fn validate(&self) -> Result<(), ModelError> {
        let n = self.n_obs();
        if n == 0 {
            return Err(ModelError::EmptyDesign {
                model: "design".to_string(),
            });
        }
        if self.x.nrows() != n || self.group.len() != n || self.rows.len() != n {
            return Err(ModelError::DimensionMismatch(format!(
                "x has {} rows, y {} entries, group {} entries, rows {} entries",
                self.x.nrows(),
                n,
                self.group.len(),
                self.rows.len()
            )));
        }
        if self.columns.len() != self.x.ncols() {
            return Err(ModelError::DimensionMismatch(format!(
                "{} column names for {} predictors",
                self.columns.len(),
                self.x.ncols()
            )));
        }
        if let Some(&bad) = self.y.iter().find(|&&v| v != 0.0 && v != 1.0) {
            return Err(ModelError::NonBinaryResponse(bad));
        }
        if let Some(&g) = self.group.iter().find(|&&g| g >= self.users.len()) {
            return Err(ModelError::DimensionMismatch(format!(
                "group index {g} but only {} users",
                self.users.len()
            )));
        }
        if let Some(empty) = self
            .group_sizes()
            .iter()
            .position(|&size| size == 0)
        {
            return Err(ModelError::EmptyGroup(self.users[empty].clone()));
        }
        self.check_rank()
    }

    fn check_rank(&self) -> Result<(), ModelError> {
        let n = self.n_obs();
        for (j, column) in self.x.axis_iter(Axis(1)).enumerate() {
            let first = column[0];
            if column.iter().all(|&v| v == first) {
                return Err(ModelError::ConstantColumn {
                    column: self.columns[j].clone(),
                    rows: n,
                });
            }
        }
        if self.x.ncols() == 0 {
            return Ok(());
        }

        let ones = Array2::<f64>::ones((n, 1));
        let mut full = concatenate(Axis(1), &[ones.view(), self.x.view()])
            .map_err(|e| ModelError::DimensionMismatch(e.to_string()))?;
        // Unit-norm columns keep the ratio independent of covariate scale.
        for mut column in full.axis_iter_mut(Axis(1)) {
            let norm = column.dot(&column).sqrt();
            if norm > 0.0 {
                column /= norm;
            }
        }
        let gram = full.t().dot(&full);
        let (eigenvalues, _) = gram.eigh(UPLO::Lower)?;
        let max = eigenvalues.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
        let ratio = if max > 0.0 { min / max } else { 0.0 };
        if ratio < RANK_TOLERANCE {
            return Err(ModelError::RankDeficient { ratio });
        }
        Ok(())
    }
}

/// Positions (within the standardized dataset) of recordings that have every
/// term of `spec` present.
pub fn complete_positions(
    data: &StandardizedDataset,
    spec: &ModelSpec,
) -> Result<Vec<usize>, ModelError> {
    let dataset = data.dataset();
    let extra_indices = covariate_indices(data, spec)?;
    let positions = (0..data.len())
        .filter(|&i| {
            let r = &dataset.recordings[i];
            spec.terms.iter().all(|term| match term {
                Term::Daytime => r.daytime.is_some(),
                Term::Weekday => r.weekday.is_some(),
                Term::Covariate(name) => extra_indices
                    .get(name.as_str())
                    .is_some_and(|&k| r.extras.get(k).copied().flatten().is_some()),
                other => other
                    .feature()
                    .is_some_and(|f| data.feature(f).get(i).is_some()),
            })
        })
        .collect();
    Ok(positions)
}

/// Source rows shared by the complete cases of every spec.
pub fn common_rows(
    data: &StandardizedDataset,
    specs: &[ModelSpec],
) -> Result<Vec<usize>, ModelError> {
    let mut common: Option<AHashSet<usize>> = None;
    for spec in specs {
        let rows: AHashSet<usize> = complete_positions(data, spec)?
            .into_iter()
            .map(|i| data.dataset().recordings[i].row)
            .collect();
        common = Some(match common {
            None => rows,
            Some(acc) => acc.intersection(&rows).copied().collect(),
        });
    }
    let mut rows: Vec<usize> = common.unwrap_or_default().into_iter().collect();
    rows.sort_unstable();
    Ok(rows)
}

fn covariate_indices<'a>(
    data: &StandardizedDataset,
    spec: &'a ModelSpec,
) -> Result<AHashMap<&'a str, usize>, ModelError> {
    let mut indices = AHashMap::new();
    for term in &spec.terms {
        if let Term::Covariate(name) = term {
            let k = data
                .dataset()
                .extra_index(name)
                .ok_or_else(|| ModelError::UnknownCovariate(name.clone()))?;
            indices.insert(name.as_str(), k);
        }
    }
    Ok(indices)
}

fn natural_levels<'a, I>(values: I) -> Vec<String>
where
    I: Iterator<Item = &'a str>,
{
    let mut levels: Vec<String> = values
        .collect::<AHashSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect();
    levels.sort_by(|a, b| natord::compare(a, b));
    levels
}

/// One block of design columns generated by a term.
enum Block {
    Feature(Feature),
    Numeric(Vec<f64>),
    Dummies { levels: Vec<String>, values: Vec<String> },
}

/// Builds the design of `spec` over `data`. When `restrict_to` is given, only
/// recordings whose source row is listed are considered.
pub fn build_design(
    data: &StandardizedDataset,
    spec: &ModelSpec,
    restrict_to: Option<&[usize]>,
) -> Result<Design, ModelError> {
    let dataset = data.dataset();
    let allowed: Option<AHashSet<usize>> = restrict_to.map(|rows| rows.iter().copied().collect());
    let complete = complete_positions(data, spec)?;
    let positions: Vec<usize> = complete
        .iter()
        .copied()
        .filter(|&i| {
            allowed
                .as_ref()
                .is_none_or(|set| set.contains(&dataset.recordings[i].row))
        })
        .collect();

    let dropped = data.len() - complete.len();
    if dropped > 0 {
        log::warn!(
            "Model '{}': {} of {} recordings lack a value for one of its terms and are excluded",
            spec.name,
            dropped,
            data.len()
        );
    }
    if positions.is_empty() {
        return Err(ModelError::EmptyDesign {
            model: spec.name.clone(),
        });
    }
    let records: Vec<_> = positions.iter().map(|&i| &dataset.recordings[i]).collect();
    let extra_indices = covariate_indices(data, spec)?;

    let mut columns = Vec::new();
    let mut blocks = Vec::new();
    for term in &spec.terms {
        match term {
            Term::Daytime => {
                let numeric: Option<Vec<f64>> = records
                    .iter()
                    .map(|r| match &r.daytime {
                        Some(Daytime::Numeric(v)) => Some(*v),
                        _ => None,
                    })
                    .collect();
                let labels: Option<Vec<String>> = records
                    .iter()
                    .map(|r| match &r.daytime {
                        Some(Daytime::Label(label)) => Some(label.clone()),
                        _ => None,
                    })
                    .collect();
                match (numeric, labels) {
                    (Some(values), _) => {
                        columns.push("daytime".to_string());
                        blocks.push(Block::Numeric(values));
                    }
                    (None, Some(values)) => {
                        let levels = natural_levels(values.iter().map(String::as_str));
                        columns.extend(levels.iter().skip(1).map(|l| format!("daytime[{l}]")));
                        blocks.push(Block::Dummies { levels, values });
                    }
                    (None, None) => return Err(ModelError::MixedDaytime),
                }
            }
            Term::Weekday => {
                let values: Vec<String> = records
                    .iter()
                    .map(|r| r.weekday.clone().unwrap_or_default())
                    .collect();
                let levels = natural_levels(values.iter().map(String::as_str));
                columns.extend(levels.iter().skip(1).map(|l| format!("weekday[{l}]")));
                blocks.push(Block::Dummies { levels, values });
            }
            Term::Covariate(name) => {
                let k = extra_indices[name.as_str()];
                columns.push(name.clone());
                blocks.push(Block::Numeric(
                    records
                        .iter()
                        .map(|r| r.extras[k].unwrap_or(f64::NAN))
                        .collect(),
                ));
            }
            other => {
                if let Some(feature) = other.feature() {
                    columns.push(feature.column_name().to_string());
                    blocks.push(Block::Feature(feature));
                }
            }
        }
    }

    let n = positions.len();
    let mut x = Array2::<f64>::zeros((n, columns.len()));
    let mut col = 0;
    for block in &blocks {
        match block {
            Block::Feature(feature) => {
                let values = data.feature(*feature);
                for (row, &i) in positions.iter().enumerate() {
                    x[[row, col]] = values.get(i).unwrap_or(f64::NAN);
                }
                col += 1;
            }
            Block::Numeric(values) => {
                for (row, &v) in values.iter().enumerate() {
                    x[[row, col]] = v;
                }
                col += 1;
            }
            Block::Dummies { levels, values } => {
                for (offset, level) in levels.iter().skip(1).enumerate() {
                    for (row, value) in values.iter().enumerate() {
                        if value == level {
                            x[[row, col + offset]] = 1.0;
                        }
                    }
                }
                col += levels.len().saturating_sub(1);
            }
        }
    }

    let users: Vec<String> = natural_levels(records.iter().map(|r| r.user.as_str()));
    let index: AHashMap<&str, usize> = users
        .iter()
        .enumerate()
        .map(|(g, u)| (u.as_str(), g))
        .collect();
    let group = records.iter().map(|r| index[r.user.as_str()]).collect();
    let y = records
        .iter()
        .map(|r| if r.stress { 1.0 } else { 0.0 })
        .collect();
    let rows = records.iter().map(|r| r.row).collect();

    let design = Design {
        x,
        y,
        group,
        users,
        columns,
        rows,
    };
    log::info!(
        "Model '{}': design with {} recordings, {} users, {} population-level predictors",
        spec.name,
        design.n_obs(),
        design.n_groups(),
        design.n_coefficients()
    );
    Ok(design)
}
