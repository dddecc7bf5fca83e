//! Prior distributions for the hierarchical logistic model.
//!
//! Densities are evaluated up to an additive constant; only their values and
//! derivatives with respect to the parameter enter the sampler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PriorError {
    #[error("Prior for {class} has a non-positive or non-finite scale ({scale}).")]
    InvalidScale { class: &'static str, scale: f64 },
    #[error("Prior for {class} has non-positive or non-finite degrees of freedom ({df}).")]
    InvalidDegreesOfFreedom { class: &'static str, df: f64 },
    #[error("Prior for {class} has a non-finite location ({location}).")]
    InvalidLocation { class: &'static str, location: f64 },
    #[error(
        "The group standard deviation needs a prior on the non-negative half-line (half_normal or half_student_t), got {family}."
    )]
    UnboundedGroupSdPrior { family: &'static str },
}

/// A univariate prior family with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Prior {
    StudentT { df: f64, location: f64, scale: f64 },
    Normal { location: f64, scale: f64 },
    /// Normal(0, scale) truncated to x >= 0.
    HalfNormal { scale: f64 },
    /// Student-t(df, 0, scale) truncated to x >= 0.
    HalfStudentT { df: f64, scale: f64 },
}

impl Prior {
    pub fn family(&self) -> &'static str {
        match self {
            Prior::StudentT { .. } => "student_t",
            Prior::Normal { .. } => "normal",
            Prior::HalfNormal { .. } => "half_normal",
            Prior::HalfStudentT { .. } => "half_student_t",
        }
    }

    fn is_half(&self) -> bool {
        matches!(self, Prior::HalfNormal { .. } | Prior::HalfStudentT { .. })
    }

    fn validate(&self, class: &'static str) -> Result<(), PriorError> {
        let check_scale = |scale: f64| {
            if scale.is_finite() && scale > 0.0 {
                Ok(())
            } else {
                Err(PriorError::InvalidScale { class, scale })
            }
        };
        let check_df = |df: f64| {
            if df.is_finite() && df > 0.0 {
                Ok(())
            } else {
                Err(PriorError::InvalidDegreesOfFreedom { class, df })
            }
        };
        let check_location = |location: f64| {
            if location.is_finite() {
                Ok(())
            } else {
                Err(PriorError::InvalidLocation { class, location })
            }
        };
        match *self {
            Prior::StudentT {
                df,
                location,
                scale,
            } => {
                check_df(df)?;
                check_location(location)?;
                check_scale(scale)
            }
            Prior::Normal { location, scale } => {
                check_location(location)?;
                check_scale(scale)
            }
            Prior::HalfNormal { scale } => check_scale(scale),
            Prior::HalfStudentT { df, scale } => {
                check_df(df)?;
                check_scale(scale)
            }
        }
    }

    /// Unnormalized log density and its derivative at `x`. Half families are
    /// evaluated on their support; callers keep `x >= 0` for them.
    pub fn log_density_and_grad(&self, x: f64) -> (f64, f64) {
        match *self {
            Prior::StudentT {
                df,
                location,
                scale,
            } => student_t(x - location, df, scale),
            Prior::Normal { location, scale } => normal(x - location, scale),
            Prior::HalfNormal { scale } => normal(x, scale),
            Prior::HalfStudentT { df, scale } => student_t(x, df, scale),
        }
    }
}

fn student_t(centered: f64, df: f64, scale: f64) -> (f64, f64) {
    let z2 = (centered / scale).powi(2);
    let logp = -0.5 * (df + 1.0) * (z2 / df).ln_1p();
    let grad = -(df + 1.0) * centered / (df * scale * scale + centered * centered);
    (logp, grad)
}

fn normal(centered: f64, scale: f64) -> (f64, f64) {
    let s2 = scale * scale;
    (-0.5 * centered * centered / s2, -centered / s2)
}

/// Priors for each coefficient class. Fixed before fitting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorSpec {
    /// Population-level intercept.
    pub intercept: Prior,
    /// Every population-level slope.
    pub coefficients: Prior,
    /// Standard deviation of the per-user intercepts.
    pub group_sd: Prior,
}

impl Default for PriorSpec {
    fn default() -> Self {
        Self {
            intercept: Prior::StudentT {
                df: 7.0,
                location: 0.0,
                scale: 10.0,
            },
            coefficients: Prior::StudentT {
                df: 7.0,
                location: 0.0,
                scale: 2.5,
            },
            group_sd: Prior::HalfNormal { scale: 1.0 },
        }
    }
}

impl PriorSpec {
    pub fn validate(&self) -> Result<(), PriorError> {
        self.intercept.validate("the intercept")?;
        self.coefficients.validate("the coefficients")?;
        self.group_sd.validate("the group standard deviation")?;
        if !self.group_sd.is_half() {
            return Err(PriorError::UnboundedGroupSdPrior {
                family: self.group_sd.family(),
            });
        }
        Ok(())
    }
}
