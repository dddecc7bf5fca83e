//! Run configuration, read from an optional TOML file.
//!
//! Every field has a default, so an empty file (or no file) gives the
//! reference analysis. Command-line flags are applied on top by the binary.

use crate::diagnostics::ConvergenceThresholds;
use crate::filter::{DEFAULT_MIN_TRAJECTORIES, DEFAULT_SWEEP_THRESHOLDS};
use crate::fit::FitSettings;
use crate::hmc::{SamplerConfig, SamplerError};
use crate::priors::{PriorError, PriorSpec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_SEED: u64 = 1234;
pub const DEFAULT_HDI_PROB: f64 = 0.95;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid HDI probability {0}; it must lie strictly between 0 and 1.")]
    InvalidHdiProb(f64),
    #[error("The sweep needs at least one threshold.")]
    EmptySweep,
    #[error("Invalid convergence thresholds: {0}")]
    InvalidConvergence(String),
    #[error(transparent)]
    Prior(#[from] PriorError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub min_trajectories: u32,
    pub seed: u64,
    pub hdi_prob: f64,
    pub sweep_thresholds: Vec<u32>,
    /// Extra numeric columns added to every model.
    pub covariates: Vec<String>,
    pub priors: PriorSpec,
    pub sampler: SamplerConfig,
    pub convergence: ConvergenceThresholds,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_trajectories: DEFAULT_MIN_TRAJECTORIES,
            seed: DEFAULT_SEED,
            hdi_prob: DEFAULT_HDI_PROB,
            sweep_thresholds: DEFAULT_SWEEP_THRESHOLDS.to_vec(),
            covariates: Vec::new(),
            priors: PriorSpec::default(),
            sampler: SamplerConfig::default(),
            convergence: ConvergenceThresholds::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.hdi_prob > 0.0 && self.hdi_prob < 1.0) {
            return Err(ConfigError::InvalidHdiProb(self.hdi_prob));
        }
        if self.sweep_thresholds.is_empty() {
            return Err(ConfigError::EmptySweep);
        }
        if !(self.convergence.max_rhat >= 1.0) {
            return Err(ConfigError::InvalidConvergence(format!(
                "max_rhat must be at least 1, got {}",
                self.convergence.max_rhat
            )));
        }
        if !(self.convergence.min_ess_ratio >= 0.0 && self.convergence.min_ess_ratio <= 1.0) {
            return Err(ConfigError::InvalidConvergence(format!(
                "min_ess_ratio must lie in [0, 1], got {}",
                self.convergence.min_ess_ratio
            )));
        }
        self.priors.validate()?;
        self.sampler.validate()?;
        Ok(())
    }

    pub fn fit_settings(&self) -> FitSettings {
        FitSettings {
            priors: self.priors,
            sampler: self.sampler.clone(),
            convergence: self.convergence,
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priors::Prior;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_gives_reference_defaults() {
        let config = AnalysisConfig::from_toml_str("").unwrap();
        assert_eq!(config, AnalysisConfig::default());
        assert_eq!(config.min_trajectories, 10);
        assert_eq!(config.sampler.chains, 4);
        assert_eq!(config.convergence.max_rhat, 1.01);
        assert_eq!(config.sweep_thresholds, vec![2, 5, 10, 15, 20, 30, 50, 100]);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let text = r#"
            seed = 7
            covariates = ["valence_z"]

            [sampler]
            draws = 500
            timeout_secs = 60

            [priors.coefficients]
            family = "normal"
            location = 0.0
            scale = 1.0

            [priors.intercept]
            family = "student_t"
            df = 3.0
            location = 0.0
            scale = 5.0

            [priors.group_sd]
            family = "half_student_t"
            df = 3.0
            scale = 2.5
        "#;
        let config = AnalysisConfig::from_toml_str(text).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.sampler.draws, 500);
        assert_eq!(config.sampler.warmup, 1000);
        assert_eq!(config.sampler.timeout_secs, Some(60));
        assert_eq!(
            config.priors.coefficients,
            Prior::Normal {
                location: 0.0,
                scale: 1.0
            }
        );
        assert_eq!(config.covariates, vec!["valence_z".to_string()]);
        assert_eq!(config.fit_settings().seed, 7);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            AnalysisConfig::from_toml_str("hdi_prob = 1.5"),
            Err(ConfigError::InvalidHdiProb(_))
        ));
        assert!(matches!(
            AnalysisConfig::from_toml_str("sweep_thresholds = []"),
            Err(ConfigError::EmptySweep)
        ));
        assert!(matches!(
            AnalysisConfig::from_toml_str("[sampler]\nchains = 0"),
            Err(ConfigError::Sampler(_))
        ));
        assert!(matches!(
            AnalysisConfig::from_toml_str("unknown_key = 1"),
            Err(ConfigError::TomlParseError(_))
        ));
    }

    #[test]
    fn round_trips_through_a_file() {
        let config = AnalysisConfig {
            min_trajectories: 15,
            ..AnalysisConfig::default()
        };
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();
        assert_eq!(AnalysisConfig::load(file.path()).unwrap(), config);
    }
}
