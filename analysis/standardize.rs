//! # Feature Standardization
//!
//! Continuous features are rescaled to zero mean and unit variance over the
//! *filtered* dataset, so every threshold of the sensitivity sweep gets its own
//! moments. Dispersion is the sample standard deviation (n - 1 denominator).
//!
//! The speed/accuracy interaction ("tradeoff") is only defined on values that
//! have already been standardized: [`interaction`] accepts [`Standardized`]
//! columns, and the only way to obtain one is [`standardize_column`]. The
//! product is then standardized again with its own moments.

use crate::data::Dataset;
use serde::Serialize;
use thiserror::Error;

/// Relative scale below which a standard deviation is treated as zero.
const ZERO_VARIANCE_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StandardizeError {
    #[error(
        "Column '{column}' has zero variance over the {count} filtered values (all equal to {value}); it cannot be standardized."
    )]
    ZeroVariance {
        column: String,
        count: usize,
        value: f64,
    },
    #[error(
        "Column '{column}' has only {found} non-missing values after filtering; at least 2 are needed to estimate a standard deviation."
    )]
    InsufficientValues { column: String, found: usize },
    #[error("Column 'wheels' contains a negative count ({value}) at source row {row}.")]
    NegativeWheels { row: usize, value: f64 },
    #[error("Cannot form an interaction between columns of different lengths ({left} vs {right}).")]
    LengthMismatch { left: usize, right: usize },
}

/// Location and scale used for one standardized column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Moments {
    pub mean: f64,
    pub sd: f64,
    /// Number of non-missing values the moments were computed from.
    pub count: usize,
}

/// A column that has been through [`standardize_column`].
#[derive(Debug, Clone, PartialEq)]
pub struct Standardized {
    name: String,
    values: Vec<Option<f64>>,
    moments: Moments,
}

impl Standardized {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied().flatten()
    }

    pub fn moments(&self) -> Moments {
        self.moments
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Sample mean and standard deviation of the present values.
pub fn sample_moments(values: &[Option<f64>]) -> Option<Moments> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    let count = present.len();
    if count < 2 {
        return None;
    }
    let mean = present.iter().sum::<f64>() / count as f64;
    let ss: f64 = present.iter().map(|v| (v - mean) * (v - mean)).sum();
    Some(Moments {
        mean,
        sd: (ss / (count - 1) as f64).sqrt(),
        count,
    })
}

/// Rescales `raw` to (x - mean) / sd. Missing values stay missing and do not
/// contribute to the moments.
pub fn standardize_column(name: &str, raw: &[Option<f64>]) -> Result<Standardized, StandardizeError> {
    let found = raw.iter().flatten().count();
    let moments = sample_moments(raw).ok_or_else(|| StandardizeError::InsufficientValues {
        column: name.to_string(),
        found,
    })?;

    if !(moments.sd > ZERO_VARIANCE_TOLERANCE * moments.mean.abs().max(1.0)) {
        return Err(StandardizeError::ZeroVariance {
            column: name.to_string(),
            count: moments.count,
            value: moments.mean,
        });
    }

    let values = raw
        .iter()
        .map(|v| v.map(|x| (x - moments.mean) / moments.sd))
        .collect();
    Ok(Standardized {
        name: name.to_string(),
        values,
        moments,
    })
}

/// standardize(speed × accuracy), defined where both inputs are present.
pub fn interaction(
    speed: &Standardized,
    accuracy: &Standardized,
) -> Result<Standardized, StandardizeError> {
    if speed.len() != accuracy.len() {
        return Err(StandardizeError::LengthMismatch {
            left: speed.len(),
            right: accuracy.len(),
        });
    }
    let product: Vec<Option<f64>> = speed
        .values
        .iter()
        .zip(&accuracy.values)
        .map(|(s, a)| match (s, a) {
            (Some(s), Some(a)) => Some(s * a),
            _ => None,
        })
        .collect();
    standardize_column("tradeoff", &product)
}

/// The standardized features available to model terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Feature {
    Speed,
    Accuracy,
    Tradeoff,
    Clicks,
    Wheels,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::Speed,
        Feature::Accuracy,
        Feature::Tradeoff,
        Feature::Clicks,
        Feature::Wheels,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            Feature::Speed => "speed",
            Feature::Accuracy => "accuracy",
            Feature::Tradeoff => "tradeoff",
            Feature::Clicks => "clicks",
            Feature::Wheels => "wheels",
        }
    }
}

/// A filtered dataset together with its standardized features.
#[derive(Debug, Clone)]
pub struct StandardizedDataset {
    dataset: Dataset,
    speed: Standardized,
    accuracy: Standardized,
    tradeoff: Standardized,
    clicks: Standardized,
    wheels: Standardized,
}

impl StandardizedDataset {
    /// Standardizes speed, accuracy, sqrt(wheels) and clicks over `dataset`
    /// (which should already be filtered) and derives the tradeoff term.
    pub fn from_filtered(dataset: Dataset) -> Result<Self, StandardizeError> {
        let column = |f: fn(&crate::data::Recording) -> Option<f64>| -> Vec<Option<f64>> {
            dataset.recordings.iter().map(f).collect()
        };

        let mut sqrt_wheels = Vec::with_capacity(dataset.len());
        for r in &dataset.recordings {
            match r.wheels {
                Some(w) if w < 0.0 => {
                    return Err(StandardizeError::NegativeWheels { row: r.row, value: w });
                }
                w => sqrt_wheels.push(w.map(f64::sqrt)),
            }
        }

        let speed = standardize_column("speed", &column(|r| r.speed))?;
        let accuracy = standardize_column("accuracy", &column(|r| r.accuracy))?;
        let wheels = standardize_column("wheels", &sqrt_wheels)?;
        let clicks = standardize_column("clicks", &column(|r| r.clicks))?;
        let tradeoff = interaction(&speed, &accuracy)?;

        log::info!(
            "Standardized {} recordings: speed mean {:.4} sd {:.4}, accuracy mean {:.4} sd {:.4}",
            dataset.len(),
            speed.moments.mean,
            speed.moments.sd,
            accuracy.moments.mean,
            accuracy.moments.sd
        );

        Ok(Self {
            dataset,
            speed,
            accuracy,
            tradeoff,
            clicks,
            wheels,
        })
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn feature(&self, feature: Feature) -> &Standardized {
        match feature {
            Feature::Speed => &self.speed,
            Feature::Accuracy => &self.accuracy,
            Feature::Tradeoff => &self.tradeoff,
            Feature::Clicks => &self.clicks,
            Feature::Wheels => &self.wheels,
        }
    }

    /// Moments of every standardized feature, in [`Feature::ALL`] order.
    pub fn moments(&self) -> Vec<(Feature, Moments)> {
        Feature::ALL
            .iter()
            .map(|&f| (f, self.feature(f).moments))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Recording;
    use approx::assert_abs_diff_eq;

    fn recording(row: usize, speed: f64, accuracy: Option<f64>, wheels: f64, clicks: f64) -> Recording {
        Recording {
            row,
            user: format!("u{}", row % 3),
            n_traj: 30,
            speed: Some(speed),
            accuracy,
            wheels: Some(wheels),
            clicks: Some(clicks),
            daytime: None,
            weekday: None,
            valence: None,
            arousal: None,
            stress: row % 2 == 0,
            extras: Vec::new(),
        }
    }

    fn sample_dataset() -> Dataset {
        let rows = [
            (1.2, Some(0.91), 4.0, 12.0),
            (0.8, Some(0.75), 0.0, 30.0),
            (1.9, None, 9.0, 7.0),
            (1.4, Some(0.66), 1.0, 18.0),
            (0.6, Some(0.88), 16.0, 25.0),
            (1.1, Some(0.70), 2.0, 9.0),
        ];
        Dataset::new(
            rows.iter()
                .enumerate()
                .map(|(i, &(s, a, w, c))| recording(i, s, a, w, c))
                .collect(),
            Vec::new(),
        )
    }

    fn mean_and_sd(column: &Standardized) -> (f64, f64) {
        let m = sample_moments(column.values()).unwrap();
        (m.mean, m.sd)
    }

    #[test]
    fn standardized_columns_have_zero_mean_unit_sd() {
        let std = StandardizedDataset::from_filtered(sample_dataset()).unwrap();
        for feature in Feature::ALL {
            let (mean, sd) = mean_and_sd(std.feature(feature));
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(sd, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn missing_inputs_stay_missing_and_skip_moments() {
        let std = StandardizedDataset::from_filtered(sample_dataset()).unwrap();
        assert_eq!(std.feature(Feature::Accuracy).get(2), None);
        assert_eq!(std.feature(Feature::Tradeoff).get(2), None);
        assert_eq!(std.feature(Feature::Accuracy).moments().count, 5);
        assert_eq!(std.feature(Feature::Speed).moments().count, 6);
    }

    #[test]
    fn wheels_are_square_rooted_before_scaling() {
        let std = StandardizedDataset::from_filtered(sample_dataset()).unwrap();
        let m = std.feature(Feature::Wheels).moments();
        let roots = [2.0, 0.0, 3.0, 1.0, 4.0, 1.4142135623730951];
        let expected_mean = roots.iter().sum::<f64>() / 6.0;
        assert_abs_diff_eq!(m.mean, expected_mean, epsilon = 1e-12);
    }

    #[test]
    fn tradeoff_is_restandardized_product() {
        let std = StandardizedDataset::from_filtered(sample_dataset()).unwrap();
        let speed = std.feature(Feature::Speed);
        let accuracy = std.feature(Feature::Accuracy);
        let product: Vec<Option<f64>> = (0..speed.len())
            .map(|i| Some(speed.get(i)? * accuracy.get(i)?))
            .collect();
        let m = sample_moments(&product).unwrap();
        for (i, value) in std.feature(Feature::Tradeoff).values().iter().enumerate() {
            match (value, product[i]) {
                (Some(t), Some(p)) => assert_abs_diff_eq!(*t, (p - m.mean) / m.sd, epsilon = 1e-12),
                (None, None) => {}
                other => panic!("presence mismatch at {i}: {other:?}"),
            }
        }
    }

    #[test]
    fn recomputation_is_bit_identical() {
        let first = StandardizedDataset::from_filtered(sample_dataset()).unwrap();
        let second = StandardizedDataset::from_filtered(sample_dataset()).unwrap();
        for feature in Feature::ALL {
            assert_eq!(first.feature(feature), second.feature(feature));
        }
    }

    #[test]
    fn constant_speed_is_a_fatal_error() {
        let dataset = Dataset::new(
            (0..4)
                .map(|i| {
                    let mut r = recording(i, 0.7, Some(0.5 + i as f64 * 0.1), i as f64, i as f64);
                    r.user = "only".to_string();
                    r
                })
                .collect(),
            Vec::new(),
        );
        match StandardizedDataset::from_filtered(dataset) {
            Err(StandardizeError::ZeroVariance { column, count, .. }) => {
                assert_eq!(column, "speed");
                assert_eq!(count, 4);
            }
            other => panic!("expected ZeroVariance, got {other:?}"),
        }
    }

    #[test]
    fn single_value_cannot_be_scaled() {
        let err = standardize_column("clicks", &[Some(3.0), None]).unwrap_err();
        assert_eq!(
            err,
            StandardizeError::InsufficientValues {
                column: "clicks".to_string(),
                found: 1
            }
        );
    }
}
