//! # Data Loading and Validation Module
//!
//! This module is the exclusive entry point for user-provided data. It reads the
//! session table (CSV with a header row), validates it against a fixed schema,
//! and produces the ordered [`Dataset`] of [`Recording`]s that every later stage
//! consumes.
//!
//! - Strict Schema: the column names below are not configurable. A missing
//!   column is a fatal configuration error naming the column.
//! - Nullable Features: mouse features, usage counts, temporal covariates and
//!   the mood ratings may be empty fields. Whether a null is acceptable is
//!   decided downstream (the filter drops null speed, designs drop incomplete
//!   rows), never here.
//! - Extra Columns: any additional numeric column is kept as an optional
//!   covariate so restricted covariates can be present or absent without
//!   changing the fitting contract.
//! - Performance: parsing goes through the `polars` CSV reader with full-table
//!   schema inference, so a column that is integral for the first rows and
//!   fractional later is still typed correctly.

use ahash::AHashSet;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Columns that must be present in every input file.
pub const REQUIRED_COLUMNS: [&str; 11] = [
    "user", "n_traj", "speed", "accuracy", "wheels", "clicks", "daytime", "weekday", "valence",
    "arousal", "stress",
];

/// Time-of-day as recorded. A column is either entirely numeric (an hour or a
/// fraction of the day) or entirely categorical ("morning", "evening", ...).
#[derive(Debug, Clone, PartialEq)]
pub enum Daytime {
    Numeric(f64),
    Label(String),
}

/// One session for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    /// Zero-based data row in the source file. Used as the identity of the
    /// observation when checking that two fits saw the same data.
    pub row: usize,
    pub user: String,
    /// Number of mouse trajectories observed in the session.
    pub n_traj: u32,
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub wheels: Option<f64>,
    pub clicks: Option<f64>,
    pub daytime: Option<Daytime>,
    pub weekday: Option<String>,
    /// Self-reported valence on the 1-7 scale.
    pub valence: Option<f64>,
    /// Self-reported arousal on the 1-7 scale.
    pub arousal: Option<f64>,
    pub stress: bool,
    /// Values of the dataset's extra covariate columns, aligned with
    /// [`Dataset::extra_columns`].
    pub extras: Vec<Option<f64>>,
}

/// Ordered collection of recordings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub recordings: Vec<Recording>,
    /// Names of numeric columns found beyond the required schema.
    pub extra_columns: Vec<String>,
}

impl Dataset {
    pub fn new(recordings: Vec<Recording>, extra_columns: Vec<String>) -> Self {
        Self {
            recordings,
            extra_columns,
        }
    }

    pub fn len(&self) -> usize {
        self.recordings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.is_empty()
    }

    /// Distinct user identifiers in first-appearance order.
    pub fn users(&self) -> Vec<&str> {
        let mut seen = AHashSet::new();
        self.recordings
            .iter()
            .filter(|r| seen.insert(r.user.as_str()))
            .map(|r| r.user.as_str())
            .collect()
    }

    /// Position of an extra covariate column, if the file carried it.
    pub fn extra_index(&self, name: &str) -> Option<usize> {
        self.extra_columns.iter().position(|c| c == name)
    }

    /// Keeps the recordings for which `keep` returns true, preserving order.
    pub fn retain_where<F>(&self, keep: F) -> Dataset
    where
        F: Fn(&Recording) -> bool,
    {
        Dataset {
            recordings: self
                .recordings
                .iter()
                .filter(|r| keep(r))
                .cloned()
                .collect(),
            extra_columns: self.extra_columns.clone(),
        }
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing values were found in the required column '{0}'. This column may not contain empty fields."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in column '{0}'. Encode missing values as empty fields instead."
    )]
    NonFiniteValuesFound(String),
    #[error("Column '{column_name}' must hold non-negative whole numbers, but row {row} contains {value}.")]
    InvalidCount {
        column_name: String,
        row: usize,
        value: f64,
    },
    #[error("The 'stress' column must be 0 or 1, but row {row} contains {value}.")]
    InvalidStressLabel { row: usize, value: f64 },
    #[error("The input file '{0}' contains no data rows.")]
    EmptyInput(String),
}

/// Loads and validates the session table at `path`.
pub fn load_recordings(path: &Path) -> Result<Dataset, DataError> {
    log::info!("Loading recordings from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(None),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::EmptyInput(path.display().to_string()));
    }

    let dataset = internal::dataset_from_frame(&df)?;
    log::info!(
        "Loaded {} recordings from {} users ({} extra covariate columns)",
        dataset.len(),
        dataset.users().len(),
        dataset.extra_columns.len()
    );
    Ok(dataset)
}

mod internal {
    use super::*;

    pub(super) fn dataset_from_frame(df: &DataFrame) -> Result<Dataset, DataError> {
        let present: AHashSet<String> = df
            .get_column_names()
            .iter()
            .map(|c| c.to_string())
            .collect();
        for required in REQUIRED_COLUMNS {
            if !present.contains(required) {
                return Err(DataError::ColumnNotFound(required.to_string()));
            }
        }

        let users = required_strings(df, "user")?;
        let n_traj = counts(df, "n_traj")?;
        let speed = nullable_floats(df, "speed")?;
        let accuracy = nullable_floats(df, "accuracy")?;
        let wheels = nullable_counts(df, "wheels")?;
        let clicks = nullable_counts(df, "clicks")?;
        let daytime = daytime_column(df)?;
        let weekday = nullable_strings(df, "weekday")?;
        let valence = nullable_floats(df, "valence")?;
        let arousal = nullable_floats(df, "arousal")?;
        let stress = stress_labels(df)?;

        // Every numeric column outside the schema becomes an optional covariate.
        let mut extra_columns = Vec::new();
        let mut extra_values = Vec::new();
        for name in df.get_column_names() {
            let name = name.to_string();
            if REQUIRED_COLUMNS.contains(&name.as_str()) {
                continue;
            }
            match numeric_if_possible(df, &name)? {
                Some(values) => {
                    extra_columns.push(name);
                    extra_values.push(values);
                }
                None => log::debug!("Ignoring non-numeric extra column '{name}'"),
            }
        }

        let recordings = (0..df.height())
            .map(|i| Recording {
                row: i,
                user: users[i].clone(),
                n_traj: n_traj[i],
                speed: speed[i],
                accuracy: accuracy[i],
                wheels: wheels[i],
                clicks: clicks[i],
                daytime: daytime[i].clone(),
                weekday: weekday[i].clone(),
                valence: valence[i],
                arousal: arousal[i],
                stress: stress[i],
                extras: extra_values.iter().map(|column| column[i]).collect(),
            })
            .collect();

        Ok(Dataset::new(recordings, extra_columns))
    }

    fn nullable_floats(df: &DataFrame, column_name: &str) -> Result<Vec<Option<f64>>, DataError> {
        let column = df.column(column_name)?;
        let casted = column.cast(&DataType::Float64)?;
        if casted.null_count() > column.null_count() {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", column.dtype()),
            });
        }
        let values: Vec<Option<f64>> = casted.f64()?.into_iter().collect();
        if values.iter().flatten().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    fn nullable_counts(df: &DataFrame, column_name: &str) -> Result<Vec<Option<f64>>, DataError> {
        let values = nullable_floats(df, column_name)?;
        for (row, value) in values.iter().enumerate() {
            if let Some(v) = *value {
                if v < 0.0 || v.fract() != 0.0 {
                    return Err(DataError::InvalidCount {
                        column_name: column_name.to_string(),
                        row,
                        value: v,
                    });
                }
            }
        }
        Ok(values)
    }

    fn counts(df: &DataFrame, column_name: &str) -> Result<Vec<u32>, DataError> {
        nullable_counts(df, column_name)?
            .into_iter()
            .enumerate()
            .map(|(row, v)| {
                let count =
                    v.ok_or_else(|| DataError::MissingValuesFound(column_name.to_string()))?;
                // Whole and non-negative already; `as u64` saturates above u64::MAX.
                u32::try_from(count as u64).map_err(|_| DataError::InvalidCount {
                    column_name: column_name.to_string(),
                    row,
                    value: count,
                })
            })
            .collect()
    }

    fn nullable_strings(df: &DataFrame, column_name: &str) -> Result<Vec<Option<String>>, DataError> {
        let casted = df.column(column_name)?.cast(&DataType::String)?;
        let values = casted
            .str()?
            .into_iter()
            .map(|v| {
                v.map(str::trim)
                    .filter(|text| !text.is_empty())
                    .map(str::to_string)
            })
            .collect();
        Ok(values)
    }

    fn required_strings(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
        nullable_strings(df, column_name)?
            .into_iter()
            .map(|v| v.ok_or_else(|| DataError::MissingValuesFound(column_name.to_string())))
            .collect()
    }

    /// Returns `None` when the column holds text that does not parse as numbers.
    fn numeric_if_possible(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Option<Vec<Option<f64>>>, DataError> {
        let column = df.column(column_name)?;
        let casted = column.cast(&DataType::Float64)?;
        if casted.null_count() > column.null_count() {
            return Ok(None);
        }
        let values: Vec<Option<f64>> = casted.f64()?.into_iter().collect();
        if values.iter().flatten().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(Some(values))
    }

    fn daytime_column(df: &DataFrame) -> Result<Vec<Option<Daytime>>, DataError> {
        if let Some(values) = numeric_if_possible(df, "daytime")? {
            return Ok(values
                .into_iter()
                .map(|v| v.map(Daytime::Numeric))
                .collect());
        }
        Ok(nullable_strings(df, "daytime")?
            .into_iter()
            .map(|v| v.map(Daytime::Label))
            .collect())
    }

    fn stress_labels(df: &DataFrame) -> Result<Vec<bool>, DataError> {
        let values = nullable_floats(df, "stress")?;
        values
            .into_iter()
            .enumerate()
            .map(|(row, v)| match v {
                None => Err(DataError::MissingValuesFound("stress".to_string())),
                Some(label) if label == 0.0 => Ok(false),
                Some(label) if label == 1.0 => Ok(true),
                Some(label) => Err(DataError::InvalidStressLabel { row, value: label }),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str =
        "user,n_traj,speed,accuracy,wheels,clicks,daytime,weekday,valence,arousal,stress";

    fn write_csv(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{body}").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn loads_nullable_fields_and_keeps_order() {
        let file = write_csv(&format!(
            "{HEADER}\n\
             u1,5,,0.9,3,10,9.5,Mon,4,3,0\n\
             u2,12,1.2,,0,4,13.0,Tue,2,6,1\n\
             u1,20,0.8,0.7,,7,18.25,,5,2,0"
        ));
        let dataset = load_recordings(file.path()).unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.users(), vec!["u1", "u2"]);
        let first = &dataset.recordings[0];
        assert_eq!(first.row, 0);
        assert_eq!(first.n_traj, 5);
        assert_eq!(first.speed, None);
        assert_eq!(first.accuracy, Some(0.9));
        assert_eq!(first.daytime, Some(Daytime::Numeric(9.5)));
        assert!(!first.stress);
        let second = &dataset.recordings[1];
        assert_eq!(second.accuracy, None);
        assert!(second.stress);
        let third = &dataset.recordings[2];
        assert_eq!(third.wheels, None);
        assert_eq!(third.weekday, None);
    }

    #[test]
    fn missing_column_is_fatal_and_named() {
        let file = write_csv(
            "user,n_traj,speed,accuracy,wheels,clicks,daytime,weekday,valence,stress\n\
             u1,5,1.0,0.9,3,10,9,Mon,4,0",
        );
        match load_recordings(file.path()) {
            Err(DataError::ColumnNotFound(name)) => assert_eq!(name, "arousal"),
            other => panic!("expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn categorical_daytime_and_extra_covariates() {
        let file = write_csv(&format!(
            "{HEADER},age,site\n\
             u1,15,1.0,0.9,3,10,morning,Mon,4,3,0,31,lab\n\
             u2,22,1.1,0.8,1,12,evening,Tue,2,6,1,,home"
        ));
        let dataset = load_recordings(file.path()).unwrap();

        assert_eq!(dataset.extra_columns, vec!["age".to_string()]);
        assert_eq!(dataset.extra_index("age"), Some(0));
        assert_eq!(dataset.recordings[0].extras, vec![Some(31.0)]);
        assert_eq!(dataset.recordings[1].extras, vec![None]);
        assert_eq!(
            dataset.recordings[1].daytime,
            Some(Daytime::Label("evening".to_string()))
        );
    }

    #[test]
    fn rejects_non_binary_stress_and_fractional_counts() {
        let file = write_csv(&format!("{HEADER}\nu1,15,1.0,0.9,3,10,9,Mon,4,3,2"));
        assert!(matches!(
            load_recordings(file.path()),
            Err(DataError::InvalidStressLabel { row: 0, .. })
        ));

        let file = write_csv(&format!("{HEADER}\nu1,15,1.0,0.9,2.5,10,9,Mon,4,3,1"));
        assert!(matches!(
            load_recordings(file.path()),
            Err(DataError::InvalidCount { .. })
        ));
    }

    #[test]
    fn trajectory_count_beyond_u32_is_rejected() {
        let file = write_csv(&format!(
            "{HEADER}\nu1,12,1.0,0.9,3,10,9,Mon,4,3,1\nu2,5000000000,1.1,0.8,2,11,9,Tue,4,3,0"
        ));
        match load_recordings(file.path()) {
            Err(DataError::InvalidCount {
                column_name,
                row,
                value,
            }) => {
                assert_eq!(column_name, "n_traj");
                assert_eq!(row, 1);
                assert_eq!(value, 5e9);
            }
            other => panic!("expected an invalid count, got {:?}", other.map(|d| d.len())),
        }
    }
}
