#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use rayon::prelude::*;
use std::error::Error;
use std::path::PathBuf;
use std::process;

use mousestress::compare::compare_fits;
use mousestress::config::AnalysisConfig;
use mousestress::data::{Dataset, load_recordings};
use mousestress::filter::{FilterSummary, filter_with_summary};
use mousestress::fit::{FitSettings, ModelFit, fit_spec};
use mousestress::model::{ModelSpec, common_rows};
use mousestress::report::plots::{
    FOREST_FILE, PARETO_K_FILE, SCATTER_FILE, SENSITIVITY_FILE, TRACE_FILE, descriptive_scatter,
    forest_plot, pareto_k_plot, sensitivity_plot, trace_plot,
};
use mousestress::report::tables::{
    comparison_table, descriptive_table, filter_table, loo_table, pairwise_table,
    parameter_table, sweep_table,
};
use mousestress::report::{
    COMPARISON_FILE, FIT_REPORT_FILE, FitReport, LOO_FILE, PARAMETERS_FILE, SWEEP_FILE, describe,
    ensure_dir, write_comparison_tsv, write_loo_tsv, write_parameters_tsv, write_sweep_tsv,
};
use mousestress::standardize::StandardizedDataset;
use mousestress::sweep::{SweepPoint, run_sweep};

type CliResult = Result<(), Box<dyn Error>>;

/// Options shared by every subcommand. Flags override the config file.
#[derive(Args, Clone)]
struct CommonArgs {
    /// Path to the recordings CSV (one row per session, with a header)
    #[arg(value_name = "CSV")]
    data: PathBuf,

    /// Optional TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory for tables, reports and charts
    #[arg(long, value_name = "DIR", default_value = "mousestress_out")]
    out: PathBuf,

    /// Minimum number of trajectories per session
    #[arg(long, value_name = "N")]
    min_trajectories: Option<u32>,

    /// Seed for the sampler; identical seeds give identical draws
    #[arg(long)]
    seed: Option<u64>,

    /// Probability mass of the reported highest-density intervals
    #[arg(long, value_name = "P")]
    hdi_prob: Option<f64>,

    /// Number of MCMC chains
    #[arg(long)]
    chains: Option<usize>,

    /// Warmup iterations per chain
    #[arg(long)]
    warmup: Option<usize>,

    /// Retained draws per chain
    #[arg(long)]
    draws: Option<usize>,

    /// Skip SVG charts
    #[arg(long)]
    no_plots: bool,
}

#[derive(Parser)]
#[command(
    name = "mousestress",
    about = "Bayesian hierarchical analysis of mouse-movement features and self-reported stress",
    long_about = "Fits random-intercept logistic regressions of stress on standardized mouse \
                 features, with PSIS-LOO model comparison and a minimum-trajectory sensitivity sweep."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the filtered data by stress label
    #[command(about = "Describe the filtered data (outputs: descriptive_scatter.svg)")]
    Describe(CommonArgs),

    /// Fit one model and report its posterior
    #[command(about = "Fit one model (outputs: parameters.tsv, loo.tsv, fit_report.toml)")]
    Fit {
        #[command(flatten)]
        common: CommonArgs,

        /// One of: intercept, mouse, usage, temporal
        #[arg(long, default_value = "mouse")]
        model: String,
    },

    /// Fit the nested models on common rows and compare them by PSIS-LOO
    #[command(about = "Compare nested models (outputs: comparison.tsv)")]
    Compare {
        #[command(flatten)]
        common: CommonArgs,

        /// Models to compare; defaults to the full nested sequence
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
    },

    /// Refit one model over a range of minimum-trajectory thresholds
    #[command(about = "Sensitivity sweep (outputs: sweep.tsv, sensitivity.svg)")]
    Sweep {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, default_value = "mouse")]
        model: String,

        /// Comma-separated thresholds; defaults to the configured list
        #[arg(long, value_delimiter = ',')]
        thresholds: Vec<u32>,
    },

    /// Run every stage: describe, fit, compare, sweep
    #[command(about = "Run the whole analysis")]
    Analyze {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, default_value = "mouse")]
        model: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Describe(common)) => {
            Session::open(&common).and_then(|session| session.describe())
        }
        Some(Commands::Fit { common, model }) => {
            Session::open(&common).and_then(|session| session.fit(&model))
        }
        Some(Commands::Compare { common, models }) => {
            Session::open(&common).and_then(|session| session.compare(&models))
        }
        Some(Commands::Sweep {
            common,
            model,
            thresholds,
        }) => Session::open(&common).and_then(|session| session.sweep(&model, &thresholds)),
        Some(Commands::Analyze { common, model }) => Session::open(&common).and_then(|session| {
            session.describe()?;
            session.fit(&model)?;
            session.compare(&[])?;
            session.sweep(&model, &[])
        }),
        None => {
            Cli::command()
                .print_help()
                .map(|_| println!())
                .map_err(Into::into)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Loaded data and resolved configuration for one invocation.
struct Session {
    config: AnalysisConfig,
    out: PathBuf,
    plots: bool,
    raw: Dataset,
    filter: FilterSummary,
    data: StandardizedDataset,
}

impl Session {
    fn open(args: &CommonArgs) -> Result<Self, Box<dyn Error>> {
        let mut config = match &args.config {
            Some(path) => AnalysisConfig::load(path)?,
            None => AnalysisConfig::default(),
        };
        if let Some(v) = args.min_trajectories {
            config.min_trajectories = v;
        }
        if let Some(v) = args.seed {
            config.seed = v;
        }
        if let Some(v) = args.hdi_prob {
            config.hdi_prob = v;
        }
        if let Some(v) = args.chains {
            config.sampler.chains = v;
        }
        if let Some(v) = args.warmup {
            config.sampler.warmup = v;
        }
        if let Some(v) = args.draws {
            config.sampler.draws = v;
        }
        config.validate()?;

        println!("Loading recordings from: {}", args.data.display());
        let raw = load_recordings(&args.data)?;
        println!(
            "Loaded {} recordings from {} users ({} extra numeric columns)",
            raw.len(),
            raw.users().len(),
            raw.extra_columns.len()
        );
        let (filtered, filter) = filter_with_summary(&raw, config.min_trajectories);
        println!("{}", filter_table(&filter));
        let data = StandardizedDataset::from_filtered(filtered)?;
        ensure_dir(&args.out)?;

        Ok(Self {
            config,
            out: args.out.clone(),
            plots: !args.no_plots,
            raw,
            filter,
            data,
        })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.out.join(file)
    }

    fn settings(&self, progress: bool) -> FitSettings {
        let mut settings = self.config.fit_settings();
        settings.sampler.progress = progress;
        settings
    }

    fn spec(&self, name: &str) -> Result<ModelSpec, Box<dyn Error>> {
        let spec = ModelSpec::by_name(name).ok_or_else(|| {
            format!("Unknown model '{name}'. Expected one of: intercept, mouse, usage, temporal")
        })?;
        Ok(spec.with_covariates(&self.config.covariates))
    }

    fn describe(&self) -> CliResult {
        println!(
            "Filtered data: {} of {} recordings kept at n_traj >= {}",
            self.filter.rows_kept, self.filter.rows_in, self.filter.threshold
        );
        let summary = describe(self.data.dataset());
        println!(
            "{} recordings, {} users, {} labelled stressed",
            summary.recordings, summary.users, summary.stressed
        );
        println!("{}", descriptive_table(&summary));
        if self.plots {
            descriptive_scatter(&self.path(SCATTER_FILE), &self.data)?;
        }
        Ok(())
    }

    fn fit(&self, model: &str) -> CliResult {
        let spec = self.spec(model)?;
        println!("Fitting model '{}' with terms: {}", spec.name, term_list(&spec));
        let fit = fit_spec(&self.data, &spec, None, &self.settings(true))?;
        let hdi_prob = self.config.hdi_prob;

        let summaries = fit.summary(hdi_prob)?;
        let convergence = fit.convergence(self.config.convergence)?;
        println!("{}", parameter_table(&summaries, hdi_prob, &convergence));
        if convergence.converged {
            println!("All chains converged.");
        } else {
            for warning in convergence.warnings() {
                println!("[WARNING] {warning}");
            }
        }

        let loo = fit.loo()?;
        println!("{}", loo_table(&loo));

        write_parameters_tsv(&self.path(PARAMETERS_FILE), &spec.name, &summaries)?;
        write_loo_tsv(&self.path(LOO_FILE), &spec.name, &loo, fit.data_rows())?;
        FitReport::new(&fit, hdi_prob, Some(&loo))?.save(&self.path(FIT_REPORT_FILE))?;

        if self.plots {
            let population = &summaries[..fit.n_population()];
            forest_plot(&self.path(FOREST_FILE), population, hdi_prob)?;
            trace_plot(&self.path(TRACE_FILE), &fit)?;
            pareto_k_plot(&self.path(PARETO_K_FILE), &loo)?;
        }
        println!("Results written to {}", self.out.display());
        Ok(())
    }

    fn compare(&self, names: &[String]) -> CliResult {
        let specs: Vec<ModelSpec> = if names.is_empty() {
            ModelSpec::nested()
                .into_iter()
                .map(|s| s.with_covariates(&self.config.covariates))
                .collect()
        } else {
            names
                .iter()
                .map(|n| self.spec(n))
                .collect::<Result<_, _>>()?
        };
        let rows = common_rows(&self.data, &specs)?;
        println!(
            "Comparing {} models on {} common recordings",
            specs.len(),
            rows.len()
        );

        let settings = self.settings(false);
        let fits: Vec<ModelFit> = specs
            .par_iter()
            .map(|spec| fit_spec(&self.data, spec, Some(rows.as_slice()), &settings))
            .collect::<Result<_, _>>()?;
        let comparison = compare_fits(&fits)?;

        println!("{}", comparison_table(&comparison));
        println!("{}", pairwise_table(&comparison));
        println!("Preferred model (smallest looic): {}", comparison.best);
        write_comparison_tsv(&self.path(COMPARISON_FILE), &comparison)?;
        Ok(())
    }

    fn sweep(&self, model: &str, thresholds: &[u32]) -> CliResult {
        let spec = self.spec(model)?;
        let thresholds = if thresholds.is_empty() {
            self.config.sweep_thresholds.clone()
        } else {
            thresholds.to_vec()
        };
        println!(
            "Sensitivity sweep of '{}' over thresholds {:?}",
            spec.name, thresholds
        );
        let points = run_sweep(
            &self.raw,
            &thresholds,
            &spec,
            &self.settings(false),
            self.config.hdi_prob,
        );

        let parameters = population_names(&points);
        println!("{}", sweep_table(&points, &parameters));
        write_sweep_tsv(&self.path(SWEEP_FILE), &points)?;
        if self.plots && !parameters.is_empty() {
            sensitivity_plot(&self.path(SENSITIVITY_FILE), &points, &parameters)?;
        }
        Ok(())
    }
}

fn term_list(spec: &ModelSpec) -> String {
    if spec.terms.is_empty() {
        return "(intercept only)".to_string();
    }
    spec.terms
        .iter()
        .map(|t| t.label())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parameter names of the first successful sweep point.
fn population_names(points: &[SweepPoint]) -> Vec<String> {
    points
        .iter()
        .find_map(|p| p.outcome.as_ref().ok())
        .map(|fit| fit.coefficients.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}
