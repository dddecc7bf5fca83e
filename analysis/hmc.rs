//! NUTS Sampler using mini-mcmc
//!
//! Posterior draws come from mini-mcmc's No-U-Turn sampler (slice NUTS with
//! dual-averaging step-size adaptation) on burn's ndarray backend.
//!
//! # Design
//!
//! mini-mcmc's NUTS uses an identity mass matrix, so the target is whitened
//! first using the Cholesky decomposition of the inverse Hessian at the mode:
//!
//! - Transform: θ = θ̂ + L @ z  (where L L^T = H^{-1})
//! - The whitened space has roughly unit covariance, so one step size fits
//!   every direction
//! - Draws are un-transformed back to the original space before storage
//!
//! # Analytical Gradients
//!
//! `unnorm_logp_and_grad` is overridden to evaluate the log density and its
//! gradient with ndarray through [`LogDensity`], so burn's autodiff graph is
//! never built.
//!
//! # Chains
//!
//! Each chain is a [`NUTSChain`] seeded from the run seed and its chain index,
//! run on the rayon pool and collected in chain order. Draws are taken in
//! blocks so a wall-clock limit can stop a run between blocks.

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use mini_mcmc::distributions::GradientTarget;
use mini_mcmc::nuts::NUTSChain;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Cholesky, Inverse, UPLO};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Backend type for NUTS, f64 for numerical precision.
pub type NutsBackend = Autodiff<NdArray<f64>>;

const INIT_ATTEMPTS: usize = 100;
const CHAIN_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;
/// Draws per call into the chain between deadline checks.
const DRAW_BLOCK: usize = 100;

/// An unnormalized log density with its gradient.
pub trait LogDensity: Clone + Sync {
    fn dim(&self) -> usize;

    /// Returns `(log p(x), ∇ log p(x))`. Non-finite values mark points
    /// outside the support.
    fn logp_and_grad(&self, position: &Array1<f64>) -> (f64, Array1<f64>);
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    #[error("Invalid sampler configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Sampling exceeded the {limit_secs}s time limit (chain {chain} stopped at iteration {iteration})."
    )]
    Timeout {
        limit_secs: u64,
        chain: usize,
        iteration: usize,
    },

    #[error("Chain {chain} could not find a starting point with finite log density.")]
    NonFiniteStart { chain: usize },

    #[error("Chain {chain} returned draws that could not be read: {message}")]
    UnreadableDraws { chain: usize, message: String },
}

/// Settings for one sampling run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerConfig {
    /// Number of independent chains.
    pub chains: usize,
    /// Adaptation iterations per chain, discarded.
    pub warmup: usize,
    /// Retained draws per chain.
    pub draws: usize,
    /// Dual-averaging target for the mean acceptance statistic.
    pub target_accept: f64,
    /// Standard deviation of the starting-point jitter in whitened space.
    pub init_jitter: f64,
    /// Wall-clock limit for the whole run.
    pub timeout_secs: Option<u64>,
    /// Draw a progress bar on stderr when it is a terminal.
    #[serde(skip)]
    pub progress: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            warmup: 1000,
            draws: 1000,
            target_accept: 0.8,
            init_jitter: 0.5,
            timeout_secs: None,
            progress: false,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.chains == 0 {
            return Err(SamplerError::InvalidConfig(
                "at least one chain is required".to_string(),
            ));
        }
        if self.draws < 4 {
            return Err(SamplerError::InvalidConfig(format!(
                "at least 4 draws per chain are required for split diagnostics, got {}",
                self.draws
            )));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(SamplerError::InvalidConfig(format!(
                "target_accept must lie strictly between 0 and 1, got {}",
                self.target_accept
            )));
        }
        if !(self.init_jitter.is_finite() && self.init_jitter >= 0.0) {
            return Err(SamplerError::InvalidConfig(format!(
                "init_jitter must be finite and non-negative, got {}",
                self.init_jitter
            )));
        }
        Ok(())
    }
}

/// Affine map from whitened coordinates back to the original parameters.
#[derive(Clone, Debug)]
pub struct Whitening {
    mode: Array1<f64>,
    /// L where L L^T = H^{-1}.
    chol: Array2<f64>,
    /// L^T for the gradient chain rule: ∇_z = L^T @ ∇_θ.
    chol_t: Array2<f64>,
}

impl Whitening {
    /// Builds L = C^{-T} from H = C C^T. A Hessian that is not positive
    /// definite falls back to a diagonal scaling from its positive diagonal.
    pub fn from_hessian(mode: Array1<f64>, hessian: &Array2<f64>) -> Self {
        let factor = hessian
            .cholesky(UPLO::Lower)
            .and_then(|c| c.inv())
            .map(|c_inv| c_inv.t().to_owned());
        match factor {
            Ok(chol) if chol.iter().all(|v| v.is_finite()) => Self::with_chol(mode, chol),
            _ => {
                log::warn!(
                    "Hessian at the mode is not positive definite; using a diagonal metric"
                );
                let scales = hessian.diag().mapv(|h| {
                    if h.is_finite() && h > 1e-8 {
                        1.0 / h.sqrt()
                    } else {
                        1.0
                    }
                });
                Self::with_chol(mode, Array2::from_diag(&scales))
            }
        }
    }

    pub fn identity(mode: Array1<f64>) -> Self {
        let dim = mode.len();
        Self::with_chol(mode, Array2::eye(dim))
    }

    fn with_chol(mode: Array1<f64>, chol: Array2<f64>) -> Self {
        let chol_t = chol.t().to_owned();
        Self { mode, chol, chol_t }
    }

    pub fn dim(&self) -> usize {
        self.mode.len()
    }

    pub fn to_original(&self, z: &Array1<f64>) -> Array1<f64> {
        &self.mode + &self.chol.dot(z)
    }
}

/// Target evaluated in whitened coordinates. Cloned once per chain; the
/// heavy parts sit behind `Arc`.
#[derive(Clone)]
struct Whitened<T: LogDensity> {
    target: T,
    whitening: Arc<Whitening>,
}

impl<T: LogDensity> Whitened<T> {
    /// Log density and gradient in z. Points outside the support come back
    /// as `-inf` with a zero gradient so the trajectory stops there.
    fn evaluate(&self, z: &Array1<f64>) -> (f64, Array1<f64>) {
        let theta = self.whitening.to_original(z);
        let (logp, grad) = self.target.logp_and_grad(&theta);
        let grad_z = self.whitening.chol_t.dot(&grad);
        if logp.is_finite() && grad_z.iter().all(|g| g.is_finite()) {
            (logp, grad_z)
        } else {
            (f64::NEG_INFINITY, Array1::zeros(z.len()))
        }
    }

    fn evaluate_tensor(&self, z: Tensor<NutsBackend, 1>) -> (f64, Array1<f64>) {
        match z.into_data().to_vec::<f64>() {
            Ok(values) => self.evaluate(&Array1::from_vec(values)),
            Err(_) => (f64::NEG_INFINITY, Array1::zeros(self.whitening.dim())),
        }
    }
}

impl<T: LogDensity> GradientTarget<f64, NutsBackend> for Whitened<T> {
    fn unnorm_logp(&self, z: Tensor<NutsBackend, 1>) -> Tensor<NutsBackend, 1> {
        let device = z.device();
        let (logp, _) = self.evaluate_tensor(z);
        Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device)
    }

    fn unnorm_logp_and_grad(
        &self,
        z: Tensor<NutsBackend, 1>,
    ) -> (Tensor<NutsBackend, 1>, Tensor<NutsBackend, 1>) {
        let device = z.device();
        let (logp, grad) = self.evaluate_tensor(z);
        let dim = grad.len();
        let logp_tensor =
            Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device);
        let grad_tensor =
            Tensor::<NutsBackend, 1>::from_data(TensorData::new(grad.to_vec(), [dim]), &device);
        (logp_tensor, grad_tensor)
    }
}

/// Per-chain sampler statistics over the retained draws.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChainStats {
    pub chain: usize,
    /// Fraction of consecutive draws that differ. Near zero means the chain
    /// is stuck.
    pub move_rate: f64,
    pub warmup_secs: f64,
    pub sampling_secs: f64,
}

/// Draws from one chain in the original parameterization.
#[derive(Clone, Debug)]
pub struct ChainOutput {
    /// Shape `(draws, dim)`.
    pub draws: Array2<f64>,
    pub stats: ChainStats,
}

fn create_progress_bar(len: u64, enabled: bool) -> ProgressBar {
    let draw_target = if enabled && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message("NUTS iterations");
    pb
}

fn chain_seed(seed: u64, chain: usize) -> u64 {
    seed ^ (chain as u64 + 1).wrapping_mul(CHAIN_SEED_STRIDE)
}

/// Runs `config.chains` NUTS chains and returns them in chain order.
pub fn run_nuts<T: LogDensity>(
    target: &T,
    whitening: &Whitening,
    config: &SamplerConfig,
    seed: u64,
) -> Result<Vec<ChainOutput>, SamplerError> {
    config.validate()?;
    let whitened = Whitened {
        target: target.clone(),
        whitening: Arc::new(whitening.clone()),
    };
    let deadline = config
        .timeout_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let per_chain = (config.warmup + config.draws) as u64;
    let pb = create_progress_bar(per_chain * config.chains as u64, config.progress);

    let outputs = (0..config.chains)
        .into_par_iter()
        .map(|chain| {
            let runner = ChainRunner {
                chain,
                seed: chain_seed(seed, chain),
                config,
                deadline,
            };
            runner.run(whitened.clone(), &pb)
        })
        .collect::<Result<Vec<_>, _>>();
    pb.finish_and_clear();
    outputs
}

struct ChainRunner<'a> {
    chain: usize,
    seed: u64,
    config: &'a SamplerConfig,
    deadline: Option<Instant>,
}

impl ChainRunner<'_> {
    fn check_deadline(&self, iteration: usize) -> Result<(), SamplerError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(SamplerError::Timeout {
                limit_secs: self.config.timeout_secs.unwrap_or_default(),
                chain: self.chain,
                iteration,
            }),
            _ => Ok(()),
        }
    }

    /// Jittered start around the mode, shrinking the jitter until the log
    /// density and its gradient are finite.
    fn initial_position<T: LogDensity>(&self, target: &Whitened<T>) -> Result<Vec<f64>, SamplerError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut jitter = self.config.init_jitter;
        for _ in 0..INIT_ATTEMPTS {
            let z: Array1<f64> = (0..target.whitening.dim())
                .map(|_| {
                    let draw: f64 = StandardNormal.sample(&mut rng);
                    jitter * draw
                })
                .collect();
            if target.evaluate(&z).0.is_finite() {
                return Ok(z.to_vec());
            }
            jitter *= 0.5;
        }
        Err(SamplerError::NonFiniteStart { chain: self.chain })
    }

    fn read_block(&self, block: Tensor<NutsBackend, 2>) -> Result<Vec<f64>, SamplerError> {
        block
            .into_data()
            .to_vec::<f64>()
            .map_err(|e| SamplerError::UnreadableDraws {
                chain: self.chain,
                message: format!("{e:?}"),
            })
    }

    fn run<T: LogDensity>(
        &self,
        target: Whitened<T>,
        pb: &ProgressBar,
    ) -> Result<ChainOutput, SamplerError> {
        let config = self.config;
        let whitening = Arc::clone(&target.whitening);
        let dim = whitening.dim();
        let start = self.initial_position(&target)?;
        self.check_deadline(0)?;

        let mut nuts = NUTSChain::<f64, NutsBackend, Whitened<T>>::new(
            target,
            start,
            config.target_accept,
        )
        .set_seed(self.seed);

        // Step-size adaptation only spans a single call.
        let started = Instant::now();
        nuts.run(1, config.warmup);
        let warmup_secs = started.elapsed().as_secs_f64();
        pb.inc(config.warmup as u64);

        let started = Instant::now();
        let mut draws = Array2::<f64>::zeros((config.draws, dim));
        let mut filled = 0;
        while filled < config.draws {
            self.check_deadline(config.warmup + filled)?;
            let len = DRAW_BLOCK.min(config.draws - filled);
            // Row 0 is the position the block starts from.
            let values = self.read_block(nuts.run(len + 1, 0))?;
            for (offset, z) in values.chunks_exact(dim).skip(1).take(len).enumerate() {
                let theta = whitening.to_original(&Array1::from_vec(z.to_vec()));
                draws.row_mut(filled + offset).assign(&theta);
            }
            filled += len;
            pb.inc(len as u64);
        }

        let moves = draws
            .rows()
            .into_iter()
            .zip(draws.rows().into_iter().skip(1))
            .filter(|(a, b)| a != b)
            .count();
        let stats = ChainStats {
            chain: self.chain,
            move_rate: moves as f64 / (config.draws - 1) as f64,
            warmup_secs,
            sampling_secs: started.elapsed().as_secs_f64(),
        };
        log::debug!(
            "Chain {}: move rate {:.3}, warmup {:.2}s, sampling {:.2}s",
            stats.chain,
            stats.move_rate,
            stats.warmup_secs,
            stats.sampling_secs
        );
        Ok(ChainOutput { draws, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Axis, array};

    /// Independent normals with the given means and standard deviations.
    #[derive(Clone)]
    struct DiagonalNormal {
        mean: Array1<f64>,
        sd: Array1<f64>,
    }

    impl LogDensity for DiagonalNormal {
        fn dim(&self) -> usize {
            self.mean.len()
        }

        fn logp_and_grad(&self, x: &Array1<f64>) -> (f64, Array1<f64>) {
            let z = (x - &self.mean) / &self.sd;
            let logp = -0.5 * z.dot(&z);
            let grad = -&z / &self.sd;
            (logp, grad)
        }
    }

    fn quick_config() -> SamplerConfig {
        SamplerConfig {
            chains: 2,
            warmup: 300,
            draws: 600,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn recovers_moments_of_a_scaled_normal() {
        let target = DiagonalNormal {
            mean: array![1.0, -2.0],
            sd: array![0.5, 3.0],
        };
        let whitening = Whitening::identity(Array1::zeros(2));
        let chains = run_nuts(&target, &whitening, &quick_config(), 11).unwrap();
        assert_eq!(chains.len(), 2);
        let stacked = ndarray::concatenate(
            Axis(0),
            &chains.iter().map(|c| c.draws.view()).collect::<Vec<_>>(),
        )
        .unwrap();
        assert_eq!(stacked.nrows(), 1200);
        let mean = stacked.mean_axis(Axis(0)).unwrap();
        let sd = stacked.std_axis(Axis(0), 1.0);
        assert!((mean[0] - 1.0).abs() < 0.15, "mean {mean}");
        assert!((mean[1] + 2.0).abs() < 0.8, "mean {mean}");
        assert!((sd[0] - 0.5).abs() < 0.15, "sd {sd}");
        assert!((sd[1] - 3.0).abs() < 0.9, "sd {sd}");
        for (i, chain) in chains.iter().enumerate() {
            assert_eq!(chain.stats.chain, i);
            assert!(chain.stats.move_rate > 0.5, "move rate {}", chain.stats.move_rate);
        }
    }

    #[test]
    fn whitened_gradient_goes_through_the_tensor_interface() {
        let target = DiagonalNormal {
            mean: array![0.0, 0.0],
            sd: array![0.1, 10.0],
        };
        let hessian = array![[100.0, 0.0], [0.0, 0.01]];
        let whitened = Whitened {
            target,
            whitening: Arc::new(Whitening::from_hessian(array![0.0, 0.0], &hessian)),
        };
        let z = Tensor::<NutsBackend, 1>::from_data(
            TensorData::new(vec![1.0, -1.0], [2]),
            &Default::default(),
        );
        let (logp, grad) = whitened.unnorm_logp_and_grad(z);
        let logp = logp.into_data().to_vec::<f64>().unwrap();
        let grad = grad.into_data().to_vec::<f64>().unwrap();
        assert!((logp[0] + 1.0).abs() < 1e-9);
        assert!((grad[0] + 1.0).abs() < 1e-9);
        assert!((grad[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn indefinite_hessian_falls_back_to_diagonal_metric() {
        let hessian = array![[4.0, 0.0], [0.0, -1.0]];
        let whitening = Whitening::from_hessian(array![0.0, 0.0], &hessian);
        let theta = whitening.to_original(&array![1.0, 1.0]);
        assert!((theta[0] - 0.5).abs() < 1e-12);
        assert!((theta[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn same_seed_gives_identical_chains() {
        let target = DiagonalNormal {
            mean: array![0.3],
            sd: array![1.0],
        };
        let whitening = Whitening::identity(Array1::zeros(1));
        let config = SamplerConfig {
            warmup: 50,
            draws: 150,
            ..quick_config()
        };
        let a = run_nuts(&target, &whitening, &config, 5).unwrap();
        let b = run_nuts(&target, &whitening, &config, 5).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.draws, y.draws);
        }
        assert_ne!(a[0].draws, a[1].draws);
        let c = run_nuts(&target, &whitening, &config, 6).unwrap();
        assert_ne!(a[0].draws, c[0].draws);
    }

    #[test]
    fn zero_timeout_stops_sampling() {
        let target = DiagonalNormal {
            mean: array![0.0],
            sd: array![1.0],
        };
        let whitening = Whitening::identity(Array1::zeros(1));
        let config = SamplerConfig {
            timeout_secs: Some(0),
            ..quick_config()
        };
        std::thread::sleep(Duration::from_millis(5));
        let result = run_nuts(&target, &whitening, &config, 1);
        assert!(matches!(
            result,
            Err(SamplerError::Timeout { iteration: 0, .. })
        ));
    }

    #[test]
    fn unsupported_start_is_reported() {
        #[derive(Clone)]
        struct Nowhere;
        impl LogDensity for Nowhere {
            fn dim(&self) -> usize {
                1
            }
            fn logp_and_grad(&self, x: &Array1<f64>) -> (f64, Array1<f64>) {
                (f64::NEG_INFINITY, Array1::zeros(x.len()))
            }
        }
        let whitening = Whitening::identity(Array1::zeros(1));
        let result = run_nuts(&Nowhere, &whitening, &quick_config(), 2);
        assert!(matches!(result, Err(SamplerError::NonFiniteStart { .. })));
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = SamplerConfig {
            target_accept: 1.0,
            ..SamplerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SamplerError::InvalidConfig(_))
        ));
        let config = SamplerConfig {
            chains: 0,
            ..SamplerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
