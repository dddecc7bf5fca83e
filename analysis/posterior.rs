//! # Hierarchical Logistic Posterior
//!
//! Log-posterior of the random-intercept logistic regression with analytical
//! gradients, evaluated in an unconstrained parameterization:
//!
//! - `θ[0]`           population intercept μ
//! - `θ[1..=p]`       population slopes β
//! - `θ[p + 1]`       log τ, the log standard deviation of the user intercepts
//! - `θ[p + 2..]`     standardized user offsets z (non-centered: α_user = μ + τ·z)
//!
//! The change of variables τ = exp(u) contributes the Jacobian term `u`.
//!
//! # Memory Efficiency
//!
//! The design is wrapped in `Arc` so clones of the target handed to parallel
//! chains share one copy of the data.

use crate::hmc::LogDensity;
use crate::model::Design;
use crate::priors::PriorSpec;
use ndarray::{Array1, Array2, ArrayView1, s};
use std::sync::Arc;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Returned in place of a non-finite cost so the line search can back off.
const NON_FINITE_COST: f64 = 1e10;

/// Index arithmetic for the unconstrained parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    pub n_coefficients: usize,
    pub n_groups: usize,
}

impl ParameterLayout {
    pub fn dim(&self) -> usize {
        2 + self.n_coefficients + self.n_groups
    }

    pub fn intercept(&self) -> usize {
        0
    }

    pub fn coefficient(&self, k: usize) -> usize {
        1 + k
    }

    pub fn log_group_sd(&self) -> usize {
        1 + self.n_coefficients
    }

    pub fn group_offset(&self, j: usize) -> usize {
        2 + self.n_coefficients + j
    }

    /// Maps an unconstrained vector to reported quantities: intercept, slopes,
    /// τ, and the user deviations τ·z.
    pub fn constrain(&self, theta: ArrayView1<f64>) -> Array1<f64> {
        let mut out = theta.to_owned();
        let tau = theta[self.log_group_sd()].exp();
        out[self.log_group_sd()] = tau;
        for j in 0..self.n_groups {
            let idx = self.group_offset(j);
            out[idx] = tau * theta[idx];
        }
        out
    }
}

/// Numerically stable log(1 + exp(x)).
pub fn log1p_exp(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Numerically stable logistic function.
pub fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Posterior mode located by BFGS, used to center and whiten the sampler.
#[derive(Debug, Clone)]
pub struct ModeEstimate {
    pub theta: Array1<f64>,
    pub log_density: f64,
    pub iterations: usize,
    /// False when the optimizer failed and `theta` is the starting point.
    pub converged: bool,
}

/// Log-posterior target for one design and one set of priors.
#[derive(Clone)]
pub struct HierarchicalLogit {
    design: Arc<Design>,
    priors: PriorSpec,
    layout: ParameterLayout,
}

impl HierarchicalLogit {
    pub fn new(design: Arc<Design>, priors: PriorSpec) -> Self {
        let layout = ParameterLayout {
            n_coefficients: design.n_coefficients(),
            n_groups: design.n_groups(),
        };
        Self {
            design,
            priors,
            layout,
        }
    }

    pub fn layout(&self) -> ParameterLayout {
        self.layout
    }

    pub fn design(&self) -> &Arc<Design> {
        &self.design
    }

    /// η = μ + Xβ + τ·z[group].
    pub fn linear_predictor(&self, theta: ArrayView1<f64>) -> Array1<f64> {
        let p = self.layout.n_coefficients;
        let mu = theta[self.layout.intercept()];
        let beta = theta.slice(s![1..1 + p]);
        let tau = theta[self.layout.log_group_sd()].exp();
        let mut eta = self.design.x.dot(&beta);
        for (i, value) in eta.iter_mut().enumerate() {
            let g = self.design.group[i];
            *value += mu + tau * theta[self.layout.group_offset(g)];
        }
        eta
    }

    /// Bernoulli log-likelihood of every observation under `theta`.
    pub fn pointwise_log_likelihood(&self, theta: ArrayView1<f64>) -> Array1<f64> {
        let eta = self.linear_predictor(theta);
        eta.iter()
            .zip(self.design.y.iter())
            .map(|(&e, &y)| y * e - log1p_exp(e))
            .collect()
    }

    fn evaluate(&self, theta: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let layout = self.layout;
        let p = layout.n_coefficients;
        let u = theta[layout.log_group_sd()];
        let tau = u.exp();
        let eta = self.linear_predictor(theta);

        let mut ll = 0.0;
        let mut residual = Array1::<f64>::zeros(eta.len());
        for (i, (&e, &y)) in eta.iter().zip(self.design.y.iter()).enumerate() {
            ll += y * e - log1p_exp(e);
            residual[i] = y - logistic(e);
        }

        let mut grad = Array1::<f64>::zeros(layout.dim());

        let (lp_mu, d_mu) = self
            .priors
            .intercept
            .log_density_and_grad(theta[layout.intercept()]);
        grad[layout.intercept()] = residual.sum() + d_mu;

        let x_t_r = self.design.x.t().dot(&residual);
        let mut lp_beta = 0.0;
        for k in 0..p {
            let (lp, d) = self
                .priors
                .coefficients
                .log_density_and_grad(theta[layout.coefficient(k)]);
            lp_beta += lp;
            grad[layout.coefficient(k)] = x_t_r[k] + d;
        }

        let mut group_residual = vec![0.0; layout.n_groups];
        for (i, &r) in residual.iter().enumerate() {
            group_residual[self.design.group[i]] += r;
        }
        let mut lp_z = 0.0;
        let mut d_u_likelihood = 0.0;
        for (j, &sum_r) in group_residual.iter().enumerate() {
            let z = theta[layout.group_offset(j)];
            lp_z -= 0.5 * z * z;
            grad[layout.group_offset(j)] = tau * sum_r - z;
            d_u_likelihood += tau * sum_r * z;
        }

        // τ = exp(u): prior on τ plus the log-Jacobian u.
        let (lp_tau, d_tau) = self.priors.group_sd.log_density_and_grad(tau);
        grad[layout.log_group_sd()] = d_u_likelihood + d_tau * tau + 1.0;

        let logp = ll + lp_mu + lp_beta + lp_tau + u + lp_z;
        (logp, grad)
    }

    /// Maximizes the log posterior with BFGS, starting from zero (τ = 1).
    pub fn find_mode(&self, tolerance: f64, max_iterations: usize) -> ModeEstimate {
        let initial = Array1::<f64>::zeros(self.layout.dim());
        let target = Arc::new(self.clone());
        let target_for_closure = target.clone();
        let cost_and_grad = move |theta: &Array1<f64>| -> (f64, Array1<f64>) {
            let (logp, grad) = target_for_closure.evaluate(theta.view());
            if logp.is_finite() && grad.iter().all(|g| g.is_finite()) {
                (-logp, -grad)
            } else {
                (NON_FINITE_COST, Array1::zeros(theta.len()))
            }
        };

        match Bfgs::new(initial.clone(), cost_and_grad)
            .with_tolerance(tolerance)
            .with_max_iterations(max_iterations)
            .run()
        {
            Ok(BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            }) => {
                log::debug!(
                    "Posterior mode found after {iterations} BFGS iterations (log density {:.4})",
                    -final_value
                );
                ModeEstimate {
                    theta: final_point,
                    log_density: -final_value,
                    iterations,
                    converged: true,
                }
            }
            Err(e) => {
                log::warn!("BFGS search for the posterior mode failed ({e:?}); starting from zero");
                let (logp, _) = target.evaluate(initial.view());
                ModeEstimate {
                    theta: initial,
                    log_density: logp,
                    iterations: max_iterations,
                    converged: false,
                }
            }
        }
    }

    /// Hessian of the negative log posterior by central differences of the
    /// analytical gradient, symmetrized.
    pub fn negative_hessian(&self, theta: ArrayView1<f64>) -> Array2<f64> {
        let dim = self.layout.dim();
        let mut hessian = Array2::<f64>::zeros((dim, dim));
        let mut point = theta.to_owned();
        for j in 0..dim {
            let h = 1e-5 * theta[j].abs().max(1.0);
            point[j] = theta[j] + h;
            let (_, g_plus) = self.evaluate(point.view());
            point[j] = theta[j] - h;
            let (_, g_minus) = self.evaluate(point.view());
            point[j] = theta[j];
            let column = (&g_plus - &g_minus) / (-2.0 * h);
            hessian.column_mut(j).assign(&column);
        }
        let transposed = hessian.t().to_owned();
        (&hessian + &transposed) * 0.5
    }
}

impl LogDensity for HierarchicalLogit {
    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn logp_and_grad(&self, position: &Array1<f64>) -> (f64, Array1<f64>) {
        self.evaluate(position.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priors::Prior;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn small_design() -> Design {
        Design {
            x: array![[0.5, -1.0], [1.5, 0.2], [-0.3, 0.8], [0.9, -0.4], [-1.2, 1.1]],
            y: array![1.0, 1.0, 0.0, 1.0, 0.0],
            group: vec![0, 1, 0, 2, 1],
            users: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            columns: vec!["speed".to_string(), "accuracy".to_string()],
            rows: vec![0, 1, 2, 3, 4],
        }
    }

    fn target() -> HierarchicalLogit {
        HierarchicalLogit::new(Arc::new(small_design()), PriorSpec::default())
    }

    #[test]
    fn layout_indices_are_contiguous() {
        let layout = target().layout();
        assert_eq!(layout.dim(), 7);
        assert_eq!(layout.coefficient(1), 2);
        assert_eq!(layout.log_group_sd(), 3);
        assert_eq!(layout.group_offset(0), 4);
        assert_eq!(layout.group_offset(2), 6);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let target = target();
        let theta = array![0.3, -0.7, 1.1, -0.4, 0.6, -1.3, 0.2];
        let (_, grad) = target.logp_and_grad(&theta);
        let eps = 1e-6;
        for i in 0..theta.len() {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus[i] += eps;
            minus[i] -= eps;
            let fd = (target.logp_and_grad(&plus).0 - target.logp_and_grad(&minus).0) / (2.0 * eps);
            assert_relative_eq!(grad[i], fd, max_relative = 1e-5, epsilon = 1e-8);
        }
    }

    #[test]
    fn log_likelihood_at_zero_is_log_half() {
        let target = target();
        let theta = Array1::zeros(7);
        let ll = target.pointwise_log_likelihood(theta.view());
        for value in ll.iter() {
            assert_relative_eq!(*value, 0.5f64.ln(), max_relative = 1e-12);
        }
    }

    #[test]
    fn constrain_exponentiates_and_scales_offsets() {
        let layout = target().layout();
        let theta = array![0.1, 0.2, 0.3, 2.0f64.ln(), 0.5, -1.0, 1.5];
        let out = layout.constrain(theta.view());
        assert_relative_eq!(out[3], 2.0, max_relative = 1e-12);
        assert_relative_eq!(out[4], 1.0, max_relative = 1e-12);
        assert_relative_eq!(out[5], -2.0, max_relative = 1e-12);
        assert_relative_eq!(out[0], 0.1);
    }

    #[test]
    fn mode_has_vanishing_gradient_and_positive_definite_hessian() {
        let target = HierarchicalLogit::new(
            Arc::new(small_design()),
            PriorSpec {
                coefficients: Prior::Normal {
                    location: 0.0,
                    scale: 1.0,
                },
                ..PriorSpec::default()
            },
        );
        let mode = target.find_mode(1e-8, 500);
        assert!(mode.converged);
        let (_, grad) = target.logp_and_grad(&mode.theta);
        assert!(grad.iter().all(|g| g.abs() < 1e-3), "gradient at mode: {grad}");

        let hessian = target.negative_hessian(mode.theta.view());
        for i in 0..hessian.nrows() {
            assert!(hessian[[i, i]] > 0.0);
            for j in 0..i {
                assert_relative_eq!(hessian[[i, j]], hessian[[j, i]]);
            }
        }
    }

    #[test]
    fn stable_link_functions() {
        assert_relative_eq!(log1p_exp(800.0), 800.0);
        assert!(log1p_exp(-800.0) >= 0.0);
        assert_relative_eq!(logistic(0.0), 0.5);
        assert!(logistic(-800.0) >= 0.0 && logistic(800.0) <= 1.0);
    }
}
