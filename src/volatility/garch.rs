//! GARCH(1,1) conditional-variance model.
//!
//! Fitted by Gaussian quasi-maximum likelihood. The parameters are mapped to
//! an unconstrained space so that `omega > 0`, `alpha, beta >= 0` and
//! `alpha + beta < 1` hold for every point the optimizer visits:
//!
//! ```text
//! omega       = exp(x0)
//! persistence = 0.999 * logistic(x1)
//! alpha       = persistence * logistic(x2)
//! beta        = persistence - alpha
//! ```

use std::f64::consts::PI;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_PERSISTENCE: f64 = 0.999;
const MIN_VARIANCE: f64 = 1e-18;
const MIN_OBSERVATIONS: usize = 10;
const COORD_BOUND: f64 = 30.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GarchError {
    #[error("Insufficient data points: {available} < {required}")]
    InsufficientData { available: usize, required: usize },

    #[error("Sample variance is zero")]
    DegenerateSample,

    #[error("Optimizer did not converge after {iterations} iterations")]
    NonConvergence { iterations: usize },

    #[error("Non-finite likelihood")]
    NumericalInstability,
}

/// Optimizer settings for a single fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GarchConfig {
    /// ARCH order. Only 1 is supported.
    pub p: usize,
    /// GARCH order. Only 1 is supported.
    pub q: usize,
    /// Simplex iteration budget.
    pub max_iterations: usize,
    /// Relative spread of simplex likelihoods that counts as converged.
    pub tolerance: f64,
    /// Scale of the random perturbation applied to the retry start.
    pub restart_scale: f64,
}

impl Default for GarchConfig {
    fn default() -> Self {
        Self {
            p: 1,
            q: 1,
            max_iterations: 1000,
            tolerance: 1e-8,
            restart_scale: 0.75,
        }
    }
}

/// Fitted GARCH(1,1) parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GarchParams {
    pub mu: f64,
    pub omega: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl GarchParams {
    pub fn persistence(&self) -> f64 {
        self.alpha + self.beta
    }

    /// Long-run variance `omega / (1 - alpha - beta)`.
    pub fn unconditional_variance(&self) -> f64 {
        self.omega / (1.0 - self.persistence()).max(1e-6)
    }

    fn from_unconstrained(x: &[f64; 3], mu: f64) -> Self {
        let persistence = MAX_PERSISTENCE * logistic(x[1]);
        let alpha = persistence * logistic(x[2]);
        Self {
            mu,
            omega: x[0].exp(),
            alpha,
            beta: persistence - alpha,
        }
    }
}

/// Outcome of a fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarchFit {
    pub params: GarchParams,
    pub log_likelihood: f64,
    pub iterations: usize,
}

/// GARCH(1,1) estimator.
#[derive(Debug, Clone)]
pub struct Garch11 {
    config: GarchConfig,
}

impl Garch11 {
    pub fn new(config: GarchConfig) -> Self {
        Self { config }
    }

    /// Default starting point for a sample with variance `var`.
    pub fn initial_point(var: f64) -> [f64; 3] {
        let persistence = 0.95;
        let alpha_share = 0.08 / persistence;
        [
            (var * (1.0 - persistence)).ln(),
            logit(persistence / MAX_PERSISTENCE),
            logit(alpha_share),
        ]
    }

    /// Randomly perturbed starting point used for the retry.
    pub fn perturbed_point<R: Rng>(&self, var: f64, rng: &mut R) -> [f64; 3] {
        let mut x = Self::initial_point(var);
        let scale = self.config.restart_scale;
        for xi in x.iter_mut() {
            *xi += rng.gen_range(-scale..scale);
        }
        x
    }

    /// Fit on `returns` starting from `start` (unconstrained coordinates).
    pub fn fit_from(&self, returns: &[f64], start: [f64; 3]) -> Result<GarchFit, GarchError> {
        if returns.len() < MIN_OBSERVATIONS {
            return Err(GarchError::InsufficientData {
                available: returns.len(),
                required: MIN_OBSERVATIONS,
            });
        }
        let mu = mean(returns);
        let residuals: Vec<f64> = returns.iter().map(|r| r - mu).collect();
        let var = sample_variance(&residuals);
        if var <= MIN_VARIANCE {
            return Err(GarchError::DegenerateSample);
        }

        let ln_var = var.ln();
        let objective = |x: &[f64; 3]| {
            let params = GarchParams::from_unconstrained(x, mu);
            negative_log_likelihood(&residuals, &params, var)
        };
        // omega is kept within a generous band around the sample variance
        let bounds = [
            (ln_var - COORD_BOUND, ln_var + 5.0),
            (-COORD_BOUND, COORD_BOUND),
            (-COORD_BOUND, COORD_BOUND),
        ];

        let (x, nll, iterations, converged) = nelder_mead(
            objective,
            start,
            &bounds,
            self.config.max_iterations,
            self.config.tolerance,
        );

        if !nll.is_finite() {
            return Err(GarchError::NumericalInstability);
        }
        if !converged {
            return Err(GarchError::NonConvergence { iterations });
        }

        Ok(GarchFit {
            params: GarchParams::from_unconstrained(&x, mu),
            log_likelihood: -nll,
            iterations,
        })
    }

    /// Fit from the default starting point.
    pub fn fit(&self, returns: &[f64]) -> Result<GarchFit, GarchError> {
        let var = sample_variance(returns);
        self.fit_from(returns, Self::initial_point(var.max(MIN_VARIANCE)))
    }
}

/// One-step-ahead conditional variance after observing every return in `returns`.
///
/// The recursion is seeded with the sample variance of the slice.
pub fn forecast_variance(returns: &[f64], params: &GarchParams) -> f64 {
    let residuals: Vec<f64> = returns.iter().map(|r| r - params.mu).collect();
    let seed = sample_variance(&residuals).max(MIN_VARIANCE);
    let mut sigma2 = seed;
    for e in &residuals {
        sigma2 = params.omega + params.alpha * e * e + params.beta * sigma2;
    }
    sigma2.max(MIN_VARIANCE)
}

fn negative_log_likelihood(residuals: &[f64], params: &GarchParams, seed: f64) -> f64 {
    let ln_2pi = (2.0 * PI).ln();
    let mut sigma2 = seed;
    let mut nll = 0.0;
    for e in residuals {
        let s = sigma2.max(MIN_VARIANCE);
        nll += 0.5 * (ln_2pi + s.ln() + e * e / s);
        sigma2 = params.omega + params.alpha * e * e + params.beta * sigma2;
    }
    if nll.is_finite() {
        nll
    } else {
        f64::INFINITY
    }
}

/// Bounded Nelder-Mead minimizer over three coordinates.
///
/// Returns `(argmin, min, iterations, converged)`.
fn nelder_mead<F>(
    f: F,
    start: [f64; 3],
    bounds: &[(f64, f64); 3],
    max_iterations: usize,
    tolerance: f64,
) -> ([f64; 3], f64, usize, bool)
where
    F: Fn(&[f64; 3]) -> f64,
{
    let clamp = |mut x: [f64; 3]| {
        for (xi, (lo, hi)) in x.iter_mut().zip(bounds.iter()) {
            *xi = xi.clamp(*lo, *hi);
        }
        x
    };

    let start = clamp(start);
    let mut simplex: Vec<([f64; 3], f64)> = Vec::with_capacity(4);
    simplex.push((start, f(&start)));
    for i in 0..3 {
        let mut x = start;
        x[i] += if x[i].abs() > 1e-3 { 0.25 * x[i].abs().min(4.0) } else { 0.25 };
        let x = clamp(x);
        simplex.push((x, f(&x)));
    }

    let mut iterations = 0;
    while iterations < max_iterations {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let best = simplex[0].1;
        let worst = simplex[3].1;
        if best.is_finite() && (worst - best).abs() <= tolerance * (1.0 + best.abs()) {
            return (simplex[0].0, best, iterations, true);
        }
        iterations += 1;

        let mut centroid = [0.0; 3];
        for (x, _) in &simplex[..3] {
            for k in 0..3 {
                centroid[k] += x[k] / 3.0;
            }
        }
        let toward = |coef: f64| {
            let mut x = [0.0; 3];
            for k in 0..3 {
                x[k] = centroid[k] + coef * (simplex[3].0[k] - centroid[k]);
            }
            clamp(x)
        };

        let reflected = toward(-1.0);
        let f_reflected = f(&reflected);

        if f_reflected < simplex[0].1 {
            let expanded = toward(-2.0);
            let f_expanded = f(&expanded);
            simplex[3] = if f_expanded < f_reflected {
                (expanded, f_expanded)
            } else {
                (reflected, f_reflected)
            };
        } else if f_reflected < simplex[2].1 {
            simplex[3] = (reflected, f_reflected);
        } else {
            let contracted = if f_reflected < simplex[3].1 {
                toward(-0.5)
            } else {
                toward(0.5)
            };
            let f_contracted = f(&contracted);
            if f_contracted < simplex[3].1.min(f_reflected) {
                simplex[3] = (contracted, f_contracted);
            } else {
                // Shrink toward the best vertex
                let best_x = simplex[0].0;
                for vertex in simplex.iter_mut().skip(1) {
                    let mut x = [0.0; 3];
                    for k in 0..3 {
                        x[k] = best_x[k] + 0.5 * (vertex.0[k] - best_x[k]);
                    }
                    let x = clamp(x);
                    *vertex = (x, f(&x));
                }
            }
        }
    }

    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
    (simplex[0].0, simplex[0].1, iterations, false)
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-9, 1.0 - 1e-9);
    (p / (1.0 - p)).ln()
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance.
pub(crate) fn sample_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Box-Muller standard normal draw.
    fn normal_draw<R: Rng>(rng: &mut R) -> f64 {
        let u1: f64 = rng.gen_range(1e-12..1.0);
        let u2: f64 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    fn simulate(n: usize, omega: f64, alpha: f64, beta: f64, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut sigma2 = omega / (1.0 - alpha - beta);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let e = sigma2.sqrt() * normal_draw(&mut rng);
            out.push(e);
            sigma2 = omega + alpha * e * e + beta * sigma2;
        }
        out
    }

    #[test]
    fn test_reparameterisation_is_stationary() {
        for x in [[-5.0, 10.0, -10.0], [0.0, -3.0, 3.0], [2.0, 30.0, 30.0]] {
            let p = GarchParams::from_unconstrained(&x, 0.0);
            assert!(p.omega > 0.0);
            assert!(p.alpha >= 0.0 && p.beta >= 0.0);
            assert!(p.persistence() < 1.0);
        }
    }

    #[test]
    fn test_fit_recovers_persistence() {
        let returns = simulate(2000, 1e-5, 0.1, 0.85, 7);
        let fit = Garch11::new(GarchConfig::default()).fit(&returns).unwrap();
        assert!(fit.log_likelihood.is_finite());
        assert!((fit.params.persistence() - 0.95).abs() < 0.1);
        assert!(fit.params.alpha > 0.02);
    }

    #[test]
    fn test_insufficient_data() {
        let result = Garch11::new(GarchConfig::default()).fit(&[0.01, -0.02]);
        assert!(matches!(result, Err(GarchError::InsufficientData { .. })));
    }

    #[test]
    fn test_degenerate_sample() {
        let result = Garch11::new(GarchConfig::default()).fit(&[0.0; 50]);
        assert_eq!(result.unwrap_err(), GarchError::DegenerateSample);
    }

    #[test]
    fn test_zero_budget_does_not_converge() {
        let returns = simulate(300, 1e-5, 0.1, 0.85, 3);
        let config = GarchConfig {
            max_iterations: 0,
            tolerance: 0.0,
            ..Default::default()
        };
        let result = Garch11::new(config).fit(&returns);
        assert!(matches!(result, Err(GarchError::NonConvergence { .. })));
    }

    #[test]
    fn test_perturbed_point_is_deterministic() {
        let model = Garch11::new(GarchConfig::default());
        let a = model.perturbed_point(1e-4, &mut ChaCha8Rng::seed_from_u64(1));
        let b = model.perturbed_point(1e-4, &mut ChaCha8Rng::seed_from_u64(1));
        assert_eq!(a, b);
        assert_ne!(a, Garch11::initial_point(1e-4));
    }

    #[test]
    fn test_forecast_reacts_to_shock() {
        let params = GarchParams {
            mu: 0.0,
            omega: 1e-6,
            alpha: 0.2,
            beta: 0.7,
        };
        let calm = vec![0.001; 50];
        let mut shocked = calm.clone();
        shocked.push(0.1);
        assert!(forecast_variance(&shocked, &params) > forecast_variance(&calm, &params));
    }
}
