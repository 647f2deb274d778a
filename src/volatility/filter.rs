//! Per-market rolling volatility filter.
//!
//! For every filter target the GARCH model is fitted on the trailing window,
//! the one-step-ahead conditional volatility is forecast, and the realized
//! proxy `|r_t - mu|` is standardized against it. Markets never share state.

use chrono::NaiveDate;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::MarketSeries;
use crate::walkforward::periods::{FilterScheduleConfig, FilterTarget, ScheduleError};

use super::garch::{forecast_variance, mean, sample_variance, Garch11, GarchConfig, GarchParams};

/// How the realized proxy is standardized by the forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualMode {
    /// `proxy / sigma`
    Ratio,
    /// `proxy - sigma`
    Difference,
}

impl ResidualMode {
    pub fn apply(self, proxy: f64, sigma: f64) -> f64 {
        match self {
            ResidualMode::Ratio => proxy / sigma.max(f64::EPSILON),
            ResidualMode::Difference => proxy - sigma,
        }
    }
}

/// Volatility filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Trailing estimation window (observations).
    pub window: usize,
    /// Minimum trailing observations before the first estimate.
    pub min_obs: usize,
    /// Re-estimate parameters every this many targets (1 = daily).
    pub refit_every: usize,
    pub residual_mode: ResidualMode,
    pub garch: GarchConfig,
    /// Seed for restart perturbations.
    pub seed: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            window: 500,
            min_obs: 300,
            refit_every: 1,
            residual_mode: ResidualMode::Ratio,
            garch: GarchConfig::default(),
            seed: 42,
        }
    }
}

impl FilterConfig {
    pub fn schedule(&self) -> FilterScheduleConfig {
        FilterScheduleConfig {
            window: self.window,
            min_obs: self.min_obs,
        }
    }
}

/// One filter output for one market on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityEstimate {
    pub date: NaiveDate,
    pub market: String,
    /// Calendar index of `date`.
    pub index: usize,
    pub conditional_volatility: f64,
    /// `|r_t - mu|` on the target date.
    pub realized_proxy: f64,
    pub residual: f64,
    /// Set when the estimate came from the forward-fill fallback.
    pub degraded: bool,
}

/// Estimates for one market, ordered by date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualSeries {
    pub market: String,
    pub estimates: Vec<VolatilityEstimate>,
}

impl ResidualSeries {
    /// Residuals laid out on a calendar of length `len`; `NaN` where absent.
    pub fn dense_residuals(&self, len: usize) -> Vec<f64> {
        let mut out = vec![f64::NAN; len];
        for e in &self.estimates {
            if e.index < len {
                out[e.index] = e.residual;
            }
        }
        out
    }

    pub fn degraded_count(&self) -> usize {
        self.estimates.iter().filter(|e| e.degraded).count()
    }
}

/// Intermediate result of one target before the forward-fill pass.
struct RawEstimate {
    target: FilterTarget,
    sigma: Option<f64>,
    mu: f64,
    fallback_sigma: f64,
}

/// Rolling GARCH filter over a set of markets.
pub struct VolatilityFilter {
    config: FilterConfig,
}

impl VolatilityFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Run the filter for every market in parallel.
    ///
    /// All series must share one calendar.
    pub fn run(&self, markets: &[MarketSeries]) -> Result<Vec<ResidualSeries>, ScheduleError> {
        markets
            .par_iter()
            .map(|series| self.run_market(series))
            .collect()
    }

    /// Run the filter for a single market.
    pub fn run_market(&self, series: &MarketSeries) -> Result<ResidualSeries, ScheduleError> {
        use crate::walkforward::periods::{ForecastScheduleConfig, WindowScheduler};

        let scheduler = WindowScheduler::new(
            series.dates(),
            self.config.schedule(),
            ForecastScheduleConfig::default(),
        );
        let targets: Vec<FilterTarget> = scheduler.filter_targets()?.collect();
        let returns = series.returns();
        let refit_every = self.config.refit_every.max(1);
        let market_seed = self.config.seed ^ hash_str(series.market());

        // Each refit group is independent; fits run in parallel.
        let raw: Vec<RawEstimate> = targets
            .par_chunks(refit_every)
            .flat_map_iter(|group| self.estimate_group(series.market(), returns, group, market_seed))
            .collect();

        let estimates = self.forward_fill(series.market(), returns, raw);
        let series_out = ResidualSeries {
            market: series.market().to_string(),
            estimates,
        };

        info!(
            market = series.market(),
            estimates = series_out.estimates.len(),
            degraded = series_out.degraded_count(),
            "Volatility filter complete"
        );
        Ok(series_out)
    }

    fn estimate_group(
        &self,
        market: &str,
        returns: &[f64],
        group: &[FilterTarget],
        market_seed: u64,
    ) -> Vec<RawEstimate> {
        let Some(first) = group.first() else {
            return Vec::new();
        };
        let params = self.fit_with_retry(market, &returns[first.history()], first, market_seed);

        group
            .iter()
            .map(|target| {
                let history = &returns[target.history()];
                let mu = mean(history);
                let fallback_sigma = sample_variance(history).sqrt();
                let sigma = params.map(|p| {
                    let p = GarchParams { mu, ..p };
                    forecast_variance(history, &p).sqrt()
                });
                RawEstimate {
                    target: target.clone(),
                    sigma,
                    mu,
                    fallback_sigma,
                }
            })
            .collect()
    }

    /// Fit once from the default start, then once from a perturbed start.
    fn fit_with_retry(
        &self,
        market: &str,
        history: &[f64],
        target: &FilterTarget,
        market_seed: u64,
    ) -> Option<GarchParams> {
        let model = Garch11::new(self.config.garch.clone());
        match model.fit(history) {
            Ok(fit) => return Some(fit.params),
            Err(e) => debug!(market, date = %target.date, error = %e, "GARCH fit failed, retrying"),
        }

        let mut rng = ChaCha8Rng::seed_from_u64(market_seed ^ target.index as u64);
        let start = model.perturbed_point(sample_variance(history), &mut rng);
        match model.fit_from(history, start) {
            Ok(fit) => Some(fit.params),
            Err(e) => {
                warn!(market, date = %target.date, error = %e, "GARCH retry failed, forward-filling");
                None
            }
        }
    }

    fn forward_fill(
        &self,
        market: &str,
        returns: &[f64],
        raw: Vec<RawEstimate>,
    ) -> Vec<VolatilityEstimate> {
        let mut previous: Option<f64> = None;
        raw.into_iter()
            .map(|r| {
                let (sigma, degraded) = match r.sigma {
                    Some(s) if s.is_finite() && s > 0.0 => (s, false),
                    _ => (previous.unwrap_or(r.fallback_sigma), true),
                };
                previous = Some(sigma);

                let proxy = (returns[r.target.index] - r.mu).abs();
                VolatilityEstimate {
                    date: r.target.date,
                    market: market.to_string(),
                    index: r.target.index,
                    conditional_volatility: sigma,
                    realized_proxy: proxy,
                    residual: self.config.residual_mode.apply(proxy, sigma),
                    degraded,
                }
            })
            .collect()
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a, stable across toolchains so seeded runs reproduce.
pub(crate) fn hash_str(s: &str) -> u64 {
    s.bytes()
        .fold(FNV_OFFSET, |h, b| (h ^ b as u64).wrapping_mul(FNV_PRIME))
}
