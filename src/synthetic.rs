//! Deterministic synthetic panels.
//!
//! Every market shares a daily volatility scale `s_d = exp(U(-a, a))` and
//! returns `r = base_vol * s_d * e` with standard normal `e`. The `driver`
//! regime column published on day `d - 1` equals `ln s_d`, so it is known
//! one day before the volatility it predicts. With `noise = true` the driver
//! is replaced by an independent draw and the panel has no signal.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rand::distributions::Distribution;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use tracing::info;

use crate::data::{Dataset, LoaderError, MarketSeries, RegimeTable};

/// Name of the regime column that leads volatility.
pub const DRIVER_COLUMN: &str = "driver";
/// Name of a regime column that is always noise.
pub const NOISE_COLUMN: &str = "aux_noise";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Trading days to generate.
    pub days: usize,
    pub markets: Vec<String>,
    pub seed: u64,
    /// Replace the driver with independent noise.
    pub noise: bool,
    /// Half-width `a` of the uniform log-scale.
    pub scale_spread: f64,
    /// Daily return volatility at unit scale.
    pub base_vol: f64,
    pub start: NaiveDate,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            days: 1000,
            markets: vec!["DE".to_string(), "FR".to_string()],
            seed: 42,
            noise: false,
            scale_spread: 2.0,
            base_vol: 0.01,
            start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default(),
        }
    }
}

pub struct SyntheticGenerator {
    config: SyntheticConfig,
}

impl SyntheticGenerator {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    /// Weekday calendar of `days` dates starting at the first weekday on or
    /// after `start`.
    pub fn calendar(&self) -> Vec<NaiveDate> {
        let mut dates = Vec::with_capacity(self.config.days);
        let mut d = self.config.start;
        while dates.len() < self.config.days {
            if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
                dates.push(d);
            }
            d += Duration::days(1);
        }
        dates
    }

    pub fn generate(&self) -> Result<Dataset, LoaderError> {
        let cfg = &self.config;
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| LoaderError::InvalidData(format!("normal distribution: {e}")))?;
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let dates = self.calendar();
        let a = cfg.scale_spread.abs();
        let draw_log_scale = |rng: &mut ChaCha8Rng| {
            if a > 0.0 {
                rng.gen_range(-a..a)
            } else {
                0.0
            }
        };

        // One extra scale so the last day's driver has something to lead
        let log_scales: Vec<f64> = (0..=cfg.days).map(|_| draw_log_scale(&mut rng)).collect();

        let markets = cfg
            .markets
            .iter()
            .map(|market| {
                let returns: Vec<f64> = log_scales[..cfg.days]
                    .iter()
                    .map(|ls| cfg.base_vol * ls.exp() * normal.sample(&mut rng))
                    .collect();
                MarketSeries::new(market.as_str(), dates.clone(), returns)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let driver: Vec<f64> = if cfg.noise {
            (0..cfg.days).map(|_| draw_log_scale(&mut rng)).collect()
        } else {
            log_scales[1..].to_vec()
        };
        let aux: Vec<f64> = (0..cfg.days).map(|_| normal.sample(&mut rng)).collect();

        let regimes = RegimeTable::new(
            dates,
            vec![DRIVER_COLUMN.to_string(), NOISE_COLUMN.to_string()],
            vec![driver, aux],
        )?;

        info!(
            days = cfg.days,
            markets = cfg.markets.len(),
            noise = cfg.noise,
            seed = cfg.seed,
            "Generated synthetic panel"
        );
        Ok(Dataset::new(markets, regimes))
    }
}
