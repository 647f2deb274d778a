//! Lag-safe feature construction.
//!
//! Every value of a vector dated `t` is read through a [`SourceTracker`],
//! which only hands out observations at calendar index `t - k` for `k >= 1`
//! and records the latest index it served. The builder checks the recorded
//! index against `t` before the vector is emitted.

use std::cell::Cell;
use std::collections::HashMap;
use std::ops::Range;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::validation::rank::average_ranks;

use super::selection::RetentionRule;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LeakageError {
    #[error("Feature {feature} for {market} on {date} reads data from {source_date}")]
    FutureSource {
        feature: String,
        market: String,
        date: NaiveDate,
        source_date: NaiveDate,
    },

    #[error("Lag set {set} contains a zero lag")]
    ZeroLag { set: &'static str },

    #[error("Training slice ends at {train_end} but test slice starts at {test_start}")]
    TrainTestOverlap {
        train_end: NaiveDate,
        test_start: NaiveDate,
    },
}

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error(transparent)]
    Leakage(#[from] LeakageError),

    #[error("Unknown regime column: {0}")]
    UnknownColumn(String),

    #[error("Invalid feature input: {0}")]
    InvalidInput(String),
}

/// Difference of two regime columns' lag-1 values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadSpec {
    pub name: String,
    pub left: String,
    pub right: String,
}

/// Product of a lag-1 value and a trailing mean of another column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionSpec {
    pub name: String,
    pub left: String,
    pub right: String,
}

/// Lag-1 ratio `numerator / (denominator + eps)`, e.g. residual-load stress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioSpec {
    pub name: String,
    pub numerator: String,
    pub denominator: String,
    #[serde(default = "default_ratio_eps")]
    pub eps: f64,
}

fn default_ratio_eps() -> f64 {
    1e-6
}

/// Sum of absolute lag-1 values, e.g. total cross-border flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsSumSpec {
    pub name: String,
    pub columns: Vec<String>,
}

/// Lag-1 `scale` times the sum of lag-1 `terms`, e.g. carbon pressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaledSumSpec {
    pub name: String,
    pub scale: String,
    pub terms: Vec<String>,
}

/// Feature construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Lags of the residual series.
    pub target_lags: Vec<usize>,
    /// Trailing windows for residual mean / std.
    pub target_windows: Vec<usize>,
    pub target_min_obs: usize,
    /// Trailing windows for regime mean / std.
    pub exog_windows: Vec<usize>,
    pub exog_min_obs: usize,
    /// Trailing window used for regime anomalies.
    pub anomaly_window: usize,
    pub anomaly_min_obs: usize,
    pub spreads: Vec<SpreadSpec>,
    pub interactions: Vec<InteractionSpec>,
    pub ratios: Vec<RatioSpec>,
    pub abs_sums: Vec<AbsSumSpec>,
    pub scaled_sums: Vec<ScaledSumSpec>,
    /// Trailing window for the right-hand side of interactions.
    pub interaction_window: usize,
    /// One-hot `is_<market>` columns.
    pub market_flags: bool,
    /// Same-day rank of the lag-1 residual across markets.
    pub cross_sectional_rank: bool,
    /// Training-fold selection rule.
    pub retention: RetentionRule,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            target_lags: vec![1, 3, 7],
            target_windows: vec![7, 30],
            target_min_obs: 3,
            exog_windows: vec![3, 7, 30],
            exog_min_obs: 2,
            anomaly_window: 7,
            anomaly_min_obs: 3,
            spreads: Vec::new(),
            interactions: Vec::new(),
            ratios: Vec::new(),
            abs_sums: Vec::new(),
            scaled_sums: Vec::new(),
            interaction_window: 30,
            market_flags: true,
            cross_sectional_rank: true,
            retention: RetentionRule::default(),
        }
    }
}

impl FeatureConfig {
    /// Reject lag sets that would read the vector's own date.
    pub fn check_lags(&self) -> Result<(), LeakageError> {
        let sets: [(&'static str, &[usize]); 3] = [
            ("target_lags", &self.target_lags),
            ("target_windows", &self.target_windows),
            ("exog_windows", &self.exog_windows),
        ];
        for (set, lags) in sets {
            if lags.contains(&0) {
                return Err(LeakageError::ZeroLag { set });
            }
        }
        if self.anomaly_window == 0 {
            return Err(LeakageError::ZeroLag {
                set: "anomaly_window",
            });
        }
        if self.interaction_window == 0 {
            return Err(LeakageError::ZeroLag {
                set: "interaction_window",
            });
        }
        Ok(())
    }
}

/// Panel data the builder reads from, all laid out on one calendar.
#[derive(Debug, Clone)]
pub struct FeatureInputs {
    pub calendar: Vec<NaiveDate>,
    pub markets: Vec<String>,
    /// `residuals[market][index]`, `NaN` where no estimate exists.
    pub residuals: Vec<Vec<f64>>,
    /// `(name, values[index])`, `NaN` where missing.
    pub regimes: Vec<(String, Vec<f64>)>,
    /// `degraded[market][index]`, filter fallback flags carried onto forecasts.
    pub degraded: Vec<Vec<bool>>,
}

/// One lagged feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub date: NaiveDate,
    pub market: String,
    /// Calendar index of `date`.
    pub index: usize,
    /// Values aligned with [`FeatureMatrix::names`].
    pub values: Vec<f64>,
    /// Latest calendar date any value was read from.
    pub latest_source: Option<NaiveDate>,
}

/// Vectors for a range of dates, all markets, one shared column set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub names: Vec<String>,
    pub rows: Vec<FeatureVector>,
}

impl FeatureMatrix {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Value of feature `name` in `row`.
    pub fn value(&self, row: usize, name: &str) -> Option<f64> {
        let col = self.column_index(name)?;
        self.rows.get(row).map(|r| r.values[col])
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r.values[col]).collect()
    }

    /// Keep only `names`, in that order.
    pub fn project(&self, names: &[String]) -> FeatureMatrix {
        let cols: Vec<usize> = names
            .iter()
            .filter_map(|n| self.column_index(n))
            .collect();
        FeatureMatrix {
            names: cols.iter().map(|&c| self.names[c].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| FeatureVector {
                    values: cols.iter().map(|&c| r.values[c]).collect(),
                    ..r.clone()
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
enum FeatureSpec {
    ResidualLag(usize),
    ResidualMean(usize),
    ResidualStd(usize),
    RegimeLag(usize),
    RegimeMean(usize, usize),
    RegimeStd(usize, usize),
    RegimeAnomaly(usize),
    Spread(usize, usize),
    Interaction(usize, usize),
    Ratio(usize, usize, f64),
    AbsSum(Vec<usize>),
    ScaledSum(usize, Vec<usize>),
    MarketFlag(usize),
    ResidualRank,
}

/// Read guard over the calendar for one vector date.
struct SourceTracker {
    t: usize,
    latest: Cell<Option<usize>>,
}

impl SourceTracker {
    fn new(t: usize) -> Self {
        Self {
            t,
            latest: Cell::new(None),
        }
    }

    fn touch(&self, idx: usize) {
        let latest = self.latest.get().map_or(idx, |l| l.max(idx));
        self.latest.set(Some(latest));
    }

    /// Observation `lag` steps before the vector date.
    fn lag(&self, series: &[f64], lag: usize) -> f64 {
        if lag > self.t {
            return f64::NAN;
        }
        let idx = self.t - lag;
        self.touch(idx);
        series.get(idx).copied().unwrap_or(f64::NAN)
    }

    /// Finite observations at lags `1..=window`.
    fn trailing(&self, series: &[f64], window: usize) -> Vec<f64> {
        (1..=window)
            .map(|k| self.lag(series, k))
            .filter(|v| v.is_finite())
            .collect()
    }
}

/// Lag-safe feature builder over a fixed panel.
pub struct FeatureBuilder {
    config: FeatureConfig,
    inputs: FeatureInputs,
    specs: Vec<FeatureSpec>,
    names: Vec<String>,
}

impl FeatureBuilder {
    /// Resolve the feature plan against the panel's regime columns.
    pub fn new(config: FeatureConfig, inputs: FeatureInputs) -> Result<Self, FeatureError> {
        config.check_lags()?;
        if inputs.residuals.len() != inputs.markets.len() {
            return Err(FeatureError::InvalidInput(format!(
                "{} markets but {} residual series",
                inputs.markets.len(),
                inputs.residuals.len()
            )));
        }
        let n = inputs.calendar.len();
        if let Some((name, _)) = inputs.regimes.iter().find(|(_, v)| v.len() != n) {
            return Err(FeatureError::InvalidInput(format!(
                "regime column {} is not aligned to the calendar",
                name
            )));
        }

        let regime_idx: HashMap<&str, usize> = inputs
            .regimes
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.as_str(), i))
            .collect();
        let lookup = |name: &str| {
            regime_idx
                .get(name)
                .copied()
                .ok_or_else(|| FeatureError::UnknownColumn(name.to_string()))
        };

        let mut specs = Vec::new();
        let mut names = Vec::new();

        for &k in &config.target_lags {
            specs.push(FeatureSpec::ResidualLag(k));
            names.push(format!("resid_lag_{}", k));
        }
        for &w in &config.target_windows {
            specs.push(FeatureSpec::ResidualMean(w));
            names.push(format!("resid_mean_{}", w));
            specs.push(FeatureSpec::ResidualStd(w));
            names.push(format!("resid_std_{}", w));
        }
        for (c, (name, _)) in inputs.regimes.iter().enumerate() {
            specs.push(FeatureSpec::RegimeLag(c));
            names.push(format!("{}_lag1", name));
            for &w in &config.exog_windows {
                specs.push(FeatureSpec::RegimeMean(c, w));
                names.push(format!("{}_mean_{}", name, w));
                specs.push(FeatureSpec::RegimeStd(c, w));
                names.push(format!("{}_std_{}", name, w));
            }
            specs.push(FeatureSpec::RegimeAnomaly(c));
            names.push(format!("{}_anomaly", name));
        }
        for spread in &config.spreads {
            specs.push(FeatureSpec::Spread(lookup(&spread.left)?, lookup(&spread.right)?));
            names.push(spread.name.clone());
        }
        for inter in &config.interactions {
            specs.push(FeatureSpec::Interaction(lookup(&inter.left)?, lookup(&inter.right)?));
            names.push(inter.name.clone());
        }
        for ratio in &config.ratios {
            specs.push(FeatureSpec::Ratio(
                lookup(&ratio.numerator)?,
                lookup(&ratio.denominator)?,
                ratio.eps,
            ));
            names.push(ratio.name.clone());
        }
        for sum in &config.abs_sums {
            let cols = sum
                .columns
                .iter()
                .map(|c| lookup(c.as_str()))
                .collect::<Result<Vec<_>, _>>()?;
            specs.push(FeatureSpec::AbsSum(cols));
            names.push(sum.name.clone());
        }
        for sum in &config.scaled_sums {
            let terms = sum
                .terms
                .iter()
                .map(|c| lookup(c.as_str()))
                .collect::<Result<Vec<_>, _>>()?;
            specs.push(FeatureSpec::ScaledSum(lookup(&sum.scale)?, terms));
            names.push(sum.name.clone());
        }
        if config.market_flags {
            for (m, market) in inputs.markets.iter().enumerate() {
                specs.push(FeatureSpec::MarketFlag(m));
                names.push(format!("is_{}", market));
            }
        }
        if config.cross_sectional_rank {
            specs.push(FeatureSpec::ResidualRank);
            names.push("resid_rank_cs".to_string());
        }

        debug!(features = names.len(), "Feature plan resolved");
        Ok(Self {
            config,
            inputs,
            specs,
            names,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn inputs(&self) -> &FeatureInputs {
        &self.inputs
    }

    /// Build vectors for every calendar index in `range` and every market.
    ///
    /// Rows are ordered by (date, market).
    pub fn build(&self, range: Range<usize>) -> Result<FeatureMatrix, LeakageError> {
        let end = range.end.min(self.inputs.calendar.len());
        let mut rows = Vec::with_capacity(range.len() * self.inputs.markets.len());
        for t in range.start..end {
            for m in 0..self.inputs.markets.len() {
                rows.push(self.vector(t, m)?);
            }
        }
        Ok(FeatureMatrix {
            names: self.names.clone(),
            rows,
        })
    }

    /// Realized residual at `(index, market)`, the forecasting target.
    pub fn target(&self, index: usize, market: usize) -> f64 {
        self.inputs.residuals[market]
            .get(index)
            .copied()
            .unwrap_or(f64::NAN)
    }

    pub fn is_degraded(&self, index: usize, market: usize) -> bool {
        self.inputs
            .degraded
            .get(market)
            .and_then(|d| d.get(index))
            .copied()
            .unwrap_or(false)
    }

    pub fn market_index(&self, market: &str) -> Option<usize> {
        self.inputs.markets.iter().position(|m| m == market)
    }

    fn vector(&self, t: usize, m: usize) -> Result<FeatureVector, LeakageError> {
        let cfg = &self.config;
        let resid = &self.inputs.residuals[m];
        let regime = |c: usize| self.inputs.regimes[c].1.as_slice();
        let date = self.inputs.calendar[t];

        let mut values = Vec::with_capacity(self.specs.len());
        let mut latest: Option<usize> = None;

        for (spec, name) in self.specs.iter().zip(&self.names) {
            let src = SourceTracker::new(t);
            let value = match spec {
                FeatureSpec::ResidualLag(k) => src.lag(resid, *k),
                FeatureSpec::ResidualMean(w) => {
                    mean_min(&src.trailing(resid, *w), cfg.target_min_obs)
                }
                FeatureSpec::ResidualStd(w) => std_min(&src.trailing(resid, *w), cfg.target_min_obs),
                FeatureSpec::RegimeLag(c) => src.lag(regime(*c), 1),
                FeatureSpec::RegimeMean(c, w) => {
                    mean_min(&src.trailing(regime(*c), *w), cfg.exog_min_obs)
                }
                FeatureSpec::RegimeStd(c, w) => {
                    std_min(&src.trailing(regime(*c), *w), cfg.exog_min_obs)
                }
                FeatureSpec::RegimeAnomaly(c) => {
                    let last = src.lag(regime(*c), 1);
                    let base = mean_min(
                        &src.trailing(regime(*c), cfg.anomaly_window),
                        cfg.anomaly_min_obs,
                    );
                    last - base
                }
                FeatureSpec::Spread(l, r) => src.lag(regime(*l), 1) - src.lag(regime(*r), 1),
                FeatureSpec::Interaction(l, r) => {
                    let trend = mean_min(&src.trailing(regime(*r), cfg.interaction_window), 1);
                    src.lag(regime(*l), 1) * trend
                }
                FeatureSpec::Ratio(num, den, eps) => {
                    src.lag(regime(*num), 1) / (src.lag(regime(*den), 1) + eps)
                }
                FeatureSpec::AbsSum(cols) => cols.iter().map(|c| src.lag(regime(*c), 1).abs()).sum(),
                FeatureSpec::ScaledSum(scale, terms) => {
                    let total: f64 = terms.iter().map(|c| src.lag(regime(*c), 1)).sum();
                    src.lag(regime(*scale), 1) * total
                }
                FeatureSpec::MarketFlag(flag) => {
                    if *flag == m {
                        1.0
                    } else {
                        0.0
                    }
                }
                FeatureSpec::ResidualRank => self.cross_sectional_rank(&src, m),
            };

            if let Some(idx) = src.latest.get() {
                if idx >= t {
                    return Err(LeakageError::FutureSource {
                        feature: name.clone(),
                        market: self.inputs.markets[m].clone(),
                        date,
                        source_date: self.inputs.calendar.get(idx).copied().unwrap_or(date),
                    });
                }
                latest = Some(latest.map_or(idx, |l: usize| l.max(idx)));
            }
            values.push(value);
        }

        Ok(FeatureVector {
            date,
            market: self.inputs.markets[m].clone(),
            index: t,
            values,
            latest_source: latest.map(|idx| self.inputs.calendar[idx]),
        })
    }

    /// Rank of this market's lag-1 residual among all markets, in (0, 1].
    fn cross_sectional_rank(&self, src: &SourceTracker, m: usize) -> f64 {
        let lagged: Vec<f64> = self
            .inputs
            .residuals
            .iter()
            .map(|series| src.lag(series, 1))
            .collect();
        if !lagged[m].is_finite() {
            return f64::NAN;
        }
        let present: Vec<(usize, f64)> = lagged
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .collect();
        let values: Vec<f64> = present.iter().map(|(_, v)| *v).collect();
        let ranks = average_ranks(&values);
        present
            .iter()
            .position(|(i, _)| *i == m)
            .map(|pos| ranks[pos] / values.len() as f64)
            .unwrap_or(f64::NAN)
    }
}

fn mean_min(values: &[f64], min_obs: usize) -> f64 {
    if values.len() < min_obs.max(1) {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1).
fn std_min(values: &[f64], min_obs: usize) -> f64 {
    if values.len() < min_obs.max(2) {
        return f64::NAN;
    }
    let m = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
