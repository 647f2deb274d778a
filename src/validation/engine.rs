//! Validation of a forecast stream.
//!
//! Scores every fold, every market and the pooled stream with Spearman IC,
//! a within-fold permutation test, an analytic t-test and the lag-1 rank
//! autocorrelation of the forecasts. Unavailable forecasts never enter any
//! statistic.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::forecast::ForecastRecord;
use crate::volatility::filter::hash_str;

use super::permutation::{permutation_test, PairGroup};
use super::rank::{correlation_p_value, spearman, IcStats};

/// Validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Shuffles per permutation test.
    pub permutation_trials: usize,
    pub seed: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            permutation_trials: 1000,
            seed: 1234,
        }
    }
}

/// What a score aggregates over.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Scope {
    Fold { fold_id: usize },
    Market { market: String },
    Pooled,
}

impl Scope {
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Fold { .. } => "fold",
            Scope::Market { .. } => "market",
            Scope::Pooled => "pooled",
        }
    }

    /// `fold_id` column value, `"pooled"` when the scope spans folds.
    pub fn fold_label(&self) -> String {
        match self {
            Scope::Fold { fold_id } => fold_id.to_string(),
            _ => "pooled".to_string(),
        }
    }

    /// `market` column value, `"pooled"` when the scope spans markets.
    pub fn market_label(&self) -> String {
        match self {
            Scope::Market { market } => market.clone(),
            _ => "pooled".to_string(),
        }
    }

    fn seed_key(&self) -> String {
        format!("{}:{}:{}", self.kind(), self.fold_label(), self.market_label())
    }

    fn includes(&self, record: &ForecastRecord) -> bool {
        match self {
            Scope::Fold { fold_id } => record.fold_id == *fold_id,
            Scope::Market { market } => &record.market == market,
            Scope::Pooled => true,
        }
    }
}

/// Rank statistics of one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankScore {
    pub scope: Scope,
    pub spearman_ic: Option<f64>,
    pub permutation_p_value: Option<f64>,
    /// Student-t approximation for comparison with the permutation p-value.
    pub t_test_p_value: Option<f64>,
    /// Usable (predicted, realized) pairs.
    pub n_obs: usize,
    /// Records skipped as `forecast_unavailable`.
    pub n_unavailable: usize,
    pub rank_autocorr: Option<f64>,
}

/// All scores of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub scores: Vec<RankScore>,
    /// Summary of per-fold ICs.
    pub fold_ic: IcStats,
}

impl ValidationReport {
    pub fn pooled(&self) -> Option<&RankScore> {
        self.scores.iter().find(|s| s.scope == Scope::Pooled)
    }

    pub fn fold(&self, fold_id: usize) -> Option<&RankScore> {
        self.scores
            .iter()
            .find(|s| s.scope == Scope::Fold { fold_id })
    }

    pub fn market(&self, market: &str) -> Option<&RankScore> {
        self.scores
            .iter()
            .find(|s| matches!(&s.scope, Scope::Market { market: m } if m == market))
    }
}

pub struct ValidationEngine {
    config: ValidationConfig,
}

impl ValidationEngine {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, records: &[ForecastRecord]) -> ValidationReport {
        let folds: Vec<usize> = {
            let mut f: Vec<usize> = records.iter().map(|r| r.fold_id).collect();
            f.sort_unstable();
            f.dedup();
            f
        };
        let markets: Vec<String> = {
            let mut m: Vec<String> = records.iter().map(|r| r.market.clone()).collect();
            m.sort();
            m.dedup();
            m
        };

        let scopes: Vec<Scope> = folds
            .iter()
            .map(|&fold_id| Scope::Fold { fold_id })
            .chain(markets.iter().map(|m| Scope::Market { market: m.clone() }))
            .chain(std::iter::once(Scope::Pooled))
            .collect();

        let scores: Vec<RankScore> = scopes
            .into_par_iter()
            .map(|scope| self.score(scope, records))
            .collect();

        let fold_ics: Vec<f64> = scores
            .iter()
            .filter(|s| matches!(s.scope, Scope::Fold { .. }))
            .filter_map(|s| s.spearman_ic)
            .collect();
        let report = ValidationReport {
            fold_ic: IcStats::from_series(&fold_ics),
            scores,
        };

        if let Some(pooled) = report.pooled() {
            info!(
                ic = ?pooled.spearman_ic,
                p_value = ?pooled.permutation_p_value,
                n_obs = pooled.n_obs,
                folds = folds.len(),
                "Validation complete"
            );
        }
        report
    }

    fn score(&self, scope: Scope, records: &[ForecastRecord]) -> RankScore {
        let in_scope: Vec<&ForecastRecord> = records.iter().filter(|r| scope.includes(r)).collect();
        let n_unavailable = in_scope.iter().filter(|r| r.forecast_unavailable).count();

        // Shuffle groups: per fold, and per fold-market cell for market scopes
        let mut groups: BTreeMap<(usize, String), PairGroup> = BTreeMap::new();
        for r in &in_scope {
            if let Some((p, y)) = r.pair() {
                let market_key = match scope {
                    Scope::Market { .. } => r.market.clone(),
                    _ => String::new(),
                };
                groups.entry((r.fold_id, market_key)).or_default().push(p, y);
            }
        }
        let groups: Vec<PairGroup> = groups.into_values().collect();

        let predicted: Vec<f64> = groups.iter().flat_map(|g| g.predicted.clone()).collect();
        let realized: Vec<f64> = groups.iter().flat_map(|g| g.realized.clone()).collect();
        let n_obs = predicted.len();
        let spearman_ic = spearman(&predicted, &realized);

        let seed = self.config.seed ^ hash_str(&scope.seed_key());
        let permutation_p_value = spearman_ic
            .and_then(|_| permutation_test(&groups, self.config.permutation_trials, seed))
            .map(|r| r.p_value);
        let t_test_p_value = spearman_ic.and_then(|ic| correlation_p_value(ic, n_obs));

        RankScore {
            rank_autocorr: rank_autocorrelation(&in_scope),
            scope,
            spearman_ic,
            permutation_p_value,
            t_test_p_value,
            n_obs,
            n_unavailable,
        }
    }
}

/// Mean over markets of the lag-1 Spearman autocorrelation of forecasts.
pub fn rank_autocorrelation(records: &[&ForecastRecord]) -> Option<f64> {
    let mut by_market: BTreeMap<&str, Vec<(chrono::NaiveDate, f64)>> = BTreeMap::new();
    for r in records {
        if r.forecast_unavailable {
            continue;
        }
        if let Some(p) = r.predicted.filter(|p| p.is_finite()) {
            by_market.entry(r.market.as_str()).or_default().push((r.date, p));
        }
    }

    let per_market: Vec<f64> = by_market
        .into_values()
        .filter_map(|mut series| {
            series.sort_by_key(|(d, _)| *d);
            let values: Vec<f64> = series.into_iter().map(|(_, v)| v).collect();
            if values.len() < 2 {
                return None;
            }
            spearman(&values[..values.len() - 1], &values[1..])
        })
        .collect();

    if per_market.is_empty() {
        None
    } else {
        Some(per_market.iter().sum::<f64>() / per_market.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn record(fold_id: usize, day: i64, market: &str, p: Option<f64>, r: f64) -> ForecastRecord {
        ForecastRecord {
            fold_id,
            date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap() + chrono::Duration::days(day),
            market: market.into(),
            predicted: p,
            realized: Some(r),
            forecast_unavailable: p.is_none(),
            degraded: false,
        }
    }

    fn perfect_stream() -> Vec<ForecastRecord> {
        let mut out = Vec::new();
        for fold in 0..3 {
            for day in 0..20 {
                for (m, market) in ["DE", "FR"].iter().enumerate() {
                    let v = (fold * 20 + day) as f64 + m as f64 * 0.5;
                    out.push(record(fold, (fold * 20 + day) as i64, market, Some(v * 3.0), v));
                }
            }
        }
        out
    }

    fn engine(trials: usize) -> ValidationEngine {
        ValidationEngine::new(ValidationConfig {
            permutation_trials: trials,
            seed: 5,
        })
    }

    #[test]
    fn test_scopes_are_complete() {
        let report = engine(50).evaluate(&perfect_stream());
        assert_eq!(report.scores.len(), 3 + 2 + 1);
        assert!(report.fold(2).is_some());
        assert!(report.market("FR").is_some());
        assert_eq!(report.pooled().unwrap().n_obs, 120);
    }

    #[test]
    fn test_perfect_forecasts() {
        let report = engine(200).evaluate(&perfect_stream());
        let pooled = report.pooled().unwrap();
        assert!((pooled.spearman_ic.unwrap() - 1.0).abs() < 1e-9);
        assert!(pooled.permutation_p_value.unwrap() <= 1.0 / 201.0 + 1e-12);
        assert!(pooled.t_test_p_value.unwrap() < 1e-6);
        assert!((pooled.rank_autocorr.unwrap() - 1.0).abs() < 1e-9);
        assert!((report.fold_ic.mean - 1.0).abs() < 1e-9);
        assert_eq!(report.fold_ic.count, 3);
    }

    #[test]
    fn test_unavailable_records_are_skipped() {
        let mut records = perfect_stream();
        // Corrupt every fold-1 record and mark it unavailable
        for r in records.iter_mut().filter(|r| r.fold_id == 1) {
            r.predicted = None;
            r.forecast_unavailable = true;
        }
        let report = engine(50).evaluate(&records);

        let fold1 = report.fold(1).unwrap();
        assert_eq!(fold1.n_obs, 0);
        assert_eq!(fold1.n_unavailable, 40);
        assert!(fold1.spearman_ic.is_none());
        assert!(fold1.permutation_p_value.is_none());

        let pooled = report.pooled().unwrap();
        assert_eq!(pooled.n_obs, 80);
        assert!((pooled.spearman_ic.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(report.fold_ic.count, 2);
    }

    #[test]
    fn test_noise_has_no_signal() {
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let records: Vec<ForecastRecord> = (0..1000)
            .map(|i| {
                record(
                    i / 100,
                    i as i64,
                    if i % 2 == 0 { "DE" } else { "FR" },
                    Some(rng.gen()),
                    rng.gen(),
                )
            })
            .collect();
        let report = engine(200).evaluate(&records);
        let pooled = report.pooled().unwrap();
        assert!(pooled.spearman_ic.unwrap().abs() < 0.12);
        assert!(pooled.permutation_p_value.unwrap() > 0.001);
    }

    #[test]
    fn test_rank_autocorrelation_per_market() {
        let records: Vec<ForecastRecord> = (0..30)
            .map(|d| record(0, d, "DE", Some(d as f64), 0.0))
            .chain((0..30).map(|d| record(0, d, "FR", Some(-(d as f64)), 0.0)))
            .collect();
        let refs: Vec<&ForecastRecord> = records.iter().collect();
        // Both series are monotone, so each autocorrelation is 1
        assert!((rank_autocorrelation(&refs).unwrap() - 1.0).abs() < 1e-9);
        assert!(rank_autocorrelation(&[]).is_none());
    }
}
