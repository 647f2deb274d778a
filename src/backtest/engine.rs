//! Cross-sectional trading simulation.
//!
//! Runs the daily loop over the merged forecast stream:
//! 1. Collect each market's forecast for the date
//! 2. Normalise cross-sectionally and against each market's own history
//! 3. Apply the threshold rule to get positions
//! 4. Book PnL on the cross-sectionally demeaned move, net of turnover cost
//! 5. Record the daily portfolio result

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::MarketSeries;
use crate::forecast::ForecastRecord;
use crate::metrics::{DailyPnl, MetricsCalculator, PerformanceMetrics};

use super::cost::CostModel;
use super::signal::{cross_sectional_z, RollingZScore, SignConvention, ThresholdRule};

/// What a position earns on each day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveSource {
    /// Market returns, demeaned across markets.
    #[default]
    Returns,
    /// Realized residual volatility, demeaned across markets.
    ResidualVol,
}

/// Configuration for the trading simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Score magnitude required to open a position.
    pub entry_threshold: f64,

    /// Score magnitude below which an open position is closed.
    pub exit_threshold: f64,

    /// Cost per unit of turnover.
    pub cost_rate: f64,

    /// Trailing forecasts used by the rolling z-score.
    pub rolling_window: usize,

    /// Minimum history before the rolling z-score is non-zero.
    pub rolling_min_obs: usize,

    /// Weight of the cross-sectional z in the combined score.
    pub cross_sectional_weight: f64,

    pub sign_convention: SignConvention,

    pub move_source: MoveSource,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            entry_threshold: 0.5,
            exit_threshold: 0.25,
            cost_rate: 0.0005,
            rolling_window: 60,
            rolling_min_obs: 10,
            cross_sectional_weight: 0.5,
            sign_convention: SignConvention::LongLowVol,
            move_source: MoveSource::Returns,
        }
    }
}

impl TradingConfig {
    fn rule(&self) -> ThresholdRule {
        ThresholdRule {
            entry: self.entry_threshold,
            exit: self.exit_threshold,
            convention: self.sign_convention,
        }
    }
}

/// Per-date, per-market simulation output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub date: NaiveDate,
    pub market: String,
    pub cross_sectional_z: f64,
    pub rolling_z: f64,
    /// Combined score the threshold rule acts on.
    pub z_score: f64,
    /// Raw entry signal before hysteresis.
    pub signal: i8,
    pub position: i8,
    /// Net of cost.
    pub pnl: f64,
    pub turnover: f64,
}

/// Result of a completed simulation.
#[derive(Debug, Clone)]
pub struct TradingResult {
    pub trades: Vec<TradeResult>,
    pub daily: Vec<DailyPnl>,
    pub metrics: PerformanceMetrics,
}

/// Market returns keyed by market and date.
#[derive(Debug, Clone, Default)]
pub struct MarketMoves {
    returns: HashMap<(String, NaiveDate), f64>,
}

impl MarketMoves {
    pub fn from_series(markets: &[MarketSeries]) -> Self {
        let returns = markets
            .iter()
            .flat_map(|s| {
                s.dates()
                    .iter()
                    .zip(s.returns())
                    .map(move |(d, r)| ((s.market().to_string(), *d), *r))
            })
            .collect();
        Self { returns }
    }

    pub fn get(&self, market: &str, date: NaiveDate) -> Option<f64> {
        self.returns.get(&(market.to_string(), date)).copied()
    }
}

/// Trading simulator.
pub struct TradingSimulator {
    config: TradingConfig,
    cost: CostModel,
}

impl TradingSimulator {
    pub fn new(config: TradingConfig) -> Self {
        let cost = CostModel::new(config.cost_rate);
        Self { config, cost }
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    /// Simulate over the forecast stream.
    ///
    /// `moves` is only consulted for [`MoveSource::Returns`].
    pub fn simulate(&self, records: &[ForecastRecord], moves: &MarketMoves) -> TradingResult {
        let mut markets: Vec<&str> = records.iter().map(|r| r.market.as_str()).collect();
        markets.sort_unstable();
        markets.dedup();
        let slot: HashMap<&str, usize> = markets.iter().enumerate().map(|(i, m)| (*m, i)).collect();

        let mut by_date: BTreeMap<NaiveDate, Vec<Option<&ForecastRecord>>> = BTreeMap::new();
        for r in records {
            let day = by_date
                .entry(r.date)
                .or_insert_with(|| vec![None; markets.len()]);
            if let Some(&i) = slot.get(r.market.as_str()) {
                day[i] = Some(r);
            }
        }

        let rule = self.config.rule();
        let w = self.config.cross_sectional_weight;
        let mut rolling: Vec<RollingZScore> = markets
            .iter()
            .map(|_| RollingZScore::new(self.config.rolling_window, self.config.rolling_min_obs))
            .collect();
        let mut positions = vec![0i8; markets.len()];

        let mut trades = Vec::with_capacity(records.len());
        let mut daily = Vec::with_capacity(by_date.len());

        for (date, day) in &by_date {
            let forecasts: Vec<Option<f64>> = day
                .iter()
                .map(|r| {
                    r.filter(|r| !r.forecast_unavailable)
                        .and_then(|r| r.predicted)
                        .filter(|p| p.is_finite())
                })
                .collect();
            // Degenerate cross-section: every market is flat for the day
            let cs_z = cross_sectional_z(&forecasts);
            let market_moves = self.relative_moves(&markets, day, *date, moves);

            let mut day_pnl = 0.0;
            let mut day_cost = 0.0;
            let mut day_turnover = 0.0;

            for (i, market) in markets.iter().enumerate() {
                let rolling_z = forecasts[i].map_or(0.0, |f| rolling[i].update(f));
                let cs = cs_z.as_ref().map_or(0.0, |z| z[i]);
                let z_score = match (&cs_z, forecasts[i]) {
                    (Some(_), Some(_)) => w * cs + (1.0 - w) * rolling_z,
                    _ => 0.0,
                };

                let previous = positions[i];
                let position = match (&cs_z, forecasts[i]) {
                    (Some(_), Some(_)) => rule.next_position(previous, z_score),
                    _ => 0,
                };
                let signal = if z_score.abs() > rule.entry {
                    rule.convention.direction(z_score)
                } else {
                    0
                };
                let cost = self.cost.calculate(previous, position);
                let pnl = position as f64 * market_moves[i] - cost.total;
                positions[i] = position;

                day_pnl += pnl;
                day_cost += cost.total;
                day_turnover += cost.turnover;

                trades.push(TradeResult {
                    date: *date,
                    market: market.to_string(),
                    cross_sectional_z: cs,
                    rolling_z,
                    z_score,
                    signal,
                    position,
                    pnl,
                    turnover: cost.turnover,
                });
            }

            daily.push(DailyPnl {
                date: *date,
                pnl: day_pnl,
                cost: day_cost,
                turnover: day_turnover,
            });
        }

        let metrics = MetricsCalculator::calculate(&daily);
        info!(
            days = daily.len(),
            markets = markets.len(),
            sharpe = metrics.sharpe,
            total_pnl = metrics.total_pnl,
            avg_turnover = metrics.avg_daily_turnover,
            "Trading simulation complete"
        );

        TradingResult {
            trades,
            daily,
            metrics,
        }
    }

    /// Demeaned moves per market slot; missing values contribute 0.
    fn relative_moves(
        &self,
        markets: &[&str],
        day: &[Option<&ForecastRecord>],
        date: NaiveDate,
        moves: &MarketMoves,
    ) -> Vec<f64> {
        let raw: Vec<Option<f64>> = markets
            .iter()
            .zip(day)
            .map(|(market, record)| match self.config.move_source {
                MoveSource::Returns => moves.get(market, date),
                MoveSource::ResidualVol => record.and_then(|r| r.realized),
            })
            .map(|v| v.filter(|x| x.is_finite()))
            .collect();

        let present: Vec<f64> = raw.iter().flatten().copied().collect();
        if present.is_empty() {
            return vec![0.0; markets.len()];
        }
        let mean = present.iter().sum::<f64>() / present.len() as f64;
        raw.iter().map(|v| v.map_or(0.0, |x| x - mean)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(i: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i)
    }

    fn record(d: i64, market: &str, predicted: Option<f64>, realized: f64) -> ForecastRecord {
        ForecastRecord {
            fold_id: 0,
            date: day(d),
            market: market.into(),
            predicted,
            realized: Some(realized),
            forecast_unavailable: predicted.is_none(),
            degraded: false,
        }
    }

    fn config() -> TradingConfig {
        TradingConfig {
            entry_threshold: 0.5,
            exit_threshold: 0.25,
            cost_rate: 0.0,
            rolling_window: 20,
            rolling_min_obs: 5,
            cross_sectional_weight: 1.0,
            sign_convention: SignConvention::LongLowVol,
            move_source: MoveSource::ResidualVol,
        }
    }

    #[test]
    fn test_zero_signals_zero_pnl() {
        // Identical forecasts: flat cross-section, every z is zero
        let records: Vec<ForecastRecord> = (0..30)
            .flat_map(|d| {
                [
                    record(d, "DE", Some(1.0), d as f64 * 0.1),
                    record(d, "FR", Some(1.0), -(d as f64) * 0.2),
                ]
            })
            .collect();
        let result = TradingSimulator::new(config()).simulate(&records, &MarketMoves::default());

        assert_eq!(result.trades.len(), 60);
        assert!(result.trades.iter().all(|t| t.signal == 0 && t.position == 0));
        assert_eq!(result.metrics.total_pnl, 0.0);
        assert_eq!(result.metrics.avg_daily_turnover, 0.0);
        assert_eq!(result.metrics.sharpe, 0.0);
    }

    #[test]
    fn test_long_low_vol_loses_when_high_vol_market_outperforms() {
        // DE always forecast higher and DE realizes higher residual vol:
        // LongLowVol shorts DE and goes long FR, losing on every day
        let records: Vec<ForecastRecord> = (0..10)
            .flat_map(|d| [record(d, "DE", Some(2.0), 2.0), record(d, "FR", Some(1.0), 1.0)])
            .collect();
        let result = TradingSimulator::new(config()).simulate(&records, &MarketMoves::default());

        let de: Vec<&TradeResult> = result.trades.iter().filter(|t| t.market == "DE").collect();
        assert!(de.iter().all(|t| t.position == -1));
        // Each day: DE -1 * 0.5 + FR 1 * -0.5
        assert!((result.metrics.total_pnl + 10.0).abs() < 1e-12);
        // Only the first day trades
        assert_eq!(result.daily[0].turnover, 2.0);
        assert!(result.daily[1..].iter().all(|d| d.turnover == 0.0));
    }

    #[test]
    fn test_costs_reduce_pnl() {
        let records: Vec<ForecastRecord> = (0..10)
            .flat_map(|d| [record(d, "DE", Some(2.0), 2.0), record(d, "FR", Some(1.0), 1.0)])
            .collect();
        let mut cfg = config();
        cfg.cost_rate = 0.01;
        let result = TradingSimulator::new(cfg).simulate(&records, &MarketMoves::default());
        assert!((result.metrics.total_cost - 0.02).abs() < 1e-12);
        assert!((result.metrics.total_pnl + 10.02).abs() < 1e-12);
    }

    #[test]
    fn test_unavailable_forecast_goes_flat() {
        let records = vec![
            record(0, "DE", Some(2.0), 0.0),
            record(0, "FR", Some(1.0), 0.0),
            record(1, "DE", None, 0.0),
            record(1, "FR", Some(1.0), 0.0),
        ];
        let result = TradingSimulator::new(config()).simulate(&records, &MarketMoves::default());
        let last_day: Vec<&TradeResult> = result.trades.iter().filter(|t| t.date == day(1)).collect();
        // One forecast left: no cross-section, both markets flat
        assert!(last_day.iter().all(|t| t.position == 0 && t.z_score == 0.0));
        assert_eq!(result.daily[1].turnover, 2.0);
    }

    #[test]
    fn test_returns_move_source() {
        let dates: Vec<NaiveDate> = (0..3).map(day).collect();
        let de = MarketSeries::new("DE", dates.clone(), vec![0.03, 0.03, 0.03]).unwrap();
        let fr = MarketSeries::new("FR", dates, vec![0.01, 0.01, 0.01]).unwrap();
        let moves = MarketMoves::from_series(&[de, fr]);
        assert_eq!(moves.get("DE", day(1)), Some(0.03));

        let records: Vec<ForecastRecord> = (0..3)
            .flat_map(|d| [record(d, "DE", Some(1.0), 0.0), record(d, "FR", Some(2.0), 0.0)])
            .collect();
        let mut cfg = config();
        cfg.move_source = MoveSource::Returns;
        let result = TradingSimulator::new(cfg).simulate(&records, &moves);
        // Long DE (+0.01 relative), short FR (-0.01 relative) on 3 days
        assert!((result.metrics.total_pnl - 0.06).abs() < 1e-12);
    }

    #[test]
    fn test_flat_cross_section_stays_flat_with_rolling_weight() {
        // Markets always agree, but each series moves against its own history
        let records: Vec<ForecastRecord> = (0..40)
            .flat_map(|d| {
                let f = if d >= 30 {
                    5.0
                } else if d % 2 == 0 {
                    1.0
                } else {
                    1.01
                };
                [record(d, "DE", Some(f), 1.0), record(d, "FR", Some(f), 2.0)]
            })
            .collect();
        let cfg = TradingConfig {
            move_source: MoveSource::ResidualVol,
            ..TradingConfig::default()
        };
        let result = TradingSimulator::new(cfg).simulate(&records, &MarketMoves::default());

        assert_eq!(result.trades.len(), 80);
        assert!(result
            .trades
            .iter()
            .all(|t| t.z_score == 0.0 && t.signal == 0 && t.position == 0));
        // Rolling history is still tracked on flat days
        assert!(result.trades.iter().any(|t| t.rolling_z != 0.0));
        assert_eq!(result.metrics.avg_daily_turnover, 0.0);
        assert_eq!(result.metrics.total_pnl, 0.0);
    }

    #[test]
    fn test_degenerate_day_closes_open_positions() {
        let mut records: Vec<ForecastRecord> = (0..3)
            .flat_map(|d| [record(d, "DE", Some(2.0), 0.0), record(d, "FR", Some(1.0), 0.0)])
            .collect();
        records.push(record(3, "DE", Some(1.5), 0.0));
        records.push(record(3, "FR", Some(1.5), 0.0));
        let result = TradingSimulator::new(TradingConfig {
            cross_sectional_weight: 1.0,
            move_source: MoveSource::ResidualVol,
            ..TradingConfig::default()
        })
        .simulate(&records, &MarketMoves::default());

        assert!(result.trades.iter().filter(|t| t.date == day(2)).all(|t| t.position != 0));
        assert!(result.trades.iter().filter(|t| t.date == day(3)).all(|t| t.position == 0));
        assert_eq!(result.daily[3].turnover, 2.0);
    }
}
