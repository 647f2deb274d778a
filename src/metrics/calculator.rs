//! Performance metrics calculator.
//!
//! Aggregates a daily portfolio PnL series into risk-adjusted statistics.
//! PnL is in return units, so drawdowns are absolute rather than percentages.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Trading days per year used for annualisation.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// One day of portfolio results, summed over markets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyPnl {
    pub date: NaiveDate,
    /// Net of cost.
    pub pnl: f64,
    pub cost: f64,
    pub turnover: f64,
}

/// Summary statistics over the evaluation horizon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub trading_days: usize,

    // P&L
    pub total_pnl: f64,
    pub total_cost: f64,
    pub avg_daily_pnl: f64,
    /// Fraction of days with strictly positive PnL.
    pub hit_rate: f64,

    // Risk-adjusted
    pub sharpe: f64,
    pub sortino: f64,

    // Drawdown
    pub max_drawdown: f64,
    pub drawdown_duration_days: i64,

    pub avg_daily_turnover: f64,
}

impl PerformanceMetrics {
    /// Generate a summary report.
    pub fn summary(&self) -> String {
        format!(
            "Performance Summary\n\
             ====================\n\
             \n\
             Days: {}\n\
             Total P&L: {:.4}\n\
             Total Cost: {:.4}\n\
             Hit Rate: {:.1}%\n\
             \n\
             Sharpe Ratio: {:.2}\n\
             Sortino Ratio: {:.2}\n\
             Max Drawdown: {:.4} ({} days)\n\
             Avg Daily Turnover: {:.3}",
            self.trading_days,
            self.total_pnl,
            self.total_cost,
            self.hit_rate * 100.0,
            self.sharpe,
            self.sortino,
            self.max_drawdown,
            self.drawdown_duration_days,
            self.avg_daily_turnover,
        )
    }
}

/// Drawdown of the cumulative PnL curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawdownAnalysis {
    pub max_drawdown: f64,
    pub max_drawdown_date: Option<NaiveDate>,
    pub peak_date: Option<NaiveDate>,
    pub duration_days: i64,
    pub drawdown_periods: usize,
}

/// Metrics calculator.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate all metrics from a date-ordered daily series.
    pub fn calculate(daily: &[DailyPnl]) -> PerformanceMetrics {
        if daily.is_empty() {
            return PerformanceMetrics::default();
        }

        let pnl: Vec<f64> = daily.iter().map(|d| d.pnl).collect();
        let n = daily.len() as f64;
        let total_pnl: f64 = pnl.iter().sum();
        let drawdown = Self::analyze_drawdown(daily);

        PerformanceMetrics {
            trading_days: daily.len(),
            total_pnl,
            total_cost: daily.iter().map(|d| d.cost).sum(),
            avg_daily_pnl: total_pnl / n,
            hit_rate: pnl.iter().filter(|&&p| p > 0.0).count() as f64 / n,
            sharpe: Self::sharpe(&pnl),
            sortino: Self::sortino(&pnl),
            max_drawdown: drawdown.max_drawdown,
            drawdown_duration_days: drawdown.duration_days,
            avg_daily_turnover: daily.iter().map(|d| d.turnover).sum::<f64>() / n,
        }
    }

    /// Annualised Sharpe ratio with population standard deviation.
    pub fn sharpe(pnl: &[f64]) -> f64 {
        if pnl.is_empty() {
            return 0.0;
        }
        let n = pnl.len() as f64;
        let mean = pnl.iter().sum::<f64>() / n;
        let std = (pnl.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n).sqrt();
        if std == 0.0 || !std.is_finite() {
            return 0.0;
        }
        mean * TRADING_DAYS_PER_YEAR.sqrt() / std
    }

    /// Calculate Sortino ratio (downside deviation).
    pub fn sortino(pnl: &[f64]) -> f64 {
        if pnl.len() < 2 {
            return 0.0;
        }
        let n = pnl.len() as f64;
        let mean = pnl.iter().sum::<f64>() / n;

        // Downside deviation (only negative days)
        let downside_dev = (pnl
            .iter()
            .filter(|&&p| p < 0.0)
            .map(|p| p.powi(2))
            .sum::<f64>()
            / n)
            .sqrt();

        if downside_dev == 0.0 {
            return 0.0;
        }
        mean * TRADING_DAYS_PER_YEAR.sqrt() / downside_dev
    }

    /// Analyze drawdown of the cumulative PnL curve, which starts at zero.
    pub fn analyze_drawdown(daily: &[DailyPnl]) -> DrawdownAnalysis {
        let Some(first) = daily.first() else {
            return DrawdownAnalysis::default();
        };

        let mut equity = 0.0;
        let mut peak = 0.0;
        let mut peak_date = first.date;
        let mut max_drawdown = 0.0;
        let mut max_drawdown_date = None;
        let mut max_peak_date = None;
        let mut drawdown_start: Option<NaiveDate> = None;
        let mut max_duration = 0i64;
        let mut periods = 0;

        for point in daily {
            equity += point.pnl;
            if equity > peak {
                // New high
                if drawdown_start.is_some() {
                    periods += 1;
                }
                peak = equity;
                peak_date = point.date;
                drawdown_start = None;
                continue;
            }

            let drawdown = peak - equity;
            if drawdown <= 0.0 {
                continue;
            }
            let start = *drawdown_start.get_or_insert(point.date);
            let duration = (point.date - start).num_days();
            max_duration = max_duration.max(duration);

            if drawdown > max_drawdown {
                max_drawdown = drawdown;
                max_drawdown_date = Some(point.date);
                max_peak_date = Some(peak_date);
            }
        }
        if drawdown_start.is_some() {
            periods += 1;
        }

        DrawdownAnalysis {
            max_drawdown,
            max_drawdown_date,
            peak_date: max_peak_date,
            duration_days: max_duration,
            drawdown_periods: periods,
        }
    }
}
