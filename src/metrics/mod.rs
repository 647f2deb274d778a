//! Performance metrics module.
//!
//! Aggregates the daily PnL of the trading simulation:
//! - Sharpe and Sortino ratios
//! - Maximum drawdown of the cumulative PnL curve
//! - Turnover and cost totals

pub mod calculator;

pub use calculator::{DailyPnl, DrawdownAnalysis, MetricsCalculator, PerformanceMetrics};
