//! Cross-sectional trading simulation.
//!
//! Turns the forecast stream into positions and cost-adjusted PnL:
//! - Cross-sectional and rolling z-scores of forecasts
//! - Threshold signals with hysteresis
//! - Turnover-proportional transaction costs

pub mod cost;
pub mod engine;
pub mod signal;

pub use cost::{Cost, CostModel};
pub use engine::{MarketMoves, MoveSource, TradeResult, TradingConfig, TradingResult, TradingSimulator};
pub use signal::{cross_sectional_z, RollingZScore, SignConvention, ThresholdRule};
