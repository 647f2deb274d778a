//! Walk-forward residual volatility forecasting for coupled power markets.
//!
//! A rolling GARCH(1,1) filter standardizes each market's volatility, a
//! gradient-boosted ensemble forecasts the residual from lagged structural
//! features, and the forecasts are judged by rank statistics and a
//! cross-sectional trading simulation.

pub mod backtest;
pub mod config;
pub mod data;
pub mod features;
pub mod forecast;
pub mod metrics;
pub mod report;
pub mod synthetic;
pub mod validation;
pub mod volatility;
pub mod walkforward;

// Re-export commonly used types
pub use backtest::{TradeResult, TradingConfig, TradingResult, TradingSimulator};
pub use config::{ConfigError, EngineConfig};
pub use data::{DataLoader, Dataset, MarketSeries, RegimeTable};
pub use features::{FeatureBuilder, FeatureConfig, LeakageError, RetentionRule};
pub use forecast::{ForecastRecord, ResidualForecaster};
pub use metrics::{MetricsCalculator, PerformanceMetrics};
pub use report::{ReportError, ReportWriter};
pub use synthetic::{SyntheticConfig, SyntheticGenerator};
pub use validation::{RankScore, ValidationEngine, ValidationReport};
pub use volatility::{VolatilityEstimate, VolatilityFilter};
pub use walkforward::{ForecastWindow, Pipeline, PipelineError, RunReport, WindowScheduler};
