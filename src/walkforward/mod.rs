//! Walk-forward module.
//!
//! - Leakage-safe window generation at filter and forecast granularity
//! - The staged pipeline that runs filter, forecast, validation and trading
//!   passes over a dataset

pub mod periods;
pub mod pipeline;

pub use periods::{
    FilterScheduleConfig, FilterTarget, ForecastScheduleConfig, ForecastWindow, ScheduleError,
    WindowScheduler,
};
pub use pipeline::{FailedFold, FilterSummary, FoldSummary, Pipeline, PipelineError, RunReport};
