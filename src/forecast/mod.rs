//! Residual volatility forecaster.
//!
//! Gradient-boosted regression trees trained per walk-forward fold.

pub mod booster;
pub mod forecaster;
pub mod tree;

pub use booster::{BoostingConfig, BoostingError, GradientBoostedTrees};
pub use forecaster::{FoldError, FoldOutput, ForecastRecord, ResidualForecaster};
pub use tree::{TreeConfig, TreeNode};
