//! Feature engineering module.
//!
//! Builds strictly lagged feature vectors from residuals and exogenous
//! regime variables, and selects a per-fold feature subset from training
//! rows only.

pub mod builder;
pub mod selection;

pub use builder::{
    FeatureBuilder, FeatureConfig, FeatureError, FeatureInputs, FeatureMatrix, FeatureVector,
    AbsSumSpec, InteractionSpec, LeakageError, RatioSpec, ScaledSumSpec, SpreadSpec,
};
pub use selection::{FeatureScore, FeatureSelector, RetentionRule};
