//! Forecast validation module.
//!
//! - Spearman rank IC per fold, per market and pooled
//! - Within-fold label permutation significance
//! - Lag-1 rank autocorrelation of the forecast series

pub mod engine;
pub mod permutation;
pub mod rank;

pub use engine::{RankScore, Scope, ValidationConfig, ValidationEngine, ValidationReport};
pub use permutation::{permutation_test, PairGroup, PermutationResult};
pub use rank::{average_ranks, spearman, IcStats};
