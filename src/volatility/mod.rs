//! Volatility filter module.
//!
//! - GARCH(1,1) quasi-maximum-likelihood estimation
//! - Rolling one-step-ahead conditional volatility per market
//! - Standardized residual extraction with degraded-fit fallback

pub mod filter;
pub mod garch;

pub use filter::{FilterConfig, ResidualMode, ResidualSeries, VolatilityEstimate, VolatilityFilter};
pub use garch::{Garch11, GarchConfig, GarchError, GarchFit, GarchParams};
