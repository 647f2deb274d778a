//! Engine configuration.
//!
//! Every tunable of a run lives in [`EngineConfig`]. It is loaded once from
//! TOML, validated once, and then passed by reference to every stage.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backtest::TradingConfig;
use crate::data::DataConfig;
use crate::features::{FeatureConfig, RetentionRule};
use crate::forecast::BoostingConfig;
use crate::validation::ValidationConfig;
use crate::volatility::FilterConfig;
use crate::walkforward::periods::ForecastScheduleConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Execution resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads for the run (0 = one per core).
    pub threads: usize,
}

/// Complete configuration of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data: DataConfig,
    pub filter: FilterConfig,
    pub forecast_schedule: ForecastScheduleConfig,
    pub features: FeatureConfig,
    pub boosting: BoostingConfig,
    pub validation: ValidationConfig,
    pub trading: TradingConfig,
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    /// Load from a TOML file; missing sections and fields take their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every cross-field constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let f = &self.filter;
        if f.window == 0 {
            return Err(invalid("filter.window", "must be positive"));
        }
        if f.min_obs == 0 || f.min_obs > f.window {
            return Err(invalid(
                "filter.min_obs",
                format!("must be in 1..={} (filter.window)", f.window),
            ));
        }
        if f.refit_every == 0 {
            return Err(invalid("filter.refit_every", "must be positive"));
        }
        if f.garch.p != 1 || f.garch.q != 1 {
            return Err(invalid(
                "filter.garch",
                format!("only GARCH(1,1) is supported, got ({}, {})", f.garch.p, f.garch.q),
            ));
        }
        if f.garch.max_iterations == 0 {
            return Err(invalid("filter.garch.max_iterations", "must be positive"));
        }
        if !(f.garch.tolerance > 0.0) {
            return Err(invalid("filter.garch.tolerance", "must be positive"));
        }

        let s = &self.forecast_schedule;
        if s.train_len == 0 {
            return Err(invalid("forecast_schedule.train_len", "must be positive"));
        }
        if s.test_len == 0 {
            return Err(invalid("forecast_schedule.test_len", "must be positive"));
        }

        self.features
            .check_lags()
            .map_err(|e| invalid("features", e.to_string()))?;
        match self.features.retention {
            RetentionRule::TopKCorrelation { k } | RetentionRule::TopKImportance { k } if k == 0 => {
                return Err(invalid("features.retention.k", "must be positive"));
            }
            RetentionRule::CorrelationThreshold { min_abs } if !(0.0..=1.0).contains(&min_abs) => {
                return Err(invalid("features.retention.min_abs", "must be in [0, 1]"));
            }
            _ => {}
        }

        let b = &self.boosting;
        if b.n_trees == 0 {
            return Err(invalid("boosting.n_trees", "must be positive"));
        }
        if b.max_depth == 0 {
            return Err(invalid("boosting.max_depth", "must be positive"));
        }
        if !(b.learning_rate > 0.0 && b.learning_rate <= 1.0) {
            return Err(invalid("boosting.learning_rate", "must be in (0, 1]"));
        }
        if b.l1 < 0.0 || b.l2 < 0.0 {
            return Err(invalid("boosting.l1/l2", "must be non-negative"));
        }
        if !(b.subsample > 0.0 && b.subsample <= 1.0) {
            return Err(invalid("boosting.subsample", "must be in (0, 1]"));
        }
        if b.max_bins < 2 || b.max_bins >= u16::MAX as usize {
            return Err(invalid("boosting.max_bins", "must be in 2..65535"));
        }
        if b.min_samples_leaf == 0 {
            return Err(invalid("boosting.min_samples_leaf", "must be positive"));
        }

        if self.validation.permutation_trials == 0 {
            return Err(invalid("validation.permutation_trials", "must be positive"));
        }

        let t = &self.trading;
        if t.entry_threshold < 0.0 {
            return Err(invalid("trading.entry_threshold", "must be non-negative"));
        }
        if t.exit_threshold < 0.0 || t.exit_threshold > t.entry_threshold {
            return Err(invalid(
                "trading.exit_threshold",
                "must be in [0, trading.entry_threshold]",
            ));
        }
        if t.cost_rate < 0.0 {
            return Err(invalid("trading.cost_rate", "must be non-negative"));
        }
        if t.rolling_window == 0 {
            return Err(invalid("trading.rolling_window", "must be positive"));
        }
        if !(0.0..=1.0).contains(&t.cross_sectional_weight) {
            return Err(invalid("trading.cross_sectional_weight", "must be in [0, 1]"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{MoveSource, SignConvention};

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.filter.window, 500);
        assert_eq!(config.filter.min_obs, 300);
        assert_eq!(config.forecast_schedule.train_len, 280);
        assert_eq!(config.forecast_schedule.test_len, 21);
        assert_eq!(config.validation.permutation_trials, 1000);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [filter]
            refit_every = 5

            [features.retention]
            kind = "top_k_importance"
            k = 8

            [trading]
            sign_convention = "long_high_vol"
            move_source = "residual_vol"
            "#,
        )
        .unwrap();
        assert_eq!(config.filter.refit_every, 5);
        assert_eq!(config.filter.window, 500);
        assert_eq!(config.features.retention, RetentionRule::TopKImportance { k: 8 });
        assert_eq!(config.trading.sign_convention, SignConvention::LongHighVol);
        assert_eq!(config.trading.move_source, MoveSource::ResidualVol);
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let mut config = EngineConfig::default();
        config.boosting.n_trees = 50;
        config.runtime.threads = 2;
        let text = config.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.boosting.n_trees, 50);
        assert_eq!(parsed.runtime.threads, 2);
    }

    #[test]
    fn test_rejects_zero_lag() {
        let mut config = EngineConfig::default();
        config.features.target_lags = vec![0, 1];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "features", .. })
        ));
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        let mut config = EngineConfig::default();
        config.filter.min_obs = 600;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.trading.exit_threshold = 2.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.filter.garch.p = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shipped_default_matches_code_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");
        let shipped = EngineConfig::from_toml_file(path).unwrap();
        shipped.validate().unwrap();

        let defaults = EngineConfig::default();
        assert_eq!(
            shipped.to_toml_string().unwrap(),
            defaults.to_toml_string().unwrap()
        );
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::from_toml_file("/nonexistent/powervol.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
