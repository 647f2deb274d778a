//! Output tables.
//!
//! Writes the forecast, validation and trading tables as CSV and a JSON run
//! summary. Also writes synthetic panels in the same layout the loader reads.

use std::fs;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::data::Dataset;
use crate::metrics::PerformanceMetrics;
use crate::validation::{IcStats, RankScore};
use crate::walkforward::pipeline::{FailedFold, FilterSummary, FoldSummary, RunReport};

pub const FORECASTS_FILE: &str = "forecasts.csv";
pub const VALIDATION_FILE: &str = "validation.csv";
pub const TRADES_FILE: &str = "trades.csv";
pub const SUMMARY_FILE: &str = "summary.json";
pub const RETURNS_FILE: &str = "returns.csv";
pub const REGIMES_FILE: &str = "regimes.csv";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON document written next to the tables.
#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub markets: &'a [String],
    pub calendar_len: usize,
    pub expected_folds: usize,
    pub completed_folds: usize,
    pub failed_folds: &'a [FailedFold],
    pub filter: &'a [FilterSummary],
    pub folds: &'a [FoldSummary],
    pub pooled: Option<&'a RankScore>,
    pub fold_ic: &'a IcStats,
    pub trading: &'a PerformanceMetrics,
}

impl<'a> From<&'a RunReport> for RunSummary<'a> {
    fn from(report: &'a RunReport) -> Self {
        Self {
            markets: &report.markets,
            calendar_len: report.calendar_len,
            expected_folds: report.expected_folds,
            completed_folds: report.folds.len(),
            failed_folds: &report.failed_folds,
            filter: &report.filter,
            folds: &report.folds,
            pooled: report.validation.pooled(),
            fold_ic: &report.validation.fold_ic,
            trading: &report.trading.metrics,
        }
    }
}

pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Write every run output; returns the written paths.
    pub fn write_run(&self, report: &RunReport) -> Result<Vec<PathBuf>, ReportError> {
        fs::create_dir_all(&self.output_dir)?;
        let paths = vec![
            self.write_csv(FORECASTS_FILE, &mut forecasts_frame(report)?)?,
            self.write_csv(VALIDATION_FILE, &mut validation_frame(&report.validation.scores)?)?,
            self.write_csv(TRADES_FILE, &mut trades_frame(report)?)?,
            self.write_json(SUMMARY_FILE, &RunSummary::from(report))?,
        ];
        info!(dir = %self.output_dir.display(), files = paths.len(), "Wrote run report");
        Ok(paths)
    }

    /// Write a panel as long-form returns and wide-form regimes.
    pub fn write_dataset(&self, dataset: &Dataset) -> Result<Vec<PathBuf>, ReportError> {
        fs::create_dir_all(&self.output_dir)?;
        let mut paths = vec![self.write_csv(RETURNS_FILE, &mut returns_frame(dataset)?)?];
        if !dataset.regimes.is_empty() {
            paths.push(self.write_csv(REGIMES_FILE, &mut regimes_frame(dataset)?)?);
        }
        info!(dir = %self.output_dir.display(), files = paths.len(), "Wrote dataset");
        Ok(paths)
    }

    fn write_csv(&self, name: &str, df: &mut DataFrame) -> Result<PathBuf, ReportError> {
        let path = self.output_dir.join(name);
        let mut file = fs::File::create(&path)?;
        CsvWriter::new(&mut file).include_header(true).finish(df)?;
        Ok(path)
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, ReportError> {
        let path = self.output_dir.join(name);
        fs::write(&path, serde_json::to_string_pretty(value)?)?;
        Ok(path)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

fn forecasts_frame(report: &RunReport) -> Result<DataFrame, PolarsError> {
    let rows = &report.forecasts;
    let df = DataFrame::new(vec![
        Series::new("fold_id".into(), rows.iter().map(|r| r.fold_id as i64).collect::<Vec<_>>()).into(),
        Series::new("date".into(), rows.iter().map(|r| r.date.format(DATE_FORMAT).to_string()).collect::<Vec<_>>()).into(),
        Series::new("market".into(), rows.iter().map(|r| r.market.clone()).collect::<Vec<_>>()).into(),
        Series::new("predicted_residual_vol".into(), rows.iter().map(|r| r.predicted).collect::<Vec<_>>()).into(),
        Series::new("realized_residual_vol".into(), rows.iter().map(|r| r.realized).collect::<Vec<_>>()).into(),
        Series::new("forecast_unavailable".into(), rows.iter().map(|r| r.forecast_unavailable).collect::<Vec<_>>()).into(),
        Series::new("degraded".into(), rows.iter().map(|r| r.degraded).collect::<Vec<_>>()).into(),
    ])?;
    Ok(df)
}

fn validation_frame(scores: &[RankScore]) -> Result<DataFrame, PolarsError> {
    let df = DataFrame::new(vec![
        Series::new("scope".into(), scores.iter().map(|s| s.scope.kind()).collect::<Vec<_>>()).into(),
        Series::new("fold_id".into(), scores.iter().map(|s| s.scope.fold_label()).collect::<Vec<_>>()).into(),
        Series::new("market".into(), scores.iter().map(|s| s.scope.market_label()).collect::<Vec<_>>()).into(),
        Series::new("spearman_ic".into(), scores.iter().map(|s| s.spearman_ic).collect::<Vec<_>>()).into(),
        Series::new("permutation_p_value".into(), scores.iter().map(|s| s.permutation_p_value).collect::<Vec<_>>()).into(),
        Series::new("t_test_p_value".into(), scores.iter().map(|s| s.t_test_p_value).collect::<Vec<_>>()).into(),
        Series::new("n_obs".into(), scores.iter().map(|s| s.n_obs as i64).collect::<Vec<_>>()).into(),
        Series::new("n_unavailable".into(), scores.iter().map(|s| s.n_unavailable as i64).collect::<Vec<_>>()).into(),
        Series::new("rank_autocorr".into(), scores.iter().map(|s| s.rank_autocorr).collect::<Vec<_>>()).into(),
    ])?;
    Ok(df)
}

fn trades_frame(report: &RunReport) -> Result<DataFrame, PolarsError> {
    let rows = &report.trading.trades;
    let df = DataFrame::new(vec![
        Series::new("date".into(), rows.iter().map(|t| t.date.format(DATE_FORMAT).to_string()).collect::<Vec<_>>()).into(),
        Series::new("market".into(), rows.iter().map(|t| t.market.clone()).collect::<Vec<_>>()).into(),
        Series::new("cross_sectional_z".into(), rows.iter().map(|t| t.cross_sectional_z).collect::<Vec<_>>()).into(),
        Series::new("rolling_z".into(), rows.iter().map(|t| t.rolling_z).collect::<Vec<_>>()).into(),
        Series::new("z_score".into(), rows.iter().map(|t| t.z_score).collect::<Vec<_>>()).into(),
        Series::new("signal".into(), rows.iter().map(|t| t.signal as i32).collect::<Vec<_>>()).into(),
        Series::new("position".into(), rows.iter().map(|t| t.position as i32).collect::<Vec<_>>()).into(),
        Series::new("pnl".into(), rows.iter().map(|t| t.pnl).collect::<Vec<_>>()).into(),
        Series::new("turnover".into(), rows.iter().map(|t| t.turnover).collect::<Vec<_>>()).into(),
    ])?;
    Ok(df)
}

fn returns_frame(dataset: &Dataset) -> Result<DataFrame, PolarsError> {
    let mut date = Vec::new();
    let mut market = Vec::new();
    let mut value = Vec::new();
    for series in &dataset.markets {
        for (d, r) in series.dates().iter().zip(series.returns()) {
            date.push(d.format(DATE_FORMAT).to_string());
            market.push(series.market().to_string());
            value.push(*r);
        }
    }
    DataFrame::new(vec![
        Series::new("date".into(), date).into(),
        Series::new("market".into(), market).into(),
        Series::new("return".into(), value).into(),
    ])
}

fn regimes_frame(dataset: &Dataset) -> Result<DataFrame, PolarsError> {
    let regimes = &dataset.regimes;
    let dates = regimes.dates();
    let mut columns: Vec<Column> = vec![Series::new(
        "date".into(),
        dates.iter().map(|d| d.format(DATE_FORMAT).to_string()).collect::<Vec<_>>(),
    )
    .into()];
    for name in regimes.names() {
        let values = regimes.aligned_column(name, dates).unwrap_or_default();
        columns.push(Series::new(name.as_str().into(), values).into());
    }
    DataFrame::new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataConfig, DataLoader};
    use crate::synthetic::{SyntheticConfig, SyntheticGenerator};
    use tempfile::tempdir;

    #[test]
    fn test_dataset_round_trip_through_loader() {
        let dir = tempdir().unwrap();
        let dataset = SyntheticGenerator::new(SyntheticConfig {
            days: 50,
            ..Default::default()
        })
        .generate()
        .unwrap();

        let paths = ReportWriter::new(dir.path()).write_dataset(&dataset).unwrap();
        assert_eq!(paths.len(), 2);

        let loaded = DataLoader::new(DataConfig::default())
            .load_dataset(&paths[0], Some(paths[1].as_path()))
            .unwrap();
        assert_eq!(loaded.market_names(), vec!["DE", "FR"]);
        assert_eq!(loaded.common_calendar(), dataset.common_calendar());
        assert_eq!(loaded.regimes.names(), dataset.regimes.names());
        let original = dataset.markets[0].returns();
        let reread = loaded.markets[0].returns();
        assert!(original
            .iter()
            .zip(reread)
            .all(|(a, b)| (a - b).abs() < 1e-12 * a.abs().max(1.0)));
    }

    #[test]
    fn test_validation_frame_columns() {
        use crate::validation::Scope;
        let scores = vec![RankScore {
            scope: Scope::Market {
                market: "DE".into(),
            },
            spearman_ic: Some(0.4),
            permutation_p_value: Some(0.01),
            t_test_p_value: None,
            n_obs: 42,
            n_unavailable: 0,
            rank_autocorr: Some(0.9),
        }];
        let df = validation_frame(&scores).unwrap();
        assert_eq!(df.height(), 1);
        assert_eq!(
            df.get_column_names()
                .into_iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
            vec![
                "scope",
                "fold_id",
                "market",
                "spearman_ic",
                "permutation_p_value",
                "t_test_p_value",
                "n_obs",
                "n_unavailable",
                "rank_autocorr"
            ]
        );
    }
}
