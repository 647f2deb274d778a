//! Data loader for the ingestion collaborator's tables.
//!
//! Reads the per-market return/price table and the exogenous regime table
//! from CSV or Parquet files using polars, and converts them into the
//! immutable [`MarketSeries`] / [`RegimeTable`] contracts.
//!
//! Expected layouts:
//! - returns: `date, market, <value_column>` (long form, one row per market per date)
//! - regimes: either long form `date, feature_name, value` or wide form
//!   `date, feature_1, ..., feature_n`

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::types::{Dataset, MarketSeries, RegimeTable, ValueKind};

/// Columns the returns table must carry besides the value column.
pub const RETURNS_KEY_COLUMNS: &[&str] = &["date", "market"];

/// Columns identifying a long-form regime table.
pub const LONG_REGIME_COLUMNS: &[&str] = &["date", "feature_name", "value"];

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Name of the value column in the returns table.
    pub value_column: String,
    /// Whether the value column holds returns or prices.
    pub value_kind: ValueKind,
    /// Date format used in text date columns.
    pub date_format: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            value_column: "return".to_string(),
            value_kind: ValueKind::Returns,
            date_format: "%Y-%m-%d".to_string(),
        }
    }
}

/// Loader for CSV / Parquet input tables.
pub struct DataLoader {
    config: DataConfig,
}

impl DataLoader {
    /// Create a new loader.
    pub fn new(config: DataConfig) -> Self {
        Self { config }
    }

    /// Load the returns table and (optionally) the regime table.
    pub fn load_dataset(
        &self,
        returns_path: &Path,
        regimes_path: Option<&Path>,
    ) -> Result<Dataset, LoaderError> {
        let markets = self.load_returns(returns_path)?;
        let regimes = match regimes_path {
            Some(path) => self.load_regimes(path)?,
            None => RegimeTable::empty(),
        };
        info!(
            "Loaded {} markets and {} regime variables",
            markets.len(),
            regimes.names().len()
        );
        Ok(Dataset::new(markets, regimes))
    }

    /// Read a CSV or Parquet file into a DataFrame.
    pub fn read_frame(&self, path: &Path) -> Result<DataFrame, LoaderError> {
        if !path.exists() {
            return Err(LoaderError::FileNotFound(path.display().to_string()));
        }
        let is_parquet = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("parquet"))
            .unwrap_or(false);

        let df = if is_parquet {
            LazyFrame::scan_parquet(path, ScanArgsParquet::default())?.collect()?
        } else {
            CsvReadOptions::default()
                .with_has_header(true)
                .try_into_reader_with_file_path(Some(path.to_path_buf()))?
                .finish()?
        };
        Ok(df)
    }

    /// Load per-market return series from a long-form table.
    pub fn load_returns(&self, path: &Path) -> Result<Vec<MarketSeries>, LoaderError> {
        let df = self.read_frame(path)?;
        self.returns_from_frame(&df)
    }

    /// Convert a long-form returns DataFrame into market series.
    pub fn returns_from_frame(&self, df: &DataFrame) -> Result<Vec<MarketSeries>, LoaderError> {
        check_columns(df, RETURNS_KEY_COLUMNS)?;
        check_columns(df, &[self.config.value_column.as_str()])?;

        let dates = self.date_column(df, "date")?;
        let markets = string_column(df, "market")?;
        let values = float_column(df, &self.config.value_column)?;

        let mut by_market: BTreeMap<String, Vec<(NaiveDate, f64)>> = BTreeMap::new();
        for ((date, market), value) in dates.into_iter().zip(markets).zip(values) {
            let (Some(date), Some(market)) = (date, market) else {
                return Err(LoaderError::InvalidData(
                    "returns table has a row without date or market".to_string(),
                ));
            };
            let value = value.unwrap_or(f64::NAN);
            by_market.entry(market).or_default().push((date, value));
        }

        if by_market.is_empty() {
            return Err(LoaderError::InvalidData("returns table is empty".to_string()));
        }

        let mut series = Vec::with_capacity(by_market.len());
        for (market, mut rows) in by_market {
            rows.sort_by_key(|(d, _)| *d);
            let (dates, values): (Vec<_>, Vec<_>) = rows.into_iter().unzip();
            let s = match self.config.value_kind {
                ValueKind::Returns => MarketSeries::new(market, dates, values)?,
                ValueKind::Prices => MarketSeries::from_prices(market, dates, values)?,
            };
            info!("  {}: {} observations", s.market(), s.len());
            series.push(s);
        }
        Ok(series)
    }

    /// Load the exogenous regime table (long or wide form).
    pub fn load_regimes(&self, path: &Path) -> Result<RegimeTable, LoaderError> {
        let df = self.read_frame(path)?;
        self.regimes_from_frame(&df)
    }

    /// Convert a regime DataFrame into a [`RegimeTable`].
    pub fn regimes_from_frame(&self, df: &DataFrame) -> Result<RegimeTable, LoaderError> {
        let columns = column_names(df);
        let is_long = LONG_REGIME_COLUMNS
            .iter()
            .all(|c| columns.iter().any(|name| name == c));

        if is_long {
            self.long_regimes(df)
        } else {
            self.wide_regimes(df, &columns)
        }
    }

    fn long_regimes(&self, df: &DataFrame) -> Result<RegimeTable, LoaderError> {
        let dates = self.date_column(df, "date")?;
        let names = string_column(df, "feature_name")?;
        let values = float_column(df, "value")?;

        let mut all_dates = BTreeSet::new();
        let mut cells: BTreeMap<String, HashMap<NaiveDate, f64>> = BTreeMap::new();
        for ((date, name), value) in dates.into_iter().zip(names).zip(values) {
            let (Some(date), Some(name)) = (date, name) else {
                warn!("Skipping regime row without date or feature name");
                continue;
            };
            all_dates.insert(date);
            cells
                .entry(name)
                .or_default()
                .insert(date, value.unwrap_or(f64::NAN));
        }

        let dates: Vec<NaiveDate> = all_dates.into_iter().collect();
        let mut names = Vec::with_capacity(cells.len());
        let mut columns = Vec::with_capacity(cells.len());
        for (name, by_date) in cells {
            columns.push(
                dates
                    .iter()
                    .map(|d| by_date.get(d).copied().unwrap_or(f64::NAN))
                    .collect(),
            );
            names.push(name);
        }
        RegimeTable::new(dates, names, columns)
    }

    fn wide_regimes(&self, df: &DataFrame, columns: &[String]) -> Result<RegimeTable, LoaderError> {
        check_columns(df, &["date"])?;
        let raw_dates = self.date_column(df, "date")?;

        let mut order: Vec<usize> = (0..raw_dates.len()).collect();
        order.sort_by_key(|&i| raw_dates[i]);

        let mut dates = Vec::with_capacity(order.len());
        for &i in &order {
            let date = raw_dates[i].ok_or_else(|| {
                LoaderError::InvalidData("regime table has a row without date".to_string())
            })?;
            dates.push(date);
        }

        let mut names = Vec::new();
        let mut values = Vec::new();
        for name in columns.iter().filter(|c| c.as_str() != "date") {
            let col = float_column(df, name)?;
            values.push(order.iter().map(|&i| col[i].unwrap_or(f64::NAN)).collect());
            names.push(name.clone());
        }
        RegimeTable::new(dates, names, values)
    }

    /// Parse a date column that may be stored as text or as a polars Date.
    fn date_column(&self, df: &DataFrame, name: &str) -> Result<Vec<Option<NaiveDate>>, LoaderError> {
        let as_text = df.column(name)?.cast(&DataType::String)?;
        let mut out = Vec::with_capacity(as_text.len());
        for value in as_text.str()?.into_iter() {
            let parsed = match value {
                Some(s) => Some(
                    NaiveDate::parse_from_str(s.trim(), &self.config.date_format).map_err(|e| {
                        LoaderError::InvalidData(format!("Invalid date '{}': {}", s, e))
                    })?,
                ),
                None => None,
            };
            out.push(parsed);
        }
        Ok(out)
    }
}

fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect()
}

fn check_columns(df: &DataFrame, required: &[&str]) -> Result<(), LoaderError> {
    let present = column_names(df);
    let missing: Vec<_> = required
        .iter()
        .filter(|c| !present.iter().any(|p| p == *c))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(LoaderError::InvalidData(format!(
            "Missing columns: {:?}",
            missing
        )))
    }
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, LoaderError> {
    let col = df.column(name)?.cast(&DataType::String)?;
    Ok(col
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.trim().to_string()))
        .collect())
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, LoaderError> {
    let col = df.column(name)?.cast(&DataType::Float64)?;
    Ok(col.f64()?.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = DataConfig::default();
        assert_eq!(config.value_column, "return");
        assert_eq!(config.value_kind, ValueKind::Returns);
    }

    #[test]
    fn test_missing_file() {
        let loader = DataLoader::new(DataConfig::default());
        let result = loader.load_returns(Path::new("does/not/exist.csv"));
        assert!(matches!(result, Err(LoaderError::FileNotFound(_))));
    }

    #[test]
    fn test_load_long_returns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "returns.csv",
            "date,market,return\n\
             2020-01-02,DE,0.01\n\
             2020-01-01,DE,-0.02\n\
             2020-01-01,FR,0.03\n\
             2020-01-02,FR,0.00\n",
        );
        let loader = DataLoader::new(DataConfig::default());
        let series = loader.load_returns(&path).unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series[0].market(), "DE");
        assert_eq!(series[0].returns(), &[-0.02, 0.01]);
        assert_eq!(series[1].market(), "FR");
    }

    #[test]
    fn test_duplicate_dates_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "returns.csv",
            "date,market,return\n2020-01-01,DE,0.01\n2020-01-01,DE,0.02\n",
        );
        let loader = DataLoader::new(DataConfig::default());
        assert!(matches!(
            loader.load_returns(&path),
            Err(LoaderError::InvalidData(_))
        ));
    }

    #[test]
    fn test_wide_and_long_regimes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let wide = write_file(
            &dir,
            "wide.csv",
            "date,gas_ret,load\n2020-01-02,0.5,10\n2020-01-01,0.25,20\n",
        );
        let long = write_file(
            &dir,
            "long.csv",
            "date,feature_name,value\n\
             2020-01-01,gas_ret,0.25\n\
             2020-01-01,load,20\n\
             2020-01-02,gas_ret,0.5\n\
             2020-01-02,load,10\n",
        );
        let loader = DataLoader::new(DataConfig::default());
        let a = loader.load_regimes(&wide).unwrap();
        let b = loader.load_regimes(&long).unwrap();

        assert_eq!(a.dates(), b.dates());
        let calendar = a.dates().to_vec();
        for name in ["gas_ret", "load"] {
            assert_eq!(
                a.aligned_column(name, &calendar),
                b.aligned_column(name, &calendar)
            );
        }
    }
}
