//! Core data types for the forecasting engine.
//!
//! These types are the contracts between the ingestion collaborator and the
//! core: per-market return series and the shared exogenous regime table.
//! Both are immutable once constructed; the series dates are the only
//! source of truth for time ordering.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::loader::LoaderError;

/// Whether the ingested value column holds returns or price levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Returns,
    Prices,
}

impl ValueKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "return" | "returns" => Some(Self::Returns),
            "price" | "prices" => Some(Self::Prices),
            _ => None,
        }
    }
}

/// Daily return series for a single market.
///
/// Dates are strictly increasing and unique. Construct through
/// [`MarketSeries::new`], which enforces that invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSeries {
    market: String,
    dates: Vec<NaiveDate>,
    returns: Vec<f64>,
}

impl MarketSeries {
    /// Create a series from aligned dates and returns.
    pub fn new(
        market: impl Into<String>,
        dates: Vec<NaiveDate>,
        returns: Vec<f64>,
    ) -> Result<Self, LoaderError> {
        let market = market.into();
        if dates.len() != returns.len() {
            return Err(LoaderError::InvalidData(format!(
                "{}: {} dates but {} values",
                market,
                dates.len(),
                returns.len()
            )));
        }
        if let Some(w) = dates.windows(2).find(|w| w[1] <= w[0]) {
            return Err(LoaderError::InvalidData(format!(
                "{}: dates not strictly increasing at {} -> {}",
                market, w[0], w[1]
            )));
        }
        if let Some(pos) = returns.iter().position(|r| !r.is_finite()) {
            return Err(LoaderError::InvalidData(format!(
                "{}: non-finite value on {}",
                market, dates[pos]
            )));
        }
        Ok(Self {
            market,
            dates,
            returns,
        })
    }

    /// Build a return series from a price series (log returns).
    ///
    /// The first date is dropped since it has no prior price.
    pub fn from_prices(
        market: impl Into<String>,
        dates: Vec<NaiveDate>,
        prices: Vec<f64>,
    ) -> Result<Self, LoaderError> {
        let market = market.into();
        if let Some(pos) = prices.iter().position(|p| !(p.is_finite() && *p > 0.0)) {
            return Err(LoaderError::InvalidData(format!(
                "{}: non-positive price on {}",
                market,
                dates.get(pos).map(|d| d.to_string()).unwrap_or_default()
            )));
        }
        let returns: Vec<f64> = prices.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        let dates = dates.into_iter().skip(1).collect();
        Self::new(market, dates, returns)
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn returns(&self) -> &[f64] {
        &self.returns
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Restrict the series to the given calendar (dates must be a subset).
    pub fn aligned_to(&self, calendar: &[NaiveDate]) -> Result<Self, LoaderError> {
        let index: HashMap<NaiveDate, usize> =
            self.dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();
        let mut returns = Vec::with_capacity(calendar.len());
        for date in calendar {
            let idx = index.get(date).ok_or_else(|| {
                LoaderError::InvalidData(format!("{}: no observation on {}", self.market, date))
            })?;
            returns.push(self.returns[*idx]);
        }
        Self::new(self.market.clone(), calendar.to_vec(), returns)
    }
}

/// Exogenous regime variables shared by all markets, one row per date.
///
/// Missing observations are stored as `NaN`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeTable {
    dates: Vec<NaiveDate>,
    names: Vec<String>,
    /// Column-major values, `columns[feature][row]`.
    columns: Vec<Vec<f64>>,
}

impl RegimeTable {
    /// Create a table from column-major values.
    pub fn new(
        dates: Vec<NaiveDate>,
        names: Vec<String>,
        columns: Vec<Vec<f64>>,
    ) -> Result<Self, LoaderError> {
        if names.len() != columns.len() {
            return Err(LoaderError::InvalidData(format!(
                "{} regime names but {} columns",
                names.len(),
                columns.len()
            )));
        }
        if let Some(name) = names
            .iter()
            .zip(columns.iter())
            .find(|(_, c)| c.len() != dates.len())
            .map(|(n, _)| n)
        {
            return Err(LoaderError::InvalidData(format!(
                "regime column {} does not match {} dates",
                name,
                dates.len()
            )));
        }
        if let Some(w) = dates.windows(2).find(|w| w[1] <= w[0]) {
            return Err(LoaderError::InvalidData(format!(
                "regime dates not strictly increasing at {} -> {}",
                w[0], w[1]
            )));
        }
        Ok(Self {
            dates,
            names,
            columns,
        })
    }

    /// A table with no regime variables.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Values of one regime column re-indexed onto `calendar` (`NaN` where absent).
    pub fn aligned_column(&self, name: &str, calendar: &[NaiveDate]) -> Option<Vec<f64>> {
        let col = self.names.iter().position(|n| n == name)?;
        let index: HashMap<NaiveDate, usize> =
            self.dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();
        Some(
            calendar
                .iter()
                .map(|d| {
                    index
                        .get(d)
                        .map(|&i| self.columns[col][i])
                        .unwrap_or(f64::NAN)
                })
                .collect(),
        )
    }
}

/// Everything the core reads from the ingestion collaborator.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub markets: Vec<MarketSeries>,
    pub regimes: RegimeTable,
}

impl Dataset {
    pub fn new(markets: Vec<MarketSeries>, regimes: RegimeTable) -> Self {
        Self { markets, regimes }
    }

    /// Dates observed by every market, in increasing order.
    pub fn common_calendar(&self) -> Vec<NaiveDate> {
        let Some(first) = self.markets.first() else {
            return Vec::new();
        };
        first
            .dates()
            .iter()
            .copied()
            .filter(|d| {
                self.markets[1..]
                    .iter()
                    .all(|m| m.dates().binary_search(d).is_ok())
            })
            .collect()
    }

    pub fn market_names(&self) -> Vec<String> {
        self.markets.iter().map(|m| m.market().to_string()).collect()
    }
}
