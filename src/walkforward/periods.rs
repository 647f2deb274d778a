//! Walk-forward window generation.
//!
//! Generates the two granularities of leakage-safe windows over a trading
//! calendar:
//! - filter targets: one forecast date at a time, each paired with its
//!   trailing estimation window
//! - forecast windows: rolling fixed-length train slice followed by a
//!   fixed-length test slice, advancing by the test length
//!
//! All ranges are half-open index ranges into the calendar.

use std::ops::Range;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error(
        "Insufficient history for {granularity} windows: {available} observations, {required} required"
    )]
    InsufficientHistory {
        granularity: &'static str,
        available: usize,
        required: usize,
    },
}

/// Configuration for the per-date volatility filter schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterScheduleConfig {
    /// Trailing estimation window length (observations).
    pub window: usize,
    /// Minimum trailing observations before the first target is emitted.
    pub min_obs: usize,
}

impl Default for FilterScheduleConfig {
    fn default() -> Self {
        Self {
            window: 500,
            min_obs: 300,
        }
    }
}

/// Configuration for the forecaster's rolling train/test windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastScheduleConfig {
    /// Training slice length (observations).
    pub train_len: usize,
    /// Test slice length, also the step between folds.
    pub test_len: usize,
}

impl Default for ForecastScheduleConfig {
    fn default() -> Self {
        Self {
            train_len: 280,
            test_len: 21,
        }
    }
}

/// A single filter target: forecast date `index` from returns in `history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterTarget {
    /// Calendar index of the forecast date.
    pub index: usize,
    /// Forecast date.
    pub date: NaiveDate,
    /// First calendar index of the trailing window.
    pub history_start: usize,
}

impl FilterTarget {
    /// Trailing window indices; always ends strictly before the target.
    pub fn history(&self) -> Range<usize> {
        self.history_start..self.index
    }

    pub fn history_len(&self) -> usize {
        self.index - self.history_start
    }
}

/// A single forecast fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastWindow {
    /// Fold number (0-indexed, increasing with time).
    pub fold_id: usize,
    /// Training indices.
    pub train: Range<usize>,
    /// Test indices.
    pub test: Range<usize>,
    /// First training date.
    pub train_start: NaiveDate,
    /// Last training date.
    pub train_end: NaiveDate,
    /// First test date.
    pub test_start: NaiveDate,
    /// Last test date.
    pub test_end: NaiveDate,
}

impl ForecastWindow {
    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn test_len(&self) -> usize {
        self.test.len()
    }

    /// Every index the fold touches, train then test.
    pub fn span(&self) -> Range<usize> {
        self.train.start..self.test.end
    }
}

/// Generator for both window granularities over one calendar.
#[derive(Debug, Clone)]
pub struct WindowScheduler<'a> {
    calendar: &'a [NaiveDate],
    filter: FilterScheduleConfig,
    forecast: ForecastScheduleConfig,
}

impl<'a> WindowScheduler<'a> {
    /// Create a scheduler over an ordered calendar.
    pub fn new(
        calendar: &'a [NaiveDate],
        filter: FilterScheduleConfig,
        forecast: ForecastScheduleConfig,
    ) -> Self {
        Self {
            calendar,
            filter,
            forecast,
        }
    }

    /// Calendar index where the forecast horizon starts.
    ///
    /// Residuals before this index exist (from `min_obs` on) but only serve
    /// as lagged history for features.
    pub fn forecast_origin(&self) -> usize {
        self.filter.window.max(self.filter.min_obs)
    }

    /// Lazy sequence of filter targets.
    pub fn filter_targets(&self) -> Result<FilterTargets<'a>, ScheduleError> {
        let n = self.calendar.len();
        let first = self.filter.min_obs.max(1);
        if n <= first {
            return Err(ScheduleError::InsufficientHistory {
                granularity: "filter",
                available: n,
                required: first + 1,
            });
        }
        Ok(FilterTargets {
            calendar: self.calendar,
            window: self.filter.window,
            next: first,
        })
    }

    /// Lazy sequence of rolling forecast windows.
    pub fn forecast_windows(&self) -> Result<ForecastWindows<'a>, ScheduleError> {
        let required = self.forecast_origin() + self.forecast.train_len + self.forecast.test_len;
        if self.calendar.len() < required || self.forecast.test_len == 0 {
            return Err(ScheduleError::InsufficientHistory {
                granularity: "forecast",
                available: self.calendar.len(),
                required,
            });
        }
        Ok(ForecastWindows {
            calendar: self.calendar,
            train_len: self.forecast.train_len,
            test_len: self.forecast.test_len,
            next_train_start: self.forecast_origin(),
            fold_id: 0,
        })
    }

    /// Number of forecast folds the calendar supports.
    pub fn expected_folds(&self) -> usize {
        let used = self.forecast_origin() + self.forecast.train_len;
        if self.calendar.len() < used || self.forecast.test_len == 0 {
            return 0;
        }
        (self.calendar.len() - used) / self.forecast.test_len
    }
}

/// Iterator over filter targets.
#[derive(Debug, Clone)]
pub struct FilterTargets<'a> {
    calendar: &'a [NaiveDate],
    window: usize,
    next: usize,
}

impl Iterator for FilterTargets<'_> {
    type Item = FilterTarget;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.calendar.len() {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(FilterTarget {
            index,
            date: self.calendar[index],
            history_start: index.saturating_sub(self.window),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.calendar.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FilterTargets<'_> {}

/// Iterator over forecast windows.
#[derive(Debug, Clone)]
pub struct ForecastWindows<'a> {
    calendar: &'a [NaiveDate],
    train_len: usize,
    test_len: usize,
    next_train_start: usize,
    fold_id: usize,
}

impl Iterator for ForecastWindows<'_> {
    type Item = ForecastWindow;

    fn next(&mut self) -> Option<Self::Item> {
        let train = self.next_train_start..self.next_train_start + self.train_len;
        let test = train.end..train.end + self.test_len;
        if test.end > self.calendar.len() || train.is_empty() {
            return None;
        }

        let window = ForecastWindow {
            fold_id: self.fold_id,
            train_start: self.calendar[train.start],
            train_end: self.calendar[train.end - 1],
            test_start: self.calendar[test.start],
            test_end: self.calendar[test.end - 1],
            train,
            test,
        };

        self.fold_id += 1;
        self.next_train_start += self.test_len;
        Some(window)
    }
}
