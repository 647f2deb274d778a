//! Forecast normalisation and threshold signals.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Which side a high volatility forecast trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignConvention {
    /// Long the market with the lowest forecast, short the highest.
    #[default]
    LongLowVol,
    LongHighVol,
}

impl SignConvention {
    /// Position sign for a normalised forecast score.
    pub fn direction(self, score: f64) -> i8 {
        let sign = if score > 0.0 {
            1
        } else if score < 0.0 {
            -1
        } else {
            0
        };
        match self {
            SignConvention::LongLowVol => -sign,
            SignConvention::LongHighVol => sign,
        }
    }
}

/// Same-day z-scores across markets.
///
/// Markets without a forecast get 0 and are excluded from the moments.
/// Returns `None` on a degenerate day (fewer than two forecasts or a zero
/// cross-sectional deviation), when no market may hold a position.
pub fn cross_sectional_z(forecasts: &[Option<f64>]) -> Option<Vec<f64>> {
    let present: Vec<f64> = forecasts
        .iter()
        .filter_map(|f| f.filter(|v| v.is_finite()))
        .collect();
    if present.len() < 2 {
        return None;
    }

    let n = present.len() as f64;
    let mean = present.iter().sum::<f64>() / n;
    let std = (present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std == 0.0 || !std.is_finite() {
        return None;
    }

    Some(
        forecasts
            .iter()
            .map(|f| match f {
                Some(v) if v.is_finite() => (v - mean) / std,
                _ => 0.0,
            })
            .collect(),
    )
}

/// Trailing z-score of one market's forecasts against its own history.
#[derive(Debug, Clone)]
pub struct RollingZScore {
    window: usize,
    min_obs: usize,
    history: VecDeque<f64>,
}

impl RollingZScore {
    pub fn new(window: usize, min_obs: usize) -> Self {
        Self {
            window: window.max(1),
            min_obs,
            history: VecDeque::with_capacity(window.max(1)),
        }
    }

    /// Score `value` against the previous forecasts, then add it to the history.
    pub fn update(&mut self, value: f64) -> f64 {
        let z = self.score(value);
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(value);
        z
    }

    fn score(&self, value: f64) -> f64 {
        if self.history.len() < self.min_obs.max(2) {
            return 0.0;
        }
        let n = self.history.len() as f64;
        let mean = self.history.iter().sum::<f64>() / n;
        let std = (self.history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if std == 0.0 || !std.is_finite() {
            0.0
        } else {
            (value - mean) / std
        }
    }
}

/// Threshold rule with hysteresis.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdRule {
    pub entry: f64,
    pub exit: f64,
    pub convention: SignConvention,
}

impl ThresholdRule {
    /// Next position given the current one and today's combined score.
    ///
    /// An open position is held while the score still points the same way
    /// and its magnitude stays above the exit threshold.
    pub fn next_position(&self, current: i8, score: f64) -> i8 {
        if !score.is_finite() {
            return 0;
        }
        let direction = self.convention.direction(score);
        if current != 0 && direction == current && score.abs() > self.exit {
            return current;
        }
        if score.abs() > self.entry {
            direction
        } else {
            0
        }
    }
}
