//! Transaction cost model.
//!
//! Cost is linear in turnover: moving from short to long costs twice the
//! rate of opening a position from flat.

use serde::{Deserialize, Serialize};

/// Cost charged for one position change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cost {
    pub turnover: f64,
    pub rate: f64,
    pub total: f64,
}

impl Cost {
    pub fn calculate(turnover: f64, rate: f64) -> Self {
        Self {
            turnover,
            rate,
            total: rate * turnover.abs(),
        }
    }
}

/// Configurable cost model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    /// Cost per unit of turnover, in return units.
    pub cost_rate: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self { cost_rate: 0.0005 } // 5 bp per unit of turnover
    }
}

impl CostModel {
    pub fn new(cost_rate: f64) -> Self {
        Self { cost_rate }
    }

    /// Create a zero-cost model.
    pub fn zero() -> Self {
        Self { cost_rate: 0.0 }
    }

    /// Cost of moving from `previous` to `current` position.
    pub fn calculate(&self, previous: i8, current: i8) -> Cost {
        let turnover = (current as f64 - previous as f64).abs();
        Cost::calculate(turnover, self.cost_rate)
    }
}
