//! Rank statistics: average ranks, Spearman IC and IC summaries.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::statistics::Statistics;

/// Minimum number of pairs for a meaningful correlation.
pub const MIN_PAIRS: usize = 3;

/// Ranks starting at 1, ties share their average rank.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && values[order[j]] == values[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j + 1) as f64 / 2.0;
        for &idx in &order[i..j] {
            ranks[idx] = avg_rank;
        }
        i = j;
    }
    ranks
}

/// Pearson correlation; `None` for short or constant inputs.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

/// Spearman rank correlation.
///
/// Pairs with a non-finite member are dropped first; fewer than
/// [`MIN_PAIRS`] usable pairs yields `None`.
pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() {
        return None;
    }
    let (xs, ys): (Vec<f64>, Vec<f64>) = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .unzip();
    if xs.len() < MIN_PAIRS {
        return None;
    }
    pearson(&average_ranks(&xs), &average_ranks(&ys))
}

/// Two-sided p-value of a correlation under the Student-t approximation.
pub fn correlation_p_value(r: f64, n: usize) -> Option<f64> {
    if n < MIN_PAIRS {
        return None;
    }
    let df = (n - 2) as f64;
    if r.abs() >= 1.0 {
        return Some(0.0);
    }
    let t = r * (df / (1.0 - r * r)).sqrt();
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
}

/// Summary of a series of per-fold ICs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IcStats {
    /// Mean IC
    pub mean: f64,
    /// Sample standard deviation of IC
    pub std: f64,
    /// Information ratio (mean / std)
    pub ir: f64,
    /// Fraction of positive ICs
    pub hit_rate: f64,
    /// t-statistic of the mean
    pub t_stat: f64,
    pub count: usize,
}

impl IcStats {
    pub fn from_series(ics: &[f64]) -> Self {
        if ics.is_empty() {
            return Self::default();
        }
        let n = ics.len() as f64;
        let mean = ics.mean();
        let std = if ics.len() > 1 { ics.std_dev() } else { 0.0 };
        let ir = if std > 0.0 { mean / std } else { 0.0 };
        let hit_rate = ics.iter().filter(|&&x| x > 0.0).count() as f64 / n;
        let t_stat = if std > 0.0 { mean / (std / n.sqrt()) } else { 0.0 };

        Self {
            mean,
            std,
            ir,
            hit_rate,
            t_stat,
            count: ics.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_average_ranks_with_ties() {
        let ranks = average_ranks(&[3.0, 1.0, 4.0, 1.0, 5.0]);
        assert_eq!(ranks, vec![3.0, 1.5, 4.0, 1.5, 5.0]);
    }

    #[test]
    fn test_spearman_rank_preserving_is_one() {
        let x: Vec<f64> = (0..200).map(|i| (i as f64 * 0.37).sin() + i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| v.powi(3) + 7.0).collect();
        assert_relative_eq!(spearman(&x, &y).unwrap(), 1.0, epsilon = 1e-9);

        let inverse: Vec<f64> = x.iter().map(|v| -v).collect();
        assert_relative_eq!(spearman(&x, &inverse).unwrap(), -1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_spearman_of_shuffled_is_near_zero() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let x: Vec<f64> = (0..2000).map(|i| i as f64).collect();
        let mut y = x.clone();
        y.shuffle(&mut rng);
        // 4 standard errors at n = 2000
        assert!(spearman(&x, &y).unwrap().abs() < 4.0 / (2000f64).sqrt());
    }

    #[test]
    fn test_spearman_drops_non_finite_and_short_inputs() {
        assert!(spearman(&[1.0, 2.0], &[1.0, 2.0]).is_none());
        let x = [1.0, f64::NAN, 2.0, 3.0, 4.0];
        let y = [1.0, 9.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(spearman(&x, &y).unwrap(), 1.0, epsilon = 1e-12);
        assert!(spearman(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_none());
    }

    #[test]
    fn test_correlation_p_value() {
        let strong = correlation_p_value(0.8, 100).unwrap();
        let weak = correlation_p_value(0.01, 100).unwrap();
        assert!(strong < 1e-6);
        assert!(weak > 0.5);
        assert!(correlation_p_value(0.5, 2).is_none());
    }

    #[test]
    fn test_ic_stats() {
        let stats = IcStats::from_series(&[0.03, 0.02, -0.01, 0.04, 0.02, 0.03, 0.01, 0.02]);
        assert!(stats.mean > 0.01 && stats.mean < 0.03);
        assert!(stats.ir > 0.0);
        assert_relative_eq!(stats.hit_rate, 7.0 / 8.0);
        assert_eq!(stats.count, 8);
        assert_eq!(IcStats::from_series(&[]).count, 0);
    }
}
