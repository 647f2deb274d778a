//! Full pipeline on a synthetic 1000-day, two-market panel.

use powervol_backtest::synthetic::{SyntheticConfig, SyntheticGenerator};
use powervol_backtest::{EngineConfig, Pipeline, RunReport};

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    // Same schedule as the defaults; parameters re-estimated every test block
    config.filter.refit_every = 21;
    config.validation.permutation_trials = 500;
    config
}

fn run(noise: bool, seed: u64) -> RunReport {
    let dataset = SyntheticGenerator::new(SyntheticConfig {
        days: 1000,
        markets: vec!["DE".to_string(), "FR".to_string()],
        seed,
        noise,
        ..Default::default()
    })
    .generate()
    .unwrap();

    let config = config();
    Pipeline::new(&config).unwrap().run(&dataset).unwrap()
}

#[test]
fn test_walk_forward_end_to_end() {
    let signal = run(false, 2024);

    // floor((1000 - 500 - 280) / 21)
    assert_eq!(signal.expected_folds, 10);
    assert_eq!(signal.folds.len(), 10);
    assert!(signal.failed_folds.is_empty());
    assert_eq!(signal.forecasts.len(), 10 * 21 * 2);

    for pair in signal.folds.windows(2) {
        let (a, b) = (&pair[0].window, &pair[1].window);
        assert!(a.train_end < a.test_start);
        assert_eq!(a.test.end, b.test.start);
        assert_eq!(a.train.len(), 280);
    }
    for record in &signal.forecasts {
        let fold = &signal.folds[record.fold_id].window;
        assert!(record.date >= fold.test_start && record.date <= fold.test_end);
    }

    let pooled = signal.validation.pooled().unwrap();
    let signal_ic = pooled.spearman_ic.unwrap();
    assert!(signal_ic >= 0.5, "signal IC {signal_ic}");
    assert!(pooled.permutation_p_value.unwrap() < 0.01);
    assert!(signal.validation.market("DE").unwrap().spearman_ic.unwrap() > 0.4);

    // Pooled over independent panels, the no-signal IC sits near zero
    let noise_ics: Vec<f64> = [2024, 2025, 2026]
        .into_iter()
        .map(|seed| {
            let noise = run(true, seed);
            assert_eq!(noise.folds.len(), 10);
            noise.validation.pooled().unwrap().spearman_ic.unwrap()
        })
        .collect();
    let noise_ic = noise_ics.iter().sum::<f64>() / noise_ics.len() as f64;
    assert!(noise_ic.abs() <= 0.1, "noise IC {noise_ic} from {noise_ics:?}");
    assert!(signal_ic > noise_ic + 0.4);

    // Trading consumes the same stream: one row per market per test date
    assert_eq!(signal.trading.trades.len(), signal.forecasts.len());
    assert_eq!(signal.trading.daily.len(), 10 * 21);
    assert!(signal.trading.metrics.avg_daily_turnover >= 0.0);
}
