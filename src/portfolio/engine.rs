//! # Backtest Engine
//!
//! $$
//! \mathcal P=\{(d,\ \mathbf w^\*(d)) : d\in\mathcal R\},\qquad
//! \text{NAV}=\text{Drift}(P,\ \mathcal P)
//! $$
//!
//! Two stages. Weights for every rebalance date are solved independently and
//! in parallel into an immutable plan, then the NAV recurrence consumes the
//! plan in date order.

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::drift::DEFAULT_SEED_NAV;
use super::drift::DriftSimulator;
use super::drift::FallbackPolicy;
use super::drift::RebalancePlan;
use super::drift::SimulationReport;
use super::optimizers::MaxSharpeSolver;
use super::optimizers::SolverConfig;
use super::schedule::schedule_indices;
use super::types::Frequency;
use super::types::WeightVector;
use crate::error::BacktestError;
use crate::prices::LookbackPolicy;
use crate::prices::PriceSeries;

/// Backtest settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
  pub frequency: Frequency,
  /// Return observations per lookback window.
  pub lookback_days: usize,
  /// Annual risk-free rate in percent.
  pub risk_free_rate: f64,
  pub seed_nav: f64,
  pub lookback_policy: LookbackPolicy,
  pub fallback: FallbackPolicy,
  pub solver: SolverConfig,
}

impl Default for BacktestConfig {
  fn default() -> Self {
    Self {
      frequency: Frequency::Quarterly,
      lookback_days: 90,
      risk_free_rate: 0.0,
      seed_nav: DEFAULT_SEED_NAV,
      lookback_policy: LookbackPolicy::Truncate,
      fallback: FallbackPolicy::Fail,
      solver: SolverConfig::default(),
    }
  }
}

impl BacktestConfig {
  /// Reject settings no run over `asset_count` assets could satisfy.
  pub fn validate(&self, asset_count: usize) -> Result<(), BacktestError> {
    if asset_count == 0 {
      return Err(BacktestError::invalid("no assets"));
    }
    if self.lookback_days < asset_count {
      return Err(BacktestError::invalid(format!(
        "lookback of {} days is shorter than the {asset_count} assets",
        self.lookback_days
      )));
    }
    if !self.seed_nav.is_finite() || self.seed_nav <= 0.0 {
      return Err(BacktestError::invalid(format!(
        "seed NAV must be positive, got {}",
        self.seed_nav
      )));
    }
    if !self.risk_free_rate.is_finite() {
      return Err(BacktestError::invalid("risk-free rate must be finite"));
    }
    if !(self.solver.tolerance > 0.0)
      || !(self.solver.objective_tolerance >= 0.0)
      || !(self.solver.weight_tolerance >= 0.0)
    {
      return Err(BacktestError::invalid("solver tolerances must be positive"));
    }
    if !(self.solver.trading_days > 0.0) {
      return Err(BacktestError::invalid("trading days per year must be positive"));
    }
    Ok(())
  }
}

/// Schedule, solved plan and simulation of one run.
#[derive(Clone, Debug)]
pub struct BacktestOutcome {
  pub schedule: Vec<NaiveDate>,
  pub plan: RebalancePlan,
  pub report: SimulationReport,
}

impl BacktestOutcome {
  pub fn is_complete(&self) -> bool {
    self.report.is_complete()
  }
}

/// Periodic maximum-Sharpe rebalancing backtest.
#[derive(Clone, Debug, Default)]
pub struct Backtester {
  config: BacktestConfig,
}

impl Backtester {
  pub fn new(config: BacktestConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &BacktestConfig {
    &self.config
  }

  /// Solve every rebalance date, then drift through the whole series.
  ///
  /// Only invalid configuration is an `Err`; a failing rebalance date halts
  /// the simulation and is reported in [`SimulationReport::failure`].
  pub fn run(&self, prices: &PriceSeries) -> Result<BacktestOutcome, BacktestError> {
    self.config.validate(prices.asset_count())?;

    let plan = self.solve_plan(prices);
    let schedule = plan.dates().collect();
    let report = self.simulate(prices, &plan);

    Ok(BacktestOutcome {
      schedule,
      plan,
      report,
    })
  }

  /// Stage 1: target weights for every rebalance date, solved in parallel.
  pub fn solve_plan(&self, prices: &PriceSeries) -> RebalancePlan {
    let indices = schedule_indices(prices.dates(), self.config.frequency);
    info!(
      rebalances = indices.len(),
      frequency = ?self.config.frequency,
      lookback = self.config.lookback_days,
      "solving rebalance weights"
    );

    let solver = MaxSharpeSolver::new(self.config.solver.clone());
    let plan: RebalancePlan = indices
      .into_par_iter()
      .map(|i| (prices.dates()[i], self.solve_at(&solver, prices, i)))
      .collect::<Vec<_>>()
      .into_iter()
      .collect();

    for failure in plan.failures() {
      warn!(%failure, "no weights for rebalance date");
    }
    plan
  }

  /// Stage 2: NAV recurrence over `plan`.
  pub fn simulate(&self, prices: &PriceSeries, plan: &RebalancePlan) -> SimulationReport {
    DriftSimulator::new(self.config.seed_nav, self.config.fallback).simulate(prices, plan)
  }

  fn solve_at(
    &self,
    solver: &MaxSharpeSolver,
    prices: &PriceSeries,
    index: usize,
  ) -> Result<WeightVector, BacktestError> {
    let window = prices.window_ending_at(
      index,
      self.config.lookback_days,
      self.config.lookback_policy,
    )?;
    let result = solver.solve(&window, self.config.risk_free_rate)?;
    debug!(
      date = %prices.dates()[index],
      weights = ?result.weights.to_vec(),
      sharpe = result.sharpe,
      "rebalance weights solved"
    );
    Ok(result.weights)
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use chrono::Days;
  use rand::Rng;
  use rand::SeedableRng;
  use rand::rngs::StdRng;

  use super::*;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
  }

  /// Three assets over 200 calendar days from 2021-01-04 with smooth,
  /// non-collinear return paths.
  fn prices() -> PriceSeries {
    let start = d(2021, 1, 4);
    let mut level = [100.0, 50.0, 20.0];
    let rows = (0..200)
      .map(|i| {
        if i > 0 {
          let t = i as f64;
          level[0] *= 1.0 + 0.001 + 0.010 * (0.7 * t).sin();
          level[1] *= 1.0 + 0.0005 + 0.008 * (1.3 * t).cos();
          level[2] *= 1.0 + 0.0002 + 0.005 * (2.1 * t + 1.0).sin();
        }
        (start + Days::new(i), level.to_vec())
      })
      .collect();
    PriceSeries::from_rows(["EQ", "BOND", "GOLD"], rows).unwrap()
  }

  /// `assets` random walks over `days` calendar days sharing a market factor.
  fn noisy_prices(assets: usize, days: u64, seed: u64) -> PriceSeries {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = d(2015, 1, 1);
    let mut level = vec![100.0; assets];
    let rows = (0..days)
      .map(|i| {
        if i > 0 {
          let market: f64 = rng.gen_range(-0.012..0.012);
          for (k, p) in level.iter_mut().enumerate() {
            let beta = 0.4 + 0.15 * k as f64;
            let drift = 0.0001 * (k % 4) as f64;
            *p *= 1.0 + drift + beta * market + rng.gen_range(-0.02..0.02);
          }
        }
        (start + Days::new(i), level.clone())
      })
      .collect();
    PriceSeries::from_rows((0..assets).map(|k| format!("S{k}")), rows).unwrap()
  }

  fn config(lookback_days: usize) -> BacktestConfig {
    BacktestConfig {
      lookback_days,
      ..BacktestConfig::default()
    }
  }

  #[test]
  fn quarterly_run_rebases_on_quarter_ends() {
    let prices = prices();
    let outcome = Backtester::new(config(30)).run(&prices).unwrap();

    assert_eq!(outcome.schedule, vec![d(2021, 3, 31), d(2021, 6, 30)]);
    assert!(outcome.is_complete());

    let output = outcome.report.output;
    assert_eq!(output.dates().first(), Some(&d(2021, 3, 31)));
    assert_eq!(output.dates().last(), prices.dates().last());
    assert_eq!(output.rebalance_dates(), outcome.schedule.as_slice());
    assert_abs_diff_eq!(output.nav().values()[0], DEFAULT_SEED_NAV, epsilon = 1e-9);

    // NAV is continuous across the second rebalance
    let i = prices.index_of(d(2021, 6, 30)).unwrap();
    let j = output.dates().iter().position(|x| *x == d(2021, 6, 30)).unwrap();
    let before = output.holdings()[j - 1].value(prices.row(i));
    let after = output.holdings()[j].value(prices.row(i));
    assert_abs_diff_eq!(before, after, epsilon = 1e-6);
  }

  #[test]
  fn rebalance_units_follow_solved_weights() {
    let prices = prices();
    let outcome = Backtester::new(config(30)).run(&prices).unwrap();
    let output = &outcome.report.output;

    let date = d(2021, 6, 30);
    let weights = outcome.plan.get(date).unwrap().as_ref().unwrap();
    let i = prices.index_of(date).unwrap();
    let j = output.dates().iter().position(|x| *x == date).unwrap();
    let row = prices.row(i);
    let drifted_nav = output.holdings()[j - 1].value(row);

    assert_eq!(&output.allocations()[j], weights);
    for k in 0..prices.asset_count() {
      let expected = drifted_nav * weights.as_array()[k] / row[k];
      assert_abs_diff_eq!(output.holdings()[j].units()[k], expected, epsilon = 1e-9);
    }
  }

  #[test]
  fn ten_asset_monthly_runs_complete() {
    let cfg = BacktestConfig {
      frequency: Frequency::Monthly,
      ..config(90)
    };
    for seed in 0..4 {
      let prices = noisy_prices(10, 800, seed);
      let outcome = Backtester::new(cfg.clone()).run(&prices).unwrap();

      assert!(outcome.is_complete(), "seed {seed}: {:?}", outcome.report.failure);
      assert_eq!(outcome.plan.failures().count(), 0);
      assert_eq!(outcome.report.output.dates().last(), prices.dates().last());
    }
  }

  #[test]
  fn plan_weights_are_feasible() {
    let prices = prices();
    let plan = Backtester::new(config(30)).solve_plan(&prices);
    assert_eq!(plan.len(), 2);
    for (_, entry) in plan.iter() {
      let w = entry.as_ref().unwrap().as_array();
      assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-6);
      assert!(w.iter().all(|&x| (-1e-9..=1.0 + 1e-9).contains(&x)));
    }
  }

  #[test]
  fn strict_lookback_failure_is_tagged_with_its_date() {
    let prices = prices();
    let cfg = BacktestConfig {
      lookback_policy: LookbackPolicy::Strict,
      ..config(100)
    };
    let outcome = Backtester::new(cfg).run(&prices).unwrap();

    let failure = outcome.report.failure.clone().unwrap();
    assert_eq!(failure.date, d(2021, 3, 31));
    assert_eq!(
      failure.source,
      BacktestError::InsufficientHistory {
        required: 101,
        actual: 87
      }
    );
    assert!(outcome.report.output.is_empty());
    assert!(outcome.plan.get(d(2021, 6, 30)).unwrap().is_ok());
  }

  #[test]
  fn truncated_lookback_uses_available_history() {
    let prices = prices();
    let outcome = Backtester::new(config(100)).run(&prices).unwrap();
    assert!(outcome.is_complete());
  }

  #[test]
  fn equal_weight_fallback_completes_the_run() {
    let prices = prices();
    let cfg = BacktestConfig {
      lookback_policy: LookbackPolicy::Strict,
      fallback: FallbackPolicy::EqualWeight,
      ..config(100)
    };
    let outcome = Backtester::new(cfg).run(&prices).unwrap();

    assert!(outcome.is_complete());
    let first = &outcome.report.output.allocations()[0];
    assert_eq!(first, &WeightVector::equal(3));
  }

  #[test]
  fn invalid_config_is_rejected_up_front() {
    let prices = prices();
    assert!(matches!(
      Backtester::new(config(2)).run(&prices),
      Err(BacktestError::InvalidInput(_))
    ));
    let cfg = BacktestConfig {
      seed_nav: 0.0,
      ..config(30)
    };
    assert!(cfg.validate(3).is_err());
  }

  #[test]
  fn config_reads_from_toml() {
    let cfg: BacktestConfig = toml::from_str(
      r#"
        frequency = "monthly"
        lookback_days = 60
        risk_free_rate = 1.5
        fallback = "carry-forward"

        [solver]
        max_iters = 500
      "#,
    )
    .unwrap();

    assert_eq!(cfg.frequency, Frequency::Monthly);
    assert_eq!(cfg.lookback_days, 60);
    assert_eq!(cfg.fallback, FallbackPolicy::CarryForward);
    assert_eq!(cfg.lookback_policy, LookbackPolicy::Truncate);
    assert_eq!(cfg.solver.max_iters, 500);
    assert_abs_diff_eq!(cfg.seed_nav, DEFAULT_SEED_NAV);
  }
}
