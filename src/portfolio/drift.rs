//! # Drift Simulation
//!
//! $$
//! \text{NAV}_t=\sum_i q_{i}^{(t-1)}P_{t,i},\qquad
//! q_i^{(t)}=\begin{cases}\dfrac{\text{NAV}_t\,w_i^{(t)}}{P_{t,i}} & t\in\mathcal R\\[4pt] q_i^{(t-1)} & t\notin\mathcal R\end{cases}
//! $$
//!
//! Buy-and-hold drift between rebalances, re-based on each rebalance date.
//! Runs strictly in date order as a fold over an immutable per-step state.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use ndarray::ArrayView1;
use serde::Deserialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::types::HoldingsState;
use super::types::NavSeries;
use super::types::WeightVector;
use crate::error::BacktestError;
use crate::error::RebalanceFailure;
use crate::prices::PriceSeries;

/// Default starting NAV.
pub const DEFAULT_SEED_NAV: f64 = 10_000.0;

/// What to do when a scheduled rebalance has no usable weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
  /// Stop and report the failing date.
  #[default]
  Fail,
  /// Rebalance to `1/n` instead.
  EqualWeight,
  /// Re-apply the previous target weights.
  CarryForward,
}

impl std::str::FromStr for FallbackPolicy {
  type Err = BacktestError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "fail" => Ok(Self::Fail),
      "equal" | "equal-weight" | "equalweight" => Ok(Self::EqualWeight),
      "carry" | "carry-forward" | "carryforward" => Ok(Self::CarryForward),
      other => Err(BacktestError::invalid(format!(
        "unknown fallback policy `{other}`"
      ))),
    }
  }
}

/// Immutable rebalance date -> weights mapping handed from solving to drift.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RebalancePlan {
  entries: BTreeMap<NaiveDate, Result<WeightVector, BacktestError>>,
}

impl RebalancePlan {
  pub fn new() -> Self {
    Self::default()
  }

  /// Plan where every date carries a valid target.
  pub fn from_targets(targets: impl IntoIterator<Item = (NaiveDate, WeightVector)>) -> Self {
    targets.into_iter().map(|(d, w)| (d, Ok(w))).collect()
  }

  pub fn insert(&mut self, date: NaiveDate, entry: Result<WeightVector, BacktestError>) {
    self.entries.insert(date, entry);
  }

  pub fn get(&self, date: NaiveDate) -> Option<&Result<WeightVector, BacktestError>> {
    self.entries.get(&date)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
    self.entries.keys().copied()
  }

  pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, &Result<WeightVector, BacktestError>)> {
    self.entries.iter().map(|(d, e)| (*d, e))
  }

  /// Every failed entry, tagged with its date, in date order.
  pub fn failures(&self) -> impl Iterator<Item = RebalanceFailure> + '_ {
    self
      .entries
      .iter()
      .filter_map(|(d, e)| e.as_ref().err().map(|err| RebalanceFailure::new(*d, err.clone())))
  }
}

impl FromIterator<(NaiveDate, Result<WeightVector, BacktestError>)> for RebalancePlan {
  fn from_iter<I: IntoIterator<Item = (NaiveDate, Result<WeightVector, BacktestError>)>>(
    iter: I,
  ) -> Self {
    Self {
      entries: iter.into_iter().collect(),
    }
  }
}

/// State carried from one date to the next.
#[derive(Clone, Debug)]
struct DriftStep {
  nav: f64,
  holdings: HoldingsState,
  target: WeightVector,
  rebalanced: bool,
}

/// NAV, holdings and allocation paths of one simulation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimulationOutput {
  assets: Vec<String>,
  nav: NavSeries,
  holdings: Vec<HoldingsState>,
  allocations: Vec<WeightVector>,
  drifted: Vec<Vec<f64>>,
  rebalance_dates: Vec<NaiveDate>,
}

impl SimulationOutput {
  fn new(assets: &[String]) -> Self {
    Self {
      assets: assets.to_vec(),
      ..Self::default()
    }
  }

  fn record(&mut self, date: NaiveDate, step: &DriftStep, prices: ArrayView1<'_, f64>) {
    self.nav.push(date, step.nav);
    self.holdings.push(step.holdings.clone());
    self.allocations.push(step.target.clone());
    self.drifted.push(step.holdings.value_weights(prices));
    if step.rebalanced {
      self.rebalance_dates.push(date);
    }
  }

  pub fn assets(&self) -> &[String] {
    &self.assets
  }

  pub fn dates(&self) -> &[NaiveDate] {
    self.nav.dates()
  }

  pub fn nav(&self) -> &NavSeries {
    &self.nav
  }

  /// Units in force after each date's rebalance (if any).
  pub fn holdings(&self) -> &[HoldingsState] {
    &self.holdings
  }

  /// Target weights forward-filled between rebalance dates.
  pub fn allocations(&self) -> &[WeightVector] {
    &self.allocations
  }

  /// Actual value weights after drift.
  pub fn drifted_allocations(&self) -> &[Vec<f64>] {
    &self.drifted
  }

  /// Dates on which holdings were re-based, including the seed date.
  pub fn rebalance_dates(&self) -> &[NaiveDate] {
    &self.rebalance_dates
  }

  pub fn len(&self) -> usize {
    self.nav.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nav.is_empty()
  }
}

/// Output plus the first failure, if the run stopped early.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationReport {
  pub output: SimulationOutput,
  pub failure: Option<RebalanceFailure>,
}

impl SimulationReport {
  pub fn is_complete(&self) -> bool {
    self.failure.is_none()
  }

  /// Full output, or the first failing date and reason.
  pub fn into_result(self) -> Result<SimulationOutput, RebalanceFailure> {
    match self.failure {
      None => Ok(self.output),
      Some(failure) => Err(failure),
    }
  }
}

/// Sequential NAV recurrence over a price matrix and a rebalance plan.
#[derive(Clone, Copy, Debug)]
pub struct DriftSimulator {
  seed_nav: f64,
  fallback: FallbackPolicy,
}

impl Default for DriftSimulator {
  fn default() -> Self {
    Self {
      seed_nav: DEFAULT_SEED_NAV,
      fallback: FallbackPolicy::Fail,
    }
  }
}

impl DriftSimulator {
  pub fn new(seed_nav: f64, fallback: FallbackPolicy) -> Self {
    Self { seed_nav, fallback }
  }

  pub fn seed_nav(&self) -> f64 {
    self.seed_nav
  }

  pub fn fallback(&self) -> FallbackPolicy {
    self.fallback
  }

  /// Run the recurrence. Output starts at the first date with usable weights.
  pub fn simulate(&self, prices: &PriceSeries, plan: &RebalancePlan) -> SimulationReport {
    let empty = SimulationOutput::new(prices.assets());

    if !self.seed_nav.is_finite() || self.seed_nav <= 0.0 {
      let date = prices.dates().first().copied().unwrap_or(NaiveDate::MIN);
      return SimulationReport {
        output: empty,
        failure: Some(RebalanceFailure::new(
          date,
          BacktestError::invalid(format!("seed NAV must be positive, got {}", self.seed_nav)),
        )),
      };
    }

    if let Some(date) = plan.dates().find(|d| prices.index_of(*d).is_none()) {
      return SimulationReport {
        output: empty,
        failure: Some(RebalanceFailure::new(
          date,
          BacktestError::invalid("rebalance date is not a price date"),
        )),
      };
    }

    let folded = prices.dates().iter().enumerate().try_fold(
      (empty, None::<DriftStep>),
      |(mut output, prev), (i, &date)| {
        let row = prices.row(i);
        match self.advance(prev.as_ref(), row, plan.get(date)) {
          Ok(Some(step)) => {
            if step.rebalanced {
              debug!(%date, nav = step.nav, "holdings re-based");
            }
            output.record(date, &step, row);
            Ok((output, Some(step)))
          }
          Ok(None) => Ok((output, prev)),
          Err(source) => Err((output, RebalanceFailure::new(date, source))),
        }
      },
    );

    match folded {
      Ok((output, _)) => {
        info!(
          days = output.len(),
          rebalances = output.rebalance_dates().len(),
          final_nav = output.nav().last().map(|(_, v)| v),
          "drift simulation complete"
        );
        SimulationReport {
          output,
          failure: None,
        }
      }
      Err((output, failure)) => {
        warn!(%failure, days = output.len(), "drift simulation halted");
        SimulationReport {
          output,
          failure: Some(failure),
        }
      }
    }
  }

  /// One step of the recurrence. `Ok(None)` means "not yet seeded".
  fn advance(
    &self,
    prev: Option<&DriftStep>,
    row: ArrayView1<'_, f64>,
    entry: Option<&Result<WeightVector, BacktestError>>,
  ) -> Result<Option<DriftStep>, BacktestError> {
    let target = match entry {
      None => None,
      Some(Ok(w)) => Some(w.clone()),
      Some(Err(err)) => Some(self.fall_back(prev, err, row.len())?),
    };

    if let Some(w) = &target {
      if w.len() != row.len() {
        return Err(BacktestError::inconsistent(format!(
          "{} weights for {} assets",
          w.len(),
          row.len()
        )));
      }
    }

    let step = match (prev, target) {
      (None, None) => return Ok(None),
      (None, Some(target)) => DriftStep {
        nav: self.seed_nav,
        holdings: HoldingsState::rebase(self.seed_nav, &target, row),
        target,
        rebalanced: true,
      },
      (Some(prev), None) => DriftStep {
        nav: prev.holdings.value(row),
        holdings: prev.holdings.clone(),
        target: prev.target.clone(),
        rebalanced: false,
      },
      (Some(prev), Some(target)) => {
        let nav = prev.holdings.value(row);
        DriftStep {
          nav,
          holdings: HoldingsState::rebase(nav, &target, row),
          target,
          rebalanced: true,
        }
      }
    };

    Ok(Some(step))
  }

  fn fall_back(
    &self,
    prev: Option<&DriftStep>,
    err: &BacktestError,
    asset_count: usize,
  ) -> Result<WeightVector, BacktestError> {
    let weights = match (self.fallback, prev) {
      (FallbackPolicy::Fail, _) => None,
      (FallbackPolicy::EqualWeight, _) => Some(WeightVector::equal(asset_count)),
      (FallbackPolicy::CarryForward, Some(prev)) => Some(prev.target.clone()),
      (FallbackPolicy::CarryForward, None) => None,
    };

    match weights {
      Some(w) => {
        warn!(error = %err, policy = ?self.fallback, "using fallback weights");
        Ok(w)
      }
      None => Err(err.clone()),
    }
  }
}
