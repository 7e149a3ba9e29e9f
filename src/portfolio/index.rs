//! # Fixed-Weight Index
//!
//! $$
//! I_{t}=\sum_i q_i^{(t-1)}P_{t,i},\qquad q_i^{(t)}=\frac{I_t\,\bar w_i(t)}{P_{t,i}}\ \text{on re-base dates}
//! $$
//!
//! Synthetic benchmark from externally supplied weights, for any number of
//! assets. Re-base dates are the first price date, every scheduled period
//! end, and every date an override takes effect. An override is an explicit
//! map entry, so a zero weight inside it still re-bases the whole index.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use super::drift::DEFAULT_SEED_NAV;
use super::drift::DriftSimulator;
use super::drift::FallbackPolicy;
use super::drift::RebalancePlan;
use super::drift::SimulationOutput;
use super::schedule::schedule_indices;
use super::types::Frequency;
use super::types::WeightVector;
use crate::error::BacktestError;
use crate::error::RebalanceFailure;
use crate::prices::PriceSeries;

/// Builder for a fixed (possibly time-varying) weight index.
#[derive(Clone, Debug)]
pub struct FixedWeightIndexBuilder {
  initial: WeightVector,
  frequency: Option<Frequency>,
  overrides: BTreeMap<NaiveDate, WeightVector>,
  seed_nav: f64,
}

impl FixedWeightIndexBuilder {
  /// Index seeded with `initial` weights and no periodic re-basing.
  pub fn new(initial: WeightVector) -> Self {
    Self {
      initial,
      frequency: None,
      overrides: BTreeMap::new(),
      seed_nav: DEFAULT_SEED_NAV,
    }
  }

  /// Constant weights re-applied at every period end.
  pub fn constant(weights: WeightVector, frequency: Frequency) -> Self {
    Self::new(weights).rebalance_every(frequency)
  }

  /// Re-base to the weights in force at the end of every `frequency` period.
  pub fn rebalance_every(mut self, frequency: Frequency) -> Self {
    self.frequency = Some(frequency);
    self
  }

  /// Switch the target to `weights` from the first price date on or after `date`.
  pub fn override_from(mut self, date: NaiveDate, weights: WeightVector) -> Self {
    self.overrides.insert(date, weights);
    self
  }

  pub fn seed_nav(mut self, seed_nav: f64) -> Self {
    self.seed_nav = seed_nav;
    self
  }

  /// Re-base dates and the weights applied on each.
  pub fn plan(&self, prices: &PriceSeries) -> Result<RebalancePlan, RebalanceFailure> {
    let dates = prices.dates();
    let Some(&first) = dates.first() else {
      return Ok(RebalancePlan::new());
    };

    let n = prices.asset_count();
    let check = |date: NaiveDate, w: &WeightVector| {
      if w.len() == n {
        Ok(())
      } else {
        Err(RebalanceFailure::new(
          date,
          BacktestError::inconsistent(format!("{} index weights for {n} assets", w.len())),
        ))
      }
    };

    check(first, &self.initial)?;
    for (date, w) in &self.overrides {
      check(*date, w)?;
    }

    let scheduled: Vec<usize> = self
      .frequency
      .map(|f| schedule_indices(dates, f))
      .unwrap_or_default();
    let mut scheduled = scheduled.into_iter().peekable();
    let mut pending = self.overrides.iter().peekable();
    let mut target = &self.initial;
    let mut plan = RebalancePlan::new();

    for (i, &date) in dates.iter().enumerate() {
      let mut switched = false;
      while let Some((_, w)) = pending.next_if(|(from, _)| **from <= date) {
        target = w;
        switched = true;
      }

      let period_end = scheduled.next_if_eq(&i).is_some();
      if i == 0 || switched || period_end {
        plan.insert(date, Ok(target.clone()));
      }
    }

    Ok(plan)
  }

  /// Index NAV, units and allocations over `prices`.
  pub fn build(&self, prices: &PriceSeries) -> Result<SimulationOutput, RebalanceFailure> {
    let plan = self.plan(prices)?;
    DriftSimulator::new(self.seed_nav, FallbackPolicy::Fail)
      .simulate(prices, &plan)
      .into_result()
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::portfolio::types::WEIGHT_TOLERANCE;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
  }

  fn w(values: &[f64]) -> WeightVector {
    WeightVector::new(values.to_vec(), WEIGHT_TOLERANCE).unwrap()
  }

  fn two_assets() -> PriceSeries {
    PriceSeries::from_rows(
      ["EQ", "BOND"],
      vec![
        (d(2021, 3, 30), vec![100.0, 100.0]),
        (d(2021, 3, 31), vec![120.0, 100.0]),
        (d(2021, 4, 1), vec![120.0, 110.0]),
        (d(2021, 6, 30), vec![150.0, 110.0]),
        (d(2021, 7, 1), vec![150.0, 121.0]),
      ],
    )
    .unwrap()
  }

  #[test]
  fn quarterly_constant_weights_rebase_at_quarter_end() {
    let prices = two_assets();
    let out = FixedWeightIndexBuilder::constant(w(&[0.6, 0.4]), Frequency::Quarterly)
      .build(&prices)
      .unwrap();

    assert_eq!(
      out.rebalance_dates(),
      &[d(2021, 3, 30), d(2021, 3, 31), d(2021, 6, 30)]
    );

    // seed: 60 EQ units, 40 BOND units
    let nav = out.nav().values();
    assert_abs_diff_eq!(nav[1], 60.0 * 120.0 + 40.0 * 100.0, epsilon = 1e-9);
    // re-based on 03-31, drift until 06-30
    let eq_units = nav[1] * 0.6 / 120.0;
    let bond_units = nav[1] * 0.4 / 100.0;
    assert_abs_diff_eq!(nav[2], eq_units * 120.0 + bond_units * 110.0, epsilon = 1e-9);
    assert_abs_diff_eq!(nav[3], eq_units * 150.0 + bond_units * 110.0, epsilon = 1e-9);
  }

  #[test]
  fn handles_any_number_of_assets() {
    let prices = PriceSeries::from_rows(
      ["A", "B", "C", "D"],
      vec![
        (d(2021, 1, 29), vec![10.0, 20.0, 40.0, 80.0]),
        (d(2021, 2, 1), vec![11.0, 19.0, 44.0, 80.0]),
        (d(2021, 2, 26), vec![12.0, 18.0, 40.0, 88.0]),
        (d(2021, 3, 1), vec![12.0, 20.0, 42.0, 90.0]),
      ],
    )
    .unwrap();
    let out = FixedWeightIndexBuilder::constant(WeightVector::equal(4), Frequency::Monthly)
      .seed_nav(1_000.0)
      .build(&prices)
      .unwrap();

    assert_eq!(out.len(), 4);
    for (i, nav) in out.nav().values().iter().enumerate() {
      assert_abs_diff_eq!(*nav, out.holdings()[i].value(prices.row(i)), epsilon = 1e-9);
    }
  }

  #[test]
  fn zero_weight_override_still_rebases() {
    let prices = two_assets();
    let out = FixedWeightIndexBuilder::new(w(&[0.5, 0.5]))
      .override_from(d(2021, 4, 1), w(&[0.0, 1.0]))
      .build(&prices)
      .unwrap();

    assert_eq!(out.rebalance_dates(), &[d(2021, 3, 30), d(2021, 4, 1)]);
    let units = out.holdings()[2].units();
    assert_abs_diff_eq!(units[0], 0.0);
    assert!(units[1] > 0.0);
    // nothing held in EQ, so its rally does not move the index
    assert_abs_diff_eq!(out.nav().values()[3], out.nav().values()[2], epsilon = 1e-9);
  }

  #[test]
  fn override_between_price_dates_applies_on_next_date() {
    let prices = two_assets();
    let plan = FixedWeightIndexBuilder::new(w(&[0.5, 0.5]))
      .override_from(d(2021, 5, 15), w(&[0.2, 0.8]))
      .plan(&prices)
      .unwrap();

    assert_eq!(plan.get(d(2021, 6, 30)), Some(&Ok(w(&[0.2, 0.8]))));
    assert!(plan.get(d(2021, 4, 1)).is_none());
  }

  #[test]
  fn wrong_weight_length_is_reported() {
    let prices = two_assets();
    let failure = FixedWeightIndexBuilder::new(WeightVector::equal(3))
      .build(&prices)
      .unwrap_err();
    assert!(matches!(failure.source, BacktestError::InconsistentWeights { .. }));
  }
}
