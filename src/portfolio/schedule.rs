//! # Rebalance Schedule
//!
//! $$
//! \mathcal R=\{d_i : \kappa(d_i)\neq\kappa(d_{i+1})\}
//! $$
//!
//! A date is a rebalance date when it is the last observed date of its
//! calendar period, i.e. the next date falls into a different period.

use chrono::NaiveDate;

use super::types::Frequency;

/// Row indices of the rebalance dates in `dates`.
pub fn schedule_indices(dates: &[NaiveDate], frequency: Frequency) -> Vec<usize> {
  dates
    .windows(2)
    .enumerate()
    .filter(|(_, pair)| frequency.period_key(pair[0]) != frequency.period_key(pair[1]))
    .map(|(i, _)| i)
    .collect()
}

/// Rebalance dates in `dates` under `frequency`.
pub fn schedule_dates(dates: &[NaiveDate], frequency: Frequency) -> Vec<NaiveDate> {
  schedule_indices(dates, frequency)
    .into_iter()
    .map(|i| dates[i])
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
  }

  #[test]
  fn monthly_picks_last_trading_day_of_each_month() {
    let dates = vec![
      d(2021, 1, 28),
      d(2021, 1, 29),
      d(2021, 2, 1),
      d(2021, 2, 26),
      d(2021, 3, 1),
      d(2021, 3, 2),
    ];
    assert_eq!(
      schedule_dates(&dates, Frequency::Monthly),
      vec![d(2021, 1, 29), d(2021, 2, 26)]
    );
  }

  #[test]
  fn quarterly_and_yearly_boundaries() {
    let dates = vec![
      d(2020, 12, 30),
      d(2020, 12, 31),
      d(2021, 1, 4),
      d(2021, 3, 31),
      d(2021, 4, 1),
    ];
    assert_eq!(
      schedule_dates(&dates, Frequency::Quarterly),
      vec![d(2020, 12, 31), d(2021, 3, 31)]
    );
    assert_eq!(schedule_dates(&dates, Frequency::Yearly), vec![d(2020, 12, 31)]);
  }

  #[test]
  fn weekly_uses_iso_weeks() {
    // Fri 2021-01-08 closes ISO week 1, Mon 2021-01-11 opens week 2.
    let dates = vec![d(2021, 1, 7), d(2021, 1, 8), d(2021, 1, 11), d(2021, 1, 12)];
    assert_eq!(schedule_indices(&dates, Frequency::Weekly), vec![1]);
  }

  #[test]
  fn year_apart_dates_in_same_month_still_split() {
    let dates = vec![d(2020, 6, 30), d(2021, 6, 30)];
    assert_eq!(schedule_indices(&dates, Frequency::Monthly), vec![0]);
  }

  #[test]
  fn single_date_yields_empty_schedule() {
    assert!(schedule_dates(&[d(2021, 1, 4)], Frequency::Monthly).is_empty());
    assert!(schedule_dates(&[], Frequency::Weekly).is_empty());
  }
}
