//! # Portfolio Optimizers
//!
//! $$
//! \mathbf{w}^\*=\arg\min_{\mathbf{w}\in\Delta}\ -\frac{\mathbf{w}^\top\mu-r_f/252}{\sqrt{\mathbf{w}^\top\Sigma\mathbf{w}}},
//! \qquad \Delta=\{\mathbf{w}:\ \textstyle\sum_i w_i=1,\ 0\le w_i\le1\}
//! $$
//!
//! Maximum-Sharpe solver. A Nelder-Mead search over softmax coordinates gives
//! a global starting point; a projected-gradient pass on the simplex then
//! identifies the active set, and on the current support the tangency
//! portfolio
//!
//! $$
//! \mathbf{w}_S\propto\Sigma_{SS}^{-1}(\mu_S-r_f)
//! $$
//!
//! is taken as an exact step whenever it stays inside the face. The solver
//! reports non-convergence when the iteration budget runs out.

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::solver::neldermead::NelderMead;
use nalgebra::DMatrix;
use nalgebra::DVector;
use ndarray::Array1;
use serde::Deserialize;
use tracing::debug;

use super::data::ReturnMoments;
use super::types::WeightVector;
use crate::error::BacktestError;
use crate::prices::PriceSeries;

const INFEASIBLE_COST: f64 = 1e10;
const MIN_STEP: f64 = 1e-20;
const MAX_STEP: f64 = 1e6;
const ARMIJO: f64 = 1e-4;
const IMPROVEMENT_EPS: f64 = 1e-12;

/// Explicit optimizer settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
  /// Iteration budget of the projected-gradient pass.
  pub max_iters: u64,
  /// Stationarity tolerance on the unit-step projected gradient, relative to
  /// `max(1, |grad|_inf)`.
  pub tolerance: f64,
  /// Stop once an accepted step lowers the objective by at most
  /// `objective_tolerance * max(1, |f|)`.
  pub objective_tolerance: f64,
  /// Iteration budget of the Nelder-Mead seed search.
  pub nelder_mead_iters: u64,
  /// Simplex standard-deviation tolerance of the seed search.
  pub nelder_mead_sd_tolerance: f64,
  /// Budget/box tolerance applied to the final weights.
  pub weight_tolerance: f64,
  /// Variances at or below this are treated as zero.
  pub variance_floor: f64,
  /// Periods per year used to de-annualize the risk-free rate.
  pub trading_days: f64,
}

impl Default for SolverConfig {
  fn default() -> Self {
    Self {
      max_iters: 10_000,
      tolerance: 1e-7,
      objective_tolerance: 1e-12,
      nelder_mead_iters: 2_000,
      nelder_mead_sd_tolerance: 1e-10,
      weight_tolerance: 1e-6,
      variance_floor: 1e-14,
      trading_days: 252.0,
    }
  }
}

/// Output of a solve.
#[derive(Clone, Debug)]
pub struct PortfolioResult {
  /// Optimal weights, asset-column order.
  pub weights: WeightVector,
  /// Mean per-period portfolio return over the window.
  pub expected_return: f64,
  /// Per-period portfolio volatility over the window.
  pub volatility: f64,
  /// Per-period Sharpe ratio `(expected_return - rf) / volatility`.
  pub sharpe: f64,
  /// Projected-gradient iterations used.
  pub iterations: u64,
}

fn softmax(x: &[f64]) -> Array1<f64> {
  if x.is_empty() {
    return Array1::zeros(0);
  }

  let max_x = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
  let exps: Array1<f64> = x.iter().map(|&v| (v - max_x).exp()).collect();
  let sum = exps.sum();

  if sum < 1e-15 {
    Array1::from_elem(x.len(), 1.0 / x.len() as f64)
  } else {
    exps / sum
  }
}

/// Euclidean projection onto the probability simplex (sort-and-threshold).
fn project_simplex(v: &Array1<f64>) -> Array1<f64> {
  let mut u = v.to_vec();
  u.sort_by(|a, b| b.total_cmp(a));

  let mut cumsum = 0.0;
  let mut theta = 0.0;
  for (j, &uj) in u.iter().enumerate() {
    cumsum += uj;
    let t = (cumsum - 1.0) / (j + 1) as f64;
    if uj - t > 0.0 {
      theta = t;
    }
  }

  v.mapv(|x| (x - theta).max(0.0))
}

fn max_abs_diff(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
  a.iter()
    .zip(b.iter())
    .map(|(x, y)| (x - y).abs())
    .fold(0.0, f64::max)
}

/// Negative Sharpe ratio of a window's moments.
struct NegSharpe<'a> {
  moments: &'a ReturnMoments,
  rf: f64,
  floor: f64,
}

impl NegSharpe<'_> {
  fn value(&self, w: &Array1<f64>) -> Option<f64> {
    let var = self.moments.portfolio_variance(w);
    if var <= self.floor {
      return None;
    }
    Some(-(self.moments.portfolio_return(w) - self.rf) / var.sqrt())
  }

  fn gradient(&self, w: &Array1<f64>) -> Option<Array1<f64>> {
    let sigma_w = self.moments.cov.dot(w);
    let var = w.dot(&sigma_w);
    if var <= self.floor {
      return None;
    }
    let vol = var.sqrt();
    let excess = self.moments.portfolio_return(w) - self.rf;
    Some(sigma_w * (excess / (var * vol)) - &self.moments.mean / vol)
  }
}

/// Nelder-Mead cost in unconstrained softmax coordinates.
struct SoftmaxSharpeCost {
  moments: ReturnMoments,
  rf: f64,
  floor: f64,
}

impl CostFunction for SoftmaxSharpeCost {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
    let objective = NegSharpe {
      moments: &self.moments,
      rf: self.rf,
      floor: self.floor,
    };
    Ok(objective.value(&softmax(x)).unwrap_or(INFEASIBLE_COST))
  }
}

/// Long-only, fully invested maximum-Sharpe solver.
#[derive(Clone, Debug, Default)]
pub struct MaxSharpeSolver {
  config: SolverConfig,
}

impl MaxSharpeSolver {
  pub fn new(config: SolverConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &SolverConfig {
    &self.config
  }

  /// Solve on a lookback window. `risk_free_pct` is annualized, in percent.
  pub fn solve(
    &self,
    window: &PriceSeries,
    risk_free_pct: f64,
  ) -> Result<PortfolioResult, BacktestError> {
    let n = window.asset_count();
    let rf = risk_free_pct / 100.0 / self.config.trading_days;

    if n == 1 {
      return self.single_asset(window, rf);
    }

    let moments = ReturnMoments::estimate(window)?;
    let max_var = moments.max_variance();
    if max_var <= self.config.variance_floor {
      return Err(BacktestError::DegenerateVolatility { variance: max_var });
    }

    let objective = NegSharpe {
      moments: &moments,
      rf,
      floor: self.config.variance_floor,
    };

    let equal = WeightVector::equal(n).as_array().clone();
    let start = match (objective.value(&equal), self.seed_search(&moments, rf)) {
      (Some(f_eq), Some((w_nm, f_nm))) if f_nm < f_eq - IMPROVEMENT_EPS => w_nm,
      (Some(_), _) => equal,
      (None, Some((w_nm, _))) => w_nm,
      (None, None) => {
        return Err(BacktestError::DegenerateVolatility {
          variance: moments.portfolio_variance(&equal),
        });
      }
    };

    let (w, iterations) = self.refine(&objective, start)?;

    let variance = moments.portfolio_variance(&w);
    if variance <= self.config.variance_floor {
      return Err(BacktestError::DegenerateVolatility { variance });
    }

    let expected_return = moments.portfolio_return(&w);
    let volatility = variance.sqrt();
    let weights = WeightVector::new(w, self.config.weight_tolerance)?;

    debug!(
      assets = n,
      observations = moments.observations,
      iterations,
      sharpe = (expected_return - rf) / volatility,
      "max-sharpe solve converged"
    );

    Ok(PortfolioResult {
      weights,
      expected_return,
      volatility,
      sharpe: (expected_return - rf) / volatility,
      iterations,
    })
  }

  fn single_asset(&self, window: &PriceSeries, rf: f64) -> Result<PortfolioResult, BacktestError> {
    if window.is_empty() {
      return Err(BacktestError::InsufficientHistory {
        required: 1,
        actual: 0,
      });
    }

    let weights = WeightVector::new(vec![1.0], self.config.weight_tolerance)?;
    let (expected_return, volatility) = match ReturnMoments::estimate(window) {
      Ok(m) => (m.mean[0], m.cov[[0, 0]].max(0.0).sqrt()),
      Err(_) => (0.0, 0.0),
    };
    let sharpe = if volatility > self.config.variance_floor.sqrt() {
      (expected_return - rf) / volatility
    } else {
      0.0
    };

    Ok(PortfolioResult {
      weights,
      expected_return,
      volatility,
      sharpe,
      iterations: 0,
    })
  }

  /// Nelder-Mead over softmax coordinates, started at equal weights.
  fn seed_search(&self, moments: &ReturnMoments, rf: f64) -> Option<(Array1<f64>, f64)> {
    let n = moments.asset_count();
    let cost = SoftmaxSharpeCost {
      moments: moments.clone(),
      rf,
      floor: self.config.variance_floor,
    };

    let x0 = vec![0.0; n];
    let mut simplex = Vec::with_capacity(n + 1);
    simplex.push(x0.clone());
    for i in 0..n {
      let mut point = x0.clone();
      point[i] = 1.0;
      simplex.push(point);
    }

    let solver = NelderMead::new(simplex)
      .with_sd_tolerance(self.config.nelder_mead_sd_tolerance)
      .ok()?;
    let res = Executor::new(cost, solver)
      .configure(|state| state.max_iters(self.config.nelder_mead_iters))
      .run()
      .ok()?;

    let w = softmax(&res.state.best_param.unwrap_or(x0));
    let objective = NegSharpe {
      moments,
      rf,
      floor: self.config.variance_floor,
    };
    let f = objective.value(&w)?;
    Some((w, f))
  }

  /// Projected gradient with Armijo backtracking on the simplex, accelerated
  /// by exact tangency steps on the current support.
  fn refine(
    &self,
    objective: &NegSharpe<'_>,
    start: Array1<f64>,
  ) -> Result<(Array1<f64>, u64), BacktestError> {
    let mut w = project_simplex(&start);
    let mut fw = objective
      .value(&w)
      .ok_or(BacktestError::DegenerateVolatility {
        variance: objective.moments.portfolio_variance(&w),
      })?;
    let mut step = 1.0;
    let mut residual = f64::INFINITY;

    for iter in 0..self.config.max_iters {
      let grad = objective
        .gradient(&w)
        .ok_or(BacktestError::DegenerateVolatility {
          variance: objective.moments.portfolio_variance(&w),
        })?;

      residual = max_abs_diff(&project_simplex(&(&w - &grad)), &w);
      let scale = grad.iter().fold(1.0_f64, |m, g| m.max(g.abs()));
      if residual <= self.config.tolerance * scale {
        return Ok((w, iter));
      }

      if let Some((candidate, fc)) = face_optimum(objective, &w) {
        if fc < fw {
          w = candidate;
          fw = fc;
          continue;
        }
      }

      let mut t = step;
      loop {
        let candidate = project_simplex(&(&w - &(&grad * t)));
        let moved = &candidate - &w;
        let decrease = ARMIJO / t * moved.dot(&moved);
        match objective.value(&candidate) {
          Some(fc) if fc <= fw - decrease => {
            let gain = fw - fc;
            w = candidate;
            fw = fc;
            step = (t * 2.0).min(MAX_STEP);
            if gain <= self.config.objective_tolerance * fw.abs().max(1.0) {
              return Ok((w, iter + 1));
            }
            break;
          }
          _ => {
            t *= 0.5;
            if t < MIN_STEP {
              // No descent left at machine precision.
              return Ok((w, iter));
            }
          }
        }
      }
    }

    Err(BacktestError::OptimizationNonConvergence {
      iterations: self.config.max_iters,
      residual,
    })
  }
}

/// Tangency portfolio restricted to the support of `w`, with its objective.
///
/// `None` unless the support holds at least two assets with a positive
/// definite covariance block and the tangency point stays inside the face.
fn face_optimum(objective: &NegSharpe<'_>, w: &Array1<f64>) -> Option<(Array1<f64>, f64)> {
  let support: Vec<usize> = (0..w.len()).filter(|&i| w[i] > 0.0).collect();
  let k = support.len();
  if k < 2 {
    return None;
  }

  let moments = objective.moments;
  let sigma = DMatrix::from_fn(k, k, |a, b| moments.cov[[support[a], support[b]]]);
  let excess = DVector::from_fn(k, |a, _| moments.mean[support[a]] - objective.rf);
  let x = sigma.cholesky()?.solve(&excess);

  let total = x.sum();
  if !(total > 0.0) || x.iter().any(|&v| !(v > 0.0)) {
    return None;
  }

  let mut out = Array1::zeros(w.len());
  for (a, &i) in support.iter().enumerate() {
    out[i] = x[a] / total;
  }
  let f = objective.value(&out)?;
  Some((out, f))
}
