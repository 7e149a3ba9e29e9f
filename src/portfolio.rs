//! # Portfolio
//!
//! $$
//! \text{NAV}_t = \sum_i q_i P_{t,i}
//! $$
//!
//! Periodic maximum-Sharpe rebalancing and fixed-weight index construction.

pub mod data;
pub mod drift;
pub mod engine;
pub mod index;
pub mod optimizers;
pub mod schedule;
pub mod types;

pub use data::ReturnMoments;
pub use drift::DEFAULT_SEED_NAV;
pub use drift::DriftSimulator;
pub use drift::FallbackPolicy;
pub use drift::RebalancePlan;
pub use drift::SimulationOutput;
pub use drift::SimulationReport;
pub use engine::BacktestConfig;
pub use engine::BacktestOutcome;
pub use engine::Backtester;
pub use index::FixedWeightIndexBuilder;
pub use optimizers::MaxSharpeSolver;
pub use optimizers::PortfolioResult;
pub use optimizers::SolverConfig;
pub use schedule::schedule_dates;
pub use schedule::schedule_indices;
pub use types::Frequency;
pub use types::HoldingsState;
pub use types::NavSeries;
pub use types::WEIGHT_TOLERANCE;
pub use types::WeightVector;
