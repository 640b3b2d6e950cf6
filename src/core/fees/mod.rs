//! Fee schedule
//!
//! Fees are never re-priced at runtime: every account pays the same minimum, derived
//! from constant per-symbol base fees and fixed network/address multipliers.

pub mod fixed;

pub use fixed::{FixedFeeCalculator, FEE_PRECISION};
