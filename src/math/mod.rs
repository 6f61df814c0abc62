//! Numerical utilities: simple regression, nonlinear least squares, and the
//! F-test used for null-model comparison.

pub mod levmar;
pub mod linreg;
pub mod stats;

pub use levmar::*;
pub use linreg::*;
pub use stats::*;
