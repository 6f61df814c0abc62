//! Log-logistic (Hill) family model implementations.
//!
//! Raw evaluation and the initial-guess heuristic are small, pure functions so
//! that fitting code can stay generic; `HillCurve` wraps a fitted parameter
//! vector and derives the pharmacological summary statistics.

pub mod curve;

pub use curve::*;
