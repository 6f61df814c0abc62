//! Crate error type.
//!
//! Only structural problems surface as errors: malformed input tables,
//! unsupported drug combinations, inconsistent dataset keying. Numerical
//! failures during fitting (non-convergence, degenerate data) are ordinary
//! `None` values on the affected group, never errors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrcError {
    /// Wells treated with more than one drug at once cannot be fitted with a
    /// single-agent dose-response model.
    #[error("drug combinations are not supported")]
    DrugCombosNotSupported,
    /// One table keys wells by dataset while the other does not, so controls
    /// cannot be matched to experimental wells unambiguously.
    #[error("inconsistent dataset keying: {0}")]
    InconsistentDatasetKeying(String),
    /// An input table violates its schema (mixed response metrics,
    /// non-positive doses, misaligned drug/dose vectors, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A curve was constructed with a parameter vector whose length does not
    /// match the shape's arity.
    #[error("parameter vector length {got} does not match {shape} arity {expected}")]
    ParameterArity {
        shape: &'static str,
        expected: usize,
        got: usize,
    },
}
