//! Curve fitting and orchestration.
//!
//! Responsibilities:
//!
//! - fit a single group's dose/response arrays (weighted Levenberg-Marquardt
//!   with acceptance guardrails)
//! - split a screen into groups, match controls, and fit them in parallel
//! - derive pharmacological statistics from accepted fits

pub mod fitter;
pub mod groups;
pub mod params;

pub use fitter::*;
pub use groups::*;
pub use params::*;
