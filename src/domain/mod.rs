//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - input records for experimental and control wells (`ExptRecord`, `CtrlRecord`)
//! - curve-shape and response-metric enums (`CurveShape`, `ResponseMetric`)
//! - group keys and orchestration configuration (`GroupKey`, `GroupFitConfig`)

pub mod types;

pub use types::*;
