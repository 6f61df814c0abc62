//! Validated in-memory input tables.

pub mod tables;

pub use tables::*;
