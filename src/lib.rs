//! `dr-curves` library crate.
//!
//! Dose-response curve fitting for drug screens: log-logistic (Hill) models
//! fitted per (dataset, cell line, drug) group, with derived potency and
//! efficacy statistics (IC50, EC50, AUC, activity area, Hill slope, Emax).
//!
//! The crate is a library on purpose so that:
//!
//! - core logic is testable without spawning processes
//! - modules are reusable (e.g., web backends, notebooks, batch pipelines)
//! - code stays easy to navigate as the project grows

pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod math;
pub mod models;
pub mod report;
