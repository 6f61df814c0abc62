//! Input tables for experiment and control wells.
//!
//! These wrappers validate structural invariants once, at construction, so the
//! fitting pipeline can rely on them:
//!
//! - **Uniform metric**: a table measures either DIP rates or viability, never
//!   a mix.
//! - **Uniform dataset keying**: either every record carries a dataset id or
//!   none does.
//! - **Well-formed doses**: experiment doses are finite, positive, and aligned
//!   with the drug list.
//!
//! Tables are deliberately dumb containers beyond that: grouping and control
//! matching live in [`crate::fit`].

use std::collections::BTreeSet;

use crate::domain::{CtrlRecord, ExptRecord, ResponseMetric};
use crate::error::DrcError;

/// Validated table of drug-treated wells.
#[derive(Debug, Clone)]
pub struct ExptTable {
    records: Vec<ExptRecord>,
    metric: ResponseMetric,
    has_datasets: bool,
}

impl ExptTable {
    pub fn new(records: Vec<ExptRecord>) -> Result<Self, DrcError> {
        if records.is_empty() {
            return Err(DrcError::InvalidInput(
                "experiment table has no records".to_string(),
            ));
        }

        let metric = records[0].response.metric();
        let has_datasets = records[0].dataset.is_some();

        for rec in &records {
            if rec.drugs.is_empty() {
                return Err(DrcError::InvalidInput(format!(
                    "well `{}`: no drug recorded",
                    rec.well_id
                )));
            }
            if rec.drugs.len() != rec.doses.len() {
                return Err(DrcError::InvalidInput(format!(
                    "well `{}`: {} drug(s) but {} dose(s)",
                    rec.well_id,
                    rec.drugs.len(),
                    rec.doses.len()
                )));
            }
            if rec.doses.iter().any(|d| !d.is_finite() || *d <= 0.0) {
                return Err(DrcError::InvalidInput(format!(
                    "well `{}`: doses must be finite and > 0",
                    rec.well_id
                )));
            }
            if rec.response.metric() != metric {
                return Err(DrcError::InvalidInput(format!(
                    "well `{}`: mixed response metrics in one table",
                    rec.well_id
                )));
            }
            if rec.dataset.is_some() != has_datasets {
                return Err(DrcError::InconsistentDatasetKeying(
                    "some experiment records carry a dataset id and some do not".to_string(),
                ));
            }
        }

        Ok(Self {
            records,
            metric,
            has_datasets,
        })
    }

    pub fn records(&self) -> &[ExptRecord] {
        &self.records
    }

    pub fn metric(&self) -> ResponseMetric {
        self.metric
    }

    /// Whether records are keyed by dataset id.
    pub fn has_datasets(&self) -> bool {
        self.has_datasets
    }

    /// Whether any record holds more than one drug (a combination treatment).
    pub fn has_drug_combos(&self) -> bool {
        self.records.iter().any(|r| r.drugs.len() > 1)
    }

    pub fn datasets(&self) -> BTreeSet<&str> {
        self.records
            .iter()
            .filter_map(|r| r.dataset.as_deref())
            .collect()
    }

    pub fn cell_lines(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.cell_line.as_str()).collect()
    }

    pub fn drugs(&self) -> BTreeSet<&str> {
        self.records
            .iter()
            .flat_map(|r| r.drugs.iter().map(String::as_str))
            .collect()
    }
}

/// Validated table of untreated (control) wells.
#[derive(Debug, Clone)]
pub struct CtrlTable {
    records: Vec<CtrlRecord>,
    metric: ResponseMetric,
    has_datasets: bool,
}

impl CtrlTable {
    pub fn new(records: Vec<CtrlRecord>) -> Result<Self, DrcError> {
        if records.is_empty() {
            return Err(DrcError::InvalidInput(
                "control table has no records".to_string(),
            ));
        }

        let metric = records[0].response.metric();
        let has_datasets = records[0].dataset.is_some();

        for rec in &records {
            if rec.plate.is_empty() {
                return Err(DrcError::InvalidInput(format!(
                    "control well `{}`: empty plate id",
                    rec.well_id
                )));
            }
            if rec.response.metric() != metric {
                return Err(DrcError::InvalidInput(format!(
                    "control well `{}`: mixed response metrics in one table",
                    rec.well_id
                )));
            }
            if rec.dataset.is_some() != has_datasets {
                return Err(DrcError::InconsistentDatasetKeying(
                    "some control records carry a dataset id and some do not".to_string(),
                ));
            }
        }

        Ok(Self {
            records,
            metric,
            has_datasets,
        })
    }

    pub fn records(&self) -> &[CtrlRecord] {
        &self.records
    }

    pub fn metric(&self) -> ResponseMetric {
        self.metric
    }

    pub fn has_datasets(&self) -> bool {
        self.has_datasets
    }
}
