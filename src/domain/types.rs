//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable (where the
//! payload allows) so they can be:
//!
//! - used in-memory during fitting
//! - exported to JSON alongside fitted parameters
//! - reloaded later for plotting or cross-screen comparisons

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::math::LevMarOptions;

/// Default p-value threshold for replacing a sigmoid fit with the flat
/// no-effect model (see [`crate::fit::fit_dose_response`]).
pub const DEFAULT_NULL_REJECTION_P: f64 = 0.05;

/// Concrete fitted curve shape.
///
/// All sigmoid shapes are members of the four-parameter log-logistic family
///
/// ```text
/// f(x) = c + (d - c) / (1 + exp(b * (ln x - ln e)))
/// ```
///
/// with progressively more parameters pinned:
///
/// - `Ll4`: all four free (`b`, `c`, `d`, `e`)
/// - `Ll3u`: upper plateau fixed at `d = 1` (relative viability scale)
/// - `Ll2`: both plateaus fixed (`c = 0`, `d = 1`)
/// - `Null`: a constant (the mean response), used when the data show no
///   dose effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveShape {
    Null,
    Ll4,
    Ll3u,
    Ll2,
}

impl CurveShape {
    /// Human-readable label for terminal output.
    pub fn display_name(self) -> &'static str {
        match self {
            CurveShape::Null => "flat",
            CurveShape::Ll4 => "LL4",
            CurveShape::Ll3u => "LL3u",
            CurveShape::Ll2 => "LL2",
        }
    }

    /// Number of free parameters for this shape.
    ///
    /// Parameter order in `popt` is `[b, c, d, e]` for `Ll4`, `[b, c, e]` for
    /// `Ll3u`, `[b, e]` for `Ll2`, and `[mean]` for `Null`.
    pub fn param_len(self) -> usize {
        match self {
            CurveShape::Null => 1,
            CurveShape::Ll4 => 4,
            CurveShape::Ll3u => 3,
            CurveShape::Ll2 => 2,
        }
    }
}

/// Which sigmoid family to fit.
///
/// `Null` is not requestable: it only arises when the significance test
/// concludes the data show no dose effect (or the responses are flat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitVariant {
    Ll4,
    Ll3u,
    Ll2,
}

impl FitVariant {
    pub fn shape(self) -> CurveShape {
        match self {
            FitVariant::Ll4 => CurveShape::Ll4,
            FitVariant::Ll3u => CurveShape::Ll3u,
            FitVariant::Ll2 => CurveShape::Ll2,
        }
    }
}

/// Which response a table measures.
///
/// `Dip` is a drug-induced proliferation rate (doublings/hour, can be
/// negative for cytotoxic responses) with a per-well standard error from the
/// upstream rate regression. `Viability` is a relative cell count at a single
/// timepoint (untreated = 1), with no standard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMetric {
    Dip,
    Viability,
}

impl ResponseMetric {
    pub fn display_name(self) -> &'static str {
        match self {
            ResponseMetric::Dip => "DIP rate",
            ResponseMetric::Viability => "viability",
        }
    }
}

/// A single well's measured response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WellResponse {
    Dip {
        rate: f64,
        /// Standard error of the rate estimate (used as an inverse fit weight).
        std_err: f64,
    },
    Viability {
        value: f64,
        /// Time after treatment at which viability was read.
        timepoint: Duration,
    },
}

impl WellResponse {
    pub fn metric(self) -> ResponseMetric {
        match self {
            WellResponse::Dip { .. } => ResponseMetric::Dip,
            WellResponse::Viability { .. } => ResponseMetric::Viability,
        }
    }

    /// The response value itself (rate or viability).
    pub fn value(self) -> f64 {
        match self {
            WellResponse::Dip { rate, .. } => rate,
            WellResponse::Viability { value, .. } => value,
        }
    }

    pub fn std_err(self) -> Option<f64> {
        match self {
            WellResponse::Dip { std_err, .. } => Some(std_err),
            WellResponse::Viability { .. } => None,
        }
    }

    pub fn timepoint(self) -> Option<Duration> {
        match self {
            WellResponse::Dip { .. } => None,
            WellResponse::Viability { timepoint, .. } => Some(timepoint),
        }
    }
}

/// A raw drug-treated well.
///
/// `drugs` and `doses` are aligned vectors so combination screens can at
/// least be *represented*; fitting rejects rows with more than one entry
/// (see [`crate::error::DrcError::DrugCombosNotSupported`]).
#[derive(Debug, Clone)]
pub struct ExptRecord {
    /// Dataset identifier, when wells from several screens share a table.
    pub dataset: Option<String>,
    pub cell_line: String,
    pub drugs: Vec<String>,
    /// Molar concentrations, one per drug. Must be finite and positive.
    pub doses: Vec<f64>,
    /// Physical plate identifier (controls are matched within plates).
    pub plate: Option<String>,
    pub well_id: String,
    pub response: WellResponse,
}

/// A raw untreated (control) well.
#[derive(Debug, Clone)]
pub struct CtrlRecord {
    pub dataset: Option<String>,
    pub cell_line: String,
    pub plate: String,
    pub well_id: String,
    pub response: WellResponse,
}

/// Dimensions a parameter table can be grouped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDimension {
    Dataset,
    CellLine,
    Drug,
}

/// Identity of one fitted group.
///
/// `Ord` gives parameter tables a deterministic row order regardless of how
/// the input rows were arranged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub dataset: Option<String>,
    pub cell_line: String,
    pub drug: String,
}

impl GroupKey {
    /// Multi-line display label: dataset (when tracked), cell line, drug.
    pub fn label(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if let Some(dataset) = &self.dataset {
            parts.push(dataset);
        }
        parts.push(&self.cell_line);
        parts.push(&self.drug);
        parts.join("\n")
    }
}

/// How the pseudo-dose assigned to untreated control wells is chosen.
///
/// Controls have no drug, but the log-logistic model needs a positive dose,
/// so control responses enter the fit at a dose small enough to sit on the
/// baseline plateau without distorting the curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtrlDosePolicy {
    /// A fixed fraction of the smallest experimental dose in the group.
    MinDoseFraction(f64),
    /// An explicit molar dose.
    Fixed(f64),
}

impl CtrlDosePolicy {
    /// Resolve the effective control dose given the smallest experimental
    /// dose in the group.
    pub fn resolve(self, min_expt_dose: f64) -> f64 {
        match self {
            CtrlDosePolicy::MinDoseFraction(frac) => min_expt_dose * frac,
            CtrlDosePolicy::Fixed(dose) => dose,
        }
    }
}

impl Default for CtrlDosePolicy {
    fn default() -> Self {
        CtrlDosePolicy::MinDoseFraction(0.1)
    }
}

/// Orchestration configuration for fitting a whole screen.
#[derive(Debug, Clone)]
pub struct GroupFitConfig {
    /// Sigmoid family fitted to every group.
    pub variant: FitVariant,
    /// Threshold for the F-test against the flat model; `None` disables the
    /// test and keeps whatever the optimizer produced.
    pub null_rejection_p: Option<f64>,
    /// Pseudo-dose policy for control wells.
    pub ctrl_dose: CtrlDosePolicy,
    /// When set, fits whose baseline `e0` is not clearly above the control
    /// response distribution are rejected. Off by default because it needs
    /// well-behaved control data to be meaningful.
    pub reject_implausible_baseline: bool,
    /// Optimizer controls handed to every per-group fit.
    pub optim: LevMarOptions,
}

impl Default for GroupFitConfig {
    fn default() -> Self {
        Self {
            variant: FitVariant::Ll4,
            null_rejection_p: Some(DEFAULT_NULL_REJECTION_P),
            ctrl_dose: CtrlDosePolicy::default(),
            reject_implausible_baseline: false,
            optim: LevMarOptions::default(),
        }
    }
}
