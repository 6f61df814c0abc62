//! Log-logistic dose-response curves.
//!
//! The fitter relies on two primitive operations:
//! - evaluate a shape at a dose given a raw parameter vector (for residuals)
//! - produce a starting parameter vector from the data (for the optimizer)
//!
//! Fitted parameters are wrapped in [`HillCurve`], which derives the
//! pharmacological summary statistics (IC/EC values, AUC, activity area).

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::domain::{CurveShape, FitVariant};
use crate::error::DrcError;
use crate::math::linear_fit;

/// Fraction of the observed response range by which the plateau guesses are
/// pushed outside that range, so the logit transform stays defined at the
/// extreme observations (the heuristic used by R's `drc` package).
const PLATEAU_MARGIN: f64 = 0.001;

/// Evaluate a curve shape at dose `x` with raw parameters `popt`.
///
/// Parameter order is `[b, c, d, e]` for `Ll4` (Hill slope, lower plateau,
/// upper plateau, EC50), `[b, c, e]` for `Ll3u`, `[b, e]` for `Ll2` and
/// `[mean]` for `Null`.
///
/// # Panics
/// Panics if `popt` is shorter than `shape.param_len()`. Callers should size
/// the vector correctly; [`HillCurve::new`] enforces this for fitted curves.
pub fn evaluate(shape: CurveShape, x: f64, popt: &[f64]) -> f64 {
    match shape {
        CurveShape::Null => popt[0],
        CurveShape::Ll4 => ll4(x, popt[0], popt[1], popt[2], popt[3]),
        CurveShape::Ll3u => ll4(x, popt[0], popt[1], 1.0, popt[2]),
        CurveShape::Ll2 => ll4(x, popt[0], 0.0, 1.0, popt[1]),
    }
}

/// Four-parameter log-logistic function.
fn ll4(x: f64, b: f64, c: f64, d: f64, e: f64) -> f64 {
    c + (d - c) / (1.0 + (b * (x.ln() - e.ln())).exp())
}

/// Heuristic starting parameters for the optimizer.
///
/// Plateaus are set just outside the observed response range; the Hill slope
/// and EC50 come from a linear regression of the logit-transformed responses
/// on log dose. Returns `None` when the linearization is undefined (fewer
/// than two points, zero response range, or a degenerate regression).
pub fn initial_guess(variant: FitVariant, doses: &[f64], responses: &[f64]) -> Option<Vec<f64>> {
    let (c, d) = find_plateaus(responses)?;

    let log_doses: Vec<f64> = doses.iter().map(|x| x.ln()).collect();
    let logits: Vec<f64> = responses.iter().map(|&y| ((d - y) / (y - c)).ln()).collect();
    let (slope, intercept) = linear_fit(&log_doses, &logits)?;
    if slope == 0.0 {
        return None;
    }
    let b = slope;
    let e = (-intercept / b).exp();
    if !e.is_finite() {
        return None;
    }

    match variant {
        FitVariant::Ll4 => Some(vec![b, c, d, e]),
        FitVariant::Ll3u => Some(vec![b, c, e]),
        FitVariant::Ll2 => Some(vec![b, e]),
    }
}

fn find_plateaus(responses: &[f64]) -> Option<(f64, f64)> {
    let mut ymin = f64::INFINITY;
    let mut ymax = f64::NEG_INFINITY;
    for &y in responses {
        if !y.is_finite() {
            return None;
        }
        ymin = ymin.min(y);
        ymax = ymax.max(y);
    }
    if ymin > ymax || ymin == ymax {
        return None;
    }
    let margin = PLATEAU_MARGIN * (ymax - ymin);
    Some((ymin - margin, ymax + margin))
}

/// A fitted dose-response curve.
///
/// Sigmoid shapes carry their free parameters in `popt` (see [`evaluate`] for
/// the order); the `Null` shape carries the mean response. Relative-scale
/// parameters are derived lazily and cached, since they are only needed when
/// relative-effect statistics are requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HillCurve {
    shape: CurveShape,
    popt: Vec<f64>,
    #[serde(skip)]
    popt_rel: OnceLock<Vec<f64>>,
}

impl HillCurve {
    pub fn new(shape: CurveShape, popt: Vec<f64>) -> Result<Self, DrcError> {
        if popt.len() != shape.param_len() {
            return Err(DrcError::ParameterArity {
                shape: shape.display_name(),
                expected: shape.param_len(),
                got: popt.len(),
            });
        }
        Ok(Self {
            shape,
            popt,
            popt_rel: OnceLock::new(),
        })
    }

    /// The flat no-effect curve at the given mean response.
    pub fn null(mean: f64) -> Self {
        Self {
            shape: CurveShape::Null,
            popt: vec![mean],
            popt_rel: OnceLock::new(),
        }
    }

    pub fn shape(&self) -> CurveShape {
        self.shape
    }

    pub fn popt(&self) -> &[f64] {
        &self.popt
    }

    pub fn is_null(&self) -> bool {
        self.shape == CurveShape::Null
    }

    /// Model response at the given dose.
    pub fn evaluate(&self, dose: f64) -> f64 {
        evaluate(self.shape, dose, &self.popt)
    }

    /// Model response at the given dose, on the relative (divisor-scaled)
    /// parameter set.
    pub fn evaluate_rel(&self, dose: f64) -> f64 {
        evaluate(self.shape, dose, self.popt_rel())
    }

    /// Hill slope `b`. Absent for the `Null` shape.
    pub fn hill_slope(&self) -> Option<f64> {
        match self.shape {
            CurveShape::Null => None,
            _ => Some(self.popt[0]),
        }
    }

    /// EC50 parameter `e`. Absent for the `Null` shape.
    pub fn ec50(&self) -> Option<f64> {
        match self.shape {
            CurveShape::Null => None,
            CurveShape::Ll4 => Some(self.popt[3]),
            CurveShape::Ll3u => Some(self.popt[2]),
            CurveShape::Ll2 => Some(self.popt[1]),
        }
    }

    /// Baseline (zero-dose) response `d`. Fixed at 1 for the upper-bounded
    /// shapes; absent for `Null`.
    pub fn e0(&self) -> Option<f64> {
        match self.shape {
            CurveShape::Null => None,
            CurveShape::Ll4 => Some(self.popt[2]),
            CurveShape::Ll3u | CurveShape::Ll2 => Some(1.0),
        }
    }

    /// Lower-plateau response `c`. Fixed at 0 for `Ll2`; absent for `Null`.
    pub fn emax(&self) -> Option<f64> {
        match self.shape {
            CurveShape::Null => None,
            CurveShape::Ll4 | CurveShape::Ll3u => Some(self.popt[1]),
            CurveShape::Ll2 => Some(0.0),
        }
    }

    /// Normalization constant for relative-scale statistics: the larger of
    /// the two plateaus, or the mean response for `Null`.
    pub fn divisor(&self) -> f64 {
        match self.shape {
            CurveShape::Null => self.popt[0],
            CurveShape::Ll4 => self.popt[1].max(self.popt[2]),
            CurveShape::Ll3u => self.popt[1].max(1.0),
            CurveShape::Ll2 => 1.0,
        }
    }

    /// Parameters with the plateaus divided by [`Self::divisor`], computed
    /// once on first use.
    pub fn popt_rel(&self) -> &[f64] {
        self.popt_rel.get_or_init(|| {
            let divisor = self.divisor();
            let mut rel = self.popt.clone();
            match self.shape {
                CurveShape::Ll4 => {
                    rel[1] /= divisor;
                    rel[2] /= divisor;
                }
                CurveShape::Ll3u => {
                    rel[1] /= divisor;
                }
                CurveShape::Ll2 | CurveShape::Null => {}
            }
            rel
        })
    }

    /// Plateaus ordered so the first is the larger, as the potency and area
    /// formulas assume (`e0 > emax`).
    fn plateaus_ordered(&self) -> Option<(f64, f64)> {
        let e0 = self.e0()?;
        let emax = self.emax()?;
        if emax > e0 {
            Some((emax, e0))
        } else {
            Some((e0, emax))
        }
    }

    /// Inhibitory concentration at the given response level, e.g. `ic(50)`.
    ///
    /// Unlike [`Self::ec`], this is measured against the baseline response
    /// rather than the curve's own span, so it does not exist when the curve
    /// never reaches the requested level (`None`). An infinite value is
    /// passed through; the enrichment step clamps it to the measured dose
    /// range.
    pub fn ic(&self, ic_num: u32) -> Option<f64> {
        let (e0, emax) = self.plateaus_ordered()?;
        let b = self.hill_slope()?;
        let ec50 = self.ec50()?;

        let ic_frac = ic_num as f64 / 100.0;
        let ic_n = ec50 * (ic_frac / (1.0 - ic_frac - emax / e0)).powf(1.0 / b);
        if ic_n.is_nan() { None } else { Some(ic_n) }
    }

    /// Effective concentration at the given fraction of the curve's span,
    /// e.g. `ec(50)`. Undefined at or above 100.
    pub fn ec(&self, ec_num: u32) -> Option<f64> {
        if ec_num >= 100 {
            return None;
        }
        let b = self.hill_slope()?;
        let ec50 = self.ec50()?;

        let ec_frac = ec_num as f64 / 100.0;
        Some(ec50 * (ec_frac / (1.0 - ec_frac)).powf(1.0 / b))
    }

    /// Area under the log10-dose response curve above `min_conc`, normalized
    /// by the baseline response.
    pub fn auc(&self, min_conc: f64) -> Option<f64> {
        let (e0, emax) = self.plateaus_ordered()?;
        let b = self.hill_slope()?;
        let ec50 = self.ec50()?;

        let min_conc_hill = min_conc.powf(b);
        let auc = ((ec50.powf(b) + min_conc_hill) / min_conc_hill).log10() / b * ((e0 - emax) / e0);
        if auc.is_finite() { Some(auc) } else { None }
    }

    /// Activity area (area over the curve) up to `max_conc`, normalized by
    /// the baseline response. `emax_obs` substitutes an observed Emax for the
    /// fitted lower plateau.
    pub fn aa(&self, max_conc: f64, emax_obs: Option<f64>) -> Option<f64> {
        let (e0, fitted_emax) = self.plateaus_ordered()?;
        let b = self.hill_slope()?;
        let ec50 = self.ec50()?;

        let emax = emax_obs.unwrap_or(fitted_emax);
        let ec50_hill = ec50.powf(b);
        let aa = ((ec50_hill + max_conc.powf(b)) / ec50_hill).log10() * ((e0 - emax) / e0) / b;
        if aa.is_finite() { Some(aa) } else { None }
    }
}
