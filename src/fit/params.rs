//! Post-fit parameter enrichment.
//!
//! Turns per-group fits into a parameter table: IC/EC values at requested
//! effect levels, activity area and area under the curve, Hill slope, and
//! observed/fitted effect floors. Dose-valued parameters are clamped to the
//! measured dose range of their group, and a detector reports which values
//! ended up pinned at a range boundary.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::data::{CtrlTable, ExptTable};
use crate::domain::{CtrlDosePolicy, ExptRecord, GroupFitConfig, GroupKey, ResponseMetric};
use crate::error::DrcError;
use crate::fit::groups::{controls_for_group, fit_groups, FitEntry, GroupFits};
use crate::models::HillCurve;

/// Absolute tolerance when comparing a parameter against a range boundary.
pub const PARAM_EQUAL_ATOL: f64 = 1e-16;
/// Relative tolerance when comparing a parameter against a range boundary.
pub const PARAM_EQUAL_RTOL: f64 = 1e-12;

/// A dose-valued parameter column, addressed by effect level in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoseParam {
    Ic(u32),
    Ec(u32),
}

/// Which derived parameters to compute.
///
/// Effect levels are percentages: `ic_levels = {50}` yields IC50. Levels
/// requested through `e_levels` / `e_rel_levels` imply the matching EC value,
/// since the response there is evaluated at the (clamped) EC dose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamOptions {
    pub ic_levels: BTreeSet<u32>,
    pub ec_levels: BTreeSet<u32>,
    pub e_levels: BTreeSet<u32>,
    pub e_rel_levels: BTreeSet<u32>,
    pub include_auc: bool,
    pub include_aa: bool,
    pub include_hill: bool,
    pub include_emax: bool,
    /// Attach each group's raw dose/response series to its row.
    pub include_response_values: bool,
}

impl Default for ParamOptions {
    fn default() -> Self {
        Self {
            ic_levels: BTreeSet::new(),
            ec_levels: BTreeSet::new(),
            e_levels: BTreeSet::new(),
            e_rel_levels: BTreeSet::new(),
            include_auc: false,
            include_aa: false,
            include_hill: false,
            include_emax: false,
            include_response_values: true,
        }
    }
}

impl ParamOptions {
    /// The standard full parameter set: IC50, EC50, AUC, AA, Hill slope, and
    /// Emax, plus raw response values.
    pub fn full() -> Self {
        Self {
            ic_levels: BTreeSet::from([50]),
            ec_levels: BTreeSet::from([50]),
            include_auc: true,
            include_aa: true,
            include_hill: true,
            include_emax: true,
            ..Self::default()
        }
    }
}

/// One well's response, positioned on the dose axis.
#[derive(Debug, Clone)]
pub struct WellSeries {
    pub dose: f64,
    pub well_id: String,
    pub value: f64,
    /// Viability timepoint, when the metric records one.
    pub timepoint: Option<Duration>,
}

/// Raw responses behind one group's fit. Control wells sit at the synthetic
/// control dose.
#[derive(Debug, Clone, Default)]
pub struct GroupResponses {
    pub ctrl: Vec<WellSeries>,
    pub expt: Vec<WellSeries>,
}

/// One group's row in the parameter table.
///
/// Requested dose-valued parameters always have a map entry; the value is
/// `None` when the group has no fit, the fit is flat, or the level is not
/// reachable for the fitted curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamRow {
    pub key: GroupKey,
    pub label: String,
    pub fit: Option<HillCurve>,
    pub min_dose_measured: f64,
    pub max_dose_measured: f64,
    pub emax_obs: Option<f64>,
    /// IC values by effect level, clamped to the measured dose range.
    pub ic: BTreeMap<u32, Option<f64>>,
    /// EC values by effect level, clamped to the measured dose range.
    pub ec: BTreeMap<u32, Option<f64>>,
    /// Fitted response at the clamped EC dose, by effect level.
    pub e: BTreeMap<u32, Option<f64>>,
    /// Relative fitted response at the clamped EC dose, by effect level.
    pub e_rel: BTreeMap<u32, Option<f64>>,
    pub auc: Option<f64>,
    pub aa: Option<f64>,
    pub hill: Option<f64>,
    /// Fitted response at the maximum measured dose.
    pub emax: Option<f64>,
    pub emax_rel: Option<f64>,
    pub emax_obs_rel: Option<f64>,
    #[serde(skip)]
    pub responses: Option<GroupResponses>,
}

impl ParamRow {
    /// Whether a dose-valued parameter sits at a boundary of the group's
    /// measured dose range (within [`PARAM_EQUAL_ATOL`]/[`PARAM_EQUAL_RTOL`]).
    ///
    /// Absent values are never truncated.
    pub fn is_truncated(&self, param: DoseParam) -> bool {
        let value = match param {
            DoseParam::Ic(level) => self.ic.get(&level).copied().flatten(),
            DoseParam::Ec(level) => self.ec.get(&level).copied().flatten(),
        };
        match value {
            Some(v) => {
                values_close(v, self.min_dose_measured) || values_close(v, self.max_dose_measured)
            }
            None => false,
        }
    }
}

/// Parameter table for a whole screen, one row per group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitParams {
    pub metric: ResponseMetric,
    pub options: ParamOptions,
    pub rows: Vec<ParamRow>,
}

impl FitParams {
    /// Truncation flags for one dose-valued parameter, in row order.
    pub fn param_truncations(&self, param: DoseParam) -> Vec<bool> {
        self.rows.iter().map(|r| r.is_truncated(param)).collect()
    }
}

/// Tolerance-based boundary comparison (asymmetric in `b`, like the clamp
/// bounds it is compared against). NaN and infinities are never close.
pub fn values_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= PARAM_EQUAL_ATOL + PARAM_EQUAL_RTOL * b.abs()
}

/// Derive the requested parameters for every fitted group.
pub fn attach_params(fits: &GroupFits, options: &ParamOptions) -> FitParams {
    let rows = fits
        .entries
        .iter()
        .map(|entry| build_row(entry, fits.metric, options))
        .collect();

    FitParams {
        metric: fits.metric,
        options: options.clone(),
        rows,
    }
}

/// Fit every group in a screen and derive the requested parameters.
///
/// This is the combined pipeline: [`fit_groups`], then [`attach_params`],
/// then (when requested) the raw response series for each row.
pub fn fit_params(
    ctrl: Option<&CtrlTable>,
    expt: &ExptTable,
    config: &GroupFitConfig,
    options: &ParamOptions,
) -> Result<FitParams, DrcError> {
    let fits = fit_groups(ctrl, expt, config)?;
    let mut params = attach_params(&fits, options);
    if options.include_response_values {
        attach_response_values(&mut params, ctrl, expt, config.ctrl_dose);
    }
    Ok(params)
}

fn build_row(entry: &FitEntry, metric: ResponseMetric, options: &ParamOptions) -> ParamRow {
    let fit = entry.fit.as_ref();
    // Flat fits have a mean (and thus a divisor) but no curve statistics.
    let sigmoid = fit.filter(|f| !f.is_null());

    let min_dose = entry.min_dose_measured;
    let max_dose = entry.max_dose_measured;

    let mut ic = BTreeMap::new();
    for &level in &options.ic_levels {
        let value = fit
            .and_then(|f| f.ic(level))
            .map(|v| clamp_to_range(v, min_dose, max_dose));
        ic.insert(level, value);
    }

    let mut ec = BTreeMap::new();
    if options.ec_levels.contains(&50) {
        // EC50 comes straight from the fitted midpoint parameter.
        let value = sigmoid
            .and_then(HillCurve::ec50)
            .map(|v| clamp_to_range(v, min_dose, max_dose));
        ec.insert(50, value);
    }
    let mut derived_ec_levels: BTreeSet<u32> = options.ec_levels.clone();
    derived_ec_levels.remove(&50);
    derived_ec_levels.extend(&options.e_levels);
    derived_ec_levels.extend(&options.e_rel_levels);
    for &level in &derived_ec_levels {
        let value = fit
            .and_then(|f| f.ec(level))
            .map(|v| clamp_to_range(v, min_dose, max_dose));
        ec.insert(level, value);
    }

    let mut e = BTreeMap::new();
    for &level in &options.e_levels {
        let value = match (sigmoid, ec.get(&level).copied().flatten()) {
            (Some(f), Some(dose)) => Some(f.evaluate(dose)),
            _ => None,
        };
        e.insert(level, value);
    }
    let mut e_rel = BTreeMap::new();
    for &level in &options.e_rel_levels {
        let value = match (sigmoid, ec.get(&level).copied().flatten()) {
            (Some(f), Some(dose)) => Some(f.evaluate_rel(dose)),
            _ => None,
        };
        e_rel.insert(level, value);
    }

    // Fitted response at the top of the measured range.
    let emax = if options.include_emax {
        sigmoid.map(|f| f.evaluate(max_dose))
    } else {
        None
    };

    let divisor = fit.map(|f| f.divisor()).filter(|d| d.is_finite() && *d != 0.0);
    let (emax_rel, emax_obs_rel) = if options.include_emax && metric == ResponseMetric::Dip {
        (
            match (emax, divisor) {
                (Some(e), Some(d)) => Some(e / d),
                _ => None,
            },
            match (entry.emax_obs, divisor) {
                (Some(e), Some(d)) => Some(e / d),
                _ => None,
            },
        )
    } else {
        (None, None)
    };

    let aa = if options.include_aa {
        // The observed response floor stands in for the fitted Emax, so the
        // activity area reflects what the screen actually reached.
        sigmoid.and_then(|f| f.aa(max_dose, entry.emax_obs))
    } else {
        None
    };
    let auc = if options.include_auc {
        sigmoid.and_then(|f| f.auc(min_dose))
    } else {
        None
    };
    let hill = if options.include_hill {
        sigmoid.and_then(HillCurve::hill_slope)
    } else {
        None
    };

    ParamRow {
        key: entry.key.clone(),
        label: entry.key.label(),
        fit: entry.fit.clone(),
        min_dose_measured: min_dose,
        max_dose_measured: max_dose,
        emax_obs: entry.emax_obs,
        ic,
        ec,
        e,
        e_rel,
        auc,
        aa,
        hill,
        emax,
        emax_rel,
        emax_obs_rel,
        responses: None,
    }
}

fn clamp_to_range(value: f64, min_dose: f64, max_dose: f64) -> f64 {
    value.min(max_dose).max(min_dose)
}

fn attach_response_values(
    params: &mut FitParams,
    ctrl: Option<&CtrlTable>,
    expt: &ExptTable,
    ctrl_dose: CtrlDosePolicy,
) {
    for row in &mut params.rows {
        row.responses = Some(responses_for_key(&row.key, ctrl, expt, ctrl_dose));
    }
}

fn responses_for_key(
    key: &GroupKey,
    ctrl: Option<&CtrlTable>,
    expt: &ExptTable,
    ctrl_dose: CtrlDosePolicy,
) -> GroupResponses {
    let records: Vec<&ExptRecord> = expt
        .records()
        .iter()
        .filter(|r| {
            r.dataset == key.dataset && r.cell_line == key.cell_line && r.drugs[0] == key.drug
        })
        .collect();

    let expt_series: Vec<WellSeries> = records
        .iter()
        .map(|r| WellSeries {
            dose: r.doses[0],
            well_id: r.well_id.clone(),
            value: r.response.value(),
            timepoint: r.response.timepoint(),
        })
        .collect();

    let ctrl_series = match ctrl {
        Some(ctrl) => {
            let plates: BTreeSet<&str> =
                records.iter().filter_map(|r| r.plate.as_deref()).collect();
            let min_expt_dose = records
                .iter()
                .map(|r| r.doses[0])
                .fold(f64::INFINITY, f64::min);
            let dose = ctrl_dose.resolve(min_expt_dose);
            controls_for_group(ctrl, key.dataset.as_deref(), &key.cell_line, &plates)
                .into_iter()
                .map(|c| WellSeries {
                    dose,
                    well_id: c.well_id.clone(),
                    value: c.response.value(),
                    timepoint: c.response.timepoint(),
                })
                .collect()
        }
        None => Vec::new(),
    };

    GroupResponses {
        ctrl: ctrl_series,
        expt: expt_series,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CtrlRecord, CurveShape, WellResponse};
    use crate::models::evaluate;

    fn dip_screen(popt: &[f64; 4], max_exp: i32) -> ExptTable {
        let records = (0..=max_exp + 9)
            .map(|i| {
                let dose = 1e-9 * 10f64.powi(i);
                ExptRecord {
                    dataset: None,
                    cell_line: "BT20".to_string(),
                    drugs: vec!["paclitaxel".to_string()],
                    doses: vec![dose],
                    plate: Some("P1".to_string()),
                    well_id: format!("W{i}"),
                    response: WellResponse::Dip {
                        rate: evaluate(CurveShape::Ll4, dose, popt),
                        std_err: 1e-4,
                    },
                }
            })
            .collect();
        ExptTable::new(records).unwrap()
    }

    #[test]
    fn full_option_set_matches_the_standard_columns() {
        let options = ParamOptions::full();
        assert_eq!(options.ic_levels, BTreeSet::from([50]));
        assert_eq!(options.ec_levels, BTreeSet::from([50]));
        assert!(options.include_auc && options.include_aa);
        assert!(options.include_hill && options.include_emax);
        assert!(options.include_response_values);
    }

    #[test]
    fn unreachable_levels_are_clamped_and_flagged_truncated() {
        // c = 0 so IC95 needs a 19x multiple of the midpoint dose, which sits
        // beyond the largest measured dose of 1e-4.
        let popt = [1.0, 0.0, 1.0, 1e-5];
        let expt = dip_screen(&popt, -4);

        let options = ParamOptions {
            ic_levels: BTreeSet::from([50, 95]),
            include_response_values: false,
            ..ParamOptions::default()
        };
        let params =
            fit_params(None, &expt, &GroupFitConfig::default(), &options).unwrap();
        let row = &params.rows[0];
        assert!(row.fit.is_some());

        let ic50 = row.ic[&50].unwrap();
        assert!((ic50 - 1e-5).abs() / 1e-5 < 0.05);
        assert!(!row.is_truncated(DoseParam::Ic(50)));

        let ic95 = row.ic[&95].unwrap();
        assert_eq!(ic95, row.max_dose_measured);
        assert!(row.is_truncated(DoseParam::Ic(95)));
        assert_eq!(params.param_truncations(DoseParam::Ic(95)), vec![true]);
        assert_eq!(params.param_truncations(DoseParam::Ic(50)), vec![false]);
    }

    #[test]
    fn ec50_uses_the_fitted_midpoint_parameter() {
        let popt = [1.0, 0.0, 1.0, 1e-5];
        let expt = dip_screen(&popt, -4);

        let options = ParamOptions {
            ec_levels: BTreeSet::from([50]),
            include_response_values: false,
            ..ParamOptions::default()
        };
        let params =
            fit_params(None, &expt, &GroupFitConfig::default(), &options).unwrap();
        let row = &params.rows[0];
        let ec50 = row.ec[&50].unwrap();
        assert_eq!(ec50, row.fit.as_ref().unwrap().ec50().unwrap());
    }

    #[test]
    fn effect_levels_evaluate_the_curve_at_the_ec_dose() {
        let popt = [1.0, 0.0, 1.0, 1e-5];
        let expt = dip_screen(&popt, -4);

        let options = ParamOptions {
            e_levels: BTreeSet::from([75]),
            e_rel_levels: BTreeSet::from([75]),
            include_response_values: false,
            ..ParamOptions::default()
        };
        let params =
            fit_params(None, &expt, &GroupFitConfig::default(), &options).unwrap();
        let row = &params.rows[0];

        // Requesting e75 implies ec75.
        let ec75 = row.ec[&75].unwrap();
        assert!((ec75 - 3.0 * 1e-5).abs() / 3e-5 < 0.05);
        // At the 75% effect dose, a (c=0, d=1) curve reads 0.25.
        assert!((row.e[&75].unwrap() - 0.25).abs() < 0.02);
        assert!((row.e_rel[&75].unwrap() - 0.25).abs() < 0.02);
    }

    #[test]
    fn aa_substitutes_the_observed_effect_floor() {
        // The lower plateau (c = 0.1) is never reached within the measured
        // range, so the observed floor sits well above the fitted Emax.
        let popt = [1.0, 0.1, 1.0, 1e-5];
        let expt = dip_screen(&popt, -4);

        let options = ParamOptions {
            include_aa: true,
            include_response_values: false,
            ..ParamOptions::default()
        };
        let params = fit_params(None, &expt, &GroupFitConfig::default(), &options).unwrap();
        let row = &params.rows[0];
        let fit = row.fit.as_ref().unwrap();

        let with_observed = fit.aa(row.max_dose_measured, row.emax_obs).unwrap();
        let with_fitted = fit.aa(row.max_dose_measured, None).unwrap();
        assert_eq!(row.aa.unwrap(), with_observed);
        assert!((with_observed - with_fitted).abs() > 1e-3);
    }

    #[test]
    fn flat_fits_report_no_curve_statistics() {
        let records = (0..8)
            .map(|i| ExptRecord {
                dataset: None,
                cell_line: "BT20".to_string(),
                drugs: vec!["paclitaxel".to_string()],
                doses: vec![1e-9 * 10f64.powi(i)],
                plate: Some("P1".to_string()),
                well_id: format!("W{i}"),
                response: WellResponse::Dip {
                    rate: 0.04,
                    std_err: 1e-4,
                },
            })
            .collect();
        let expt = ExptTable::new(records).unwrap();

        let params = fit_params(
            None,
            &expt,
            &GroupFitConfig::default(),
            &ParamOptions::full(),
        )
        .unwrap();
        let row = &params.rows[0];

        assert!(row.fit.as_ref().unwrap().is_null());
        assert!(row.ic[&50].is_none());
        assert!(row.ec[&50].is_none());
        assert!(row.auc.is_none());
        assert!(row.aa.is_none());
        assert!(row.hill.is_none());
        assert!(row.emax.is_none());
        assert!(row.emax_rel.is_none());

        // The observed floor still normalizes against the flat fit's mean.
        let emax_obs_rel = row.emax_obs_rel.unwrap();
        assert!((emax_obs_rel - 1.0).abs() < 1e-9);
        assert_eq!(row.label, "BT20\npaclitaxel");
    }

    #[test]
    fn relative_emax_columns_are_dip_only() {
        let records = (0..8)
            .map(|i| {
                let dose = 1e-9 * 10f64.powi(i);
                ExptRecord {
                    dataset: None,
                    cell_line: "BT20".to_string(),
                    drugs: vec!["paclitaxel".to_string()],
                    doses: vec![dose],
                    plate: Some("P1".to_string()),
                    well_id: format!("W{i}"),
                    response: WellResponse::Viability {
                        value: evaluate(CurveShape::Ll4, dose, &[1.0, 0.1, 1.0, 1e-5]),
                        timepoint: Duration::hours(72),
                    },
                }
            })
            .collect();
        let expt = ExptTable::new(records).unwrap();

        let params = fit_params(
            None,
            &expt,
            &GroupFitConfig::default(),
            &ParamOptions::full(),
        )
        .unwrap();
        let row = &params.rows[0];
        assert!(row.emax.is_some());
        assert!(row.emax_rel.is_none());
        assert!(row.emax_obs_rel.is_none());
    }

    #[test]
    fn response_series_are_attached_on_request() {
        let popt = [1.5, 0.01, 0.05, 1e-7];
        let records = (0..8)
            .map(|i| {
                let dose = 1e-10 * 10f64.powi(i);
                ExptRecord {
                    dataset: None,
                    cell_line: "BT20".to_string(),
                    drugs: vec!["paclitaxel".to_string()],
                    doses: vec![dose],
                    plate: Some("P1".to_string()),
                    well_id: format!("W{i}"),
                    response: WellResponse::Dip {
                        rate: evaluate(CurveShape::Ll4, dose, &popt),
                        std_err: 1e-4,
                    },
                }
            })
            .collect();
        let expt = ExptTable::new(records).unwrap();
        let ctrl = CtrlTable::new(vec![CtrlRecord {
            dataset: None,
            cell_line: "BT20".to_string(),
            plate: "P1".to_string(),
            well_id: "C1".to_string(),
            response: WellResponse::Dip {
                rate: 0.05,
                std_err: 1e-4,
            },
        }])
        .unwrap();

        let params = fit_params(
            Some(&ctrl),
            &expt,
            &GroupFitConfig::default(),
            &ParamOptions::full(),
        )
        .unwrap();
        let responses = params.rows[0].responses.as_ref().unwrap();
        assert_eq!(responses.expt.len(), 8);
        assert_eq!(responses.ctrl.len(), 1);
        assert!((responses.ctrl[0].dose - 1e-11).abs() < 1e-24);
        assert_eq!(responses.ctrl[0].well_id, "C1");

        let options = ParamOptions {
            include_response_values: false,
            ..ParamOptions::full()
        };
        let params = fit_params(Some(&ctrl), &expt, &GroupFitConfig::default(), &options).unwrap();
        assert!(params.rows[0].responses.is_none());
    }

    #[test]
    fn boundary_comparison_tolerates_rounding_only() {
        assert!(values_close(1e-4, 1e-4));
        assert!(values_close(1e-4 * (1.0 + 1e-13), 1e-4));
        assert!(!values_close(1.0001e-4, 1e-4));
        assert!(!values_close(f64::NAN, 1e-4));
        assert!(!values_close(f64::INFINITY, 1e-4));

        // A value pinned at a range boundary is flagged; an interior one is
        // not, even against both ends of the range.
        assert!(values_close(1e-9, 1e-9));
        assert!(!values_close(1e-7, 1e-9));
        assert!(!values_close(1e-7, 1e-5));
    }
}
