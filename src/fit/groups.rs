//! Whole-screen orchestration.
//!
//! Splits an experiment table into `(dataset, cell line, drug)` groups,
//! assembles each group's dose/response vectors (inserting matched control
//! wells at a synthetic near-zero dose), and fits every group in parallel.
//!
//! Groups are independent, so the per-group work runs on the rayon pool and
//! failures stay local: a group that cannot be fitted produces an entry with
//! no curve, never an error for the whole screen.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{CtrlTable, ExptTable};
use crate::domain::{CtrlRecord, ExptRecord, GroupDimension, GroupFitConfig, GroupKey, ResponseMetric};
use crate::error::DrcError;
use crate::fit::fitter::{fit_dose_response, FitterOptions};
use crate::models::HillCurve;

/// One group's fit plus the bookkeeping needed to derive statistics from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitEntry {
    pub key: GroupKey,
    /// `None` when the group has no acceptable fit.
    pub fit: Option<HillCurve>,
    /// Smallest dose entering the fit, including the synthetic control dose.
    pub min_dose_measured: f64,
    /// Largest dose entering the fit.
    pub max_dose_measured: f64,
    /// Smallest finite experimental response (the observed effect floor).
    pub emax_obs: Option<f64>,
}

/// Per-group fits for a whole screen, in deterministic group order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupFits {
    pub metric: ResponseMetric,
    pub entries: Vec<FitEntry>,
}

/// Decide which dimensions distinguish groups, given how many distinct
/// datasets, cell lines, and drugs a table holds.
///
/// Dimensions that are constant across the table are left out so the
/// partition has no redundant singleton components:
///
/// - several drugs on one cell line group by drug alone
/// - several cell lines under one drug group by cell line alone
/// - otherwise groups are `(cell line, drug)` pairs
/// - several datasets prepend the dataset dimension, collapsing to dataset
///   alone when cell line and drug are both singletons
pub fn resolve_grouping(
    n_datasets: usize,
    n_cell_lines: usize,
    n_drugs: usize,
) -> Vec<GroupDimension> {
    let mut dims = if n_drugs > 1 && n_cell_lines == 1 {
        vec![GroupDimension::Drug]
    } else if n_cell_lines > 1 && n_drugs == 1 {
        vec![GroupDimension::CellLine]
    } else {
        vec![GroupDimension::CellLine, GroupDimension::Drug]
    };

    if n_datasets > 1 {
        if n_cell_lines == 1 && n_drugs == 1 {
            dims = vec![GroupDimension::Dataset];
        } else {
            dims.insert(0, GroupDimension::Dataset);
        }
    }

    dims
}

/// Fit dose-response curves for every group in a screen.
///
/// Control wells, when given, are matched to each group by dataset (when
/// tracked), cell line, and the set of plates the group's experiment wells
/// sit on. They enter DIP fits at a synthetic dose from
/// [`GroupFitConfig::ctrl_dose`]; viability fits use experiment wells only.
///
/// Fails fast on structural problems (drug combinations, mismatched metrics,
/// asymmetric dataset keying). Per-group fit failures are recorded as entries
/// without a curve.
pub fn fit_groups(
    ctrl: Option<&CtrlTable>,
    expt: &ExptTable,
    config: &GroupFitConfig,
) -> Result<GroupFits, DrcError> {
    if expt.has_drug_combos() {
        return Err(DrcError::DrugCombosNotSupported);
    }
    if let Some(ctrl) = ctrl {
        if ctrl.has_datasets() != expt.has_datasets() {
            return Err(DrcError::InconsistentDatasetKeying(
                "control and experiment tables must either both carry dataset ids or neither"
                    .to_string(),
            ));
        }
        if ctrl.metric() != expt.metric() {
            return Err(DrcError::InvalidInput(format!(
                "control table measures {} but experiment table measures {}",
                ctrl.metric().display_name(),
                expt.metric().display_name()
            )));
        }
    }

    let n_datasets = if expt.has_datasets() {
        expt.datasets().len()
    } else {
        1
    };
    let dims = resolve_grouping(n_datasets, expt.cell_lines().len(), expt.drugs().len());

    // Partition on the resolved dimensions. Components left out of `dims` are
    // constant across the table, so each partition cell still has a unique
    // full (dataset, cell line, drug) key.
    let mut partitions: BTreeMap<Vec<&str>, Vec<&ExptRecord>> = BTreeMap::new();
    for rec in expt.records() {
        let projected: Vec<&str> = dims
            .iter()
            .map(|dim| match dim {
                GroupDimension::Dataset => rec.dataset.as_deref().unwrap_or(""),
                GroupDimension::CellLine => rec.cell_line.as_str(),
                GroupDimension::Drug => rec.drugs[0].as_str(),
            })
            .collect();
        partitions.entry(projected).or_default().push(rec);
    }

    let groups: Vec<(GroupKey, Vec<&ExptRecord>)> = partitions
        .into_values()
        .map(|records| {
            let first = records[0];
            let key = GroupKey {
                dataset: first.dataset.clone(),
                cell_line: first.cell_line.clone(),
                drug: first.drugs[0].clone(),
            };
            (key, records)
        })
        .collect();

    debug!(
        n_groups = groups.len(),
        dims = ?dims,
        metric = ?expt.metric(),
        "fitting dose-response groups"
    );

    let entries: Vec<FitEntry> = groups
        .par_iter()
        .map(|(key, records)| fit_group(key, records, ctrl, expt.metric(), config))
        .collect();

    Ok(GroupFits {
        metric: expt.metric(),
        entries,
    })
}

fn fit_group(
    key: &GroupKey,
    records: &[&ExptRecord],
    ctrl: Option<&CtrlTable>,
    metric: ResponseMetric,
    config: &GroupFitConfig,
) -> FitEntry {
    let doses_expt: Vec<f64> = records.iter().map(|r| r.doses[0]).collect();
    let resp_expt: Vec<f64> = records.iter().map(|r| r.response.value()).collect();
    let emax_obs = resp_expt
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .reduce(f64::min);

    let mut opts = FitterOptions {
        variant: config.variant,
        null_rejection_p: config.null_rejection_p,
        ctrl_dose: None,
        optim: config.optim.clone(),
    };

    let (doses, responses, std_errs) = match metric {
        ResponseMetric::Viability => (doses_expt, resp_expt, None),
        ResponseMetric::Dip => {
            let plates: BTreeSet<&str> = records.iter().filter_map(|r| r.plate.as_deref()).collect();
            let ctrl_recs = ctrl
                .map(|c| controls_for_group(c, key.dataset.as_deref(), &key.cell_line, &plates))
                .unwrap_or_default();
            if ctrl.is_some() && ctrl_recs.is_empty() {
                debug!(label = %key.label(), "no control wells match this group");
            }

            let min_expt_dose = doses_expt.iter().copied().fold(f64::INFINITY, f64::min);
            let ctrl_dose_val = config.ctrl_dose.resolve(min_expt_dose);
            if config.reject_implausible_baseline {
                opts.ctrl_dose = Some(ctrl_dose_val);
            }

            let mut doses = vec![ctrl_dose_val; ctrl_recs.len()];
            doses.extend(&doses_expt);
            let mut responses: Vec<f64> =
                ctrl_recs.iter().map(|r| r.response.value()).collect();
            responses.extend(&resp_expt);
            let mut std_errs: Vec<f64> = ctrl_recs
                .iter()
                .map(|r| r.response.std_err().unwrap_or(1.0))
                .collect();
            std_errs.extend(records.iter().map(|r| r.response.std_err().unwrap_or(1.0)));

            (doses, responses, Some(std_errs))
        }
    };

    let fit = fit_dose_response(&doses, &responses, std_errs.as_deref(), &opts);
    if fit.is_none() {
        debug!(label = %key.label(), "group has no acceptable fit");
    }

    let min_dose_measured = doses.iter().copied().fold(f64::INFINITY, f64::min);
    let max_dose_measured = doses.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    FitEntry {
        key: key.clone(),
        fit,
        min_dose_measured,
        max_dose_measured,
        emax_obs,
    }
}

/// Controls usable for one group: same dataset (when tracked), same cell
/// line, and only from plates the group's experiment wells sit on. A group
/// with no plate information gets no controls.
pub(crate) fn controls_for_group<'a>(
    ctrl: &'a CtrlTable,
    dataset: Option<&str>,
    cell_line: &str,
    plates: &BTreeSet<&str>,
) -> Vec<&'a CtrlRecord> {
    ctrl.records()
        .iter()
        .filter(|r| match (dataset, r.dataset.as_deref()) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        })
        .filter(|r| r.cell_line == cell_line)
        .filter(|r| plates.contains(r.plate.as_str()))
        .collect()
}
