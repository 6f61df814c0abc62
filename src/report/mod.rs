//! Reporting utilities: formatted terminal summaries of fitted screens.
//!
//! We keep formatting code in one place so:
//! - the math/fitting code stays clean and testable
//! - output changes are localized (important for future snapshot tests)

use crate::fit::{DoseParam, FitParams, GroupFits};
use crate::models::HillCurve;

/// Format a one-line-per-group overview of raw fit results.
pub fn format_fit_summary(fits: &GroupFits) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "=== dose-response fits ({}) ===\n",
        fits.metric.display_name()
    ));
    for entry in &fits.entries {
        let label = single_line(&entry.key.label());
        match &entry.fit {
            Some(fit) => out.push_str(&format!(
                "{label}: {} popt={} doses=[{:.3e}, {:.3e}]\n",
                fit.shape().display_name(),
                fmt_vec(fit.popt()),
                entry.min_dose_measured,
                entry.max_dose_measured,
            )),
            None => out.push_str(&format!(
                "{label}: no acceptable fit (doses=[{:.3e}, {:.3e}])\n",
                entry.min_dose_measured, entry.max_dose_measured,
            )),
        }
    }

    out
}

/// Format the parameter table (group rows + the standard derived columns).
pub fn format_params_summary(params: &FitParams) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "=== dose-response parameters ({}) ===\n",
        params.metric.display_name()
    ));

    let n_fitted = params
        .rows
        .iter()
        .filter(|r| r.fit.as_ref().is_some_and(|f| !f.is_null()))
        .count();
    let n_flat = params
        .rows
        .iter()
        .filter(|r| r.fit.as_ref().is_some_and(HillCurve::is_null))
        .count();
    let n_failed = params.rows.iter().filter(|r| r.fit.is_none()).count();
    out.push_str(&format!(
        "Groups: n={} | fitted={n_fitted} | flat={n_flat} | no fit={n_failed}\n\n",
        params.rows.len()
    ));

    out.push_str(&format!(
        "{:<32} {:>6} {:>12} {:>12} {:>9} {:>9} {:>9} {:>11}\n",
        "group", "shape", "ec50", "ic50", "auc", "aa", "hill", "emax"
    ));
    out.push_str(&format!(
        "{:-<32} {:-<6} {:-<12} {:-<12} {:-<9} {:-<9} {:-<9} {:-<11}\n",
        "", "", "", "", "", "", "", ""
    ));

    let mut any_truncated = false;
    for row in &params.rows {
        let shape = row
            .fit
            .as_ref()
            .map_or("-", |f| f.shape().display_name());
        let ec50_truncated = row.is_truncated(DoseParam::Ec(50));
        let ic50_truncated = row.is_truncated(DoseParam::Ic(50));
        any_truncated |= ec50_truncated || ic50_truncated;

        out.push_str(
            format!(
                "{:<32} {:>6} {:>12} {:>12} {:>9} {:>9} {:>9} {:>11}\n",
                truncate(&single_line(&row.label), 32),
                shape,
                fmt_dose(row.ec.get(&50).copied().flatten(), ec50_truncated),
                fmt_dose(row.ic.get(&50).copied().flatten(), ic50_truncated),
                fmt_stat(row.auc),
                fmt_stat(row.aa),
                fmt_stat(row.hill),
                fmt_dose_free(row.emax),
            )
            .trim_end(),
        );
        out.push('\n');
    }

    if any_truncated {
        out.push_str("\n* clamped to the measured dose range\n");
    }

    out
}

fn single_line(label: &str) -> String {
    label.replace('\n', " / ")
}

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.4e}")).collect();
    format!("[{}]", parts.join(", "))
}

fn fmt_dose(v: Option<f64>, truncated: bool) -> String {
    match v {
        Some(v) if truncated => format!("{v:.3e}*"),
        Some(v) => format!("{v:.3e}"),
        None => "-".to_string(),
    }
}

fn fmt_dose_free(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{v:.4e}"),
        None => "-".to_string(),
    }
}

fn fmt_stat(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{v:.4}"),
        None => "-".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        if i + 1 >= max {
            break;
        }
        out.push(ch);
    }
    out.push('.');
    out
}
