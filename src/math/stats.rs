//! Summary statistics and the flat-model F-test.

use statrs::distribution::{ContinuousCDF, FisherSnedecor};

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (no Bessel correction).
pub fn population_std(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// P-value of the F-test comparing a fitted curve against the flat
/// mean-response model.
///
/// `ssq_model` and `ssq_null` are unweighted residual sums of squares; `df`
/// is the model's residual degrees of freedom. The numerator has a single
/// degree of freedom, so the ratio is referred to an `F(1, df)` distribution.
///
/// Returns `None` when the test is undefined (`df <= 0`, or a 0/0 ratio on
/// degenerate data); the caller keeps the fitted curve in that case. A fit no
/// better than flat gives `p = 1`, a perfect fit `p = 0`.
pub fn f_test_p_value(ssq_null: f64, ssq_model: f64, df: f64) -> Option<f64> {
    if df <= 0.0 {
        return None;
    }

    let f_ratio = (ssq_null - ssq_model) / (ssq_model / df);
    if f_ratio.is_nan() {
        return None;
    }
    if f_ratio <= 0.0 {
        return Some(1.0);
    }
    if f_ratio.is_infinite() {
        return Some(0.0);
    }

    let dist = FisherSnedecor::new(1.0, df).ok()?;
    Some(1.0 - dist.cdf(f_ratio))
}
