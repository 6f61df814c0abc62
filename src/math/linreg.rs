//! Simple linear regression.
//!
//! The initial-guess heuristic for the log-logistic family linearizes the
//! curve into `logit-space ~ a + b ln(x)` and reads the Hill slope and EC50
//! off the fitted line. The problem is always univariate, so we use the
//! closed-form covariance/variance solution rather than a matrix solve.

/// Least-squares slope and intercept of `y ~ intercept + slope * x`.
///
/// Returns `None` when the fit is undefined: fewer than two points, any
/// non-finite input, or zero variance in `x`.
pub fn linear_fit(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    assert_eq!(x.len(), y.len(), "linear_fit input lengths differ");
    let n = x.len();
    if n < 2 {
        return None;
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return None;
    }

    let nf = n as f64;
    let x_bar = x.iter().sum::<f64>() / nf;
    let y_bar = y.iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var = 0.0;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let dx = xi - x_bar;
        cov += dx * (yi - y_bar);
        var += dx * dx;
    }
    if var <= 0.0 {
        return None;
    }

    let slope = cov / var;
    let intercept = y_bar - slope * x_bar;
    if slope.is_finite() && intercept.is_finite() {
        Some((slope, intercept))
    } else {
        None
    }
}
