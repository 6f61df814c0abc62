//! Low-level fitting routine for a single dose-response group.
//!
//! Given:
//! - doses `x_i`
//! - observed responses `y_i`
//! - optional per-response standard errors `σ_i`
//!
//! we fit the configured log-logistic family by weighted Levenberg-Marquardt
//! and then pass the candidate through an acceptance pipeline:
//!
//! - an F-test against the flat (no-effect) model
//! - an EC50-within-measured-range guardrail
//! - an optional control-baseline plausibility check
//!
//! A group that fails any stage yields `None` rather than an error: noisy
//! screens routinely contain groups with no acceptable fit, and the caller
//! records the absence instead of aborting the batch.

use tracing::debug;

use crate::domain::{FitVariant, DEFAULT_NULL_REJECTION_P};
use crate::math::{f_test_p_value, levmar_least_squares, mean, population_std, LevMarOptions};
use crate::models::{evaluate, initial_guess, HillCurve};

/// Fitting options that affect how a single group is calibrated.
#[derive(Debug, Clone)]
pub struct FitterOptions {
    /// Sigmoid family to fit.
    pub variant: FitVariant,

    /// Significance threshold for the F-test against the flat model.
    ///
    /// When the test's p-value exceeds this threshold the sigmoid is replaced
    /// by a flat curve at the mean response. `None` disables the test and
    /// keeps whatever the optimizer produced.
    pub null_rejection_p: Option<f64>,

    /// Dose at which control responses were inserted, if any.
    ///
    /// When set, the fitted baseline `E0` must exceed the mean plus one
    /// standard deviation of the responses observed at exactly this dose.
    /// Skipped when no sample sits at the dose.
    pub ctrl_dose: Option<f64>,

    /// Optimizer controls.
    pub optim: LevMarOptions,
}

impl Default for FitterOptions {
    fn default() -> Self {
        Self {
            variant: FitVariant::Ll4,
            null_rejection_p: Some(DEFAULT_NULL_REJECTION_P),
            ctrl_dose: None,
            optim: LevMarOptions::default(),
        }
    }
}

/// Fit a dose-response curve to one group of samples.
///
/// `std_errs`, when given, weights each residual by `1 / σ_i`. Samples with a
/// NaN response are dropped up front, and the remainder is sorted by
/// `(dose, response, std_err)` so the result does not depend on input order.
///
/// Returns `None` when the group has no samples after NaN removal, when the
/// optimizer fails to converge, or when the candidate fails a guardrail. A
/// flat (no-effect) conclusion is still `Some`: it is reported as a null
/// curve pinned at the mean response.
///
/// # Panics
///
/// Panics if `responses` (or `std_errs`, when given) differs in length from
/// `doses`.
pub fn fit_dose_response(
    doses: &[f64],
    responses: &[f64],
    std_errs: Option<&[f64]>,
    opts: &FitterOptions,
) -> Option<HillCurve> {
    assert_eq!(
        doses.len(),
        responses.len(),
        "dose/response length mismatch"
    );
    if let Some(se) = std_errs {
        assert_eq!(doses.len(), se.len(), "dose/std-err length mismatch");
    }

    // Drop NaN responses, then sort lexicographically so that permutations of
    // the same samples produce bitwise-identical fits.
    let mut samples: Vec<(f64, f64, f64)> = doses
        .iter()
        .zip(responses.iter())
        .enumerate()
        .filter(|&(_, (_, y))| !y.is_nan())
        .map(|(i, (&x, &y))| (x, y, std_errs.map_or(1.0, |se| se[i])))
        .collect();
    if samples.is_empty() {
        debug!("no usable samples after NaN removal");
        return None;
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let x: Vec<f64> = samples.iter().map(|s| s.0).collect();
    let y: Vec<f64> = samples.iter().map(|s| s.1).collect();
    let sigma: Option<Vec<f64>> = std_errs.map(|_| samples.iter().map(|s| s.2).collect());

    let n = x.len();
    let y_mean = mean(&y)?;

    // Perfectly flat responses carry no curve information: the plateau finder
    // has a zero range and the logit transform is undefined. They are the
    // no-effect conclusion by construction.
    if y.iter().all(|&v| v == y[0]) {
        debug!(n, "responses are constant, reporting no-effect curve");
        return Some(HillCurve::null(y_mean));
    }

    let shape = opts.variant.shape();
    if n < shape.param_len() {
        debug!(n, needed = shape.param_len(), "too few samples for variant");
        return None;
    }

    let Some(guess) = initial_guess(opts.variant, &x, &y) else {
        debug!(n, variant = ?opts.variant, "initial guess undefined");
        return None;
    };

    let popt = levmar_least_squares(n, &guess, &opts.optim, |p, out| {
        for i in 0..n {
            let r = evaluate(shape, x[i], p) - y[i];
            out[i] = match &sigma {
                Some(s) => r / s[i],
                None => r,
            };
        }
    });
    let Some(popt) = popt else {
        debug!(n, variant = ?opts.variant, "optimizer did not converge");
        return None;
    };
    if popt.iter().any(|v| v.is_nan()) {
        debug!("optimizer returned NaN parameters");
        return None;
    }
    let fit = HillCurve::new(shape, popt).ok()?;

    // F-test against the flat model, on unweighted residuals. The denominator
    // degrees of freedom use the four-parameter count for every variant.
    if let Some(threshold) = opts.null_rejection_p {
        let ssq_model: f64 = x
            .iter()
            .zip(y.iter())
            .map(|(&xi, &yi)| {
                let r = fit.evaluate(xi) - yi;
                r * r
            })
            .sum();
        let ssq_null: f64 = y
            .iter()
            .map(|&yi| {
                let r = y_mean - yi;
                r * r
            })
            .sum();
        let df = n as f64 - 4.0;
        if let Some(p) = f_test_p_value(ssq_null, ssq_model, df) {
            if p > threshold {
                debug!(p, threshold, "sigmoid not significant vs flat model");
                return Some(HillCurve::null(y_mean));
            }
        }
    }

    // Reject fits whose EC50 sits below the measured dose range: the curve's
    // transition was never observed and the parameters are extrapolation.
    if let Some(ec50) = fit.ec50() {
        let min_dose = x[0];
        if ec50 < min_dose {
            debug!(ec50, min_dose, "EC50 below measured dose range");
            return None;
        }
    }

    // Baseline plausibility: keep the fit only when E0 clears the control
    // response distribution at the control dose.
    if let Some(ctrl_dose) = opts.ctrl_dose {
        let controls: Vec<f64> = samples
            .iter()
            .filter(|s| s.0 == ctrl_dose)
            .map(|s| s.1)
            .collect();
        if let (Some(ctrl_mean), Some(ctrl_std)) = (mean(&controls), population_std(&controls)) {
            if let Some(e0) = fit.e0() {
                if e0 <= ctrl_mean + ctrl_std {
                    debug!(e0, ctrl_mean, ctrl_std, "baseline within control noise");
                    return None;
                }
            }
        }
    }

    Some(fit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CurveShape;
    use crate::models::evaluate;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn log_doses(start: f64, factor: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| start * factor.powi(i as i32)).collect()
    }

    fn ll4_responses(doses: &[f64], popt: &[f64; 4]) -> Vec<f64> {
        doses
            .iter()
            .map(|&x| evaluate(CurveShape::Ll4, x, popt))
            .collect()
    }

    #[test]
    fn recovers_ll4_parameters_from_clean_data() {
        let true_popt = [1.5, 0.1, 1.0, 1e-7];
        let doses = log_doses(1e-10, 10.0, 10);
        let responses = ll4_responses(&doses, &true_popt);

        let fit = fit_dose_response(&doses, &responses, None, &FitterOptions::default()).unwrap();
        assert!(!fit.is_null());

        let hill = fit.hill_slope().unwrap();
        let emax = fit.emax().unwrap();
        let e0 = fit.e0().unwrap();
        let ec50 = fit.ec50().unwrap();
        assert!((hill - true_popt[0]).abs() / true_popt[0] < 0.05);
        assert!((emax - true_popt[1]).abs() / true_popt[1] < 0.05);
        assert!((e0 - true_popt[2]).abs() / true_popt[2] < 0.05);
        assert!((ec50 - true_popt[3]).abs() / true_popt[3] < 0.05);
    }

    #[test]
    fn noisy_screen_still_recovers_parameters() {
        let true_popt = [1.5, 0.1, 1.0, 1e-7];
        let doses = log_doses(1e-10, 10.0, 10);
        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0, 0.005).unwrap();
        let responses: Vec<f64> = ll4_responses(&doses, &true_popt)
            .into_iter()
            .map(|y| y + noise.sample(&mut rng))
            .collect();

        let fit = fit_dose_response(&doses, &responses, None, &FitterOptions::default()).unwrap();
        assert!(!fit.is_null());
        let ec50 = fit.ec50().unwrap();
        assert!((ec50 - true_popt[3]).abs() / true_popt[3] < 0.15);
        let e0 = fit.e0().unwrap();
        assert!((e0 - true_popt[2]).abs() / true_popt[2] < 0.1);
    }

    #[test]
    fn recovers_subnanomolar_ec50() {
        // An EC50 around twenty times smaller than sqrt(machine epsilon);
        // convergence has to track the parameter's own scale.
        let true_popt = [1.2, 0.05, 1.0, 8e-10];
        let doses = log_doses(1e-12, 10.0, 10);
        let responses = ll4_responses(&doses, &true_popt);

        let fit = fit_dose_response(&doses, &responses, None, &FitterOptions::default()).unwrap();
        assert!(!fit.is_null());
        let ec50 = fit.ec50().unwrap();
        assert!((ec50 - true_popt[3]).abs() / true_popt[3] < 0.05);
        let hill = fit.hill_slope().unwrap();
        assert!((hill - true_popt[0]).abs() / true_popt[0] < 0.05);
    }

    #[test]
    fn constant_responses_yield_flat_curve() {
        let doses = log_doses(1e-9, 10.0, 8);
        let responses = vec![1.0; 8];

        let fit = fit_dose_response(&doses, &responses, None, &FitterOptions::default()).unwrap();
        assert!(fit.is_null());
        assert_eq!(fit.popt(), &[1.0]);
        assert!(fit.hill_slope().is_none());
        assert!(fit.ec50().is_none());
        assert!(fit.auc(1e-9).is_none());
        assert!(fit.aa(1e-2, None).is_none());
    }

    #[test]
    fn ec50_below_measured_range_is_rejected() {
        // True EC50 of 5e-9 sits below the lowest measured dose of 1e-8, so
        // the response at the lowest dose is already under half range and any
        // converged decreasing fit must place e below 1e-8.
        let doses = log_doses(1e-8, 10.0f64.sqrt(), 8);
        let responses: Vec<f64> = doses.iter().map(|&x| 1.0 / (1.0 + x / 5e-9)).collect();

        let opts = FitterOptions {
            variant: FitVariant::Ll2,
            ..FitterOptions::default()
        };
        assert!(fit_dose_response(&doses, &responses, None, &opts).is_none());
    }

    #[test]
    fn trendless_noise_is_replaced_by_flat_curve() {
        // Near-symmetric dip pattern: the best monotone curve cannot explain
        // enough variance for the F-test to prefer it over the flat model.
        let doses = log_doses(1e-9, 10.0, 6);
        let responses = [1.0, 0.92, 0.8, 0.8, 0.9, 1.0];

        let fit = fit_dose_response(&doses, &responses, None, &FitterOptions::default()).unwrap();
        assert!(fit.is_null());
        let mean = responses.iter().sum::<f64>() / responses.len() as f64;
        assert!((fit.popt()[0] - mean).abs() < 1e-12);
    }

    #[test]
    fn disabling_the_null_rejection_test_keeps_the_sigmoid() {
        let true_popt = [1.5, 0.1, 1.0, 1e-7];
        let doses = log_doses(1e-10, 10.0, 10);
        let responses = ll4_responses(&doses, &true_popt);

        let opts = FitterOptions {
            null_rejection_p: None,
            ..FitterOptions::default()
        };
        let fit = fit_dose_response(&doses, &responses, None, &opts).unwrap();
        assert!(!fit.is_null());
    }

    #[test]
    fn empty_and_all_nan_inputs_yield_no_fit() {
        let opts = FitterOptions::default();
        assert!(fit_dose_response(&[], &[], None, &opts).is_none());
        assert!(fit_dose_response(&[1e-9, 1e-8], &[f64::NAN, f64::NAN], None, &opts).is_none());
    }

    #[test]
    fn nan_responses_are_dropped_not_propagated() {
        let true_popt = [1.5, 0.1, 1.0, 1e-7];
        let doses = log_doses(1e-10, 10.0, 10);
        let responses = ll4_responses(&doses, &true_popt);

        let mut doses_with_nan = doses.clone();
        let mut responses_with_nan = responses.clone();
        doses_with_nan.push(1e-6);
        responses_with_nan.push(f64::NAN);

        let opts = FitterOptions::default();
        let clean = fit_dose_response(&doses, &responses, None, &opts).unwrap();
        let padded =
            fit_dose_response(&doses_with_nan, &responses_with_nan, None, &opts).unwrap();
        assert_eq!(clean.popt(), padded.popt());
    }

    #[test]
    fn fits_are_insensitive_to_sample_order() {
        let true_popt = [1.2, 0.2, 1.0, 3e-8];
        let doses = log_doses(1e-10, 10.0, 9);
        let responses = ll4_responses(&doses, &true_popt);

        let mut doses_rev = doses.clone();
        let mut responses_rev = responses.clone();
        doses_rev.reverse();
        responses_rev.reverse();

        let opts = FitterOptions::default();
        let fwd = fit_dose_response(&doses, &responses, None, &opts).unwrap();
        let rev = fit_dose_response(&doses_rev, &responses_rev, None, &opts).unwrap();
        assert_eq!(fwd.popt(), rev.popt());
    }

    #[test]
    fn large_std_err_downweights_an_outlier() {
        let true_popt = [1.5, 0.1, 1.0, 1e-7];
        let doses = log_doses(1e-10, 10.0, 10);
        let mut responses = ll4_responses(&doses, &true_popt);
        responses[2] = 0.3;

        let mut std_errs = vec![1e-3; doses.len()];
        std_errs[2] = 1e3;

        let fit =
            fit_dose_response(&doses, &responses, Some(&std_errs), &FitterOptions::default())
                .unwrap();
        let ec50 = fit.ec50().unwrap();
        assert!((ec50 - true_popt[3]).abs() / true_popt[3] < 0.05);
        let e0 = fit.e0().unwrap();
        assert!((e0 - true_popt[2]).abs() / true_popt[2] < 0.05);
    }

    #[test]
    fn implausible_baseline_is_rejected_when_controls_sit_high() {
        // Controls at the control dose average 1.2; the fitted E0 lands near
        // the experimental top plateau of 1.0 and fails the baseline check.
        let true_popt = [1.5, 0.1, 1.0, 1e-7];
        let ctrl_dose = 1e-12;
        let mut doses = vec![ctrl_dose; 3];
        let mut responses = vec![1.2; 3];
        let expt_doses = log_doses(1e-10, 10.0, 8);
        responses.extend(ll4_responses(&expt_doses, &true_popt));
        doses.extend(expt_doses);

        let opts = FitterOptions {
            ctrl_dose: Some(ctrl_dose),
            ..FitterOptions::default()
        };
        assert!(fit_dose_response(&doses, &responses, None, &opts).is_none());
    }

    #[test]
    fn plausible_baseline_is_kept_when_controls_sit_low() {
        let true_popt = [1.5, 0.1, 1.0, 1e-7];
        let ctrl_dose = 1e-12;
        let mut doses = vec![ctrl_dose; 3];
        let mut responses = vec![0.7; 3];
        let expt_doses = log_doses(1e-10, 10.0, 8);
        responses.extend(ll4_responses(&expt_doses, &true_popt));
        doses.extend(expt_doses);

        let opts = FitterOptions {
            ctrl_dose: Some(ctrl_dose),
            ..FitterOptions::default()
        };
        let fit = fit_dose_response(&doses, &responses, None, &opts).unwrap();
        assert!(!fit.is_null());
        assert!(fit.e0().unwrap() > 0.7);
    }

    #[test]
    fn baseline_check_is_skipped_when_no_sample_sits_at_the_control_dose() {
        let true_popt = [1.5, 0.1, 1.0, 1e-7];
        let doses = log_doses(1e-10, 10.0, 10);
        let responses = ll4_responses(&doses, &true_popt);

        let opts = FitterOptions {
            ctrl_dose: Some(5e-13),
            ..FitterOptions::default()
        };
        assert!(fit_dose_response(&doses, &responses, None, &opts).is_some());
    }
}
