//! Nonlinear least squares via Levenberg–Marquardt.
//!
//! The log-logistic model is nonlinear in its parameters, so unlike a design-
//! matrix regression there is no closed-form solve. We minimize the summed
//! squared residuals with a damped Gauss–Newton loop:
//!
//! - approximate the Jacobian by forward differences, stepping each parameter
//!   by a fraction of its own magnitude (a dose parameter can sit ten orders
//!   of magnitude below a slope parameter, so no absolute step suits both)
//! - rescale the normal equations to unit diagonal and solve the damped
//!   system `(Â + λI) ŷ = -ĝ` by Cholesky, which lets one damping factor
//!   reach every parameter in proportion to its own scale
//! - adjust `λ` by the gain ratio of actual to predicted cost reduction
//!   (Marquardt–Nielsen): productive steps relax it, rejected steps raise it
//!   at an escalating rate
//!
//! The step-size and scaling conventions follow the classic MINPACK `lmdif`,
//! on normal equations instead of QR. The loop is fully deterministic.
//! Failure (non-convergence, a non-finite start, an unusable Jacobian,
//! runaway damping) is an `Option::None`, because a failed fit is an expected
//! outcome on noisy screen data, not an error. A trial step that leaves the
//! model's domain shows up as non-finite cost and is rejected like any other
//! unproductive step.

use nalgebra::{DMatrix, DVector};

/// Convergence and damping controls for [`levmar_least_squares`].
#[derive(Debug, Clone)]
pub struct LevMarOptions {
    /// Maximum number of Jacobian refreshes (one per accepted step).
    pub max_iter: usize,
    /// Relative cost-reduction tolerance.
    pub ftol: f64,
    /// Relative step-size tolerance, in the scaled parameter space.
    pub xtol: f64,
    /// Gradient infinity-norm tolerance.
    pub gtol: f64,
    /// Initial damping factor.
    pub lambda_init: f64,
    /// Damping growth after a rejected step; doubles while rejections repeat.
    pub lambda_scale: f64,
    /// Damping ceiling; a rejection at the ceiling counts as failure.
    pub lambda_max: f64,
}

impl Default for LevMarOptions {
    fn default() -> Self {
        // sqrt(machine epsilon), the usual choice for double precision.
        let tol = f64::EPSILON.sqrt();
        Self {
            max_iter: 200,
            ftol: tol,
            xtol: tol,
            gtol: 1e-12,
            lambda_init: 1e-3,
            lambda_scale: 10.0,
            lambda_max: 1e12,
        }
    }
}

/// Minimize `Σ r_i(p)²` starting from `p0`.
///
/// `residuals` must fill `out` (length `n_residuals`) with the residual
/// vector at parameter vector `p`. Weighting is the caller's job: divide each
/// residual by its standard error before returning it.
///
/// Returns `None` on non-convergence, a non-finite starting point, or a
/// Jacobian that cannot be evaluated.
pub fn levmar_least_squares<F>(
    n_residuals: usize,
    p0: &[f64],
    opts: &LevMarOptions,
    mut residuals: F,
) -> Option<Vec<f64>>
where
    F: FnMut(&[f64], &mut [f64]),
{
    let k = p0.len();
    if k == 0 || n_residuals == 0 {
        return None;
    }
    if p0.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let mut p = DVector::<f64>::from_column_slice(p0);
    let mut r = DVector::<f64>::zeros(n_residuals);
    let mut buf = vec![0.0_f64; n_residuals];

    residuals(p.as_slice(), &mut buf);
    r.copy_from_slice(&buf);
    let mut cost: f64 = r.iter().map(|v| v * v).sum();
    if !cost.is_finite() {
        return None;
    }

    let mut lambda = opts.lambda_init;
    let mut growth = opts.lambda_scale;
    let mut p_step = p.clone();

    for _ in 0..opts.max_iter {
        // Forward-difference Jacobian around the current point. The
        // difference step is relative to each parameter's magnitude, with an
        // absolute floor only for parameters that are exactly zero.
        let mut jac = DMatrix::<f64>::zeros(n_residuals, k);
        for j in 0..k {
            let mut h = f64::EPSILON.sqrt() * p[j].abs();
            if h == 0.0 {
                h = f64::EPSILON.sqrt();
            }
            p_step.copy_from(&p);
            p_step[j] += h;
            residuals(p_step.as_slice(), &mut buf);
            for i in 0..n_residuals {
                jac[(i, j)] = (buf[i] - r[i]) / h;
            }
        }
        if jac.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let jt = jac.transpose();
        let a = &jt * &jac;
        let g = &jt * &r;

        if g.amax() < opts.gtol {
            return Some(p.iter().copied().collect());
        }

        // Column scales. A flat column has no scale of its own; unit keeps
        // the scaled system solvable and that column's step pinned at zero.
        let scale: Vec<f64> = (0..k)
            .map(|j| {
                let d = a[(j, j)].sqrt();
                if d > 0.0 {
                    d
                } else {
                    1.0
                }
            })
            .collect();
        let mut a_scaled = DMatrix::<f64>::zeros(k, k);
        for i in 0..k {
            for j in 0..k {
                a_scaled[(i, j)] = a[(i, j)] / (scale[i] * scale[j]);
            }
        }
        let g_scaled = DVector::<f64>::from_fn(k, |j, _| g[j] / scale[j]);
        let xnorm = (0..k)
            .map(|j| (scale[j] * p[j]).powi(2))
            .sum::<f64>()
            .sqrt();

        // Adjust the damping until a step is accepted (or damping runs away).
        loop {
            let mut a_damped = a_scaled.clone();
            for j in 0..k {
                a_damped[(j, j)] += lambda;
            }

            let Some(chol) = a_damped.cholesky() else {
                if !grow_damping(&mut lambda, &mut growth, opts) {
                    return None;
                }
                continue;
            };
            let step = chol.solve(&(-&g_scaled));

            // The damped step shrinks as λ grows; once it is negligible
            // against the scaled parameters, nothing can move any further.
            if step.norm() <= opts.xtol * (xnorm + opts.xtol) {
                return Some(p.iter().copied().collect());
            }

            let delta = DVector::<f64>::from_fn(k, |j, _| step[j] / scale[j]);
            let p_new = &p + &delta;
            let cost_new: f64 = if p_new.iter().all(|v| v.is_finite()) {
                residuals(p_new.as_slice(), &mut buf);
                buf.iter().map(|v| v * v).sum()
            } else {
                f64::NAN
            };

            // Gain ratio: actual cost drop over the drop predicted by the
            // damped linear model.
            let predicted: f64 = (0..k)
                .map(|j| step[j] * (lambda * step[j] - g_scaled[j]))
                .sum();
            let gain = (cost - cost_new) / predicted;

            if cost_new.is_finite() && predicted > 0.0 && gain > 0.0 {
                // Nielsen's smooth damping update.
                let relax = (1.0 - (2.0 * gain - 1.0).powi(3)).max(1.0 / 3.0);
                lambda = (lambda * relax).max(1e-12);
                growth = opts.lambda_scale;
                let small_drop = cost - cost_new <= opts.ftol * cost;
                p = p_new;
                r.copy_from_slice(&buf);
                cost = cost_new;
                if small_drop {
                    return Some(p.iter().copied().collect());
                }
                break;
            }

            if !grow_damping(&mut lambda, &mut growth, opts) {
                return None;
            }
        }
    }

    None
}

/// Raise the damping after a rejected step or failed solve. Growth escalates
/// while rejections repeat, so a bad region costs few retries. Returns
/// `false` once the ceiling is hit.
fn grow_damping(lambda: &mut f64, growth: &mut f64, opts: &LevMarOptions) -> bool {
    if *lambda >= opts.lambda_max {
        return false;
    }
    *lambda = (*lambda * *growth).min(opts.lambda_max);
    *growth *= 2.0;
    true
}
