//! Adaptive Runge–Kutta integration of the pseudo-time gradient flow.
//!
//! The optimizer integrates `dg/dt = f(g)` from `t = 0` either to a finite
//! time or, for a fully relaxed step, until the flow has come to rest. The
//! integrator is the Dormand–Prince 5(4) pair with the usual error-per-step
//! control.

use crate::error::{PathError, Result};
use nalgebra::DVector;

/// Tolerances of the integrator.
#[derive(Debug, Clone, Copy)]
pub struct OdeOptions {
    /// Relative error per step
    pub rtol: f64,
    /// Absolute error per step
    pub atol: f64,
    /// First trial step
    pub initial_step: f64,
    /// Maximum number of attempted steps
    pub max_steps: usize,
    /// Open-ended runs stop once `max |f|` drops below this
    pub rest_tolerance: f64,
    /// Open-ended runs stop at this time regardless
    pub horizon: f64,
}

impl Default for OdeOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-7,
            atol: 1e-10,
            initial_step: 0.05,
            max_steps: 20_000,
            rest_tolerance: 1e-10,
            horizon: 60.0,
        }
    }
}

const C: [f64; 6] = [1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const A2: [f64; 1] = [1.0 / 5.0];
const A3: [f64; 2] = [3.0 / 40.0, 9.0 / 40.0];
const A4: [f64; 3] = [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0];
const A5: [f64; 4] = [
    19372.0 / 6561.0,
    -25360.0 / 2187.0,
    64448.0 / 6561.0,
    -212.0 / 729.0,
];
const A6: [f64; 5] = [
    9017.0 / 3168.0,
    -355.0 / 33.0,
    46732.0 / 5247.0,
    49.0 / 176.0,
    -5103.0 / 18656.0,
];
const B: [f64; 6] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
];
/// Fifth minus fourth order weights, stages 1 through 7.
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

fn combine(y: &DVector<f64>, h: f64, weights: &[f64], k: &[DVector<f64>]) -> DVector<f64> {
    let mut out = y.clone();
    for (w, ki) in weights.iter().zip(k) {
        if *w != 0.0 {
            out.axpy(h * w, ki, 1.0);
        }
    }
    out
}

fn max_abs(v: &DVector<f64>) -> f64 {
    v.iter().map(|x| x.abs()).fold(0.0, f64::max)
}

/// Integrates `dy/dt = f(t, y)` from `t = 0`.
///
/// With `t_end = Some(T)` the state at `T` is returned. With `None` the
/// integration runs until the derivative falls below
/// [`OdeOptions::rest_tolerance`] or the horizon is reached, approximating the
/// limit `t → ∞`.
pub fn integrate<F>(
    mut f: F,
    y0: DVector<f64>,
    t_end: Option<f64>,
    options: &OdeOptions,
) -> Result<DVector<f64>>
where
    F: FnMut(f64, &DVector<f64>) -> Result<DVector<f64>>,
{
    let target = t_end.unwrap_or(options.horizon);
    if target <= 0.0 {
        return Ok(y0);
    }

    let mut t = 0.0;
    let mut y = y0;
    let mut k1 = f(t, &y)?;
    if t_end.is_none() && max_abs(&k1) < options.rest_tolerance {
        return Ok(y);
    }
    let mut h = options.initial_step.min(target);

    for _ in 0..options.max_steps {
        if t + h > target {
            h = target - t;
        }

        let mut k: Vec<DVector<f64>> = Vec::with_capacity(7);
        k.push(k1.clone());
        for (stage, a) in [&A2[..], &A3[..], &A4[..], &A5[..], &A6[..]].iter().enumerate() {
            let y_stage = combine(&y, h, a, &k);
            k.push(f(t + C[stage] * h, &y_stage)?);
        }
        let y_new = combine(&y, h, &B, &k);
        k.push(f(t + C[5] * h, &y_new)?);

        let mut error: DVector<f64> = DVector::zeros(y.len());
        for (w, ki) in E.iter().zip(&k) {
            if *w != 0.0 {
                error.axpy(h * w, ki, 1.0);
            }
        }
        let ratio = error
            .iter()
            .zip(y.iter().zip(y_new.iter()))
            .map(|(e, (a, b))| e.abs() / (options.atol + options.rtol * a.abs().max(b.abs())))
            .fold(0.0, f64::max);

        if !ratio.is_finite() {
            h *= 0.2;
            if h < 1e-14 {
                return Err(PathError::Integration(format!(
                    "non-finite derivative at t = {:.6e}",
                    t
                )));
            }
            continue;
        }

        if ratio <= 1.0 {
            t += h;
            y = y_new;
            if let Some(last) = k.pop() {
                k1 = last;
            }
            if t_end.is_some() && t >= target - 1e-15 * target.max(1.0) {
                return Ok(y);
            }
            if t_end.is_none() && (max_abs(&k1) < options.rest_tolerance || t >= target) {
                return Ok(y);
            }
        }

        let factor = if ratio == 0.0 {
            5.0
        } else {
            (0.9 * ratio.powf(-0.2)).clamp(0.2, 5.0)
        };
        h *= factor;
        if h < 1e-14 {
            return Err(PathError::Integration(format!(
                "step size underflow at t = {:.6e}",
                t
            )));
        }
    }

    Err(PathError::Integration(format!(
        "no convergence after {} steps (t = {:.6e})",
        options.max_steps, t
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_exponential_decay_to_finite_time() {
        let y0 = DVector::from_vec(vec![1.0, -3.0]);
        let y = integrate(
            |_, y| Ok(-y),
            y0,
            Some(std::f64::consts::LN_2),
            &OdeOptions::default(),
        )
        .unwrap();
        assert!(approx_eq(y[0], 0.5, 1e-7));
        assert!(approx_eq(y[1], -1.5, 1e-7));
    }

    #[test]
    fn test_relaxes_to_fixed_point() {
        // dy/dt = 2 - y relaxes to y = 2
        let y = integrate(
            |_, y| Ok(y.map(|v| 2.0 - v)),
            DVector::from_vec(vec![-1.0]),
            None,
            &OdeOptions::default(),
        )
        .unwrap();
        assert!(approx_eq(y[0], 2.0, 1e-6));
    }

    #[test]
    fn test_zero_time_is_identity() {
        let y0 = DVector::from_vec(vec![4.0]);
        let y = integrate(|_, y| Ok(-y), y0.clone(), Some(0.0), &OdeOptions::default()).unwrap();
        assert_eq!(y, y0);
    }

    #[test]
    fn test_derivative_errors_propagate() {
        let err = integrate(
            |t, _| {
                if t > 0.1 {
                    Err(PathError::ConstraintSingular)
                } else {
                    Ok(DVector::from_element(1, 1.0))
                }
            },
            DVector::zeros(1),
            Some(1.0),
            &OdeOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PathError::ConstraintSingular));
    }
}
