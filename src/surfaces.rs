//! Analytic two-dimensional model surfaces.
//!
//! These stand in for a quantum-chemistry backend in tests and in the demo
//! binary. All of them return exact gradients.

use crate::oracle::{Evaluation, OracleError, PotentialSurface};
use nalgebra::DVector;

fn unpack(position: &DVector<f64>) -> Result<(f64, f64), OracleError> {
    if position.len() != 2 {
        return Err(OracleError::DimensionMismatch {
            expected: 2,
            found: position.len(),
        });
    }
    Ok((position[0], position[1]))
}

/// The Müller–Brown surface.
///
/// Three minima at roughly (-0.558, 1.442), (-0.050, 0.467) and (0.623, 0.028),
/// joined by two first-order saddles.
#[derive(Debug, Clone, Copy, Default)]
pub struct MullerBrown;

impl MullerBrown {
    const A: [f64; 4] = [-200.0, -100.0, -170.0, 15.0];
    const SA: [f64; 4] = [-1.0, -1.0, -6.5, 0.7];
    const SB: [f64; 4] = [0.0, 0.0, 11.0, 0.6];
    const SC: [f64; 4] = [-10.0, -10.0, -6.5, 0.7];
    const X0: [f64; 4] = [1.0, 0.0, -0.5, -1.0];
    const Y0: [f64; 4] = [0.0, 0.5, 1.5, 1.0];

    /// Global minimum in the upper-left basin.
    pub fn minimum_a() -> DVector<f64> {
        DVector::from_vec(vec![-0.558224, 1.441726])
    }

    /// Minimum in the lower-right basin.
    pub fn minimum_b() -> DVector<f64> {
        DVector::from_vec(vec![0.623499, 0.028038])
    }

    /// Shallow intermediate minimum.
    pub fn minimum_c() -> DVector<f64> {
        DVector::from_vec(vec![-0.050011, 0.466694])
    }
}

impl PotentialSurface for MullerBrown {
    fn evaluate(&self, position: &DVector<f64>) -> Result<Evaluation, OracleError> {
        let (x, y) = unpack(position)?;
        let mut energy = 0.0;
        let mut dx = 0.0;
        let mut dy = 0.0;
        for k in 0..4 {
            let u = x - Self::X0[k];
            let v = y - Self::Y0[k];
            let term = Self::A[k] * (Self::SA[k] * u * u + Self::SB[k] * u * v + Self::SC[k] * v * v).exp();
            energy += term;
            dx += term * (2.0 * Self::SA[k] * u + Self::SB[k] * v);
            dy += term * (Self::SB[k] * u + 2.0 * Self::SC[k] * v);
        }
        Ok(Evaluation::new(energy, DVector::from_vec(vec![dx, dy])))
    }
}

/// Two Gaussian wells at (0, 0) and (3, 3) with a side pocket near (1, 2),
/// on a weak harmonic background.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianWells;

impl PotentialSurface for GaussianWells {
    fn evaluate(&self, position: &DVector<f64>) -> Result<Evaluation, OracleError> {
        let (x, y) = unpack(position)?;
        let e1 = (-(x * x + y * y)).exp();
        let e2 = (-((x - 3.0).powi(2) + (y - 3.0).powi(2))).exp();
        let e3 = (-((x - 1.0).powi(2) + (y - 2.0).powi(2))).exp();
        let energy = -e1 - e2 + 0.01 * (x * x + y * y) - 0.3 * e3;
        let dx = 2.0 * x * e1 + (2.0 * x - 6.0) * e2 + 0.02 * x + 0.3 * (2.0 * x - 2.0) * e3;
        let dy = 2.0 * y * e1 + (2.0 * y - 6.0) * e2 + 0.02 * y + 0.3 * (2.0 * y - 4.0) * e3;
        Ok(Evaluation::new(energy, DVector::from_vec(vec![dx, dy])))
    }
}

/// Separable double well `(x² - 1)² + k·y²`.
///
/// The minimum energy path is the segment y = 0 between the minima at
/// (-1, 0) and (1, 0), with the saddle at the origin and barrier height 1.
#[derive(Debug, Clone, Copy)]
pub struct DoubleWell {
    /// Transverse force constant
    pub stiffness: f64,
}

impl Default for DoubleWell {
    fn default() -> Self {
        Self { stiffness: 5.0 }
    }
}

impl PotentialSurface for DoubleWell {
    fn evaluate(&self, position: &DVector<f64>) -> Result<Evaluation, OracleError> {
        let (x, y) = unpack(position)?;
        let w = x * x - 1.0;
        let energy = w * w + self.stiffness * y * y;
        let gradient = DVector::from_vec(vec![4.0 * x * w, 2.0 * self.stiffness * y]);
        Ok(Evaluation::new(energy, gradient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finite_difference<S: PotentialSurface>(surface: &S, x: f64, y: f64) -> (f64, f64) {
        let h = 1e-6;
        let e = |x: f64, y: f64| {
            surface
                .evaluate(&DVector::from_vec(vec![x, y]))
                .unwrap()
                .energy
        };
        (
            (e(x + h, y) - e(x - h, y)) / (2.0 * h),
            (e(x, y + h) - e(x, y - h)) / (2.0 * h),
        )
    }

    fn check_gradient<S: PotentialSurface>(surface: &S, x: f64, y: f64, tol: f64) {
        let analytic = surface
            .evaluate(&DVector::from_vec(vec![x, y]))
            .unwrap()
            .gradient;
        let (gx, gy) = finite_difference(surface, x, y);
        assert!((analytic[0] - gx).abs() < tol, "dx {} vs {}", analytic[0], gx);
        assert!((analytic[1] - gy).abs() < tol, "dy {} vs {}", analytic[1], gy);
    }

    #[test]
    fn test_muller_brown_gradient() {
        check_gradient(&MullerBrown, -0.3, 0.8, 1e-4);
        check_gradient(&MullerBrown, 0.2, 0.1, 1e-4);
    }

    #[test]
    fn test_muller_brown_minimum_is_stationary() {
        let g = MullerBrown.evaluate(&MullerBrown::minimum_a()).unwrap().gradient;
        assert!(g.norm() < 1e-2, "gradient norm {}", g.norm());
    }

    #[test]
    fn test_gaussian_wells_gradient() {
        check_gradient(&GaussianWells, 0.7, 1.3, 1e-6);
    }

    #[test]
    fn test_double_well_values() {
        let s = DoubleWell::default();
        let top = s.evaluate(&DVector::from_vec(vec![0.0, 0.0])).unwrap();
        assert_eq!(top.energy, 1.0);
        check_gradient(&s, 0.4, -0.2, 1e-6);
    }

    #[test]
    fn test_wrong_dimension() {
        let err = DoubleWell::default()
            .evaluate(&DVector::zeros(3))
            .unwrap_err();
        assert_eq!(err, OracleError::DimensionMismatch { expected: 2, found: 3 });
    }
}
