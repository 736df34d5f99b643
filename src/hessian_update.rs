//! Per-bead quasi-Newton curvature models.
//!
//! Every interior bead owns one inverse Hessian approximation, updated with the
//! BFGS formula from its own secant pairs only. The collection is block
//! diagonal: no update ever touches another bead's slot.
//!
//! # Update formula
//!
//! With s = Δx, y = Δg and H the current inverse Hessian:
//! ```text
//! fac = 1 / (y·s)
//! fad = 1 / (y·H·y)
//! w   = fac·s - fad·H·y
//! H'  = H + fac·s·sᵀ - fad·(H·y)(H·y)ᵀ + (y·H·y)·w·wᵀ
//! ```
//! which satisfies the secant condition `H'·y = s`.
//!
//! # References
//!
//! - Fletcher, R. Practical Methods of Optimization, 2nd ed., Wiley 1987.

use crate::error::{PathError, Result};
use nalgebra::{DMatrix, DVector};

/// Numerical thresholds for updates.
const SMALL: f64 = 1e-14;

/// BFGS update of an inverse Hessian.
///
/// The update is skipped (the input is returned unchanged) for non-finite
/// input and when the curvature condition `Δx·Δg > 0` fails, which keeps the
/// approximation positive definite.
pub fn update_inverse_hessian_bfgs(
    h_inv: &DMatrix<f64>,
    delta_x: &DVector<f64>,
    delta_g: &DVector<f64>,
) -> DMatrix<f64> {
    if !delta_x.iter().all(|v| v.is_finite()) || !delta_g.iter().all(|v| v.is_finite()) {
        return h_inv.clone();
    }

    let curvature = delta_g.dot(delta_x);
    if curvature <= SMALL {
        return h_inv.clone();
    }

    let h_dg = h_inv * delta_g;
    let dg_h_dg = delta_g.dot(&h_dg);
    if dg_h_dg.abs() < SMALL {
        return h_inv.clone();
    }

    let fac = 1.0 / curvature;
    let fad = 1.0 / dg_h_dg;
    let w = delta_x * fac - &h_dg * fad;

    let mut updated = h_inv + (delta_x * delta_x.transpose()) * fac
        - (&h_dg * h_dg.transpose()) * fad
        + (&w * w.transpose()) * dg_h_dg;

    updated = 0.5 * (&updated + updated.transpose());

    if updated.iter().any(|v| !v.is_finite()) {
        return h_inv.clone();
    }
    updated
}

/// Inverse Hessian of a single bead.
#[derive(Debug, Clone)]
pub struct NodeHessian {
    h_inv: DMatrix<f64>,
    updates: usize,
    skipped: usize,
}

impl NodeHessian {
    /// Starts from `H = alpha·I`, i.e. an inverse of `I/alpha`.
    pub fn new(dimension: usize, alpha: f64) -> Self {
        Self {
            h_inv: DMatrix::identity(dimension, dimension) / alpha,
            updates: 0,
            skipped: 0,
        }
    }

    /// Maps a gradient-like vector to a step-like vector.
    pub fn apply_inverse(&self, g: &DVector<f64>) -> DVector<f64> {
        &self.h_inv * g
    }

    /// Folds one secant pair into the model. Returns false if it was rejected.
    pub fn update(&mut self, delta_x: &DVector<f64>, delta_g: &DVector<f64>) -> bool {
        let updated = update_inverse_hessian_bfgs(&self.h_inv, delta_x, delta_g);
        let accepted = updated != self.h_inv;
        if accepted {
            self.h_inv = updated;
            self.updates += 1;
        } else {
            self.skipped += 1;
        }
        accepted
    }

    /// The current inverse Hessian.
    pub fn inverse(&self) -> &DMatrix<f64> {
        &self.h_inv
    }

    /// Number of accepted updates.
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// Number of rejected secant pairs.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// One [`NodeHessian`] per interior bead, indexed like the interior beads.
#[derive(Debug, Clone)]
pub struct HessianBank {
    slots: Vec<NodeHessian>,
}

impl HessianBank {
    /// Fresh bank for `count` beads of the given dimension.
    pub fn new(count: usize, dimension: usize, alpha: f64) -> Self {
        Self {
            slots: (0..count).map(|_| NodeHessian::new(dimension, alpha)).collect(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True for a bank without slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot `index`.
    pub fn slot(&self, index: usize) -> &NodeHessian {
        &self.slots[index]
    }

    fn check_len(&self, found: usize) -> Result<()> {
        if found != self.slots.len() {
            return Err(PathError::DimensionMismatch {
                expected: self.slots.len(),
                found,
            });
        }
        Ok(())
    }

    /// Updates slot `i` with `(delta_x[i], delta_g[i])` for every `i`.
    ///
    /// Returns how many slots accepted their pair.
    pub fn update(&mut self, delta_x: &[DVector<f64>], delta_g: &[DVector<f64>]) -> Result<usize> {
        self.check_len(delta_x.len())?;
        self.check_len(delta_g.len())?;
        Ok(self
            .slots
            .iter_mut()
            .zip(delta_x.iter().zip(delta_g))
            .filter_map(|(slot, (dx, dg))| slot.update(dx, dg).then_some(()))
            .count())
    }

    /// Applies every slot's inverse to the matching vector.
    pub fn apply_inverse(&self, g: &[DVector<f64>]) -> Result<Vec<DVector<f64>>> {
        self.check_len(g.len())?;
        Ok(self
            .slots
            .iter()
            .zip(g)
            .map(|(slot, v)| slot.apply_inverse(v))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to check if two floats are approximately equal
    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_inverse_bfgs_secant_condition() {
        let h = DMatrix::identity(3, 3) * 0.5;
        let dx = DVector::from_vec(vec![0.1, 0.2, 0.3]);
        let dg = DVector::from_vec(vec![0.15, 0.25, 0.35]);

        let h_new = update_inverse_hessian_bfgs(&h, &dx, &dg);

        // Check symmetry
        assert!(approx_eq((&h_new - h_new.transpose()).norm(), 0.0, 1e-12));
        let mapped = &h_new * &dg;
        assert!((mapped - &dx).norm() < 1e-12);
    }

    #[test]
    fn test_inverse_bfgs_negative_curvature_skipped() {
        let h = DMatrix::identity(3, 3);
        let dx = DVector::from_vec(vec![0.1, 0.2, 0.3]);
        let dg = DVector::from_vec(vec![-0.1, -0.2, -0.3]);
        assert_eq!(update_inverse_hessian_bfgs(&h, &dx, &dg), h);
    }

    #[test]
    fn test_inverse_bfgs_zero_step_skipped() {
        let h = DMatrix::identity(2, 2);
        let dx = DVector::zeros(2);
        let dg = DVector::from_vec(vec![1.0, 1.0]);
        assert_eq!(update_inverse_hessian_bfgs(&h, &dx, &dg), h);
    }

    #[test]
    fn test_inverse_bfgs_recovers_quadratic() {
        // Two independent secant pairs of a diagonal quadratic determine it fully.
        let curvature = [4.0, 0.5];
        let mut node = NodeHessian::new(2, 1.0);
        let steps = [
            DVector::from_vec(vec![1.0, 0.0]),
            DVector::from_vec(vec![0.0, 1.0]),
        ];
        for s in &steps {
            let y = DVector::from_vec(vec![curvature[0] * s[0], curvature[1] * s[1]]);
            assert!(node.update(s, &y));
        }
        let step = node.apply_inverse(&DVector::from_vec(vec![4.0, 0.5]));
        assert!(approx_eq(step[0], 1.0, 1e-12));
        assert!(approx_eq(step[1], 1.0, 1e-12));
    }

    #[test]
    fn test_bank_initial_scale() {
        let bank = HessianBank::new(3, 2, 70.0);
        let out = bank
            .apply_inverse(&vec![DVector::from_vec(vec![70.0, -140.0]); 3])
            .unwrap();
        for v in out {
            assert!(approx_eq(v[0], 1.0, 1e-12));
            assert!(approx_eq(v[1], -2.0, 1e-12));
        }
    }

    #[test]
    fn test_bank_slots_are_independent() {
        let mut bank = HessianBank::new(2, 2, 1.0);
        let dx = vec![DVector::from_vec(vec![0.1, 0.0]), DVector::zeros(2)];
        let dg = vec![DVector::from_vec(vec![0.5, 0.0]), DVector::zeros(2)];
        assert_eq!(bank.update(&dx, &dg).unwrap(), 1);
        assert_eq!(bank.slot(0).updates(), 1);
        assert_eq!(bank.slot(1).updates(), 0);
        assert_eq!(bank.slot(1).skipped(), 1);
        assert_eq!(bank.slot(1).inverse(), &DMatrix::<f64>::identity(2, 2));
    }

    #[test]
    fn test_bank_length_mismatch() {
        let bank = HessianBank::new(2, 2, 1.0);
        assert!(bank.apply_inverse(&[DVector::zeros(2)]).is_err());
    }
}
