//! Path constraints and their Lagrange multipliers.
//!
//! A constraint is a vector function `c(X)` of the interior bead positions,
//! one component per interior bead, together with its Jacobian. The Jacobian
//! is stored as an `m × (n·D)` matrix whose row `i`, column block `j` holds
//! `∂cᵢ/∂xⱼ`.
//!
//! During the pseudo-time flow each bead moves with `ẋⱼ = Hⱼ⁻¹(-gⱼ + λⱼτⱼ)`.
//! The multipliers are chosen so that the constraint does not drift:
//!
//! ```text
//! ċᵢ = Σⱼ Aᵢⱼ·Hⱼ⁻¹(-gⱼ) + Σⱼ (Aᵢⱼ·Hⱼ⁻¹τⱼ)·λⱼ = 0
//! ```
//!
//! which is one small dense solve per derivative evaluation.

use crate::error::{PathError, Result};
use crate::hessian_update::HessianBank;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Which constraint, if any, the optimizer enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstraintPolicy {
    /// No multipliers; beads follow the orthogonal gradient flow
    #[default]
    None,
    /// Every bead step stays orthogonal to its tangent
    OrthogonalStep,
    /// Beads keep their fractional arclength positions
    UniformSpacing,
}

impl ConstraintPolicy {
    /// Configuration name.
    pub fn name(self) -> &'static str {
        match self {
            ConstraintPolicy::None => "none",
            ConstraintPolicy::OrthogonalStep => "orthogonal-step",
            ConstraintPolicy::UniformSpacing => "uniform-spacing",
        }
    }
}

impl std::str::FromStr for ConstraintPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "orthogonal-step" | "orthogonal" => Ok(Self::OrthogonalStep),
            "uniform-spacing" | "spacing" => Ok(Self::UniformSpacing),
            other => Err(format!("unknown constraint policy: {}", other)),
        }
    }
}

/// Constraint values and Jacobian at one configuration.
#[derive(Debug, Clone)]
pub struct ConstraintSet {
    /// `cᵢ(X)`
    pub values: DVector<f64>,
    /// `∂cᵢ/∂xⱼ` in column blocks of the bead dimension
    pub jacobian: DMatrix<f64>,
}

/// Evaluates the constraint selected by `policy`.
///
/// `positions` is the whole chain including endpoints; `tangents` are the
/// interior tangents. Returns `None` for [`ConstraintPolicy::None`].
pub fn evaluate_constraints(
    policy: ConstraintPolicy,
    positions: &[DVector<f64>],
    tangents: &[DVector<f64>],
) -> Result<Option<ConstraintSet>> {
    match policy {
        ConstraintPolicy::None => Ok(None),
        ConstraintPolicy::OrthogonalStep => Ok(Some(orthogonal_step(tangents))),
        ConstraintPolicy::UniformSpacing => spacing_constraint(positions).map(Some),
    }
}

/// `cᵢ = 0` with `∂cᵢ/∂xᵢ = τᵢ`: the step of every bead is kept orthogonal to
/// its own tangent.
pub fn orthogonal_step(tangents: &[DVector<f64>]) -> ConstraintSet {
    let n = tangents.len();
    let dim = tangents.first().map_or(0, |t| t.len());
    let mut jacobian = DMatrix::<f64>::zeros(n, n * dim);
    for (i, t) in tangents.iter().enumerate() {
        jacobian
            .view_mut((i, i * dim), (1, dim))
            .copy_from(&t.transpose());
    }
    ConstraintSet {
        values: DVector::zeros(n),
        jacobian,
    }
}

/// Fractional arclength constraint `cᵢ = sᵢ/L - i/(N-1)` for interior beads.
///
/// `sᵢ` is the chord length from the first bead to bead `i` and `L` the total;
/// all components vanish on an evenly spaced chain. The Jacobian is dense
/// because moving any bead changes `L`.
pub fn spacing_constraint(positions: &[DVector<f64>]) -> Result<ConstraintSet> {
    let n_nodes = positions.len();
    if n_nodes < 3 {
        return Err(PathError::InvalidPathSize {
            found: n_nodes,
            minimum: 3,
        });
    }
    let dim = positions[0].len();
    let n = n_nodes - 2;

    let mut lengths = Vec::with_capacity(n_nodes - 1);
    let mut units = Vec::with_capacity(n_nodes - 1);
    for (k, w) in positions.windows(2).enumerate() {
        let d = &w[1] - &w[0];
        let len = d.norm();
        if len == 0.0 {
            return Err(PathError::DegenerateSegment { index: k });
        }
        units.push(d / len);
        lengths.push(len);
    }

    let mut arc = vec![0.0; n_nodes];
    for k in 0..n_nodes - 1 {
        arc[k + 1] = arc[k] + lengths[k];
    }
    let total = arc[n_nodes - 1];

    let mut values = DVector::<f64>::zeros(n);
    let mut jacobian = DMatrix::<f64>::zeros(n, n * dim);
    for row in 0..n {
        let i = row + 1;
        values[row] = arc[i] / total - i as f64 / (n_nodes - 1) as f64;
        for col in 0..n {
            let j = col + 1;
            // d(total)/dx_j
            let dl = &units[j - 1] - &units[j];
            let mut ds = DVector::<f64>::zeros(dim);
            if j <= i {
                ds += &units[j - 1];
            }
            if j < i {
                ds -= &units[j];
            }
            let block = ds / total - dl * (arc[i] / (total * total));
            jacobian
                .view_mut((row, col * dim), (1, dim))
                .copy_from(&block.transpose());
        }
    }

    Ok(ConstraintSet { values, jacobian })
}

fn block_dot(jacobian: &DMatrix<f64>, row: usize, col: usize, v: &DVector<f64>) -> f64 {
    let dim = v.len();
    jacobian.view((row, col * dim), (1, dim)).dot(&v.transpose())
}

/// Multipliers λ that cancel the constraint drift of the flow `-H⁻¹g`.
///
/// `gradients` are the per-bead gradients the flow would follow without
/// correction. Fails with [`PathError::ConstraintSingular`] if the `n × n`
/// system is numerically rank deficient (`σmin ≤ n·ε·σmax`) or the LU
/// factorization hits a zero pivot. Badly conditioned systems above that
/// threshold are still solved.
pub fn lagrange_multipliers(
    constraint: &ConstraintSet,
    hessians: &HessianBank,
    gradients: &[DVector<f64>],
    tangents: &[DVector<f64>],
) -> Result<Vec<f64>> {
    let n = gradients.len();
    let m = constraint.values.len();
    if m != n || tangents.len() != n {
        return Err(PathError::DimensionMismatch { expected: n, found: m });
    }

    let neg: Vec<DVector<f64>> = gradients.iter().map(|g| -g).collect();
    let xh = hessians.apply_inverse(&neg)?;
    let xt = hessians.apply_inverse(tangents)?;

    let mut ch = DVector::<f64>::zeros(m);
    let mut ct = DMatrix::<f64>::zeros(m, n);
    for i in 0..m {
        for j in 0..n {
            ch[i] += block_dot(&constraint.jacobian, i, j, &xh[j]);
            ct[(i, j)] = block_dot(&constraint.jacobian, i, j, &xt[j]);
        }
    }

    let singular = ct.singular_values();
    let largest = singular.max();
    // numerical rank cutoff n·ε·σmax
    let threshold = n as f64 * f64::EPSILON * largest;
    if largest == 0.0 || !largest.is_finite() || singular.min() <= threshold {
        return Err(PathError::ConstraintSingular);
    }

    let lambda = ct.lu().solve(&(-ch)).ok_or(PathError::ConstraintSingular)?;
    Ok(lambda.iter().copied().collect())
}
