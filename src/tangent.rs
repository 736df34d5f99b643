//! Unit tangents at the interior beads of a chain.
//!
//! Tangents split each bead's gradient into the part along the path, which
//! the optimizer discards or replaces, and the part across it, which drives
//! the path towards the minimum energy path.
//!
//! Three estimators are available through [`TangentMethod`]:
//!
//! ```text
//! Averaged:         τᵢ ∝ (xᵢ - xᵢ₋₁)/|xᵢ - xᵢ₋₁| + (xᵢ₊₁ - xᵢ)/|xᵢ₊₁ - xᵢ|
//! Central:          τᵢ ∝ xᵢ₊₁ - xᵢ₋₁
//! CurveDerivative:  τᵢ ∝ x'(sᵢ) of the interpolating curve
//! ```
//!
//! Every estimator fails with [`PathError::DegenerateSegment`] when two
//! adjacent beads coincide, because the path has no direction there.

use crate::curve::PathCurve;
use crate::error::{PathError, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Strategy for estimating tangents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TangentMethod {
    /// Bisector of the normalized incoming and outgoing segments
    #[default]
    Averaged,
    /// Direction from the previous to the next bead
    Central,
    /// Derivative of the interpolating curve at the bead
    CurveDerivative,
}

impl TangentMethod {
    /// Configuration name.
    pub fn name(self) -> &'static str {
        match self {
            TangentMethod::Averaged => "averaged",
            TangentMethod::Central => "central",
            TangentMethod::CurveDerivative => "curve-derivative",
        }
    }
}

impl std::str::FromStr for TangentMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "averaged" | "average" => Ok(Self::Averaged),
            "central" => Ok(Self::Central),
            "curve-derivative" | "curve" | "spline" => Ok(Self::CurveDerivative),
            other => Err(format!("unknown tangent method: {}", other)),
        }
    }
}

fn normalized(v: DVector<f64>, index: usize) -> Result<DVector<f64>> {
    let norm = v.norm();
    if norm == 0.0 || !norm.is_finite() {
        return Err(PathError::DegenerateSegment { index });
    }
    Ok(v / norm)
}

fn check_segments(positions: &[DVector<f64>]) -> Result<()> {
    for (i, w) in positions.windows(2).enumerate() {
        if w[0] == w[1] {
            return Err(PathError::DegenerateSegment { index: i });
        }
    }
    Ok(())
}

/// Unit tangents at the interior beads of `positions` (endpoints included).
///
/// Returns `positions.len() - 2` vectors. `params` is only consulted by the
/// curve-derivative method; pass the chain's arclength parameters.
pub fn tangents(
    method: TangentMethod,
    positions: &[DVector<f64>],
    params: &[f64],
) -> Result<Vec<DVector<f64>>> {
    if positions.len() < 3 {
        return Err(PathError::InvalidPathSize {
            found: positions.len(),
            minimum: 3,
        });
    }
    check_segments(positions)?;

    match method {
        TangentMethod::Averaged => (1..positions.len() - 1)
            .map(|i| {
                let back = normalized(&positions[i] - &positions[i - 1], i - 1)?;
                let ahead = normalized(&positions[i + 1] - &positions[i], i)?;
                // antiparallel segments (a hairpin) fall back to the central difference
                let sum = back + ahead;
                if sum.norm() < 1e-12 {
                    normalized(&positions[i + 1] - &positions[i - 1], i)
                } else {
                    normalized(sum, i)
                }
            })
            .collect(),
        TangentMethod::Central => (1..positions.len() - 1)
            .map(|i| normalized(&positions[i + 1] - &positions[i - 1], i))
            .collect(),
        TangentMethod::CurveDerivative => {
            let curve = PathCurve::build(positions, params)?;
            let knots = curve.knots().to_vec();
            (1..positions.len() - 1)
                .map(|i| normalized(curve.tangent(knots[i]), i))
                .collect()
        }
    }
}

/// Splits each gradient into its component along the tangent and the rest.
///
/// Returns `(parallel, orthogonal)` with `g = parallel·τ + orthogonal`.
pub fn project(
    gradients: &[DVector<f64>],
    tangents: &[DVector<f64>],
) -> (Vec<f64>, Vec<DVector<f64>>) {
    gradients
        .iter()
        .zip(tangents)
        .map(|(g, t)| {
            let along = g.dot(t);
            (along, g - t * along)
        })
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn point(x: f64, y: f64) -> DVector<f64> {
        DVector::from_vec(vec![x, y])
    }

    fn bent_path() -> (Vec<DVector<f64>>, Vec<f64>) {
        let positions = vec![
            point(0.0, 0.0),
            point(1.0, 0.3),
            point(1.8, 1.2),
            point(2.1, 2.5),
            point(3.5, 2.9),
        ];
        let mut params = vec![0.0];
        for w in positions.windows(2) {
            let last = params[params.len() - 1];
            params.push(last + (&w[1] - &w[0]).norm());
        }
        (positions, params)
    }

    #[test]
    fn test_all_methods_unit_length() {
        let (positions, params) = bent_path();
        for method in [
            TangentMethod::Averaged,
            TangentMethod::Central,
            TangentMethod::CurveDerivative,
        ] {
            let ts = tangents(method, &positions, &params).unwrap();
            assert_eq!(ts.len(), 3);
            for t in ts {
                assert!(approx_eq(t.norm(), 1.0, 1e-12), "{:?}", method);
            }
        }
    }

    #[test]
    fn test_straight_line_tangents_agree() {
        let positions: Vec<_> = (0..5).map(|i| point(i as f64, 2.0 * i as f64)).collect();
        let params: Vec<_> = (0..5).map(|i| i as f64).collect();
        let expected = point(1.0, 2.0).normalize();
        for method in [
            TangentMethod::Averaged,
            TangentMethod::Central,
            TangentMethod::CurveDerivative,
        ] {
            for t in tangents(method, &positions, &params).unwrap() {
                assert!((t - &expected).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn test_coincident_nodes_fail() {
        let positions = vec![point(0.0, 0.0), point(1.0, 1.0), point(1.0, 1.0), point(2.0, 0.0)];
        let params = [0.0, 1.0, 2.0, 3.0];
        for method in [TangentMethod::Averaged, TangentMethod::Central] {
            let err = tangents(method, &positions, &params).unwrap_err();
            assert!(matches!(err, PathError::DegenerateSegment { index: 1 }));
        }
    }

    #[test]
    fn test_projection_splits_gradient() {
        let t = vec![point(1.0, 0.0)];
        let g = vec![point(3.0, -2.0)];
        let (par, perp) = project(&g, &t);
        assert_eq!(par, vec![3.0]);
        assert_eq!(perp[0], point(0.0, -2.0));
    }

    #[test]
    fn test_parse_method() {
        assert_eq!("central".parse::<TangentMethod>().unwrap(), TangentMethod::Central);
        assert_eq!(
            "Curve-Derivative".parse::<TangentMethod>().unwrap(),
            TangentMethod::CurveDerivative
        );
        assert!("sideways".parse::<TangentMethod>().is_err());
    }
}
