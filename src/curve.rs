//! Smooth interpolation through an ordered sequence of nodes.
//!
//! A [`PathCurve`] is a disposable view over node positions and their
//! parameters (usually cumulative arclength). The interpolation scheme depends
//! on the node count:
//!
//! | Nodes | Scheme |
//! |-------|--------|
//! | 2     | straight segment |
//! | 3     | quadratic with the middle node at the midpoint parameter |
//! | ≥ 4   | not-a-knot cubic spline, one per coordinate |
//!
//! Every scheme is interpolating: `position(knot_i)` returns node `i`. The
//! spline is C² inside the domain, so its tangent is continuous everywhere.
//! Outside the knot range each scheme extrapolates with its end polynomial.
//!
//! # Arclength
//!
//! [`PathCurve::cumulative_arc_lengths`] integrates `|x'(s)|` with five-point
//! Gauss–Legendre quadrature on every knot interval, and
//! [`PathCurve::parameter_at_arc_length`] inverts it. Both are used when a
//! string is respaced or grown.

use crate::error::{PathError, Result};
use nalgebra::{DMatrix, DVector};

const GAUSS_NODES: [f64; 5] = [
    -0.906_179_845_938_664,
    -0.538_469_310_105_683_1,
    0.0,
    0.538_469_310_105_683_1,
    0.906_179_845_938_664,
];
const GAUSS_WEIGHTS: [f64; 5] = [
    0.236_926_885_056_189_1,
    0.478_628_670_499_366_5,
    0.568_888_888_888_888_9,
    0.478_628_670_499_366_5,
    0.236_926_885_056_189_1,
];

#[derive(Debug, Clone)]
enum Scheme {
    Linear,
    Quadratic,
    /// Second derivatives at the knots.
    Spline(Vec<DVector<f64>>),
}

/// Interpolating curve through a sequence of points.
#[derive(Debug, Clone)]
pub struct PathCurve {
    knots: Vec<f64>,
    values: Vec<DVector<f64>>,
    scheme: Scheme,
}

impl PathCurve {
    /// Builds the interpolant through `nodes` at parameters `params`.
    ///
    /// Parameters must be strictly increasing. With three nodes the middle
    /// parameter is ignored and replaced by the midpoint of the outer two; the
    /// parameters actually used are available from [`PathCurve::knots`].
    pub fn build(nodes: &[DVector<f64>], params: &[f64]) -> Result<Self> {
        if nodes.len() < 2 {
            return Err(PathError::InvalidPathSize {
                found: nodes.len(),
                minimum: 2,
            });
        }
        if params.len() != nodes.len() {
            return Err(PathError::DimensionMismatch {
                expected: nodes.len(),
                found: params.len(),
            });
        }
        let dim = nodes[0].len();
        if let Some(bad) = nodes.iter().find(|n| n.len() != dim) {
            return Err(PathError::DimensionMismatch {
                expected: dim,
                found: bad.len(),
            });
        }
        for i in 0..params.len() - 1 {
            if !(params[i + 1] > params[i]) {
                return Err(PathError::DegenerateSegment { index: i });
            }
        }

        let mut knots = params.to_vec();
        let scheme = match nodes.len() {
            2 => Scheme::Linear,
            3 => {
                knots[1] = 0.5 * (knots[0] + knots[2]);
                Scheme::Quadratic
            }
            _ => Scheme::Spline(not_a_knot_second_derivatives(nodes, &knots)?),
        };

        Ok(Self {
            knots,
            values: nodes.to_vec(),
            scheme,
        })
    }

    /// Builds a one-dimensional curve, e.g. energy against arclength.
    pub fn scalar(values: &[f64], params: &[f64]) -> Result<Self> {
        let nodes: Vec<DVector<f64>> = values
            .iter()
            .map(|&v| DVector::from_element(1, v))
            .collect();
        Self::build(&nodes, params)
    }

    /// Parameters at which the curve passes through its nodes.
    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always false; a curve has at least two nodes.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Dimension of the interpolated points.
    pub fn dimension(&self) -> usize {
        self.values[0].len()
    }

    /// First and last knot.
    pub fn domain(&self) -> (f64, f64) {
        (self.knots[0], self.knots[self.knots.len() - 1])
    }

    /// Position at parameter `s`.
    pub fn position(&self, s: f64) -> DVector<f64> {
        self.evaluate(s, 0)
    }

    /// First derivative with respect to the parameter. Not normalized.
    pub fn tangent(&self, s: f64) -> DVector<f64> {
        self.evaluate(s, 1)
    }

    /// Second derivative with respect to the parameter.
    pub fn second_derivative(&self, s: f64) -> DVector<f64> {
        self.evaluate(s, 2)
    }

    /// First component of the position, for scalar curves.
    pub fn value(&self, s: f64) -> f64 {
        self.position(s)[0]
    }

    /// First component of the tangent, for scalar curves.
    pub fn slope(&self, s: f64) -> f64 {
        self.tangent(s)[0]
    }

    fn interval(&self, s: f64) -> usize {
        let n = self.knots.len();
        self.knots
            .partition_point(|&k| k <= s)
            .saturating_sub(1)
            .min(n - 2)
    }

    fn evaluate(&self, s: f64, order: u8) -> DVector<f64> {
        match &self.scheme {
            Scheme::Linear => {
                let h = self.knots[1] - self.knots[0];
                let (y0, y1) = (&self.values[0], &self.values[1]);
                match order {
                    0 => {
                        let b = (s - self.knots[0]) / h;
                        y0 * (1.0 - b) + y1 * b
                    }
                    1 => (y1 - y0) / h,
                    _ => DVector::zeros(y0.len()),
                }
            }
            Scheme::Quadratic => {
                let span = self.knots[2] - self.knots[0];
                let u = (s - self.knots[0]) / span;
                let w = match order {
                    0 => [
                        2.0 * (u - 0.5) * (u - 1.0),
                        -4.0 * u * (u - 1.0),
                        2.0 * u * (u - 0.5),
                    ],
                    1 => [
                        (4.0 * u - 3.0) / span,
                        (4.0 - 8.0 * u) / span,
                        (4.0 * u - 1.0) / span,
                    ],
                    _ => {
                        let c = 1.0 / (span * span);
                        [4.0 * c, -8.0 * c, 4.0 * c]
                    }
                };
                &self.values[0] * w[0] + &self.values[1] * w[1] + &self.values[2] * w[2]
            }
            Scheme::Spline(m) => {
                let i = self.interval(s);
                let h = self.knots[i + 1] - self.knots[i];
                let a = (self.knots[i + 1] - s) / h;
                let b = (s - self.knots[i]) / h;
                let (y0, y1) = (&self.values[i], &self.values[i + 1]);
                let (m0, m1) = (&m[i], &m[i + 1]);
                match order {
                    0 => {
                        y0 * a
                            + y1 * b
                            + (m0 * (a * a * a - a) + m1 * (b * b * b - b)) * (h * h / 6.0)
                    }
                    1 => {
                        (y1 - y0) / h - m0 * ((3.0 * a * a - 1.0) * h / 6.0)
                            + m1 * ((3.0 * b * b - 1.0) * h / 6.0)
                    }
                    _ => m0 * a + m1 * b,
                }
            }
        }
    }

    /// Length of the curve between parameters `a` and `b` (signed by order).
    pub fn arc_length(&self, a: f64, b: f64) -> f64 {
        if b < a {
            return -self.arc_length(b, a);
        }
        let mut breaks = vec![a];
        breaks.extend(self.knots.iter().copied().filter(|&k| k > a && k < b));
        breaks.push(b);
        breaks
            .windows(2)
            .map(|w| self.gauss_legendre(w[0], w[1]))
            .sum()
    }

    fn gauss_legendre(&self, a: f64, b: f64) -> f64 {
        let half = 0.5 * (b - a);
        let mid = 0.5 * (a + b);
        GAUSS_NODES
            .iter()
            .zip(GAUSS_WEIGHTS.iter())
            .map(|(&x, &w)| w * self.tangent(mid + half * x).norm())
            .sum::<f64>()
            * half
    }

    /// Arclength from the first knot to every knot.
    pub fn cumulative_arc_lengths(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.knots.len());
        let mut total = 0.0;
        out.push(0.0);
        for w in self.knots.windows(2) {
            total += self.gauss_legendre(w[0], w[1]);
            out.push(total);
        }
        out
    }

    /// Parameter at which the arclength from the first knot equals `target`.
    ///
    /// Targets outside `[0, total length]` are clamped to the domain ends.
    pub fn parameter_at_arc_length(&self, target: f64) -> f64 {
        let cumulative = self.cumulative_arc_lengths();
        self.invert_arc_length(&cumulative, target)
    }

    fn invert_arc_length(&self, cumulative: &[f64], target: f64) -> f64 {
        let (first, last) = self.domain();
        let total = cumulative[cumulative.len() - 1];
        if target <= 0.0 {
            return first;
        }
        if target >= total {
            return last;
        }
        let i = cumulative
            .partition_point(|&c| c <= target)
            .saturating_sub(1)
            .min(cumulative.len() - 2);
        let (mut lo, mut hi) = (self.knots[i], self.knots[i + 1]);
        let remaining = target - cumulative[i];
        for _ in 0..60 {
            let mid = 0.5 * (lo + hi);
            if self.gauss_legendre(self.knots[i], mid) < remaining {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }

    /// Parameters of `count` points evenly spaced in arclength, ends included.
    pub fn even_arc_length_parameters(&self, count: usize) -> Vec<f64> {
        let cumulative = self.cumulative_arc_lengths();
        let total = cumulative[cumulative.len() - 1];
        let (first, last) = self.domain();
        if count < 2 {
            return vec![first; count];
        }
        (0..count)
            .map(|k| {
                if k == 0 {
                    first
                } else if k == count - 1 {
                    last
                } else {
                    let target = total * k as f64 / (count - 1) as f64;
                    self.invert_arc_length(&cumulative, target)
                }
            })
            .collect()
    }
}

/// Solves for the knot second derivatives of a not-a-knot cubic spline.
///
/// The end conditions make the third derivative continuous across the second
/// and the second-to-last knot, which reproduces any cubic exactly.
fn not_a_knot_second_derivatives(
    nodes: &[DVector<f64>],
    knots: &[f64],
) -> Result<Vec<DVector<f64>>> {
    let n = nodes.len();
    let dim = nodes[0].len();
    let h: Vec<f64> = knots.windows(2).map(|w| w[1] - w[0]).collect();

    let mut a = DMatrix::<f64>::zeros(n, n);
    let mut rhs = DMatrix::<f64>::zeros(n, dim);

    a[(0, 0)] = -h[1];
    a[(0, 1)] = h[0] + h[1];
    a[(0, 2)] = -h[0];

    for i in 1..n - 1 {
        a[(i, i - 1)] = h[i - 1];
        a[(i, i)] = 2.0 * (h[i - 1] + h[i]);
        a[(i, i + 1)] = h[i];
        let delta = (&nodes[i + 1] - &nodes[i]) / h[i] - (&nodes[i] - &nodes[i - 1]) / h[i - 1];
        for d in 0..dim {
            rhs[(i, d)] = 6.0 * delta[d];
        }
    }

    a[(n - 1, n - 3)] = -h[n - 2];
    a[(n - 1, n - 2)] = h[n - 3] + h[n - 2];
    a[(n - 1, n - 1)] = -h[n - 3];

    let solution = a
        .lu()
        .solve(&rhs)
        .ok_or_else(|| PathError::Interpolation("spline system is singular".to_string()))?;

    Ok((0..n)
        .map(|i| solution.row(i).transpose().into_owned())
        .collect())
}
