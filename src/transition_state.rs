//! Transition-state estimation on a finished path.
//!
//! [`PathTools`] takes the beads of an optimized path (positions, energies,
//! optionally gradients, and their arclength parameters) and extracts
//! approximate saddle points with six interchangeable estimators:
//!
//! | Estimator | Idea |
//! |-----------|------|
//! | `highest` | the highest bead |
//! | `spline` | root of `dE/ds` of the energy spline inside every rising-falling bracket |
//! | `spline-average` | midpoint of the two beads bracketing a maximum |
//! | `spline-cubic` | maximum of the Hermite cubic built from bracket energies and slopes |
//! | `bell` | densest sample maximum of the energy spline, position interpolated linearly |
//! | `three-point` | least-squares parabola through the three beads around the highest one |
//!
//! Slopes along the path are the bead gradients projected on the path
//! derivative `x'(s)` when gradients are known, and the slope of the energy
//! spline otherwise.
//!
//! Estimators that find nothing return an empty list. Candidates are ranked in
//! ascending energy with ties broken on bead indices, so the best estimate is
//! the last one.
//!
//! # Reaction modes
//!
//! For every candidate [`PathTools::analyse`] approximates the reaction
//! coordinate four ways: the chord between the bracketing beads, that chord
//! mapped through the Jacobian of a [`CoordinateMap`], the mapped end-to-end
//! chord of the whole path, and the mapped curve tangent. It also reports the
//! curvature of the energy profile and the parallel/perpendicular gradient at
//! the bracketing beads.

use crate::chain::{chord_parameters, Chain};
use crate::curve::PathCurve;
use crate::error::{PathError, Result};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Samples taken by the bell estimator across the whole path.
const BELL_SAMPLES: usize = 1000;
/// Largest accepted `(dE/ds)²` at a spline root.
const SPLINE_RESIDUAL: f64 = 1e-10;
const ROOT_ITERATIONS: usize = 200;

/// Available estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TsEstimator {
    /// Highest bead
    Highest,
    /// Root of the energy spline slope
    Spline,
    /// Midpoint of the bracketing beads
    SplineAverage,
    /// Hermite cubic on the bracket
    SplineCubic,
    /// Dense sampling of the energy spline
    Bell,
    /// Quadratic fit around the highest bead
    ThreePoint,
}

impl TsEstimator {
    /// Every estimator, in reporting order.
    pub const ALL: [TsEstimator; 6] = [
        TsEstimator::Highest,
        TsEstimator::Spline,
        TsEstimator::SplineAverage,
        TsEstimator::SplineCubic,
        TsEstimator::Bell,
        TsEstimator::ThreePoint,
    ];

    /// Configuration name.
    pub fn name(self) -> &'static str {
        match self {
            TsEstimator::Highest => "highest",
            TsEstimator::Spline => "spline",
            TsEstimator::SplineAverage => "spline-average",
            TsEstimator::SplineCubic => "spline-cubic",
            TsEstimator::Bell => "bell",
            TsEstimator::ThreePoint => "three-point",
        }
    }
}

impl fmt::Display for TsEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TsEstimator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "highest" => Ok(Self::Highest),
            "spline" => Ok(Self::Spline),
            "spline-average" | "splineavg" => Ok(Self::SplineAverage),
            "spline-cubic" | "splinecubic" => Ok(Self::SplineCubic),
            "bell" => Ok(Self::Bell),
            "three-point" | "threepoint" => Ok(Self::ThreePoint),
            other => Err(format!("unknown TS estimator: {}", other)),
        }
    }
}

/// One transition-state estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct TsCandidate {
    /// Estimated energy
    pub energy: f64,
    /// Estimated position
    pub position: DVector<f64>,
    /// Estimated gradient, if the estimator produces one
    pub gradient: Option<DVector<f64>>,
    /// Parameter of the left bracketing bead
    pub left_param: f64,
    /// Parameter of the right bracketing bead
    pub right_param: f64,
    /// Parameter of the estimate, within `[left_param, right_param]`
    pub ts_param: f64,
    /// Index of the left bracketing bead
    pub left_bead: usize,
    /// Index of the right bracketing bead
    pub right_bead: usize,
}

/// Ascending energy, then left bead, then right bead.
pub fn compare_candidates(a: &TsCandidate, b: &TsCandidate) -> Ordering {
    a.energy
        .total_cmp(&b.energy)
        .then(a.left_bead.cmp(&b.left_bead))
        .then(a.right_bead.cmp(&b.right_bead))
}

/// Stable sort with [`compare_candidates`].
pub fn sort_candidates(candidates: &mut [TsCandidate]) {
    candidates.sort_by(compare_candidates);
}

/// Linearization of a map from path coordinates into another representation.
pub trait CoordinateMap {
    /// Jacobian of the map at `position`; columns index path coordinates.
    fn jacobian(&self, position: &DVector<f64>) -> DMatrix<f64>;
}

/// The path coordinates themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMap;

impl CoordinateMap for IdentityMap {
    fn jacobian(&self, position: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::identity(position.len(), position.len())
    }
}

/// One approximation of the reaction coordinate direction.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionModeEstimate {
    /// How the direction was obtained
    pub label: &'static str,
    /// Unit vector
    pub vector: DVector<f64>,
}

/// Gradient split at a bracketing bead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborForce {
    /// Bead index
    pub bead: usize,
    /// Gradient component along the path
    pub parallel: f64,
    /// Norm of the gradient component across the path
    pub perpendicular: f64,
}

/// Mode and curvature information attached to a candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeAnalysis {
    /// Up to four reaction-mode estimates
    pub modes: Vec<ReactionModeEstimate>,
    /// `d²E/ds²` of the energy spline at the candidate
    pub energy_curvature: f64,
    /// Gradient split at the bracketing beads; empty without gradients
    pub neighbor_forces: Vec<NeighborForce>,
}

/// A candidate together with the estimator that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TsEstimate {
    /// Producing estimator
    pub estimator: TsEstimator,
    /// The estimate
    pub candidate: TsCandidate,
    /// Modes and curvature at the estimate
    pub analysis: ModeAnalysis,
}

/// Bisection for a sign change of `f` on `[a, b]` with `f(a) > 0 >= f(b)`.
fn bracketed_root<F: Fn(f64) -> f64>(f: F, mut a: f64, mut b: f64) -> f64 {
    for _ in 0..ROOT_ITERATIONS {
        let mid = 0.5 * (a + b);
        if mid <= a || mid >= b {
            break;
        }
        if f(mid) > 0.0 {
            a = mid;
        } else {
            b = mid;
        }
    }
    0.5 * (a + b)
}

/// Real roots of `A u² + B u + C`, stable for tiny `A`.
fn quadratic_roots(qa: f64, qb: f64, qc: f64) -> Vec<f64> {
    let disc = qb * qb - 4.0 * qa * qc;
    if disc < 0.0 {
        return Vec::new();
    }
    let q = -0.5 * (qb + qb.signum() * disc.sqrt());
    let mut roots = Vec::with_capacity(2);
    if q != 0.0 {
        roots.push(qc / q);
        if qa != 0.0 {
            roots.push(q / qa);
        }
    } else if qa != 0.0 {
        // B = 0 and disc = 0, so the double root is at zero
        roots.push(0.0);
    }
    roots
}

fn lagrange_weights(nodes: [f64; 3], s: f64) -> [f64; 3] {
    let [a, b, c] = nodes;
    [
        (s - b) * (s - c) / ((a - b) * (a - c)),
        (s - a) * (s - c) / ((b - a) * (b - c)),
        (s - a) * (s - b) / ((c - a) * (c - b)),
    ]
}

/// Transition-state estimators over a discretized path.
#[derive(Debug, Clone)]
pub struct PathTools {
    positions: Vec<DVector<f64>>,
    energies: Vec<f64>,
    gradients: Option<Vec<DVector<f64>>>,
    steps: Vec<f64>,
    position_curve: PathCurve,
    energy_curve: PathCurve,
}

impl PathTools {
    /// Prepares the estimators.
    ///
    /// `steps` are the bead parameters and default to the cumulative chord
    /// length. They must be strictly increasing. With three beads the middle
    /// parameter is replaced by the midpoint, as the interpolating curve does.
    pub fn new(
        positions: Vec<DVector<f64>>,
        energies: Vec<f64>,
        gradients: Option<Vec<DVector<f64>>>,
        steps: Option<Vec<f64>>,
    ) -> Result<Self> {
        let n = positions.len();
        if n < 2 {
            return Err(PathError::InvalidPathSize {
                found: n,
                minimum: 2,
            });
        }
        if energies.len() != n {
            return Err(PathError::DimensionMismatch {
                expected: n,
                found: energies.len(),
            });
        }
        if let Some(gradients) = &gradients {
            if gradients.len() != n {
                return Err(PathError::DimensionMismatch {
                    expected: n,
                    found: gradients.len(),
                });
            }
            let dim = positions[0].len();
            if let Some(bad) = gradients.iter().find(|g| g.len() != dim) {
                return Err(PathError::DimensionMismatch {
                    expected: dim,
                    found: bad.len(),
                });
            }
        }

        let steps = steps.unwrap_or_else(|| chord_parameters(&positions));
        let position_curve = PathCurve::build(&positions, &steps)?;
        let energy_curve = PathCurve::scalar(&energies, &steps)?;
        let steps = position_curve.knots().to_vec();

        Ok(Self {
            positions,
            energies,
            gradients,
            steps,
            position_curve,
            energy_curve,
        })
    }

    /// Estimators over an evaluated chain, parametrized by its chord lengths.
    pub fn from_chain(chain: &Chain) -> Result<Self> {
        Self::new(
            chain.positions(),
            chain.energies()?,
            Some(chain.gradients()?),
            Some(chain.params().to_vec()),
        )
    }

    /// Number of beads.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Always false; at least two beads are required.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Bead parameters.
    pub fn steps(&self) -> &[f64] {
        &self.steps
    }

    /// Bead energies.
    pub fn energies(&self) -> &[f64] {
        &self.energies
    }

    /// Energy profile as a function of the path parameter.
    pub fn energy_curve(&self) -> &PathCurve {
        &self.energy_curve
    }

    /// `dE/ds` at every bead.
    pub fn bead_slopes(&self) -> Vec<f64> {
        match &self.gradients {
            Some(gradients) => gradients
                .iter()
                .zip(&self.steps)
                .map(|(g, &s)| g.dot(&self.position_curve.tangent(s)))
                .collect(),
            None => self
                .steps
                .iter()
                .map(|&s| self.energy_curve.slope(s))
                .collect(),
        }
    }

    fn candidate(&self, energy: f64, ts_param: f64, left: usize, right: usize) -> TsCandidate {
        TsCandidate {
            energy,
            position: self.position_curve.position(ts_param),
            gradient: None,
            left_param: self.steps[left],
            right_param: self.steps[right],
            ts_param,
            left_bead: left,
            right_bead: right,
        }
    }

    /// Brackets `(i, i + 1)` that contain an energy maximum.
    fn maximum_brackets(&self, slopes: &[f64]) -> Vec<usize> {
        (0..self.len() - 1)
            .filter(|&i| {
                let (e0, e1) = (self.energies[i], self.energies[i + 1]);
                (e1 >= e0 && slopes[i + 1] <= 0.0) || (e1 <= e0 && slopes[i] > 0.0)
            })
            .collect()
    }

    /// The highest bead. Always exactly one candidate.
    ///
    /// Among beads of equal energy the one with the lowest index wins.
    pub fn highest(&self) -> TsCandidate {
        let (i, &energy) = self
            .energies
            .iter()
            .enumerate()
            .reduce(|best, next| if next.1 > best.1 { next } else { best })
            .unwrap_or((0, &self.energies[0]));
        TsCandidate {
            energy,
            position: self.positions[i].clone(),
            gradient: self.gradients.as_ref().map(|g| g[i].clone()),
            left_param: self.steps[i],
            right_param: self.steps[i],
            ts_param: self.steps[i],
            left_bead: i,
            right_bead: i,
        }
    }

    /// Roots of the energy spline slope in every bracket where it turns from
    /// rising to falling.
    ///
    /// Both end slopes must be strictly signed, so a maximum sitting exactly on
    /// a bead yields no root here; [`PathTools::highest`] reports it.
    pub fn spline(&self) -> Vec<TsCandidate> {
        let curve = &self.energy_curve;
        let mut found = Vec::new();
        for i in 0..self.len() - 1 {
            let (a, b) = (self.steps[i], self.steps[i + 1]);
            if !(curve.slope(a) > 0.0 && curve.slope(b) < 0.0) {
                continue;
            }
            let s = bracketed_root(|s| curve.slope(s), a, b);
            let residual = curve.slope(s).powi(2);
            if residual < SPLINE_RESIDUAL {
                found.push(self.candidate(curve.value(s), s, i, i + 1));
            } else {
                debug!("Rejected spline root in bracket {} (residual {:.3e})", i, residual);
            }
        }
        found
    }

    /// Midpoint of every bracket that holds a maximum.
    pub fn spline_average(&self) -> Vec<TsCandidate> {
        let slopes = self.bead_slopes();
        self.maximum_brackets(&slopes)
            .into_iter()
            .map(|i| TsCandidate {
                energy: 0.5 * (self.energies[i] + self.energies[i + 1]),
                position: (&self.positions[i] + &self.positions[i + 1]) * 0.5,
                gradient: None,
                left_param: self.steps[i],
                right_param: self.steps[i + 1],
                ts_param: 0.5 * (self.steps[i] + self.steps[i + 1]),
                left_bead: i,
                right_bead: i + 1,
            })
            .collect()
    }

    /// Maxima of the cubic matching energies and slopes at both ends of every
    /// bracket that holds a maximum.
    pub fn spline_cubic(&self) -> Vec<TsCandidate> {
        let slopes = self.bead_slopes();
        let mut found = Vec::new();
        for i in self.maximum_brackets(&slopes) {
            let (s0, s1) = (self.steps[i], self.steps[i + 1]);
            let h = s1 - s0;
            let (e0, e1) = (self.energies[i], self.energies[i + 1]);
            let (d0, d1) = (slopes[i], slopes[i + 1]);

            // E(s0 + u) = a u³ + b u² + d0 u + e0
            let secant = (e1 - e0) / h;
            let b = (3.0 * secant - 2.0 * d0 - d1) / h;
            let a = (d0 + d1 - 2.0 * secant) / (h * h);
            let tol = 1e-12 * h;

            for u in quadratic_roots(3.0 * a, 2.0 * b, d0) {
                if u < -tol || u > h + tol || 6.0 * a * u + 2.0 * b >= 0.0 {
                    continue;
                }
                let u = u.clamp(0.0, h);
                let energy = ((a * u + b) * u + d0) * u + e0;
                found.push(self.candidate(energy, s0 + u, i, i + 1));
            }
        }
        found
    }

    /// Highest of [`BELL_SAMPLES`] evenly spaced samples of the energy spline.
    ///
    /// The position is interpolated linearly between the bracketing beads.
    /// Returns nothing if the first sample is the highest.
    pub fn bell(&self) -> Vec<TsCandidate> {
        let (start, end) = self.energy_curve.domain();
        let (best, _) = (0..BELL_SAMPLES)
            .map(|k| {
                let s = start + (end - start) * k as f64 / BELL_SAMPLES as f64;
                (s, self.energy_curve.value(s))
            })
            .fold((start, f64::NEG_INFINITY), |acc, (s, e)| {
                if e > acc.1 {
                    (s, e)
                } else {
                    acc
                }
            });
        if best <= start {
            return Vec::new();
        }

        let right = self
            .steps
            .partition_point(|&s| s < best)
            .clamp(1, self.len() - 1);
        let left = right - 1;
        let frac = (best - self.steps[left]) / (self.steps[right] - self.steps[left]);
        let position =
            &self.positions[left] + (&self.positions[right] - &self.positions[left]) * frac;

        vec![TsCandidate {
            energy: self.energy_curve.value(best),
            position,
            gradient: None,
            left_param: self.steps[left],
            right_param: self.steps[right],
            ts_param: best,
            left_bead: left,
            right_bead: right,
        }]
    }

    /// Least-squares parabola `E(s)` through the highest bead and its two
    /// neighbours, fitted to their energies and, if known, their slopes.
    ///
    /// Position and gradient are quadratic interpolants of the three beads.
    /// At the path ends the triple shifts inwards. A maximum outside the triple
    /// is clamped into it with a warning.
    pub fn three_point(&self) -> Result<Vec<TsCandidate>> {
        let n = self.len();
        if n < 3 {
            return Ok(Vec::new());
        }
        let top = self.highest().left_bead;
        let mid = top.clamp(1, n - 2);
        let beads = [mid - 1, mid, mid + 1];
        let origin = self.steps[mid];
        let slopes = self.gradients.as_ref().map(|_| self.bead_slopes());

        let mut rows: Vec<f64> = Vec::with_capacity(18);
        let mut rhs: Vec<f64> = Vec::with_capacity(6);
        for &j in &beads {
            let u = self.steps[j] - origin;
            rows.extend_from_slice(&[u * u, u, 1.0]);
            rhs.push(self.energies[j]);
        }
        if let Some(slopes) = &slopes {
            for &j in &beads {
                let u = self.steps[j] - origin;
                rows.extend_from_slice(&[2.0 * u, 1.0, 0.0]);
                rhs.push(slopes[j]);
            }
        }
        let system = DMatrix::from_row_slice(rhs.len(), 3, &rows);
        let coefficients = system
            .svd(true, true)
            .solve(&DVector::from_vec(rhs), 1e-14)
            .map_err(|e| PathError::Interpolation(e.to_string()))?;
        let (qa, qb, qc) = (coefficients[0], coefficients[1], coefficients[2]);

        if !(qa < 0.0) {
            debug!("Three-point fit has no maximum (curvature {:.3e})", qa);
            return Ok(Vec::new());
        }

        let (lo, hi) = (self.steps[beads[0]], self.steps[beads[2]]);
        let mut s = origin - qb / (2.0 * qa);
        if s < lo || s > hi {
            warn!(
                "Three-point maximum at s = {:.4} lies outside beads {}..{} ([{:.4}, {:.4}]), clamping",
                s, beads[0], beads[2], lo, hi
            );
            s = s.clamp(lo, hi);
        }
        let u = s - origin;
        let energy = (qa * u + qb) * u + qc;

        let weights = lagrange_weights([lo, origin, hi], s);
        let blend = |values: &[DVector<f64>]| -> DVector<f64> {
            beads
                .iter()
                .zip(weights)
                .fold(DVector::zeros(values[0].len()), |acc, (&j, w)| acc + &values[j] * w)
        };
        let position = blend(&self.positions[..]);
        let gradient = self.gradients.as_deref().map(blend);

        let (left, right) = if s <= origin {
            (beads[0], mid)
        } else {
            (mid, beads[2])
        };
        Ok(vec![TsCandidate {
            energy,
            position,
            gradient,
            left_param: self.steps[left],
            right_param: self.steps[right],
            ts_param: s,
            left_bead: left,
            right_bead: right,
        }])
    }

    /// Candidates of one estimator in ascending order.
    pub fn candidates(&self, estimator: TsEstimator) -> Result<Vec<TsCandidate>> {
        let mut found = match estimator {
            TsEstimator::Highest => vec![self.highest()],
            TsEstimator::Spline => self.spline(),
            TsEstimator::SplineAverage => self.spline_average(),
            TsEstimator::SplineCubic => self.spline_cubic(),
            TsEstimator::Bell => self.bell(),
            TsEstimator::ThreePoint => self.three_point()?,
        };
        sort_candidates(&mut found);
        Ok(found)
    }

    fn bracket(&self, candidate: &TsCandidate) -> (usize, usize) {
        let (left, right) = (candidate.left_bead, candidate.right_bead);
        if left == right {
            (left.saturating_sub(1), (right + 1).min(self.len() - 1))
        } else {
            (left, right)
        }
    }

    /// Up to four unit reaction-mode estimates at `candidate`.
    ///
    /// Directions that vanish are skipped.
    pub fn modes(&self, candidate: &TsCandidate, map: &dyn CoordinateMap) -> Vec<ReactionModeEstimate> {
        let (left, right) = self.bracket(candidate);
        let chord = &self.positions[right] - &self.positions[left];
        let jacobian = map.jacobian(&candidate.position);
        let path_chord = &self.positions[self.len() - 1] - &self.positions[0];
        let tangent = self.position_curve.tangent(candidate.ts_param);

        [
            ("bead-chord", chord.clone()),
            ("mapped-bead-chord", &jacobian * &chord),
            ("mapped-path-chord", &jacobian * &path_chord),
            ("mapped-curve-tangent", &jacobian * &tangent),
        ]
        .into_iter()
        .filter_map(|(label, v)| {
            let norm = v.norm();
            (norm > 0.0 && norm.is_finite()).then(|| ReactionModeEstimate {
                label,
                vector: v / norm,
            })
        })
        .collect()
    }

    /// `d²E/ds²` of the energy spline at `s`.
    pub fn energy_curvature(&self, s: f64) -> f64 {
        self.energy_curve.second_derivative(s)[0]
    }

    /// Gradient split along and across the path at the bracketing beads.
    pub fn neighbor_forces(&self, candidate: &TsCandidate) -> Vec<NeighborForce> {
        let Some(gradients) = &self.gradients else {
            return Vec::new();
        };
        let (left, right) = self.bracket(candidate);
        let beads = if left == right { vec![left] } else { vec![left, right] };
        beads
            .into_iter()
            .filter_map(|bead| {
                let tangent = self.position_curve.tangent(self.steps[bead]);
                let norm = tangent.norm();
                if norm == 0.0 {
                    return None;
                }
                let tangent = tangent / norm;
                let g = &gradients[bead];
                let parallel = g.dot(&tangent);
                Some(NeighborForce {
                    bead,
                    parallel,
                    perpendicular: (g - &tangent * parallel).norm(),
                })
            })
            .collect()
    }

    /// Modes, curvature and neighbour forces at `candidate`.
    pub fn analyse(&self, candidate: &TsCandidate, map: &dyn CoordinateMap) -> ModeAnalysis {
        ModeAnalysis {
            modes: self.modes(candidate, map),
            energy_curvature: self.energy_curvature(candidate.ts_param),
            neighbor_forces: self.neighbor_forces(candidate),
        }
    }

    /// Runs `estimators` in order and analyses every candidate in the path
    /// coordinates.
    pub fn estimate(&self, estimators: &[TsEstimator]) -> Result<Vec<TsEstimate>> {
        self.estimate_with_map(estimators, &IdentityMap)
    }

    /// Like [`PathTools::estimate`] with modes mapped through `map`.
    pub fn estimate_with_map(
        &self,
        estimators: &[TsEstimator],
        map: &dyn CoordinateMap,
    ) -> Result<Vec<TsEstimate>> {
        let mut estimates = Vec::new();
        for &estimator in estimators {
            for candidate in self.candidates(estimator)? {
                let analysis = self.analyse(&candidate, map);
                estimates.push(TsEstimate {
                    estimator,
                    candidate,
                    analysis,
                });
            }
        }
        Ok(estimates)
    }
}
