//! Chain-of-states data structures.
//!
//! This module provides the discretized path the optimizer works on:
//!
//! - [`Node`]: one bead, a position plus optionally cached energy and gradient
//! - [`Chain`]: an ordered sequence of at least three nodes with fixed endpoints
//!   and an arclength parameter per node
//! - [`PathStatistics`]: spacing summary used for regeneration decisions
//!
//! Positions live in an abstract D-dimensional space; the chain knows nothing
//! about atoms or units.

use crate::curve::PathCurve;
use crate::error::{PathError, Result};
use crate::oracle::{evaluate_checked, PotentialSurface};
use nalgebra::DVector;

/// Smallest chain the engine accepts: two endpoints and one movable bead.
pub const MIN_NODES: usize = 3;

/// One bead of the chain.
///
/// The energy and gradient are a cache of the last oracle evaluation at this
/// exact position. Moving the node clears them.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    position: DVector<f64>,
    energy: Option<f64>,
    gradient: Option<DVector<f64>>,
}

impl Node {
    /// Creates an unevaluated node.
    pub fn new(position: DVector<f64>) -> Self {
        Self {
            position,
            energy: None,
            gradient: None,
        }
    }

    /// Current position.
    pub fn position(&self) -> &DVector<f64> {
        &self.position
    }

    /// Cached energy, if the node has been evaluated at its current position.
    pub fn energy(&self) -> Option<f64> {
        self.energy
    }

    /// Cached gradient, if the node has been evaluated at its current position.
    pub fn gradient(&self) -> Option<&DVector<f64>> {
        self.gradient.as_ref()
    }

    /// True when both energy and gradient are cached.
    pub fn is_evaluated(&self) -> bool {
        self.energy.is_some() && self.gradient.is_some()
    }

    fn move_to(&mut self, position: DVector<f64>) {
        self.position = position;
        self.energy = None;
        self.gradient = None;
    }

    fn record(&mut self, energy: f64, gradient: DVector<f64>) {
        self.energy = Some(energy);
        self.gradient = Some(gradient);
    }
}

/// Ordered beads from a fixed start to a fixed end.
///
/// Each node carries a parameter equal to the cumulative chord length from the
/// first node, so the parameters are non-decreasing. Only interior nodes can be
/// moved; the endpoints are immutable for the lifetime of the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    nodes: Vec<Node>,
    params: Vec<f64>,
}

impl Chain {
    /// Builds a chain from bead positions.
    ///
    /// Fails with [`PathError::InvalidPathSize`] for fewer than three nodes and
    /// with [`PathError::DimensionMismatch`] if the positions differ in length.
    pub fn new(positions: Vec<DVector<f64>>) -> Result<Self> {
        Self::from_nodes(positions.into_iter().map(Node::new).collect())
    }

    /// Builds a chain from nodes, keeping whatever evaluations they carry.
    pub fn from_nodes(nodes: Vec<Node>) -> Result<Self> {
        if nodes.len() < MIN_NODES {
            return Err(PathError::InvalidPathSize {
                found: nodes.len(),
                minimum: MIN_NODES,
            });
        }
        let dim = nodes[0].position.len();
        for node in &nodes {
            if node.position.len() != dim {
                return Err(PathError::DimensionMismatch {
                    expected: dim,
                    found: node.position.len(),
                });
            }
            if let Some(g) = &node.gradient {
                if g.len() != dim {
                    return Err(PathError::DimensionMismatch {
                        expected: dim,
                        found: g.len(),
                    });
                }
            }
        }
        let params = cumulative_chord(&nodes);
        Ok(Self { nodes, params })
    }

    /// Straight-line discretization with `count` evenly spaced beads.
    pub fn linear(start: &DVector<f64>, end: &DVector<f64>, count: usize) -> Result<Self> {
        if count < MIN_NODES {
            return Err(PathError::InvalidPathSize {
                found: count,
                minimum: MIN_NODES,
            });
        }
        let positions = (0..count)
            .map(|i| {
                let t = i as f64 / (count - 1) as f64;
                start * (1.0 - t) + end * t
            })
            .collect();
        Self::new(positions)
    }

    /// Number of beads including endpoints.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; a chain has at least three beads.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of movable beads.
    pub fn interior_len(&self) -> usize {
        self.nodes.len() - 2
    }

    /// Dimension shared by all positions.
    pub fn dimension(&self) -> usize {
        self.nodes[0].position.len()
    }

    /// All nodes in order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node `index`.
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// Cumulative chord length at every node.
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Parameters rescaled to `[0, 1]`.
    pub fn normalized_params(&self) -> Result<Vec<f64>> {
        let total = self.params[self.params.len() - 1];
        if total <= 0.0 {
            return Err(PathError::DegenerateSegment { index: 0 });
        }
        Ok(self.params.iter().map(|p| p / total).collect())
    }

    /// Copies of all positions.
    pub fn positions(&self) -> Vec<DVector<f64>> {
        self.nodes.iter().map(|n| n.position.clone()).collect()
    }

    /// Copies of the interior positions.
    pub fn interior_positions(&self) -> Vec<DVector<f64>> {
        self.nodes[1..self.nodes.len() - 1]
            .iter()
            .map(|n| n.position.clone())
            .collect()
    }

    /// Moves every interior node. Cached evaluations of moved nodes are dropped.
    pub fn set_interior_positions(&mut self, positions: &[DVector<f64>]) -> Result<()> {
        if positions.len() != self.interior_len() {
            return Err(PathError::DimensionMismatch {
                expected: self.interior_len(),
                found: positions.len(),
            });
        }
        let dim = self.dimension();
        if let Some(bad) = positions.iter().find(|p| p.len() != dim) {
            return Err(PathError::DimensionMismatch {
                expected: dim,
                found: bad.len(),
            });
        }
        for (node, position) in self.nodes[1..].iter_mut().zip(positions) {
            if node.position != *position {
                node.move_to(position.clone());
            }
        }
        self.params = cumulative_chord(&self.nodes);
        Ok(())
    }

    /// Stores an oracle result on node `index`.
    pub fn record_evaluation(&mut self, index: usize, energy: f64, gradient: DVector<f64>) -> Result<()> {
        if gradient.len() != self.dimension() {
            return Err(PathError::DimensionMismatch {
                expected: self.dimension(),
                found: gradient.len(),
            });
        }
        self.nodes[index].record(energy, gradient);
        Ok(())
    }

    /// Evaluates every node without a cached result in one batch.
    ///
    /// Returns how many nodes were evaluated.
    pub fn evaluate_missing<S: PotentialSurface + ?Sized>(&mut self, surface: &S) -> Result<usize> {
        let missing = self.unevaluated();
        if missing.is_empty() {
            return Ok(0);
        }
        let positions: Vec<DVector<f64>> = missing
            .iter()
            .map(|&i| self.nodes[i].position.clone())
            .collect();
        let results = evaluate_checked(surface, &positions)?;
        for (&i, result) in missing.iter().zip(results) {
            self.record_evaluation(i, result.energy, result.gradient)?;
        }
        Ok(missing.len())
    }

    /// Indices of nodes without a cached evaluation.
    pub fn unevaluated(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| !self.nodes[i].is_evaluated())
            .collect()
    }

    /// Energies of all nodes.
    pub fn energies(&self) -> Result<Vec<f64>> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| n.energy.ok_or(PathError::MissingEnergies(i)))
            .collect()
    }

    /// Gradients of all nodes.
    pub fn gradients(&self) -> Result<Vec<DVector<f64>>> {
        self.nodes
            .iter()
            .map(|n| n.gradient.clone().ok_or(PathError::MissingGradients))
            .collect()
    }

    /// Euclidean distance between consecutive beads.
    pub fn segment_lengths(&self) -> Vec<f64> {
        segment_lengths(&self.positions())
    }

    /// Interpolating curve through the beads, parametrized by chord length.
    pub fn curve(&self) -> Result<PathCurve> {
        PathCurve::build(&self.positions(), &self.params)
    }

    /// Replaces the interior with `count - 2` beads, keeping the endpoints.
    ///
    /// The new beads sit on the current interpolating curve at evenly spaced
    /// arclength fractions. The chord parameters are then refined a few times
    /// so that the straight-line distances between new neighbours come out
    /// equal as well; those are what spacing checks look at.
    pub fn respaced(&self, count: usize) -> Result<Chain> {
        if count < MIN_NODES {
            return Err(PathError::InvalidPathSize {
                found: count,
                minimum: MIN_NODES,
            });
        }
        let curve = self.curve()?;
        let mut params = curve.even_arc_length_parameters(count);
        for _ in 0..8 {
            let points: Vec<_> = params.iter().map(|&s| curve.position(s)).collect();
            let chords = chord_parameters(&points);
            let total = chords[chords.len() - 1];
            if total <= 0.0 {
                return Err(PathError::DegenerateSegment { index: 0 });
            }
            let mut refined = params.clone();
            for (k, slot) in refined.iter_mut().enumerate().take(count - 1).skip(1) {
                let target = total * k as f64 / (count - 1) as f64;
                let j = chords
                    .partition_point(|&c| c <= target)
                    .saturating_sub(1)
                    .min(count - 2);
                let span = chords[j + 1] - chords[j];
                let frac = if span > 0.0 { (target - chords[j]) / span } else { 0.0 };
                *slot = params[j] + frac * (params[j + 1] - params[j]);
            }
            params = refined;
        }

        let last = self.nodes.len() - 1;
        let mut nodes = Vec::with_capacity(count);
        nodes.push(self.nodes[0].clone());
        for &s in &params[1..count - 1] {
            nodes.push(Node::new(curve.position(s)));
        }
        nodes.push(self.nodes[last].clone());
        Chain::from_nodes(nodes)
    }

    /// Length and spacing summary.
    pub fn statistics(&self) -> PathStatistics {
        PathStatistics::from_segments(&self.segment_lengths())
    }
}

/// Spacing summary of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct PathStatistics {
    /// Sum of all segment lengths
    pub path_length: f64,
    /// Number of beads
    pub num_points: usize,
    /// Shortest segment
    pub min_spacing: f64,
    /// Longest segment
    pub max_spacing: f64,
    /// Mean segment length
    pub mean_spacing: f64,
    /// Largest deviation of a segment from the mean, relative to the mean
    pub disparity: f64,
}

impl PathStatistics {
    fn from_segments(segments: &[f64]) -> Self {
        let path_length: f64 = segments.iter().sum();
        let mean_spacing = path_length / segments.len() as f64;
        let min_spacing = segments.iter().copied().fold(f64::INFINITY, f64::min);
        let max_spacing = segments.iter().copied().fold(0.0, f64::max);
        let disparity = if mean_spacing > 0.0 {
            segments
                .iter()
                .map(|d| (d - mean_spacing).abs() / mean_spacing)
                .fold(0.0, f64::max)
        } else {
            f64::INFINITY
        };
        Self {
            path_length,
            num_points: segments.len() + 1,
            min_spacing,
            max_spacing,
            mean_spacing,
            disparity,
        }
    }
}

/// Distances between consecutive positions.
pub fn segment_lengths(positions: &[DVector<f64>]) -> Vec<f64> {
    positions.windows(2).map(|w| (&w[1] - &w[0]).norm()).collect()
}

/// Cumulative chord length at every position, starting from zero.
pub fn chord_parameters(positions: &[DVector<f64>]) -> Vec<f64> {
    let mut params = Vec::with_capacity(positions.len());
    let mut total = 0.0;
    params.push(0.0);
    for d in segment_lengths(positions) {
        total += d;
        params.push(total);
    }
    params
}

fn cumulative_chord(nodes: &[Node]) -> Vec<f64> {
    let positions: Vec<_> = nodes.iter().map(|n| n.position.clone()).collect();
    chord_parameters(&positions)
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

    #[test]
    fn test_chain_requires_three_nodes() {
        let err = Chain::new(vec![point(0.0, 0.0), point(1.0, 0.0)]).unwrap_err();
        assert!(matches!(err, PathError::InvalidPathSize { found: 2, minimum: 3 }));
    }

    #[test]
    fn test_chain_rejects_mixed_dimensions() {
        let err = Chain::new(vec![
            point(0.0, 0.0),
            DVector::zeros(3),
            point(1.0, 0.0),
        ])
        .unwrap_err();
        assert!(matches!(err, PathError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_params_are_cumulative_chords() {
        let chain = Chain::new(vec![point(0.0, 0.0), point(3.0, 4.0), point(3.0, 5.0)]).unwrap();
        assert_eq!(chain.params(), &[0.0, 5.0, 6.0]);
        let normalized = chain.normalized_params().unwrap();
        assert!(approx_eq(normalized[1], 5.0 / 6.0, 1e-15));
    }

    #[test]
    fn test_moving_interior_clears_cache() {
        let mut chain = Chain::linear(&point(0.0, 0.0), &point(2.0, 0.0), 3).unwrap();
        chain.record_evaluation(1, 1.0, point(0.0, 1.0)).unwrap();
        chain.record_evaluation(0, 0.0, point(0.0, 0.0)).unwrap();
        chain.set_interior_positions(&[point(1.0, 0.5)]).unwrap();
        assert!(chain.node(1).energy().is_none());
        assert_eq!(chain.node(0).energy(), Some(0.0));
        assert_eq!(chain.unevaluated(), vec![1, 2]);
    }

    #[test]
    fn test_respaced_keeps_endpoints_and_evens_spacing() {
        let positions: Vec<_> = [0.0, 0.1, 0.25, 1.2, 2.6, 3.0]
            .iter()
            .map(|&t: &f64| point(t, (t * 0.8).sin()))
            .collect();
        let mut chain = Chain::new(positions).unwrap();
        chain.record_evaluation(0, -1.0, point(0.0, 0.0)).unwrap();
        let respaced = chain.respaced(8).unwrap();
        assert_eq!(respaced.len(), 8);
        assert_eq!(respaced.node(0), chain.node(0));
        assert_eq!(respaced.node(7).position(), chain.node(5).position());
        assert!(respaced.statistics().disparity < 1e-3);
    }

    #[test]
    fn test_statistics() {
        let chain = Chain::new(vec![point(0.0, 0.0), point(1.0, 0.0), point(4.0, 0.0)]).unwrap();
        let stats = chain.statistics();
        assert_eq!(stats.path_length, 4.0);
        assert_eq!(stats.min_spacing, 1.0);
        assert_eq!(stats.max_spacing, 3.0);
        assert!(approx_eq(stats.disparity, 0.5, 1e-15));
    }
}
