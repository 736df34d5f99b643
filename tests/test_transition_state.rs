use cospath::transition_state::{compare_candidates, CoordinateMap};
use cospath::{Chain, DoubleWell, PathError, PathTools, TsEstimator};
use nalgebra::{DMatrix, DVector};
use std::cmp::Ordering;

fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() < epsilon
}

/// Eleven evaluated beads on the double-well minimum energy path y = 0.
fn double_well_path() -> PathTools {
    let start = DVector::from_vec(vec![-1.0, 0.0]);
    let end = DVector::from_vec(vec![1.0, 0.0]);
    let mut chain = Chain::linear(&start, &end, 11).unwrap();
    chain.evaluate_missing(&DoubleWell::default()).unwrap();
    PathTools::from_chain(&chain).unwrap()
}

/// Ten beads on the same path; the barrier falls between beads 4 and 5.
fn straddled_double_well_path() -> PathTools {
    let start = DVector::from_vec(vec![-1.0, 0.0]);
    let end = DVector::from_vec(vec![1.0, 0.0]);
    let mut chain = Chain::linear(&start, &end, 10).unwrap();
    chain.evaluate_missing(&DoubleWell::default()).unwrap();
    PathTools::from_chain(&chain).unwrap()
}

/// Doubles the first coordinate.
struct Stretch;

impl CoordinateMap for Stretch {
    fn jacobian(&self, position: &DVector<f64>) -> DMatrix<f64> {
        let mut j = DMatrix::identity(position.len(), position.len());
        j[(0, 0)] = 2.0;
        j
    }
}

#[test]
fn test_estimators_find_double_well_barrier() {
    let tools = double_well_path();

    let highest = tools.highest();
    assert_eq!(highest.left_bead, 5);
    assert!(approx_eq(highest.energy, 1.0, 1e-12));

    let three_point = tools.candidates(TsEstimator::ThreePoint).unwrap();
    assert_eq!(three_point.len(), 1);
    assert!(three_point[0].position[0].abs() < 1e-9);
    assert!(approx_eq(three_point[0].energy, 1.0, 2e-2));
    assert!(three_point[0].gradient.as_ref().unwrap().norm() < 1e-9);
}

#[test]
fn test_spline_root_between_symmetric_beads() {
    let tools = straddled_double_well_path();

    // Beads 4 and 5 are mirror images; the first one is reported.
    let highest = tools.highest();
    assert_eq!(highest.left_bead, 4);
    assert!(approx_eq(highest.energy, (80.0f64 / 81.0).powi(2), 1e-12));

    let spline = tools.candidates(TsEstimator::Spline).unwrap();
    assert_eq!(spline.len(), 1);
    assert_eq!((spline[0].left_bead, spline[0].right_bead), (4, 5));
    assert!(spline[0].position[0].abs() < 1e-6);
    assert!(approx_eq(spline[0].energy, 1.0, 1e-3));
    assert!(spline[0].energy > highest.energy);
}

#[test]
fn test_estimates_stay_inside_their_brackets() {
    let tools = double_well_path();
    let estimates = tools.estimate(&TsEstimator::ALL).unwrap();
    assert!(!estimates.is_empty());
    for ts in &estimates {
        let c = &ts.candidate;
        assert!(c.left_bead <= c.right_bead);
        assert!(c.left_param <= c.ts_param + 1e-12);
        assert!(c.ts_param <= c.right_param + 1e-12);
        assert!(c.energy <= 1.0 + 1e-6);
        // The barrier is a maximum along the path.
        assert!(ts.analysis.energy_curvature < 0.0);
    }
}

#[test]
fn test_reaction_modes_follow_the_path() {
    let tools = double_well_path();
    let estimates = tools.estimate(&[TsEstimator::Highest]).unwrap();
    assert_eq!(estimates.len(), 1);
    let modes = &estimates[0].analysis.modes;
    assert_eq!(modes.len(), 4);
    for mode in modes {
        assert!(approx_eq(mode.vector.norm(), 1.0, 1e-12));
        assert!(approx_eq(mode.vector[0].abs(), 1.0, 1e-9));
    }

    // Along x the neighbours only feel the double-well slope.
    for force in &estimates[0].analysis.neighbor_forces {
        assert!(force.perpendicular < 1e-9);
    }

    let mapped = tools
        .estimate_with_map(&[TsEstimator::Highest], &Stretch)
        .unwrap();
    assert!(mapped[0]
        .analysis
        .modes
        .iter()
        .all(|m| approx_eq(m.vector.norm(), 1.0, 1e-12)));
}

#[test]
fn test_two_barriers_sorted_by_energy() {
    let positions: Vec<DVector<f64>> = (0..7).map(|i| DVector::from_element(1, i as f64)).collect();
    let energies = vec![0.0, 1.0, 0.0, -0.5, 0.0, 2.0, 0.0];
    let tools = PathTools::new(positions, energies, None, None).unwrap();

    let spline = tools.candidates(TsEstimator::Spline).unwrap();
    assert_eq!(spline.len(), 2);
    assert!(spline[0].energy < spline[1].energy);
    assert!(spline[0].left_bead < 3);
    assert!(spline[1].left_bead >= 4);
    assert_ne!(compare_candidates(&spline[0], &spline[1]), Ordering::Greater);

    // Without gradients the neighbour forces are empty.
    let estimates = tools.estimate(&[TsEstimator::Spline]).unwrap();
    assert!(estimates.iter().all(|e| e.analysis.neighbor_forces.is_empty()));
}

#[test]
fn test_unevaluated_chain_rejected() {
    let start = DVector::from_vec(vec![-1.0, 0.0]);
    let end = DVector::from_vec(vec![1.0, 0.0]);
    let chain = Chain::linear(&start, &end, 5).unwrap();
    assert!(matches!(
        PathTools::from_chain(&chain),
        Err(PathError::MissingEnergies(_))
    ));
}
