//! Chain-of-states models and the path search driver.
//!
//! The optimizer in [`crate::optimizer`] only knows how to follow the
//! orthogonal gradient flow. A [`PathModel`] adds what distinguishes the
//! chain-of-states methods from each other:
//!
//! - **Plain chain** ([`PlainChain`]): nothing; beads follow `-g⊥` and any
//!   configured constraint keeps them apart
//! - **Nudged elastic band** ([`Neb`]): springs between neighbours act along
//!   the tangent only, so they control spacing without pulling the band off
//!   the minimum energy path
//! - **String / growing string** ([`GrowingString`]): no springs; spacing is
//!   restored by respacing the beads on the interpolating curve whenever it
//!   degrades, and a growing string starts coarse and gains beads each time it
//!   converges
//!
//! # Nudged Elastic Band
//!
//! With `τᵢ` the unit tangent at bead `i` and `kⱼ` the spring constant of the
//! gap between beads `j` and `j + 1`, the band descends
//!
//! ```text
//! gᵢ^NEB = gᵢ⊥ - Fᵢ τᵢ,   Fᵢ = kᵢ |xᵢ₊₁ - xᵢ| - kᵢ₋₁ |xᵢ - xᵢ₋₁|
//! ```
//!
//! which is the orthogonal part of the gradient of
//!
//! ```text
//! V = Σ E(xᵢ) + ½ Σ kⱼ |xⱼ₊₁ - xⱼ|²
//! ```
//!
//! with the spring part projected on the tangent instead. With a climbing
//! image the highest interior bead drops its spring and follows `g⊥ - g∥τ`
//! instead, which drives it uphill along the path towards the saddle point.
//!
//! # Path search
//!
//! [`find_path`] runs the configured method to completion: it restarts the
//! optimizer on a respaced chain when the model signals uneven spacing, grows a
//! growing string after every converged run, stops at the global iteration
//! cap, and finally runs the transition-state estimators on the result.
//!
//! # References
//!
//! - Henkelman, G.; Jónsson, H. *J. Chem. Phys.* **2000**, 113, 9978-9985.
//! - Henkelman, G.; Uberuaga, B. P.; Jónsson, H. *J. Chem. Phys.* **2000**, 113, 9901-9904.
//! - Peters, B.; Heyden, A.; Bell, A. T.; Chakraborty, A. *J. Chem. Phys.* **2004**, 120, 7877-7886.

use crate::chain::{segment_lengths, Chain};
use crate::config::{GrowthTrigger, PathConfig, PathMethod, SpringConstants};
use crate::error::Result;
use crate::oracle::PotentialSurface;
use crate::optimizer::{ChainOptimizer, StepStatus};
use crate::progress::{PathEvent, PathObserver};
use crate::tangent::{project, tangents, TangentMethod};
use crate::transition_state::{PathTools, TsEstimate};
use log::{debug, info, warn};
use nalgebra::DVector;

/// Read-only view of the chain handed to [`PathModel::parallel_correction`].
///
/// During a step this describes the configuration the pseudo-time flow has
/// reached, not necessarily the one the chain is at.
#[derive(Debug, Clone, Copy)]
pub struct CorrectionContext<'a> {
    /// All bead positions, endpoints included
    pub positions: &'a [DVector<f64>],
    /// Unit tangents at the interior beads
    pub tangents: &'a [DVector<f64>],
    /// Gradient component along each interior tangent
    pub parallel: &'a [f64],
    /// Interior bead energies at the start of the step
    pub energies: &'a [f64],
}

/// A chain-of-states method.
pub trait PathModel {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Tangential force `μᵢ` per interior bead; the optimizer descends
    /// `g⊥ - μτ`. Zero by default.
    fn parallel_correction(&self, context: &CorrectionContext<'_>) -> Vec<f64> {
        vec![0.0; context.tangents.len()]
    }

    /// Whether the discretization must be rebuilt before the next step.
    fn needs_regeneration(&self, _chain: &Chain) -> bool {
        false
    }

    /// Scalar objective of an evaluated chain: the sum of interior energies
    /// unless the model adds terms.
    fn objective(&self, chain: &Chain) -> Result<f64> {
        let energies = chain.energies()?;
        Ok(energies[1..energies.len() - 1].iter().sum())
    }
}

/// Chain without springs or respacing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainChain;

impl PathModel for PlainChain {
    fn name(&self) -> &str {
        "sopt"
    }
}

/// Nudged elastic band.
#[derive(Debug, Clone, PartialEq)]
pub struct Neb {
    springs: SpringConstants,
    climbing_image: bool,
}

impl Neb {
    /// Band with the given springs.
    pub fn new(springs: SpringConstants, climbing_image: bool) -> Self {
        Self {
            springs,
            climbing_image,
        }
    }

    /// Band configured from `config.springs` and `config.climbing_image`.
    pub fn from_config(config: &PathConfig) -> Self {
        Self::new(config.springs.clone(), config.climbing_image)
    }

    /// Spring force magnitude `Fᵢ` along the tangent of every interior bead.
    ///
    /// Positive values push a bead towards the end of the chain.
    pub fn spring_forces(&self, positions: &[DVector<f64>]) -> Vec<f64> {
        let gaps = segment_lengths(positions);
        (1..positions.len() - 1)
            .map(|i| self.springs.gap(i) * gaps[i] - self.springs.gap(i - 1) * gaps[i - 1])
            .collect()
    }

    fn climbing_bead(&self, energies: &[f64]) -> Option<usize> {
        if !self.climbing_image {
            return None;
        }
        // first of equally high beads
        energies
            .iter()
            .enumerate()
            .reduce(|best, next| if next.1 > best.1 { next } else { best })
            .map(|(i, _)| i)
    }

    /// Gradients the band descends at the chain's current configuration.
    pub fn effective_gradients(
        &self,
        chain: &Chain,
        method: TangentMethod,
    ) -> Result<Vec<DVector<f64>>> {
        let positions = chain.positions();
        let n = chain.interior_len();
        let gradients = chain.gradients()?;
        let energies = chain.energies()?;
        let taus = tangents(method, &positions, chain.params())?;
        let (parallel, orthogonal) = project(&gradients[1..n + 1], &taus);
        let mu = self.parallel_correction(&CorrectionContext {
            positions: &positions,
            tangents: &taus,
            parallel: &parallel,
            energies: &energies[1..n + 1],
        });
        Ok(orthogonal
            .into_iter()
            .zip(&taus)
            .zip(mu)
            .map(|((o, t), m)| o - t * m)
            .collect())
    }
}

impl PathModel for Neb {
    fn name(&self) -> &str {
        "neb"
    }

    fn parallel_correction(&self, context: &CorrectionContext<'_>) -> Vec<f64> {
        let mut forces = self.spring_forces(context.positions);
        if let Some(top) = self.climbing_bead(context.energies) {
            forces[top] = context.parallel[top];
        }
        forces
    }

    fn objective(&self, chain: &Chain) -> Result<f64> {
        let energies = chain.energies()?;
        let interior: f64 = energies[1..energies.len() - 1].iter().sum();
        let springs: f64 = chain
            .segment_lengths()
            .iter()
            .enumerate()
            .map(|(j, d)| 0.5 * self.springs.gap(j) * d * d)
            .sum();
        Ok(interior + springs)
    }
}

/// String that is respaced when its beads bunch up and, optionally, grows.
#[derive(Debug, Clone, PartialEq)]
pub struct GrowingString {
    target_beads: usize,
    beads_per_growth: usize,
    max_sep_ratio: f64,
    growing: bool,
}

impl GrowingString {
    /// Fixed-size string respaced above `max_sep_ratio`.
    pub fn fixed(max_sep_ratio: f64) -> Self {
        Self {
            target_beads: 0,
            beads_per_growth: 0,
            max_sep_ratio,
            growing: false,
        }
    }

    /// String that grows by `beads_per_growth` up to `target_beads`.
    pub fn growing(target_beads: usize, beads_per_growth: usize, max_sep_ratio: f64) -> Self {
        Self {
            target_beads,
            beads_per_growth,
            max_sep_ratio,
            growing: true,
        }
    }

    /// String for `config.method`, growing only for
    /// [`PathMethod::GrowingString`].
    pub fn from_config(config: &PathConfig) -> Self {
        if config.method == PathMethod::GrowingString {
            Self::growing(
                config.growth.target_beads,
                config.growth.beads_per_growth,
                config.max_sep_ratio,
            )
        } else {
            Self::fixed(config.max_sep_ratio)
        }
    }

    /// Whether `chain` may still gain beads.
    pub fn can_grow(&self, chain: &Chain) -> bool {
        self.growing && chain.len() < self.target_beads
    }

    /// Same bead count, evenly respaced along the current curve.
    pub fn regenerate(&self, chain: &Chain) -> Result<Chain> {
        chain.respaced(chain.len())
    }

    /// The next, larger discretization, or `None` at the target size.
    pub fn grow(&self, chain: &Chain) -> Result<Option<Chain>> {
        if !self.can_grow(chain) {
            return Ok(None);
        }
        let count = (chain.len() + self.beads_per_growth).min(self.target_beads);
        chain.respaced(count).map(Some)
    }
}

impl PathModel for GrowingString {
    fn name(&self) -> &str {
        if self.growing {
            "growing-string"
        } else {
            "string"
        }
    }

    fn needs_regeneration(&self, chain: &Chain) -> bool {
        chain.statistics().disparity > self.max_sep_ratio
    }
}

/// Outcome of [`find_path`].
#[derive(Debug, Clone)]
pub struct PathResult {
    /// Final chain, every bead evaluated
    pub chain: Chain,
    /// Whether the last run met a convergence threshold
    pub converged: bool,
    /// Iterations over all runs
    pub iterations: usize,
    /// Respacing restarts
    pub regenerations: usize,
    /// Growth events of a growing string
    pub growth_events: usize,
    /// Transition-state estimates of the configured estimators
    pub transition_states: Vec<TsEstimate>,
}

fn model_for(config: &PathConfig) -> Box<dyn PathModel> {
    match config.method {
        PathMethod::Sopt => Box::new(PlainChain),
        PathMethod::Neb => Box::new(Neb::from_config(config)),
        PathMethod::String | PathMethod::GrowingString => {
            Box::new(GrowingString::from_config(config))
        }
    }
}

/// Optimizes `chain` with the configured method and estimates the transition
/// state on the result.
///
/// The chain is used as given; its bead count is not adjusted except by
/// growing-string growth and respacing. Running out of iterations or
/// regenerations is not an error and shows up as `converged == false`.
pub fn find_path<S: PotentialSurface + ?Sized>(
    config: &PathConfig,
    chain: Chain,
    surface: &S,
    observer: &PathObserver<'_>,
) -> Result<PathResult> {
    config.validate()?;
    let model = model_for(config);
    let string = matches!(
        config.method,
        PathMethod::String | PathMethod::GrowingString
    )
    .then(|| GrowingString::from_config(config));
    info!(
        "Starting {} search with {} beads",
        model.name(),
        chain.len()
    );

    let mut chain = chain;
    let mut iterations = 0;
    let mut regenerations = 0;
    let mut growth_events = 0;
    let mut converged = false;

    while iterations < config.max_iterations {
        let remaining = config.max_iterations - iterations;
        let can_grow = string.as_ref().is_some_and(|s| s.can_grow(&chain));
        let cap = match config.growth.trigger {
            GrowthTrigger::EveryIterations(n) if can_grow => remaining.min(n),
            _ => remaining,
        };

        let mut optimizer = ChainOptimizer::new(chain, config).with_iteration_cap(cap);
        let status = optimizer.run(surface, model.as_ref(), observer)?;
        iterations += optimizer.iteration();
        chain = optimizer.into_chain();
        debug!(
            "Run ended with {:?} after {} iterations in total",
            status, iterations
        );

        let next = match status {
            StepStatus::NeedsRegeneration => {
                let Some(string) = &string else { break };
                if regenerations >= config.max_regenerations {
                    warn!(
                        "Regeneration limit of {} reached, stopping unconverged",
                        config.max_regenerations
                    );
                    break;
                }
                regenerations += 1;
                let respaced = string.regenerate(&chain)?;
                info!(
                    "Respaced {} beads (regeneration {})",
                    respaced.len(),
                    regenerations
                );
                observer.report(PathEvent::Regenerated {
                    beads: respaced.len(),
                    count: regenerations,
                });
                respaced
            }
            StepStatus::Converged => {
                let grown = match &string {
                    Some(string) => string.grow(&chain)?,
                    None => None,
                };
                match grown {
                    Some(grown) => grown,
                    None => {
                        converged = true;
                        break;
                    }
                }
            }
            StepStatus::IterationCapReached | StepStatus::InProgress => {
                let periodic = matches!(config.growth.trigger, GrowthTrigger::EveryIterations(_));
                let grown = match &string {
                    Some(string) if periodic && iterations < config.max_iterations => {
                        string.grow(&chain)?
                    }
                    _ => None,
                };
                match grown {
                    Some(grown) => grown,
                    None => break,
                }
            }
        };

        if next.len() > chain.len() {
            growth_events += 1;
            info!("String grown from {} to {} beads", chain.len(), next.len());
            observer.report(PathEvent::Grown {
                from: chain.len(),
                to: next.len(),
            });
        }
        chain = next;
    }

    if !converged {
        warn!(
            "Path search stopped unconverged after {} iterations",
            iterations
        );
    }

    chain.evaluate_missing(surface)?;
    let transition_states = if config.ts_estimators.is_empty() {
        Vec::new()
    } else {
        PathTools::from_chain(&chain)?.estimate(&config.ts_estimators)?
    };

    Ok(PathResult {
        chain,
        converged,
        iterations,
        regenerations,
        growth_events,
        transition_states,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GrowthConfig, Thresholds};
    use crate::error::PathError;
    use crate::surfaces::DoubleWell;
    use std::cell::RefCell;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn point(x: f64, y: f64) -> DVector<f64> {
        DVector::from_vec(vec![x, y])
    }

    fn bowed_chain(count: usize, height: f64) -> Chain {
        let positions = (0..count)
            .map(|i| {
                let f = i as f64 / (count - 1) as f64;
                point(-1.0 + 2.0 * f, height * (std::f64::consts::PI * f).sin())
            })
            .collect();
        Chain::new(positions).unwrap()
    }

    fn evaluated(mut chain: Chain) -> Chain {
        chain.evaluate_missing(&DoubleWell::default()).unwrap();
        chain
    }

    #[test]
    fn test_spring_forces() {
        let neb = Neb::new(SpringConstants::Uniform(1.0), false);
        let forces = neb.spring_forces(&[point(0.0, 0.0), point(0.5, 0.0), point(2.0, 0.0)]);
        assert_eq!(forces.len(), 1);
        assert!(approx_eq(forces[0], 1.0, 1e-12));

        let even: Vec<_> = (0..5).map(|i| point(i as f64, 0.0)).collect();
        assert!(neb.spring_forces(&even).iter().all(|f| f.abs() < 1e-12));
    }

    #[test]
    fn test_per_gap_springs() {
        let neb = Neb::new(SpringConstants::PerGap(vec![1.0, 3.0]), false);
        let forces = neb.spring_forces(&[point(0.0, 0.0), point(1.0, 0.0), point(2.0, 0.0)]);
        assert!(approx_eq(forces[0], 2.0, 1e-12));
    }

    #[test]
    fn test_zero_springs_leave_orthogonal_gradient() {
        let chain = evaluated(bowed_chain(6, 0.4));
        let neb = Neb::new(SpringConstants::Uniform(0.0), false);
        let effective = neb
            .effective_gradients(&chain, TangentMethod::Averaged)
            .unwrap();
        let taus = tangents(TangentMethod::Averaged, &chain.positions(), chain.params()).unwrap();
        let gradients = chain.gradients().unwrap();
        for (i, (e, t)) in effective.iter().zip(&taus).enumerate() {
            assert!(e.dot(t).abs() < 1e-12);
            let g = &gradients[i + 1];
            let orthogonal = g - t * g.dot(t);
            assert!((e - orthogonal).norm() < 1e-12);
        }
    }

    #[test]
    fn test_climbing_image_inverts_parallel_gradient() {
        let chain = evaluated(bowed_chain(5, 0.3));
        let neb = Neb::new(SpringConstants::Uniform(2.0), true);
        let effective = neb
            .effective_gradients(&chain, TangentMethod::Averaged)
            .unwrap();
        let taus = tangents(TangentMethod::Averaged, &chain.positions(), chain.params()).unwrap();

        // the middle bead sits on the barrier at x = 0
        let energies = chain.energies().unwrap();
        let top = (1..4)
            .max_by(|&a, &b| energies[a].total_cmp(&energies[b]))
            .unwrap();
        let g = &chain.gradients().unwrap()[top];
        let t = &taus[top - 1];
        let parallel = g.dot(t);
        assert!(approx_eq(effective[top - 1].dot(t), -parallel, 1e-12));
    }

    #[test]
    fn test_neb_objective_adds_springs() {
        let chain = evaluated(Chain::linear(&point(-1.0, 0.0), &point(1.0, 0.0), 3).unwrap());
        let neb = Neb::new(SpringConstants::Uniform(2.0), false);
        // interior bead at the barrier top: E = 1; two gaps of length 1
        assert!(approx_eq(neb.objective(&chain).unwrap(), 1.0 + 2.0, 1e-12));
        assert!(approx_eq(PlainChain.objective(&chain).unwrap(), 1.0, 1e-12));
    }

    #[test]
    fn test_string_regeneration_restores_spacing() {
        let chain = Chain::new(vec![
            point(-1.0, 0.0),
            point(-0.9, 0.1),
            point(-0.7, 0.2),
            point(0.6, 0.2),
            point(1.0, 0.0),
        ])
        .unwrap();
        let string = GrowingString::fixed(0.1);
        assert!(string.needs_regeneration(&chain));
        let respaced = string.regenerate(&chain).unwrap();
        assert_eq!(respaced.len(), 5);
        assert!(!string.needs_regeneration(&respaced));
    }

    #[test]
    fn test_growth_stops_at_target() {
        let string = GrowingString::growing(6, 2, 0.1);
        let mut chain = Chain::linear(&point(-1.0, 0.0), &point(1.0, 0.0), 3).unwrap();
        let mut sizes = vec![chain.len()];
        while let Some(next) = string.grow(&chain).unwrap() {
            assert!(next.len() > chain.len());
            assert!(!string.needs_regeneration(&next));
            chain = next;
            sizes.push(chain.len());
        }
        assert_eq!(sizes, vec![3, 5, 6]);
        assert!(!GrowingString::fixed(0.1).can_grow(&chain));
    }

    fn quiet_config(method: PathMethod) -> PathConfig {
        PathConfig {
            method,
            max_iterations: 200,
            thresholds: Thresholds {
                gradient: 1e-6,
                step: 1e-9,
            },
            ts_estimators: Vec::new(),
            ..PathConfig::default()
        }
    }

    #[test]
    fn test_find_path_straightens_bowed_chain() {
        let config = quiet_config(PathMethod::Sopt);
        let result = find_path(
            &config,
            bowed_chain(7, 0.3),
            &DoubleWell::default(),
            &PathObserver::new(),
        )
        .unwrap();
        assert!(result.converged);
        assert!(result.iterations > 0);
        for node in result.chain.nodes() {
            assert!(node.position()[1].abs() < 1e-3);
            assert!(node.is_evaluated());
        }
    }

    #[test]
    fn test_find_path_neb() {
        let config = PathConfig {
            springs: SpringConstants::Uniform(1.0),
            ..quiet_config(PathMethod::Neb)
        };
        let result = find_path(
            &config,
            bowed_chain(7, 0.3),
            &DoubleWell::default(),
            &PathObserver::new(),
        )
        .unwrap();
        assert!(result.converged);
        assert!(result
            .chain
            .nodes()
            .iter()
            .all(|n| n.position()[1].abs() < 1e-3));
    }

    #[test]
    fn test_growing_string_reports_growth() {
        let config = PathConfig {
            growth: GrowthConfig {
                target_beads: 7,
                beads_per_growth: 2,
                ..GrowthConfig::default()
            },
            ..quiet_config(PathMethod::GrowingString)
        };
        let events = RefCell::new(Vec::new());
        let observer = PathObserver::with_callback(Box::new(|event: &PathEvent<'_>| {
            if let PathEvent::Grown { from, to } = event {
                events.borrow_mut().push((*from, *to));
            }
        }));
        let start = Chain::linear(&point(-1.0, 0.0), &point(1.0, 0.0), 3).unwrap();
        let result = find_path(&config, start, &DoubleWell::default(), &observer).unwrap();

        assert!(result.converged);
        assert_eq!(result.chain.len(), 7);
        assert_eq!(result.growth_events, 2);
        assert_eq!(*events.borrow(), vec![(3, 5), (5, 7)]);
    }

    #[test]
    fn test_string_regenerates_uneven_chain() {
        let config = quiet_config(PathMethod::String);
        let start = Chain::new(vec![
            point(-1.0, 0.0),
            point(-0.9, 0.0),
            point(-0.8, 0.0),
            point(0.5, 0.0),
            point(1.0, 0.0),
        ])
        .unwrap();
        let count = RefCell::new(0);
        let observer = PathObserver::with_callback(Box::new(|event: &PathEvent<'_>| {
            if let PathEvent::Regenerated { .. } = event {
                *count.borrow_mut() += 1;
            }
        }));
        let result = find_path(&config, start, &DoubleWell::default(), &observer).unwrap();
        assert_eq!(result.regenerations, 1);
        assert_eq!(*count.borrow(), 1);
        assert!(result.converged);
        assert!(result.chain.statistics().disparity < 0.1);
    }

    #[test]
    fn test_iteration_cap_is_soft() {
        let config = PathConfig {
            max_iterations: 2,
            ..quiet_config(PathMethod::Sopt)
        };
        let result = find_path(
            &config,
            bowed_chain(5, 0.3),
            &DoubleWell::default(),
            &PathObserver::new(),
        )
        .unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations, 2);
        assert!(result.chain.unevaluated().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PathConfig {
            max_step: -1.0,
            ..PathConfig::default()
        };
        let err = find_path(
            &config,
            bowed_chain(5, 0.3),
            &DoubleWell::default(),
            &PathObserver::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PathError::Config(_)));
    }
}
