//! Quasi-Newton chain optimizer with pseudo-time integrated steps.
//!
//! One [`ChainOptimizer`] owns a [`Chain`] and a [`HessianBank`] and advances
//! the interior beads one iteration per call to [`ChainOptimizer::step`]:
//!
//! 1. evaluate beads whose energy/gradient is not cached, in one batch
//! 2. compute tangents and split every gradient into `g∥·τ + g⊥`
//! 3. stop if `max |g⊥|` is below the gradient threshold
//! 4. fold the previous step's secant pairs into the per-bead Hessians
//! 5. follow the gradient flow in pseudo-time `t`
//!    ```text
//!    dg/dt = -(g⊥ - μ·τ - λ·τ),   x(g) = x₀ + H⁻¹(g - g₀)
//!    ```
//!    where `μ` is the model's tangential force (springs, climbing image) and
//!    `λ` the constraint multipliers
//! 6. pick the end time: infinite (fully relaxed) when a unit step stays below
//!    the step cap, otherwise `T = -ln(1 - h)` with `h` chosen so the linear
//!    step would be 90% of the cap
//! 7. map the integrated gradient change back to a step with `H⁻¹`
//! 8. converge if the step is below the step threshold, warn if it is still
//!    above the cap, and apply it
//!
//! Integrating the flow instead of taking a single Newton step keeps large
//! steps stable when the tangents rotate along the way.

use crate::chain::{chord_parameters, Chain};
use crate::config::PathConfig;
use crate::constraints::{evaluate_constraints, lagrange_multipliers};
use crate::error::{PathError, Result};
use crate::hessian_update::HessianBank;
use crate::ode::{integrate, OdeOptions};
use crate::oracle::PotentialSurface;
use crate::progress::{IterationReport, PathEvent, PathObserver};
use crate::reaction_path::{CorrectionContext, PathModel};
use crate::tangent::{project, tangents};
use log::{debug, info, warn};
use nalgebra::DVector;

/// Lifecycle of an optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerState {
    /// No iteration has run yet
    Initializing,
    /// Iterations are in progress
    Iterating,
    /// A convergence test passed; further steps are no-ops
    Converged,
    /// The model asked for a new discretization; this optimizer is spent
    Regenerate,
}

/// Outcome of one optimizer iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Keep iterating
    InProgress,
    /// Gradient or step threshold reached
    Converged,
    /// Bead spacing degraded; rebuild the chain and restart
    NeedsRegeneration,
    /// The iteration cap was hit before convergence
    IterationCapReached,
}

fn max_abs(vectors: &[DVector<f64>]) -> f64 {
    vectors
        .iter()
        .flat_map(|v| v.iter())
        .map(|x| x.abs())
        .fold(0.0, f64::max)
}

fn max_norm(vectors: &[DVector<f64>]) -> f64 {
    vectors.iter().map(|v| v.norm()).fold(0.0, f64::max)
}

fn flatten(vectors: &[DVector<f64>]) -> DVector<f64> {
    let total = vectors.iter().map(|v| v.len()).sum();
    DVector::from_iterator(total, vectors.iter().flat_map(|v| v.iter().copied()))
}

fn unflatten(flat: &DVector<f64>, count: usize, dim: usize) -> Vec<DVector<f64>> {
    (0..count)
        .map(|i| flat.rows(i * dim, dim).into_owned())
        .collect()
}

/// The pseudo-time gradient flow around the current iterate.
struct Flow<'a, M: ?Sized> {
    config: &'a PathConfig,
    model: &'a M,
    hessians: &'a HessianBank,
    start: &'a DVector<f64>,
    end: &'a DVector<f64>,
    x0: &'a [DVector<f64>],
    g0: &'a [DVector<f64>],
    energies: &'a [f64],
}

impl<M: PathModel + ?Sized> Flow<'_, M> {
    /// `dg/dt` at gradient state `g`.
    fn derivative(&self, g: &[DVector<f64>]) -> Result<Vec<DVector<f64>>> {
        let delta: Vec<DVector<f64>> = g.iter().zip(self.g0).map(|(a, b)| a - b).collect();
        let moved = self.hessians.apply_inverse(&delta)?;

        let mut full = Vec::with_capacity(g.len() + 2);
        full.push(self.start.clone());
        full.extend(self.x0.iter().zip(&moved).map(|(x, dx)| x + dx));
        full.push(self.end.clone());

        let params = chord_parameters(&full);
        let taus = tangents(self.config.tangent, &full, &params)?;
        let (parallel, mut orthogonal) = project(g, &taus);

        let mu = self.model.parallel_correction(&CorrectionContext {
            positions: &full,
            tangents: &taus,
            parallel: &parallel,
            energies: self.energies,
        });
        for ((o, t), m) in orthogonal.iter_mut().zip(&taus).zip(&mu) {
            o.axpy(-*m, t, 1.0);
        }

        if let Some(set) = evaluate_constraints(self.config.constraint, &full, &taus)? {
            let lambda = lagrange_multipliers(&set, self.hessians, &orthogonal, &taus)?;
            for ((o, t), l) in orthogonal.iter_mut().zip(&taus).zip(&lambda) {
                o.axpy(-*l, t, 1.0);
            }
        }

        Ok(orthogonal.into_iter().map(|o| -o).collect())
    }
}

/// Halvings of the step fraction tried after a failed integration.
const INTEGRATION_RETRIES: usize = 4;

/// End time of the flow for a linear step of `fraction` of the rough step.
fn horizon(fraction: f64) -> Option<f64> {
    (fraction < 1.0).then(|| -(1.0 - fraction).ln())
}

/// Integrates the flow from `gradients`, shortening the horizon after an
/// integrator failure.
///
/// Each retry halves the fraction of the rough step the horizon allows. Only
/// [`PathError::Integration`] is retried; the error of the last attempt is
/// returned when every attempt fails.
fn relax<M: PathModel + ?Sized>(
    flow: &Flow<'_, M>,
    gradients: &[DVector<f64>],
    fraction: f64,
    options: &OdeOptions,
) -> Result<DVector<f64>> {
    let n = gradients.len();
    let dim = gradients.first().map_or(0, |g| g.len());
    let mut fraction = fraction;
    let mut attempt = 0;
    loop {
        let outcome = integrate(
            |_, y| {
                let g = unflatten(y, n, dim);
                Ok(flatten(&flow.derivative(&g)?))
            },
            flatten(gradients),
            horizon(fraction),
            options,
        );
        match outcome {
            Err(PathError::Integration(reason)) if attempt < INTEGRATION_RETRIES => {
                attempt += 1;
                fraction *= 0.5;
                warn!(
                    "Pseudo-time integration failed ({}); retrying with step fraction {:.3e}",
                    reason, fraction
                );
            }
            other => return other,
        }
    }
}

/// Drives one optimization run over a fixed discretization.
///
/// A run ends in [`StepStatus::Converged`], [`StepStatus::IterationCapReached`]
/// or [`StepStatus::NeedsRegeneration`]. In the last case the caller must
/// build a new chain and a new optimizer; Hessians are never carried across.
#[derive(Debug)]
pub struct ChainOptimizer<'c> {
    config: &'c PathConfig,
    chain: Chain,
    hessians: HessianBank,
    state: OptimizerState,
    iteration: usize,
    max_iterations: usize,
    previous: Option<(Vec<DVector<f64>>, Vec<DVector<f64>>)>,
    ode: OdeOptions,
}

impl<'c> ChainOptimizer<'c> {
    /// Prepares a run with fresh Hessians and the configured iteration cap.
    pub fn new(chain: Chain, config: &'c PathConfig) -> Self {
        let hessians = HessianBank::new(
            chain.interior_len(),
            chain.dimension(),
            config.initial_curvature,
        );
        Self {
            config,
            chain,
            hessians,
            state: OptimizerState::Initializing,
            iteration: 0,
            max_iterations: config.max_iterations,
            previous: None,
            ode: OdeOptions::default(),
        }
    }

    /// Overrides the iteration cap of this run.
    pub fn with_iteration_cap(mut self, cap: usize) -> Self {
        self.max_iterations = cap;
        self
    }

    /// Replaces the integrator tolerances of this run.
    pub fn with_ode_options(mut self, options: OdeOptions) -> Self {
        self.ode = options;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OptimizerState {
        self.state
    }

    /// Iterations completed in this run.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// The chain being optimized.
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Per-bead curvature models.
    pub fn hessians(&self) -> &HessianBank {
        &self.hessians
    }

    /// Ends the run and returns the chain.
    pub fn into_chain(self) -> Chain {
        self.chain
    }

    /// Performs one iteration.
    pub fn step<S, M>(
        &mut self,
        surface: &S,
        model: &M,
        observer: &PathObserver<'_>,
    ) -> Result<StepStatus>
    where
        S: PotentialSurface + ?Sized,
        M: PathModel + ?Sized,
    {
        match self.state {
            OptimizerState::Converged => return Ok(StepStatus::Converged),
            OptimizerState::Regenerate => return Ok(StepStatus::NeedsRegeneration),
            OptimizerState::Initializing | OptimizerState::Iterating => {}
        }
        if self.iteration >= self.max_iterations {
            return Ok(StepStatus::IterationCapReached);
        }
        self.state = OptimizerState::Iterating;

        if model.needs_regeneration(&self.chain) {
            info!(
                "Bead spacing too uneven (disparity {:.3}), requesting regeneration",
                self.chain.statistics().disparity
            );
            self.state = OptimizerState::Regenerate;
            return Ok(StepStatus::NeedsRegeneration);
        }

        let evaluated = self.chain.evaluate_missing(surface)?;
        debug!("Evaluated {} beads", evaluated);

        let positions = self.chain.positions();
        let n = self.chain.interior_len();
        let dim = self.chain.dimension();
        let interior = &positions[1..n + 1];
        let all_gradients = self.chain.gradients()?;
        let gradients = all_gradients[1..n + 1].to_vec();
        let energies = self.chain.energies()?[1..n + 1].to_vec();

        let taus = tangents(self.config.tangent, &positions, self.chain.params())?;
        let (_, orthogonal) = project(&gradients, &taus);
        let max_orthogonal = max_norm(&orthogonal);
        debug!(
            "Iteration {}: max orthogonal gradient {:.3e}",
            self.iteration, max_orthogonal
        );

        if max_orthogonal < self.config.thresholds.gradient {
            info!(
                "Converged on orthogonal gradient after {} iterations",
                self.iteration
            );
            let report = IterationReport {
                iteration: self.iteration,
                chain: &self.chain,
                status: StepStatus::Converged,
                max_orthogonal_gradient: max_orthogonal,
                max_step: 0.0,
                step_capped: false,
            };
            observer.report(PathEvent::Iteration(report));
            self.state = OptimizerState::Converged;
            return Ok(StepStatus::Converged);
        }

        if let Some((x_prev, g_prev)) = &self.previous {
            let dx: Vec<_> = interior.iter().zip(x_prev).map(|(a, b)| a - b).collect();
            let dg: Vec<_> = gradients.iter().zip(g_prev).map(|(a, b)| a - b).collect();
            let accepted = self.hessians.update(&dx, &dg)?;
            if accepted < n {
                debug!("{} of {} Hessian updates skipped", n - accepted, n);
            }
        }

        let step = {
            let flow = Flow {
                config: self.config,
                model,
                hessians: &self.hessians,
                start: &positions[0],
                end: &positions[n + 1],
                x0: interior,
                g0: &gradients,
                energies: &energies,
            };

            let rough = self.hessians.apply_inverse(&flow.derivative(&gradients)?)?;
            let rough_max = max_abs(&rough);
            let scale = if rough_max > self.config.max_step {
                0.9 * self.config.max_step / rough_max
            } else {
                1.0
            };

            let relaxed = relax(&flow, &gradients, scale, &self.ode)?;
            let change: Vec<_> = unflatten(&relaxed, n, dim)
                .iter()
                .zip(&gradients)
                .map(|(a, b)| a - b)
                .collect();
            self.hessians.apply_inverse(&change)?
        };

        let step_max = max_abs(&step);
        let capped = step_max > self.config.max_step;
        if capped {
            warn!(
                "Step {:.3e} still exceeds the cap {:.3e} after time scaling",
                step_max, self.config.max_step
            );
        }
        if step.iter().any(|s| s.iter().any(|v| !v.is_finite())) {
            return Err(PathError::Integration("step is not finite".to_string()));
        }

        let updated: Vec<DVector<f64>> = interior.iter().zip(&step).map(|(x, s)| x + s).collect();
        self.previous = Some((interior.to_vec(), gradients));
        self.chain.set_interior_positions(&updated)?;
        self.iteration += 1;

        let status = if step_max < self.config.thresholds.step {
            info!("Converged on step size after {} iterations", self.iteration);
            StepStatus::Converged
        } else if self.iteration >= self.max_iterations {
            warn!(
                "Iteration cap of {} reached without convergence",
                self.max_iterations
            );
            StepStatus::IterationCapReached
        } else {
            StepStatus::InProgress
        };

        let report = IterationReport {
            iteration: self.iteration,
            chain: &self.chain,
            status,
            max_orthogonal_gradient: max_orthogonal,
            max_step: step_max,
            step_capped: capped,
        };
        observer.report(PathEvent::Iteration(report));
        if status == StepStatus::Converged {
            self.state = OptimizerState::Converged;
        }
        Ok(status)
    }

    /// Iterates until the run ends, returning the final status.
    pub fn run<S, M>(
        &mut self,
        surface: &S,
        model: &M,
        observer: &PathObserver<'_>,
    ) -> Result<StepStatus>
    where
        S: PotentialSurface + ?Sized,
        M: PathModel + ?Sized,
    {
        loop {
            match self.step(surface, model, observer)? {
                StepStatus::InProgress => continue,
                done => return Ok(done),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Evaluation, OracleError};
    use crate::reaction_path::PlainChain;
    use crate::surfaces::DoubleWell;
    use std::cell::Cell;

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

    #[test]
    fn test_converged_input_is_left_alone() {
        let config = PathConfig::default();
        let chain = Chain::linear(&point(-1.0, 0.0), &point(1.0, 0.0), 6).unwrap();
        let before = chain.positions();
        let mut optimizer = ChainOptimizer::new(chain, &config);

        let status = optimizer
            .step(&DoubleWell::default(), &PlainChain, &PathObserver::new())
            .unwrap();
        assert_eq!(status, StepStatus::Converged);
        assert_eq!(optimizer.iteration(), 0);
        assert_eq!(optimizer.state(), OptimizerState::Converged);
        assert_eq!(optimizer.chain().positions(), before);

        // further steps are no-ops
        let again = optimizer
            .step(&DoubleWell::default(), &PlainChain, &PathObserver::new())
            .unwrap();
        assert_eq!(again, StepStatus::Converged);
        assert_eq!(optimizer.into_chain().positions(), before);
    }

    #[test]
    fn test_steps_respect_cap() {
        let config = PathConfig {
            max_step: 0.02,
            ..PathConfig::default()
        };
        let chain = bowed_chain(7, 0.5);
        let before = chain.interior_positions();
        let mut optimizer = ChainOptimizer::new(chain, &config);
        let capped = Cell::new(false);
        let observer = PathObserver::with_callback(Box::new(|event: &PathEvent<'_>| {
            if let PathEvent::Iteration(report) = event {
                capped.set(report.step_capped);
            }
        }));
        optimizer
            .step(&DoubleWell::default(), &PlainChain, &observer)
            .unwrap();
        assert!(!capped.get());
        for (a, b) in before.iter().zip(optimizer.chain().interior_positions()) {
            assert!((a - b).amax() <= config.max_step + 1e-12);
        }
    }

    #[test]
    fn test_run_lowers_orthogonal_gradient() {
        let config = PathConfig {
            max_iterations: 100,
            ..PathConfig::default()
        };
        let mut optimizer = ChainOptimizer::new(bowed_chain(7, 0.3), &config);
        let first = Cell::new(None);
        let last = Cell::new(0.0);
        let observer = PathObserver::with_callback(Box::new(|event: &PathEvent<'_>| {
            if let PathEvent::Iteration(report) = event {
                if first.get().is_none() {
                    first.set(Some(report.max_orthogonal_gradient));
                }
                last.set(report.max_orthogonal_gradient);
            }
        }));
        let status = optimizer
            .run(&DoubleWell::default(), &PlainChain, &observer)
            .unwrap();
        assert_eq!(status, StepStatus::Converged);
        assert!(last.get() < first.get().unwrap());
        assert!(optimizer.hessians().slot(0).updates() > 0);
    }

    #[test]
    fn test_iteration_cap_reached() {
        let config = PathConfig::default();
        let mut optimizer =
            ChainOptimizer::new(bowed_chain(5, 0.3), &config).with_iteration_cap(1);
        let status = optimizer
            .run(&DoubleWell::default(), &PlainChain, &PathObserver::new())
            .unwrap();
        assert_eq!(status, StepStatus::IterationCapReached);
        assert_eq!(optimizer.iteration(), 1);
        assert_eq!(optimizer.state(), OptimizerState::Iterating);
    }

    /// One step on the bowed chain, which starts below the step cap and so
    /// asks for a fully relaxed flow.
    fn first_step(options: OdeOptions) -> Result<(StepStatus, Vec<DVector<f64>>)> {
        let config = PathConfig::default();
        let chain = bowed_chain(7, 0.3);
        let before = chain.interior_positions();
        let mut optimizer = ChainOptimizer::new(chain, &config).with_ode_options(options);
        let status = optimizer.step(&DoubleWell::default(), &PlainChain, &PathObserver::new())?;
        let moved = before
            .iter()
            .zip(optimizer.chain().interior_positions())
            .map(|(a, b)| b - a)
            .collect();
        Ok((status, moved))
    }

    #[test]
    fn test_failed_integration_retried_with_shorter_horizon() {
        let (_, full) = first_step(OdeOptions::default()).unwrap();

        // too few steps to relax completely, plenty for t = ln 2
        let limited = OdeOptions {
            max_steps: 15,
            ..OdeOptions::default()
        };
        let (status, half) = first_step(limited).unwrap();
        assert_eq!(status, StepStatus::InProgress);

        // the linear flow covers 1 - exp(-ln 2) of the relaxed step
        let ratio = max_abs(&half) / max_abs(&full);
        assert!(ratio > 0.4 && ratio < 0.6, "ratio {}", ratio);
        for (h, f) in half.iter().zip(&full) {
            assert!(h.dot(f) > 0.0);
        }
    }

    #[test]
    fn test_integration_error_surfaces_after_retries() {
        let stuck = OdeOptions {
            max_steps: 0,
            ..OdeOptions::default()
        };
        let err = first_step(stuck).unwrap_err();
        assert!(matches!(err, PathError::Integration(_)));
    }

    struct Failing;

    impl PotentialSurface for Failing {
        fn evaluate(&self, _position: &DVector<f64>) -> std::result::Result<Evaluation, OracleError> {
            Err(OracleError::Evaluation("diverged".to_string()))
        }
    }

    #[test]
    fn test_oracle_fault_aborts_step() {
        let config = PathConfig::default();
        let mut optimizer = ChainOptimizer::new(bowed_chain(5, 0.3), &config);
        let err = optimizer
            .step(&Failing, &PlainChain, &PathObserver::new())
            .unwrap_err();
        assert!(matches!(err, PathError::Oracle(OracleError::Evaluation(_))));
    }

    struct AlwaysUneven;

    impl PathModel for AlwaysUneven {
        fn name(&self) -> &str {
            "uneven"
        }

        fn needs_regeneration(&self, _chain: &Chain) -> bool {
            true
        }
    }

    #[test]
    fn test_regeneration_signal_is_sticky() {
        let config = PathConfig::default();
        let mut optimizer = ChainOptimizer::new(bowed_chain(5, 0.3), &config);
        let observer = PathObserver::new();
        let surface = DoubleWell::default();
        assert_eq!(
            optimizer.step(&surface, &AlwaysUneven, &observer).unwrap(),
            StepStatus::NeedsRegeneration
        );
        assert_eq!(optimizer.state(), OptimizerState::Regenerate);
        assert_eq!(
            optimizer.step(&surface, &PlainChain, &observer).unwrap(),
            StepStatus::NeedsRegeneration
        );
    }
}
