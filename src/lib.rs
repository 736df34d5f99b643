#![deny(missing_docs)]

//! cospath - Chain-of-States Reaction Path Optimizer
//!
//! cospath locates minimum energy paths between two fixed endpoints on a
//! potential energy surface and estimates the transition state along them.
//!
//! # Overview
//!
//! A path is discretized into a chain of beads. The two endpoints stay fixed
//! and every interior bead is moved by a quasi-Newton optimizer driven by the
//! gradient component orthogonal to the path. Three chain models share one
//! optimizer:
//!
//! - **Plain chain** (`sopt`): beads relax independently across the path
//! - **Nudged elastic band** (`neb`): springs keep beads apart, with an
//!   optional climbing image
//! - **String / growing string**: beads are respaced by arc length when their
//!   separations become uneven; the growing variant adds beads over time
//!
//! # Algorithm
//!
//! Each iteration:
//!
//! 1. Evaluates energies and gradients of every bead lacking them
//! 2. Estimates tangents and projects the gradients
//!    ```text
//!    g_perp = g - (g . t) t
//!    ```
//! 3. Updates one inverse BFGS Hessian per bead
//! 4. Integrates the linearized flow `dx/dt = -H^-1 g_perp(x)` in pseudo-time
//!    up to the time at which the largest step component hits the cap
//!
//! After convergence the path is interpolated by cubic splines and up to six
//! transition-state estimators are run on it.
//!
//! # Quick Start
//!
//! ```no_run
//! use cospath::{find_path, Chain, MullerBrown, PathConfig, PathMethod, PathObserver};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let chain = Chain::linear(&MullerBrown::minimum_a(), &MullerBrown::minimum_b(), 9)?;
//!     let config = PathConfig {
//!         method: PathMethod::Neb,
//!         max_iterations: 300,
//!         ..PathConfig::default()
//!     };
//!     let result = find_path(&config, chain, &MullerBrown, &PathObserver::new())?;
//!     for ts in &result.transition_states {
//!         println!("{}: E = {:.4}", ts.estimator, ts.candidate.energy);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`chain`](chain/index.html) - Beads, spacing statistics and respacing
//! - [`curve`](curve/index.html) - Cubic spline interpolation of a path
//! - [`tangent`](tangent/index.html) - Tangent estimators and projection
//! - [`constraints`](constraints/index.html) - Lagrange multiplier constraints
//! - [`hessian_update`](hessian_update/index.html) - Per-bead BFGS updates
//! - [`ode`](ode/index.html) - Adaptive pseudo-time integrator
//! - [`optimizer`](optimizer/index.html) - The chain optimizer
//! - [`reaction_path`](reaction_path/index.html) - Chain models and the search driver
//! - [`transition_state`](transition_state/index.html) - TS estimators
//! - [`settings`](settings/index.html) - Layered INI configuration
//!
//! # References
//!
//! - Henkelman, G.; Uberuaga, B. P.; Jónsson, H.
//!   *J. Chem. Phys.* **2000**, 113, 9901-9904.
//! - Peters, B.; Heyden, A.; Bell, A. T.; Chakraborty, A.
//!   *J. Chem. Phys.* **2004**, 120, 7877-7886.
//!
//! # License
//!
//! MIT License

pub mod chain;
/// Lagrange multiplier constraints on bead motion
pub mod constraints;
pub mod config;
/// Cubic spline interpolation of a path
pub mod curve;
pub mod error;
/// Per-bead inverse Hessian updates
pub mod hessian_update;
/// Adaptive pseudo-time integration
pub mod ode;
pub mod optimizer;
pub mod oracle;
pub mod progress;
/// Chain models and the path search driver
pub mod reaction_path;
/// Configuration management system
pub mod settings;
/// Analytic model surfaces
pub mod surfaces;
pub mod tangent;
/// Transition-state estimation on a finished path
pub mod transition_state;

pub use chain::Chain;
pub use config::{PathConfig, PathMethod};
pub use error::{PathError, Result};
pub use optimizer::{ChainOptimizer, StepStatus};
pub use oracle::{Evaluation, OracleError, PotentialSurface};
pub use progress::{PathEvent, PathObserver};
pub use reaction_path::{find_path, PathResult};
pub use surfaces::{DoubleWell, GaussianWells, MullerBrown};
pub use transition_state::{PathTools, TsEstimate, TsEstimator};
