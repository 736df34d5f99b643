//! Progress reporting for path searches.
//!
//! The engine reports through an injected callback and never through global
//! state. Callbacks receive read-only views, so they cannot influence the
//! optimization.

use crate::chain::Chain;
use crate::optimizer::StepStatus;

/// Snapshot handed to the observer after every optimizer iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationReport<'a> {
    /// Iterations completed in the current inner run
    pub iteration: usize,
    /// Chain after the step was applied
    pub chain: &'a Chain,
    /// Outcome of the iteration
    pub status: StepStatus,
    /// Largest orthogonal gradient norm before the step
    pub max_orthogonal_gradient: f64,
    /// Largest step component of any bead (0 if no step was taken)
    pub max_step: f64,
    /// True if the step still exceeded the cap after time scaling
    pub step_capped: bool,
}

/// Everything the engine reports.
#[derive(Debug, Clone, Copy)]
pub enum PathEvent<'a> {
    /// One optimizer iteration finished
    Iteration(IterationReport<'a>),
    /// The chain was respaced after an uneven-spacing signal
    Regenerated {
        /// Bead count of the new chain
        beads: usize,
        /// Regenerations so far
        count: usize,
    },
    /// A growing string gained beads
    Grown {
        /// Bead count before growth
        from: usize,
        /// Bead count after growth
        to: usize,
    },
}

/// Boxed observer callback.
pub type PathCallback<'a> = Box<dyn Fn(&PathEvent<'_>) + 'a>;

/// Forwards events to an optional callback.
#[derive(Default)]
pub struct PathObserver<'a> {
    callback: Option<PathCallback<'a>>,
}

impl<'a> PathObserver<'a> {
    /// Observer that discards every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer that forwards events to `callback`.
    pub fn with_callback(callback: PathCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[inline]
    pub(crate) fn report(&self, event: PathEvent<'_>) {
        if let Some(cb) = &self.callback {
            cb(&event);
        }
    }
}

impl std::fmt::Debug for PathObserver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathObserver")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
