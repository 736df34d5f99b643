//! Energy/gradient oracle interface.
//!
//! The engine never computes energies itself. Everything it knows about the
//! potential energy surface comes through [`PotentialSurface`], which plays the
//! role a quantum-chemistry program adapter plays in a molecular code: a
//! deterministic function from a position to an energy and its gradient.
//!
//! Batched evaluation is the dispatch unit of the optimizer. Implementations
//! may fan a batch out however they like, as long as results come back in the
//! order of the input positions. [`ParallelSurface`] does this with rayon when
//! the `parallel` feature is enabled, and [`CachedSurface`] memoizes repeated
//! positions.

use nalgebra::DVector;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Faults reported by an energy/gradient oracle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    /// The underlying evaluation failed (divergence, crashed worker, ...)
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    /// The gradient length disagrees with the position length.
    #[error("gradient has {found} components, position has {expected}")]
    DimensionMismatch {
        /// Length of the position vector
        expected: usize,
        /// Length of the returned gradient
        found: usize,
    },
    /// The returned energy or gradient contains NaN or infinity.
    #[error("non-finite result for position {index}")]
    NonFinite {
        /// Index of the position within the batch
        index: usize,
    },
}

type Result<T> = std::result::Result<T, OracleError>;

/// Energy and gradient at one position.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Potential energy
    pub energy: f64,
    /// Gradient of the energy, same length as the position
    pub gradient: DVector<f64>,
}

impl Evaluation {
    /// Bundles an energy with its gradient.
    pub fn new(energy: f64, gradient: DVector<f64>) -> Self {
        Self { energy, gradient }
    }
}

/// A deterministic potential energy surface.
pub trait PotentialSurface {
    /// Evaluates energy and gradient at `position`.
    fn evaluate(&self, position: &DVector<f64>) -> Result<Evaluation>;

    /// Evaluates a batch of positions, returning results in input order.
    ///
    /// The default implementation evaluates sequentially.
    fn evaluate_many(&self, positions: &[DVector<f64>]) -> Result<Vec<Evaluation>> {
        positions.iter().map(|p| self.evaluate(p)).collect()
    }
}

impl<S: PotentialSurface + ?Sized> PotentialSurface for &S {
    fn evaluate(&self, position: &DVector<f64>) -> Result<Evaluation> {
        (**self).evaluate(position)
    }

    fn evaluate_many(&self, positions: &[DVector<f64>]) -> Result<Vec<Evaluation>> {
        (**self).evaluate_many(positions)
    }
}

/// Evaluates a batch and checks every result for shape and finiteness.
///
/// This is the entry point the optimizer uses; a surface that returns a
/// malformed result is reported as a typed fault instead of silently
/// corrupting the chain.
pub fn evaluate_checked<S: PotentialSurface + ?Sized>(
    surface: &S,
    positions: &[DVector<f64>],
) -> Result<Vec<Evaluation>> {
    let results = surface.evaluate_many(positions)?;
    if results.len() != positions.len() {
        return Err(OracleError::Evaluation(format!(
            "batch of {} positions returned {} results",
            positions.len(),
            results.len()
        )));
    }
    for (index, (position, result)) in positions.iter().zip(&results).enumerate() {
        if result.gradient.len() != position.len() {
            return Err(OracleError::DimensionMismatch {
                expected: position.len(),
                found: result.gradient.len(),
            });
        }
        if !result.energy.is_finite() || !result.gradient.iter().all(|g| g.is_finite()) {
            return Err(OracleError::NonFinite { index });
        }
    }
    Ok(results)
}

/// Wraps a thread-safe surface so that batches are evaluated concurrently.
///
/// Without the `parallel` feature this behaves exactly like the wrapped surface.
#[derive(Debug, Clone)]
pub struct ParallelSurface<S> {
    inner: S,
}

impl<S> ParallelSurface<S> {
    /// Wraps `inner`.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Returns the wrapped surface.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: PotentialSurface + Sync> PotentialSurface for ParallelSurface<S> {
    fn evaluate(&self, position: &DVector<f64>) -> Result<Evaluation> {
        self.inner.evaluate(position)
    }

    fn evaluate_many(&self, positions: &[DVector<f64>]) -> Result<Vec<Evaluation>> {
        #[cfg(not(feature = "parallel"))]
        let iterator = positions.iter();

        #[cfg(feature = "parallel")]
        let iterator = positions.par_iter();

        iterator.map(|p| self.inner.evaluate(p)).collect()
    }
}

/// Memoizes evaluations keyed on the exact bit pattern of the position.
///
/// Only bit-identical positions hit the cache, which is sound because surfaces
/// are required to be deterministic. Endpoints of a chain are the typical
/// beneficiaries: they are re-requested after every regeneration.
#[derive(Debug)]
pub struct CachedSurface<S> {
    inner: S,
    store: Mutex<HashMap<Vec<u64>, Evaluation>>,
}

impl<S> CachedSurface<S> {
    /// Wraps `inner` with an empty cache.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Number of distinct positions evaluated so far.
    pub fn len(&self) -> usize {
        self.store.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// True if nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cache_key(position: &DVector<f64>) -> Vec<u64> {
    position.iter().map(|v| v.to_bits()).collect()
}

impl<S: PotentialSurface> PotentialSurface for CachedSurface<S> {
    fn evaluate(&self, position: &DVector<f64>) -> Result<Evaluation> {
        let key = cache_key(position);
        if let Ok(store) = self.store.lock() {
            if let Some(hit) = store.get(&key) {
                return Ok(hit.clone());
            }
        }
        let result = self.inner.evaluate(position)?;
        if let Ok(mut store) = self.store.lock() {
            store.insert(key, result.clone());
        }
        Ok(result)
    }

    fn evaluate_many(&self, positions: &[DVector<f64>]) -> Result<Vec<Evaluation>> {
        let mut results: Vec<Option<Evaluation>> = vec![None; positions.len()];
        let mut missing = Vec::new();
        if let Ok(store) = self.store.lock() {
            for (i, p) in positions.iter().enumerate() {
                match store.get(&cache_key(p)) {
                    Some(hit) => results[i] = Some(hit.clone()),
                    None => missing.push(i),
                }
            }
        } else {
            missing.extend(0..positions.len());
        }

        if !missing.is_empty() {
            let batch: Vec<DVector<f64>> = missing.iter().map(|&i| positions[i].clone()).collect();
            let fresh = self.inner.evaluate_many(&batch)?;
            if fresh.len() != batch.len() {
                return Err(OracleError::Evaluation(format!(
                    "batch of {} positions returned {} results",
                    batch.len(),
                    fresh.len()
                )));
            }
            let mut store = self.store.lock().ok();
            for (&i, result) in missing.iter().zip(fresh) {
                if let Some(store) = store.as_mut() {
                    store.insert(cache_key(&positions[i]), result.clone());
                }
                results[i] = Some(result);
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.ok_or_else(|| OracleError::Evaluation(format!("no result for position {}", i)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Paraboloid;

    impl PotentialSurface for Paraboloid {
        fn evaluate(&self, position: &DVector<f64>) -> Result<Evaluation> {
            Ok(Evaluation::new(position.norm_squared(), position * 2.0))
        }
    }

    struct Counting {
        calls: Cell<usize>,
    }

    impl PotentialSurface for Counting {
        fn evaluate(&self, position: &DVector<f64>) -> Result<Evaluation> {
            self.calls.set(self.calls.get() + 1);
            Ok(Evaluation::new(position[0], DVector::from_element(position.len(), 1.0)))
        }
    }

    struct Broken;

    impl PotentialSurface for Broken {
        fn evaluate(&self, position: &DVector<f64>) -> Result<Evaluation> {
            Ok(Evaluation::new(f64::NAN, DVector::zeros(position.len())))
        }
    }

    #[test]
    fn test_batch_preserves_order() {
        let positions: Vec<_> = (0..6)
            .map(|i| DVector::from_vec(vec![i as f64, 0.0]))
            .collect();
        let results = ParallelSurface::new(Paraboloid)
            .evaluate_many(&positions)
            .unwrap();
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.energy, (i * i) as f64);
        }
    }

    #[test]
    fn test_cache_skips_repeated_positions() {
        let surface = CachedSurface::new(Counting { calls: Cell::new(0) });
        let a = DVector::from_vec(vec![1.0, 2.0]);
        let b = DVector::from_vec(vec![3.0, 4.0]);
        surface.evaluate_many(&[a.clone(), b.clone()]).unwrap();
        let again = surface.evaluate_many(&[b, a]).unwrap();
        assert_eq!(surface.inner.calls.get(), 2);
        assert_eq!(again[0].energy, 3.0);
        assert_eq!(again[1].energy, 1.0);
        assert_eq!(surface.len(), 2);
    }

    #[test]
    fn test_checked_rejects_non_finite() {
        let err = evaluate_checked(&Broken, &[DVector::zeros(2)]).unwrap_err();
        assert_eq!(err, OracleError::NonFinite { index: 0 });
    }
}
