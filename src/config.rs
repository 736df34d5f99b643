//! Configuration structures for path optimization.
//!
//! This module defines the options recognized by the optimizer, the chain
//! models and the transition-state analysis. A [`PathConfig`] is a plain value:
//! build it once (from defaults, code or an INI file through
//! [`crate::settings::SettingsManager`]) and hand it to the engine, which never
//! modifies it.
//!
//! # Defaults
//!
//! | Option | Default |
//! |--------|---------|
//! | `method` | `sopt` |
//! | `max_iterations` | 50 |
//! | `max_step` | 0.05 |
//! | `thresholds.gradient` | 1e-5 |
//! | `thresholds.step` | 1e-6 |
//! | `initial_curvature` | 70 |
//! | `springs` | uniform 5.0 |
//! | `max_sep_ratio` | 0.1 |

use crate::constraints::ConstraintPolicy;
use crate::settings::ConfigError;
use crate::tangent::TangentMethod;
use crate::transition_state::TsEstimator;
use serde::{Deserialize, Serialize};

/// Which chain-of-states model drives the optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathMethod {
    /// Plain chain: orthogonal gradient flow with the selected constraint
    #[default]
    Sopt,
    /// Nudged elastic band with springs between neighbours
    Neb,
    /// String with a fixed bead count, respaced when spacing degrades
    String,
    /// String that starts coarse and grows to the target bead count
    GrowingString,
}

impl PathMethod {
    /// Configuration name.
    pub fn name(self) -> &'static str {
        match self {
            PathMethod::Sopt => "sopt",
            PathMethod::Neb => "neb",
            PathMethod::String => "string",
            PathMethod::GrowingString => "growing-string",
        }
    }
}

impl std::str::FromStr for PathMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sopt" => Ok(Self::Sopt),
            "neb" => Ok(Self::Neb),
            "string" => Ok(Self::String),
            "growing-string" | "growingstring" => Ok(Self::GrowingString),
            other => Err(format!("unknown path method: {}", other)),
        }
    }
}

/// Spring constants of a nudged elastic band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpringConstants {
    /// The same constant on every gap
    Uniform(f64),
    /// One constant per gap between consecutive beads
    PerGap(Vec<f64>),
}

impl Default for SpringConstants {
    fn default() -> Self {
        SpringConstants::Uniform(5.0)
    }
}

impl SpringConstants {
    /// Constant of the gap between bead `gap` and bead `gap + 1`.
    ///
    /// A per-gap list shorter than the chain repeats its last entry.
    pub fn gap(&self, gap: usize) -> f64 {
        match self {
            SpringConstants::Uniform(k) => *k,
            SpringConstants::PerGap(ks) => ks
                .get(gap)
                .or_else(|| ks.last())
                .copied()
                .unwrap_or(0.0),
        }
    }

    fn values(&self) -> Vec<f64> {
        match self {
            SpringConstants::Uniform(k) => vec![*k],
            SpringConstants::PerGap(ks) => ks.clone(),
        }
    }
}

/// When a growing string inserts new beads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrowthTrigger {
    /// After the inner optimization has converged
    #[default]
    OnConvergence,
    /// After at most this many inner iterations, converged or not
    EveryIterations(usize),
}

/// Bead insertion policy of the growing string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthConfig {
    /// Final bead count including endpoints
    pub target_beads: usize,
    /// Beads added per growth event
    pub beads_per_growth: usize,
    /// When growth happens
    pub trigger: GrowthTrigger,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            target_beads: 10,
            beads_per_growth: 2,
            trigger: GrowthTrigger::OnConvergence,
        }
    }
}

/// Convergence thresholds of the chain optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Largest allowed norm of any bead's orthogonal gradient
    pub gradient: f64,
    /// Largest allowed step component of any bead
    pub step: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            gradient: 1e-5,
            step: 1e-6,
        }
    }
}

/// Complete configuration of a path search.
///
/// # Examples
///
/// ```
/// use cospath::config::{PathConfig, PathMethod, SpringConstants};
///
/// let config = PathConfig {
///     method: PathMethod::Neb,
///     springs: SpringConstants::Uniform(2.0),
///     max_iterations: 200,
///     ..PathConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Chain model
    pub method: PathMethod,
    /// Iteration cap over the whole search, restarts included
    pub max_iterations: usize,
    /// Largest per-coordinate step of any bead
    pub max_step: f64,
    /// Convergence thresholds
    pub thresholds: Thresholds,
    /// Diagonal of every bead's starting Hessian
    pub initial_curvature: f64,
    /// Tangent estimator
    pub tangent: TangentMethod,
    /// Constraint enforced through Lagrange multipliers
    pub constraint: ConstraintPolicy,
    /// NEB spring constants
    pub springs: SpringConstants,
    /// Let the highest NEB bead climb towards the saddle
    pub climbing_image: bool,
    /// Growing-string insertion policy
    pub growth: GrowthConfig,
    /// Uneven-spacing threshold: largest tolerated deviation of a bead
    /// separation from the mean, as a fraction of the mean
    pub max_sep_ratio: f64,
    /// Number of respacing restarts before giving up
    pub max_regenerations: usize,
    /// Estimators run on the finished path; empty disables the analysis
    pub ts_estimators: Vec<TsEstimator>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            method: PathMethod::Sopt,
            max_iterations: 50,
            max_step: 0.05,
            thresholds: Thresholds::default(),
            initial_curvature: 70.0,
            tangent: TangentMethod::Averaged,
            constraint: ConstraintPolicy::None,
            springs: SpringConstants::default(),
            climbing_image: false,
            growth: GrowthConfig::default(),
            max_sep_ratio: 0.1,
            max_regenerations: 20,
            ts_estimators: TsEstimator::ALL.to_vec(),
        }
    }
}

impl PathConfig {
    /// Checks that every option is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &str, value: f64| {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::InvalidValue(format!(
                    "{} must be positive, got {}",
                    name, value
                )))
            }
        };

        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidValue(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        positive("max_step", self.max_step)?;
        positive("gradient tolerance", self.thresholds.gradient)?;
        positive("step tolerance", self.thresholds.step)?;
        positive("initial_curvature", self.initial_curvature)?;
        positive("max_sep_ratio", self.max_sep_ratio)?;

        if let Some(k) = self
            .springs
            .values()
            .into_iter()
            .find(|k| !(k.is_finite() && *k >= 0.0))
        {
            return Err(ConfigError::InvalidValue(format!(
                "spring constants must be non-negative, got {}",
                k
            )));
        }
        if let SpringConstants::PerGap(ks) = &self.springs {
            if ks.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "per-gap spring list is empty".to_string(),
                ));
            }
        }

        if self.method == PathMethod::GrowingString {
            if self.growth.target_beads < 3 {
                return Err(ConfigError::InvalidValue(format!(
                    "growth target must be at least 3 beads, got {}",
                    self.growth.target_beads
                )));
            }
            if self.growth.beads_per_growth == 0 {
                return Err(ConfigError::InvalidValue(
                    "beads_per_growth must be at least 1".to_string(),
                ));
            }
        }
        if self.growth.trigger == GrowthTrigger::EveryIterations(0) {
            return Err(ConfigError::InvalidValue(
                "growth trigger interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PathConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_tolerance() {
        let mut config = PathConfig::default();
        config.thresholds.gradient = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_rejects_negative_spring() {
        let config = PathConfig {
            springs: SpringConstants::PerGap(vec![1.0, -2.0]),
            ..PathConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_growth_target() {
        let config = PathConfig {
            method: PathMethod::GrowingString,
            growth: GrowthConfig {
                target_beads: 2,
                ..GrowthConfig::default()
            },
            ..PathConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_per_gap_springs_repeat_last() {
        let springs = SpringConstants::PerGap(vec![1.0, 2.0]);
        assert_eq!(springs.gap(0), 1.0);
        assert_eq!(springs.gap(5), 2.0);
        assert_eq!(SpringConstants::Uniform(3.0).gap(7), 3.0);
    }

    #[test]
    fn test_parse_method() {
        assert_eq!("NEB".parse::<PathMethod>().unwrap(), PathMethod::Neb);
        assert_eq!(
            "growingstring".parse::<PathMethod>().unwrap(),
            PathMethod::GrowingString
        );
    }
}
