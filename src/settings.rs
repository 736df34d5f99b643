//! Configuration management for cospath.
//!
//! Search options can be supplied through INI files. Files are searched in
//! hierarchical order, each one overriding the keys it sets:
//!
//! 1. System configuration (`/etc/cospath/cospath.cfg`)
//! 2. User configuration (`~/.config/cospath/cospath.cfg`)
//! 3. Local configuration (`./cospath.cfg`)
//!
//! Keys that no file sets keep their built-in defaults.
//!
//! # Configuration File Format
//!
//! ```ini
//! [optimizer]
//! method = neb
//! max_iterations = 200
//! max_step = 0.05
//!
//! [path]
//! tangent = averaged
//! constraint = none
//!
//! [neb]
//! springs = 1.0, 2.0, 1.0
//! climbing_image = true
//!
//! [string]
//! target_beads = 12
//! growth_trigger = every-iterations
//! growth_interval = 10
//!
//! [ts]
//! estimators = spline, spline-cubic, three-point
//!
//! [logging]
//! level = debug
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use cospath::settings::SettingsManager;
//!
//! let settings = SettingsManager::load()?;
//! println!("max step: {}", settings.path_config().max_step);
//! # Ok::<(), cospath::settings::ConfigError>(())
//! ```

use crate::config::{GrowthTrigger, PathConfig, SpringConstants};
use crate::transition_state::TsEstimator;
use configparser::ini::Ini;
use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// File name looked up in every configuration directory.
pub const CONFIG_FILE_NAME: &str = "cospath.cfg";

type Section = HashMap<String, Option<String>>;

/// Errors that can occur during configuration loading and processing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading configuration files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Everything a configuration file can set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Search options
    pub path: PathConfig,
    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Logging configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level: off, error, warn, info, debug or trace (default: "info")
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingSettings {
    /// The level as a `log` filter.
    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("Invalid log level: {}", self.level)))
    }
}

/// Configuration manager that handles loading and accessing program settings.
#[derive(Debug, Clone)]
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
}

impl SettingsManager {
    /// Loads configuration from the system, user and local files that exist.
    ///
    /// A file that fails to parse is skipped with a warning; the merged result
    /// must still validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();

        let candidates = [
            ("system", Self::get_system_config_path()),
            ("user", Self::get_user_config_path()),
            ("local", Some(PathBuf::from(CONFIG_FILE_NAME))),
        ];
        for (label, path) in candidates {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            let mut layered = settings.clone();
            match Self::read_file(&path).and_then(|ini| Self::apply(&mut layered, &ini)) {
                Ok(()) => {
                    settings = layered;
                    config_source = format!("{} config ({})", label, path.display());
                    debug!("Loaded {} configuration from: {}", label, path.display());
                }
                Err(e) => {
                    warn!(
                        "Failed to load {} config from {}: {}",
                        label,
                        path.display(),
                        e
                    );
                }
            }
        }

        settings.path.validate()?;
        info!("Configuration loaded from: {}", config_source);
        Ok(Self {
            settings,
            config_source,
        })
    }

    /// Loads a single file on top of the built-in defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Self::read_file(path)?;
        let manager = Self::from_ini(ini, format!("file ({})", path.display()))?;
        info!("Configuration loaded from: {}", manager.config_source);
        Ok(manager)
    }

    /// Parses INI text on top of the built-in defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut ini = Ini::new();
        ini.read(content.to_string())
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;
        Self::from_ini(ini, "inline text".to_string())
    }

    fn from_ini(ini: Ini, config_source: String) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        Self::apply(&mut settings, &ini)?;
        settings.path.validate()?;
        Ok(Self {
            settings,
            config_source,
        })
    }

    /// Returns the source of the loaded configuration.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Gets a reference to the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Gets the search options.
    pub fn path_config(&self) -> &PathConfig {
        &self.settings.path
    }

    /// Gets the logging settings.
    pub fn logging(&self) -> &LoggingSettings {
        &self.settings.logging
    }

    /// Consumes the manager, returning the settings.
    pub fn into_settings(self) -> Settings {
        self.settings
    }

    fn read_file(path: &Path) -> Result<Ini, ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut ini = Ini::new();
        ini.read(content)
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;
        Ok(ini)
    }

    /// Overrides every key `ini` sets.
    fn apply(settings: &mut Settings, ini: &Ini) -> Result<(), ConfigError> {
        let map = ini.get_map_ref();
        let path = &mut settings.path;

        if let Some(section) = map.get("optimizer") {
            set(section, "method", &mut path.method)?;
            set(section, "max_iterations", &mut path.max_iterations)?;
            set(section, "max_step", &mut path.max_step)?;
            set(section, "gradient_tolerance", &mut path.thresholds.gradient)?;
            set(section, "step_tolerance", &mut path.thresholds.step)?;
            set(section, "initial_curvature", &mut path.initial_curvature)?;
        }

        if let Some(section) = map.get("path") {
            set(section, "tangent", &mut path.tangent)?;
            set(section, "constraint", &mut path.constraint)?;
        }

        if let Some(section) = map.get("neb") {
            if let Some(springs) = value(section, "springs") {
                path.springs = parse_springs(springs)?;
            }
            set(section, "climbing_image", &mut path.climbing_image)?;
        }

        if let Some(section) = map.get("string") {
            set(section, "target_beads", &mut path.growth.target_beads)?;
            set(section, "beads_per_growth", &mut path.growth.beads_per_growth)?;
            set(section, "max_sep_ratio", &mut path.max_sep_ratio)?;
            set(section, "max_regenerations", &mut path.max_regenerations)?;
            let mut interval = match path.growth.trigger {
                GrowthTrigger::EveryIterations(n) => n,
                GrowthTrigger::OnConvergence => 10,
            };
            set(section, "growth_interval", &mut interval)?;
            let trigger = value(section, "growth_trigger").map(|t| t.to_lowercase());
            path.growth.trigger = match trigger.as_deref() {
                None => match path.growth.trigger {
                    GrowthTrigger::EveryIterations(_) => GrowthTrigger::EveryIterations(interval),
                    GrowthTrigger::OnConvergence => GrowthTrigger::OnConvergence,
                },
                Some("on-convergence") => GrowthTrigger::OnConvergence,
                Some("every-iterations") => GrowthTrigger::EveryIterations(interval),
                Some(other) => {
                    return Err(ConfigError::InvalidValue(format!(
                        "Invalid growth_trigger: {}",
                        other
                    )))
                }
            };
        }

        if let Some(section) = map.get("ts") {
            if let Some(list) = value(section, "estimators") {
                path.ts_estimators = parse_estimators(list)?;
            }
        }

        if let Some(section) = map.get("logging") {
            if let Some(level) = value(section, "level") {
                settings.logging.level = level.to_string();
                settings.logging.level_filter()?;
            }
        }

        Ok(())
    }

    /// Gets the system configuration file path.
    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/cospath").join(CONFIG_FILE_NAME))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("cospath").join(CONFIG_FILE_NAME))
        }
    }

    /// Gets the user configuration file path.
    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("cospath")
                    .join(CONFIG_FILE_NAME)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("cospath").join(CONFIG_FILE_NAME))
        }
    }
}

fn value<'a>(section: &'a Section, key: &str) -> Option<&'a str> {
    match section.get(key) {
        Some(Some(v)) if !v.trim().is_empty() => Some(v.trim()),
        _ => None,
    }
}

/// Parses `key` into `target` if the section sets it.
fn set<T>(section: &Section, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = value(section, key) {
        *target = raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("Invalid {} '{}': {}", key, raw, e)))?;
    }
    Ok(())
}

fn parse_springs(raw: &str) -> Result<SpringConstants, ConfigError> {
    let values = raw
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValue(format!("Invalid spring constant: {}", s)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    match values.as_slice() {
        [] => Err(ConfigError::InvalidValue("springs is empty".to_string())),
        [k] => Ok(SpringConstants::Uniform(*k)),
        _ => Ok(SpringConstants::PerGap(values)),
    }
}

fn parse_estimators(raw: &str) -> Result<Vec<TsEstimator>, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "all" => return Ok(TsEstimator::ALL.to_vec()),
        "none" => return Ok(Vec::new()),
        _ => {}
    }
    raw.split(',')
        .map(|s| s.parse().map_err(ConfigError::InvalidValue))
        .collect()
}

impl SettingsManager {
    /// Writes a commented template holding every option at its default.
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    /// Generates the content for a cospath.cfg template file.
    fn generate_template_content() -> String {
        let defaults = PathConfig::default();
        let springs = match &defaults.springs {
            SpringConstants::Uniform(k) => k.to_string(),
            SpringConstants::PerGap(ks) => ks
                .iter()
                .map(|k| k.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        };
        let (trigger, interval) = match defaults.growth.trigger {
            GrowthTrigger::OnConvergence => ("on-convergence", 10),
            GrowthTrigger::EveryIterations(n) => ("every-iterations", n),
        };
        let estimators = defaults
            .ts_estimators
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            r#"# cospath configuration file
#
# Files are loaded in this order, later ones overriding the keys they set:
#
# 1. /etc/cospath/cospath.cfg
# 2. ~/.config/cospath/cospath.cfg
# 3. ./cospath.cfg
#
# Missing sections or keys keep the built-in defaults shown below.

[optimizer]
# Chain model: sopt, neb, string, growing-string
method = {method}

# Iteration cap over the whole search, restarts included
max_iterations = {max_iterations}

# Largest per-coordinate step of any bead
max_step = {max_step}

# Converged when every bead's orthogonal gradient norm is below this
gradient_tolerance = {gradient}

# Converged when every step component is below this
step_tolerance = {step}

# Diagonal of the starting Hessian of every bead
initial_curvature = {curvature}

[path]
# Tangent estimator: averaged, central, curve-derivative
tangent = {tangent}

# Constraint: none, orthogonal-step, uniform-spacing
constraint = {constraint}

[neb]
# One value for uniform springs, or one value per gap separated by commas
springs = {springs}

# Let the highest bead climb to the saddle point
climbing_image = {climbing}

[string]
# Final bead count of a growing string, endpoints included
target_beads = {target}

# Beads added per growth event
beads_per_growth = {per_growth}

# When to grow: on-convergence, every-iterations
growth_trigger = {trigger}

# Iterations between growth events for every-iterations
growth_interval = {interval}

# Respace when a bead separation deviates from the mean by more than this fraction
max_sep_ratio = {ratio}

# Respacing restarts before giving up
max_regenerations = {regenerations}

[ts]
# Comma-separated subset of: highest, spline, spline-average, spline-cubic,
# bell, three-point. Use "all" or "none".
estimators = {estimators}

[logging]
# Log level: off, error, warn, info, debug, trace
level = {level}
"#,
            method = defaults.method.name(),
            max_iterations = defaults.max_iterations,
            max_step = defaults.max_step,
            gradient = defaults.thresholds.gradient,
            step = defaults.thresholds.step,
            curvature = defaults.initial_curvature,
            tangent = defaults.tangent.name(),
            constraint = defaults.constraint.name(),
            springs = springs,
            climbing = defaults.climbing_image,
            target = defaults.growth.target_beads,
            per_growth = defaults.growth.beads_per_growth,
            trigger = trigger,
            interval = interval,
            ratio = defaults.max_sep_ratio,
            regenerations = defaults.max_regenerations,
            estimators = estimators,
            level = LoggingSettings::default().level,
        )
    }
}
