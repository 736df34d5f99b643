//! cospath command-line interface
//!
//! Runs a path search on one of the built-in model surfaces using the layered
//! configuration (`/etc/cospath/cospath.cfg`, the user config directory and
//! `./cospath.cfg`).
//!
//! # Usage
//!
//! ```bash
//! # Müller-Brown search between the two deep minima with 9 beads
//! cospath
//!
//! # Another surface and bead count
//! cospath double-well 11
//!
//! # Use a specific configuration file instead of the layered lookup
//! cospath --config my_run.cfg muller-brown
//!
//! # Write a configuration template to ./cospath.cfg
//! cospath ci
//! ```

use cospath::settings::{SettingsManager, CONFIG_FILE_NAME};
use cospath::{
    find_path, Chain, DoubleWell, GaussianWells, MullerBrown, PathEvent, PathObserver,
    PathResult, PotentialSurface,
};
use log::{debug, error, info, warn};
use nalgebra::DVector;
use std::env;
use std::path::{Path, PathBuf};
use std::process;

const DEFAULT_BEADS: usize = 9;

/// Level used until the settings have chosen one.
const STARTUP_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// Built-in surfaces the binary can search on.
#[derive(Debug, Clone, Copy)]
enum Surface {
    MullerBrown,
    GaussianWells,
    DoubleWell,
}

impl Surface {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "muller-brown" | "mb" => Some(Surface::MullerBrown),
            "gaussian-wells" | "gw" => Some(Surface::GaussianWells),
            "double-well" | "dw" => Some(Surface::DoubleWell),
            _ => None,
        }
    }

    fn endpoints(self) -> (DVector<f64>, DVector<f64>) {
        match self {
            Surface::MullerBrown => (MullerBrown::minimum_a(), MullerBrown::minimum_b()),
            Surface::GaussianWells => (
                DVector::from_vec(vec![0.0, 0.0]),
                DVector::from_vec(vec![3.0, 3.0]),
            ),
            Surface::DoubleWell => (
                DVector::from_vec(vec![-1.0, 0.0]),
                DVector::from_vec(vec![1.0, 0.0]),
            ),
        }
    }
}

struct Arguments {
    config: Option<PathBuf>,
    surface: Surface,
    beads: usize,
}

fn print_usage() {
    println!("Usage:");
    println!("  cospath [--config FILE] [SURFACE] [BEADS]");
    println!("  cospath ci                 write {} template", CONFIG_FILE_NAME);
    println!();
    println!("Surfaces: muller-brown (default), gaussian-wells, double-well");
}

fn parse_arguments(args: &[String]) -> Result<Arguments, String> {
    let mut config = None;
    let mut surface = None;
    let mut beads = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let file = iter.next().ok_or("--config requires a file name")?;
                config = Some(PathBuf::from(file));
            }
            other => {
                if let Ok(count) = other.parse::<usize>() {
                    beads = Some(count);
                } else if let Some(s) = Surface::from_name(other) {
                    surface = Some(s);
                } else {
                    return Err(format!("Unknown argument: {}", other));
                }
            }
        }
    }
    Ok(Arguments {
        config,
        surface: surface.unwrap_or(Surface::MullerBrown),
        beads: beads.unwrap_or(DEFAULT_BEADS),
    })
}

fn run_create_settings_template() -> Result<(), Box<dyn std::error::Error>> {
    let settings_path = Path::new(CONFIG_FILE_NAME);
    if settings_path.exists() {
        return Err(format!(
            "{} already exists. Please remove it first or choose a different location.",
            CONFIG_FILE_NAME
        )
        .into());
    }
    SettingsManager::create_template(settings_path)?;
    println!("Wrote configuration template to {}", CONFIG_FILE_NAME);
    Ok(())
}

fn load_settings(config: Option<&Path>) -> Result<SettingsManager, Box<dyn std::error::Error>> {
    let manager = match config {
        Some(path) => SettingsManager::load_from(path)?,
        None => SettingsManager::load()?,
    };
    Ok(manager)
}

/// Starts the logger at [`STARTUP_LOG_LEVEL`].
///
/// The logger itself lets everything through; `log::set_max_level` decides
/// what is emitted, so the level can be raised once the settings are read.
fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Trace)
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();
    log::set_max_level(STARTUP_LOG_LEVEL);
}

/// Level requested by the settings, or the startup level if they are
/// missing or name an unknown level.
fn configured_log_level(manager: Option<&SettingsManager>) -> log::LevelFilter {
    manager
        .and_then(|m| m.logging().level_filter().ok())
        .unwrap_or(STARTUP_LOG_LEVEL)
}

fn log_event(event: &PathEvent<'_>) {
    match event {
        PathEvent::Iteration(report) => {
            debug!(
                "iter {:4}  max|g_perp| = {:.6e}  max step = {:.4e}{}  status = {:?}",
                report.iteration,
                report.max_orthogonal_gradient,
                report.max_step,
                if report.step_capped { " (capped)" } else { "" },
                report.status
            );
        }
        PathEvent::Regenerated { beads, count } => {
            info!("Respaced chain to {} beads (regeneration {})", beads, count);
        }
        PathEvent::Grown { from, to } => {
            info!("String grew from {} to {} beads", from, to);
        }
    }
}

fn report(result: &PathResult) {
    let stats = result.chain.statistics();
    info!("{}", "=".repeat(60));
    info!(
        "Search {} after {} iterations ({} regenerations, {} growth events)",
        if result.converged { "converged" } else { "stopped" },
        result.iterations,
        result.regenerations,
        result.growth_events
    );
    info!(
        "Path length {:.5}, {} beads, spacing {:.5}..{:.5}",
        stats.path_length, stats.num_points, stats.min_spacing, stats.max_spacing
    );
    for (i, node) in result.chain.nodes().iter().enumerate() {
        let position = node.position();
        let coordinates: Vec<String> = position.iter().map(|c| format!("{:10.6}", c)).collect();
        match node.energy() {
            Some(e) => info!("  bead {:3}  [{}]  E = {:.6}", i, coordinates.join(" "), e),
            None => info!("  bead {:3}  [{}]", i, coordinates.join(" ")),
        }
    }
    if result.transition_states.is_empty() {
        return;
    }
    info!("Transition-state estimates:");
    for ts in &result.transition_states {
        let coordinates: Vec<String> = ts
            .candidate
            .position
            .iter()
            .map(|c| format!("{:10.6}", c))
            .collect();
        info!(
            "  {:14} E = {:12.6}  s = {:7.4}  [{}]  d2E/ds2 = {:.4e}",
            ts.estimator.name(),
            ts.candidate.energy,
            ts.candidate.ts_param,
            coordinates.join(" "),
            ts.analysis.energy_curvature
        );
    }
}

fn run_search(
    args: &Arguments,
    manager: &SettingsManager,
) -> Result<PathResult, Box<dyn std::error::Error>> {
    let (start, end) = args.surface.endpoints();
    let mut chain = Chain::linear(&start, &end, args.beads)?;
    // The straight double-well chain is already the minimum energy path, so bow it.
    if let Surface::DoubleWell = args.surface {
        let mut interior = chain.interior_positions();
        let last = interior.len().saturating_sub(1) as f64;
        for (i, p) in interior.iter_mut().enumerate() {
            let t = (i as f64 + 1.0) / (last + 2.0);
            p[1] = 0.4 * (std::f64::consts::PI * t).sin();
        }
        chain.set_interior_positions(&interior)?;
    }

    let surface: Box<dyn PotentialSurface> = match args.surface {
        Surface::MullerBrown => Box::new(MullerBrown),
        Surface::GaussianWells => Box::new(GaussianWells),
        Surface::DoubleWell => Box::new(DoubleWell::default()),
    };

    let config = manager.path_config();
    info!(
        "Surface {:?}, method {}, {} beads",
        args.surface,
        config.method.name(),
        chain.len()
    );
    let observer = PathObserver::with_callback(Box::new(|event: &PathEvent<'_>| log_event(event)));
    Ok(find_path(config, chain, surface.as_ref(), &observer)?)
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    init_logging();

    if args.first().map(String::as_str) == Some("ci") {
        if let Err(e) = run_create_settings_template() {
            error!("Failed to create configuration template: {}", e);
            process::exit(1);
        }
        return;
    }

    let arguments = match parse_arguments(&args) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}", e);
            print_usage();
            process::exit(2);
        }
    };

    let loaded = load_settings(arguments.config.as_deref());
    let (manager, load_error) = match loaded {
        Ok(m) => (Some(m), None),
        Err(e) => (None, Some(e)),
    };
    log::set_max_level(configured_log_level(manager.as_ref()));

    let manager = match (manager, load_error) {
        (Some(m), _) => m,
        (None, Some(e)) if arguments.config.is_some() => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
        (None, e) => {
            if let Some(e) = e {
                warn!("Failed to load configuration ({}); using defaults", e);
            }
            match SettingsManager::parse("") {
                Ok(m) => m,
                Err(e) => {
                    error!("Built-in defaults rejected: {}", e);
                    process::exit(1);
                }
            }
        }
    };

    match run_search(&arguments, &manager) {
        Ok(result) => {
            report(&result);
            if !result.converged {
                process::exit(3);
            }
        }
        Err(e) => {
            error!("Path search failed: {}", e);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_follows_settings() {
        let manager = SettingsManager::parse("[logging]\nlevel = debug\n").unwrap();
        assert_eq!(configured_log_level(Some(&manager)), log::LevelFilter::Debug);

        let defaults = SettingsManager::parse("").unwrap();
        assert_eq!(configured_log_level(Some(&defaults)), log::LevelFilter::Info);
    }

    #[test]
    fn test_missing_settings_keep_startup_level() {
        assert_eq!(configured_log_level(None), STARTUP_LOG_LEVEL);
    }

    #[test]
    fn test_arguments() {
        let args: Vec<String> = ["--config", "run.cfg", "dw", "11"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = parse_arguments(&args).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("run.cfg")));
        assert!(matches!(parsed.surface, Surface::DoubleWell));
        assert_eq!(parsed.beads, 11);
        assert!(parse_arguments(&["nowhere".to_string()]).is_err());
    }
}
