//! Loading of instrument and plan trees from YAML files.
//!
//! # Usage
//!
//! ```rust,ignore
//! use labscan::config::loader::load_experiment;
//!
//! // Reads the plan, then the device/sensor/actuator files named in its `init` block
//! let experiment = load_experiment(Path::new("config/laser_scan.yml"), &Overrides::default())?;
//! let graph = DeviceGraph::load(&resolver, experiment.devices, &experiment.sensors, &experiment.actuators).await?;
//! ```
//!
//! Files are parsed with `serde_yaml` directly rather than through figment:
//! figment collects mappings into sorted dictionaries, which would lose the
//! declaration order that defaults and scan blocks depend on.

use super::schema::{DeviceSpec, Ordered, PlanSpec, PropertyTree};
use crate::error::LabError;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// File read error
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// Offending file
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Parse error (invalid YAML or wrong shape)
    #[error("Failed to parse config {path}: {source}")]
    ParseError {
        /// Offending file (or "<inline>")
        path: String,
        /// Underlying error
        #[source]
        source: serde_yaml::Error,
    },

    /// Validation error
    #[error("Config validation failed for {path}: {message}")]
    ValidationError {
        /// Offending file (or "<inline>")
        path: String,
        /// What is wrong
        message: String,
    },
}

impl From<ConfigLoadError> for LabError {
    fn from(value: ConfigLoadError) -> Self {
        LabError::Configuration(value.to_string())
    }
}

const INLINE: &str = "<inline>";

fn read(path: &Path) -> Result<String, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()));
    }
    debug!("Loading config from: {}", path.display());
    std::fs::read_to_string(path).map_err(|source| ConfigLoadError::ReadError {
        path: path.display().to_string(),
        source,
    })
}

fn parse<T: DeserializeOwned>(yaml: &str, origin: &str) -> Result<T, ConfigLoadError> {
    serde_yaml::from_str(yaml).map_err(|source| ConfigLoadError::ParseError {
        path: origin.to_string(),
        source,
    })
}

// =============================================================================
// Devices
// =============================================================================

fn devices_from(yaml: &str, origin: &str) -> Result<Vec<DeviceSpec>, ConfigLoadError> {
    let entries: Ordered<DeviceSpec> = parse(yaml, origin)?;
    let mut devices = Vec::with_capacity(entries.len());
    for (key, mut spec) in entries.0 {
        if spec.name.is_empty() {
            spec.name = key;
        }
        if spec.driver.trim().is_empty() {
            return Err(ConfigLoadError::ValidationError {
                path: origin.to_string(),
                message: format!("device '{}' has an empty driver", spec.name),
            });
        }
        devices.push(spec);
    }
    Ok(devices)
}

/// Parse a devices tree. Entries without `name` take their mapping key.
pub fn parse_devices(yaml: &str) -> Result<Vec<DeviceSpec>, ConfigLoadError> {
    devices_from(yaml, INLINE)
}

/// Load a devices file.
pub fn load_devices(path: &Path) -> Result<Vec<DeviceSpec>, ConfigLoadError> {
    let devices = devices_from(&read(path)?, &path.display().to_string())?;
    info!(count = devices.len(), "Loaded devices from {}", path.display());
    Ok(devices)
}

// =============================================================================
// Sensors and actuators
// =============================================================================

/// Parse a sensors or actuators tree.
pub fn parse_properties(yaml: &str) -> Result<PropertyTree, ConfigLoadError> {
    parse(yaml, INLINE)
}

/// Load a sensors or actuators file.
pub fn load_properties(path: &Path) -> Result<PropertyTree, ConfigLoadError> {
    let tree: PropertyTree = parse(&read(path)?, &path.display().to_string())?;
    let count: usize = tree.iter().map(|(_, props)| props.len()).sum();
    info!(count, "Loaded properties from {}", path.display());
    Ok(tree)
}

// =============================================================================
// Plans
// =============================================================================

fn validate_plan(plan: &PlanSpec, origin: &str) -> Result<(), ConfigLoadError> {
    let invalid = |message: String| ConfigLoadError::ValidationError {
        path: origin.to_string(),
        message,
    };
    for (name, scan) in plan.scan.iter() {
        if scan.params.repeat == 0 {
            return Err(invalid(format!("scan '{name}' has repeat: 0")));
        }
        let stepped = scan.params.step.is_some();
        let swept = scan.params.speed.is_some() || scan.params.interval_trigger.is_some();
        if stepped == swept {
            return Err(invalid(format!(
                "scan '{name}' needs either 'step' or 'speed' + 'interval_trigger'"
            )));
        }
        if swept && (scan.params.speed.is_none() || scan.params.interval_trigger.is_none()) {
            return Err(invalid(format!(
                "scan '{name}' sweep needs both 'speed' and 'interval_trigger'"
            )));
        }
    }
    Ok(())
}

/// Parse a plan tree.
pub fn parse_plan(yaml: &str) -> Result<PlanSpec, ConfigLoadError> {
    let plan = parse(yaml, INLINE)?;
    validate_plan(&plan, INLINE)?;
    Ok(plan)
}

/// Load a plan file.
pub fn load_plan(path: &Path) -> Result<PlanSpec, ConfigLoadError> {
    let origin = path.display().to_string();
    let mut plan: PlanSpec = parse(&read(path)?, &origin)?;
    validate_plan(&plan, &origin)?;
    if plan.name.is_empty() {
        plan.name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    Ok(plan)
}

// =============================================================================
// Whole experiment
// =============================================================================

/// Instrument files that take precedence over the plan's `init` block.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Device files, applied in order (later definitions win)
    pub devices: Vec<PathBuf>,
    /// Sensors file
    pub sensors: Option<PathBuf>,
    /// Actuators file
    pub actuators: Option<PathBuf>,
}

/// Everything needed to build a device graph and run a plan.
#[derive(Debug, Clone)]
pub struct LoadedExperiment {
    /// The plan
    pub plan: PlanSpec,
    /// Device specs from all device files, in order
    pub devices: Vec<DeviceSpec>,
    /// Sensors tree
    pub sensors: PropertyTree,
    /// Actuators tree
    pub actuators: PropertyTree,
}

/// Load a plan and the instrument files it (or `overrides`) names.
///
/// Relative paths in the plan's `init` block resolve against the plan's directory.
pub fn load_experiment(
    plan_path: &Path,
    overrides: &Overrides,
) -> Result<LoadedExperiment, ConfigLoadError> {
    let plan = load_plan(plan_path)?;
    let base = plan_path.parent().unwrap_or_else(|| Path::new("."));
    let relative = |p: &PathBuf| if p.is_absolute() { p.clone() } else { base.join(p) };

    let device_files: Vec<PathBuf> = if overrides.devices.is_empty() {
        plan.init.devices.iter().map(relative).collect()
    } else {
        overrides.devices.clone()
    };
    if device_files.is_empty() {
        return Err(ConfigLoadError::ValidationError {
            path: plan_path.display().to_string(),
            message: "no devices file given (init.devices or --devices)".into(),
        });
    }
    let mut devices = Vec::new();
    for file in &device_files {
        devices.extend(load_devices(file)?);
    }

    let tree = |explicit: &Option<PathBuf>, planned: &Option<PathBuf>| {
        match explicit.clone().or_else(|| planned.as_ref().map(relative)) {
            Some(path) => load_properties(&path),
            None => Ok(PropertyTree::default()),
        }
    };
    let sensors = tree(&overrides.sensors, &plan.init.sensors)?;
    let actuators = tree(&overrides.actuators, &plan.init.actuators)?;

    Ok(LoadedExperiment {
        plan,
        devices,
        sensors,
        actuators,
    })
}
