//! Configuration
//!
//! Two independent layers:
//! - Instrument and plan trees ([`schema`], [`loader`]): YAML files describing
//!   devices, the sensors/actuators wired to them, and experiment plans.
//! - Application settings ([`settings`]): logging and engine tunables loaded
//!   with figment from `labscan.toml` and `LABSCAN_*` environment variables.

pub mod loader;
pub mod schema;
pub mod settings;

pub use loader::{load_experiment, ConfigLoadError, LoadedExperiment, Overrides};
pub use schema::{DeviceSpec, PlanSpec, PropertySpec, PropertyTree};
pub use settings::Settings;
