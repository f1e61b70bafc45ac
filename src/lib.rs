//! # labscan Core Library
//!
//! Declarative laboratory experiments: describe instruments (devices and the
//! sensors/actuators wired to them) and experiment plans in YAML, then run
//! the plans against hardware drivers. The `labscan` binary is a thin CLI
//! over this library.
//!
//! ## Crate Structure
//!
//! - **`units`**: `Unit` and `Quantity`, magnitude + unit pairs parsed from strings
//!   such as `"10 nm/s"`. Mismatched units fail instead of being coerced.
//! - **`calibration`**: linear raw ↔ target conversion and target-unit safety limits.
//! - **`hardware`**: capability traits for drivers, the driver resolver, properties,
//!   the property registry and the device graph. Simulated drivers live in
//!   `hardware::mock`.
//! - **`config`**: typed YAML schema for device, property and plan trees, their
//!   loader, and figment-based application settings.
//! - **`experiment`**: plan resolution, the `RunEngine` orchestrator, scan records
//!   and result sinks.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the `LabError` taxonomy shared by all of the above.
//!
//! ## Example
//!
//! ```rust,ignore
//! use labscan::config::{load_experiment, Overrides};
//! use labscan::experiment::{MemorySink, RunEngine};
//! use labscan::hardware::{register_mock_factories, DeviceGraph, DriverResolver};
//!
//! let mut resolver = DriverResolver::new();
//! register_mock_factories(&mut resolver)?;
//!
//! let experiment = load_experiment(Path::new("plans/laser_scan.yml"), &Overrides::default())?;
//! let graph = DeviceGraph::load(&resolver, experiment.devices, &experiment.sensors, &experiment.actuators).await?;
//!
//! let engine = RunEngine::new(Arc::new(graph));
//! let mut sink = MemorySink::new();
//! let report = engine.run(&experiment.plan, &mut sink).await?;
//! ```

pub mod calibration;
pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod units;

pub use error::{AppResult, LabError, PropertyAddress};
pub use units::{Quantity, Unit};
