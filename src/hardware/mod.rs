//! Hardware abstraction
//!
//! Devices are reached only through capability traits ([`Readable`],
//! [`Writable`], [`Actionable`]). Drivers are built by [`DriverFactory`]
//! implementations registered with a [`DriverResolver`] under a
//! `module/Symbol` spec; configured sensors and actuators become
//! [`Property`] handles in the [`PropertyRegistry`] owned by the
//! [`DeviceGraph`].
//!
//! ```text
//! DeviceSpec ──resolve──> DriverFactory ──build──> DriverComponents
//!                                                      │
//! PropertySpec ──validate──> PropertyDefinition ───────┴──> Property (registry)
//! ```

pub mod capabilities;
pub mod driver;
pub mod graph;
pub mod mock;
pub mod property;
pub mod registry;

pub use capabilities::{Actionable, Channel, RawValue, Readable, Writable};
pub use driver::{Capability, DriverComponents, DriverFactory, DriverResolver};
pub use graph::{Device, DeviceGraph};
pub use mock::register_mock_factories;
pub use property::{Direction, Property, PropertyKind, PropertyState, PropertyValue};
pub use registry::PropertyRegistry;
