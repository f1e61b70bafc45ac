//! Configuration schema types for instrument and plan trees.
//!
//! Three YAML trees describe an experiment:
//!
//! ```yaml
//! # devices.yml: one entry per device, keyed by name
//! NI-DAQ:
//!   type: daq
//!   model: ni6251
//!   driver: mock/Daq
//!   connection: {type: daq, port: 1}
//!
//! # sensors.yml / actuators.yml: properties nested under their owning device
//! NI-DAQ:
//!   photodiode1:
//!     port: ai0
//!     type: analog
//!     units: V
//!     calibration: {units: uW, slope: 12.5, offset: 0}
//!
//! # plan.yml: init paths, ordered scan blocks, finish blocks
//! init: {devices: devices.yml, sensors: sensors.yml, actuators: actuators.yml}
//! scan:
//!   laser:
//!     params: {property: wavelength, start: 1491 nm, stop: 1510 nm, step: 1 nm}
//!     detectors:
//!       NI-DAQ: [photodiode1]
//! finish:
//!   shutter: {actions: [close]}
//! ```
//!
//! Mapping order is significant (defaults are applied in declaration order and
//! scan blocks run in file order), so keyed collections deserialize into
//! [`Ordered`] rather than a hash map.

use crate::error::{AppResult, LabError};
use crate::hardware::property::Direction;
use crate::units::{Quantity, Unit};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;

// =============================================================================
// Shared value types
// =============================================================================

/// Mapping that keeps the order of its entries as written.
#[derive(Debug, Clone, PartialEq)]
pub struct Ordered<T>(pub Vec<(String, T)>);

impl<T> Default for Ordered<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Ordered<T> {
    /// Iterate entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Ordered<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = Ordered<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Ordered::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(Ordered(entries))
            }
        }

        deserializer.deserialize_any(OrderedVisitor(PhantomData))
    }
}

impl<T: Serialize> Serialize for Ordered<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Scalar configuration value: a flag, a bare number, or text such as `"10 nm/s"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSpec {
    /// YAML boolean
    Bool(bool),
    /// YAML number
    Number(f64),
    /// Anything else, including unit-suffixed quantities
    Text(String),
}

impl ValueSpec {
    /// Interpret as a unit-tagged quantity. Bare numbers are dimensionless.
    pub fn to_quantity(&self) -> AppResult<Quantity> {
        match self {
            ValueSpec::Number(v) => Ok(Quantity::new(*v, Unit::dimensionless())),
            ValueSpec::Text(s) => s.parse(),
            ValueSpec::Bool(b) => Err(LabError::Configuration(format!(
                "expected a quantity, got boolean {b}"
            ))),
        }
    }

    /// Interpret as a boolean; accepts `true/false`, `on/off`, `1/0`.
    pub fn to_flag(&self) -> AppResult<bool> {
        match self {
            ValueSpec::Bool(b) => Ok(*b),
            ValueSpec::Number(v) if *v == 0.0 || *v == 1.0 => Ok(*v == 1.0),
            ValueSpec::Text(s) => match s.to_lowercase().as_str() {
                "true" | "on" | "open" => Ok(true),
                "false" | "off" | "closed" => Ok(false),
                other => Err(LabError::Configuration(format!(
                    "expected a boolean, got '{other}'"
                ))),
            },
            ValueSpec::Number(v) => Err(LabError::Configuration(format!(
                "expected a boolean, got {v}"
            ))),
        }
    }
}

impl fmt::Display for ValueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSpec::Bool(b) => write!(f, "{b}"),
            ValueSpec::Number(v) => write!(f, "{v}"),
            ValueSpec::Text(s) => f.write_str(s),
        }
    }
}

// =============================================================================
// Devices
// =============================================================================

/// Physical link between the control computer and a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// GPIB bus
    #[serde(rename = "GPIB", alias = "gpib")]
    Gpib,
    /// USB
    #[serde(rename = "USB", alias = "usb")]
    Usb,
    /// RS-232 and friends
    #[serde(rename = "serial", alias = "Serial")]
    Serial,
    /// Data-acquisition card
    #[serde(rename = "daq", alias = "DAQ")]
    Daq,
    /// Simulated device
    #[serde(rename = "mock")]
    Mock,
}

/// `connection` block of a device spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Link type
    #[serde(rename = "type", default)]
    pub kind: Option<ConnectionKind>,
    /// Port, board number or address
    #[serde(default)]
    pub port: Option<ValueSpec>,
}

/// One device entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Unique name; defaults to the mapping key
    #[serde(default)]
    pub name: String,
    /// Device category ("daq", "laser", "shutter")
    #[serde(rename = "type", default)]
    pub device_type: String,
    /// Model identifier
    #[serde(default)]
    pub model: String,
    /// Driver spec, `module/Symbol`
    pub driver: String,
    /// Connection block
    #[serde(default)]
    pub connection: ConnectionSpec,
    /// Driver-specific options passed through to the factory
    #[serde(default)]
    pub options: Ordered<ValueSpec>,
}

impl DeviceSpec {
    /// Option value by key.
    pub fn option(&self, key: &str) -> Option<&ValueSpec> {
        self.options.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

// =============================================================================
// Properties (sensors and actuators)
// =============================================================================

/// `calibration` block: `target = slope * raw + offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSpec {
    /// Target unit
    pub units: String,
    /// Slope
    #[serde(default = "default_slope")]
    pub slope: f64,
    /// Offset, in the target unit
    #[serde(default)]
    pub offset: f64,
}

/// `limits` block in the target unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsSpec {
    /// Lower bound
    pub min: ValueSpec,
    /// Upper bound
    pub max: ValueSpec,
}

/// One sensor or actuator entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    /// Physical port / line
    #[serde(default)]
    pub port: Option<ValueSpec>,
    /// Signal kind (analog, digital, boolean, enumerated)
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Driver-specific acquisition mode
    #[serde(default)]
    pub mode: Option<String>,
    /// Direction override; sensors default to readable, actuators to writable
    #[serde(default)]
    pub direction: Option<Direction>,
    /// Raw unit reported by the driver
    #[serde(default)]
    pub units: Option<String>,
    /// Raw to target calibration
    #[serde(default)]
    pub calibration: Option<CalibrationSpec>,
    /// Safety limits in the target unit
    #[serde(default)]
    pub limits: Option<LimitsSpec>,
    /// Value applied once during init
    #[serde(default)]
    pub default: Option<ValueSpec>,
    /// Allowed values for enumerated properties
    #[serde(default)]
    pub choices: Vec<String>,
    /// Free text
    #[serde(default)]
    pub description: Option<String>,
}

/// Properties declared for one owning device.
pub type PropertyTree = Ordered<Ordered<PropertySpec>>;

// =============================================================================
// Plans
// =============================================================================

/// `init` block: where the instrument trees live.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InitSpec {
    /// Devices file
    #[serde(default)]
    pub devices: Option<PathBuf>,
    /// Sensors file
    #[serde(default)]
    pub sensors: Option<PathBuf>,
    /// Actuators file
    #[serde(default)]
    pub actuators: Option<PathBuf>,
}

/// A device action, either a bare name or a name with arguments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ActionSpec {
    /// `close`
    Name(String),
    /// `{name: start_sweep, args: [...]}`
    Call {
        /// Action name
        name: String,
        /// Positional arguments
        #[serde(default)]
        args: Vec<ValueSpec>,
    },
}

impl ActionSpec {
    /// Action name.
    pub fn name(&self) -> &str {
        match self {
            ActionSpec::Name(name) | ActionSpec::Call { name, .. } => name,
        }
    }

    /// Positional arguments.
    pub fn args(&self) -> &[ValueSpec] {
        match self {
            ActionSpec::Name(_) => &[],
            ActionSpec::Call { args, .. } => args,
        }
    }
}

/// `params` of a scan block.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScanParamsSpec {
    /// Actuator to sweep; may be omitted when the device has a single writable property
    #[serde(default)]
    pub property: Option<String>,
    /// First set-point
    pub start: ValueSpec,
    /// Last set-point (inclusive)
    pub stop: ValueSpec,
    /// Spacing between set-points
    #[serde(default)]
    pub step: Option<ValueSpec>,
    /// Sweep speed (with `interval_trigger`)
    #[serde(default)]
    pub speed: Option<ValueSpec>,
    /// Spacing between triggers during a sweep
    #[serde(default)]
    pub interval_trigger: Option<ValueSpec>,
    /// Wait after each write, before reading detectors
    #[serde(default)]
    pub settle: Option<ValueSpec>,
    /// Number of passes over the range
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

/// `before` / `after` actions of a scan block.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScanActionsSpec {
    /// Run once before the first set-point
    #[serde(default)]
    pub before: Vec<ActionSpec>,
    /// Run once after the last set-point
    #[serde(default)]
    pub after: Vec<ActionSpec>,
}

/// One scan block.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScanSpec {
    /// Target device; defaults to the block key
    #[serde(default)]
    pub device: Option<String>,
    /// Range and target property
    pub params: ScanParamsSpec,
    /// Owning device → detector property names
    #[serde(default)]
    pub detectors: Ordered<Vec<String>>,
    /// Device actions around the scan
    #[serde(default)]
    pub actions: ScanActionsSpec,
}

/// One finish block.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FinishSpec {
    /// Property values to apply
    #[serde(default)]
    pub set: Ordered<ValueSpec>,
    /// Actions to perform after the values are applied
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// Complete experiment plan file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlanSpec {
    /// Plan name
    #[serde(default)]
    pub name: String,
    /// Free text
    #[serde(default)]
    pub description: Option<String>,
    /// Instrument files
    #[serde(default)]
    pub init: InitSpec,
    /// Scan blocks in execution order
    #[serde(default)]
    pub scan: Ordered<ScanSpec>,
    /// Teardown blocks keyed by device
    #[serde(default)]
    pub finish: Ordered<FinishSpec>,
}

// Default value functions
fn default_slope() -> f64 {
    1.0
}

fn default_repeat() -> u32 {
    1
}
