//! Device properties: the unit of reading and writing.
//!
//! Sensors and actuators are both [`Property`] values. A property knows which
//! driver capability it is bound to, how its raw values map onto physical
//! units, and which values it may never be driven to.
//!
//! Building a property happens in two steps:
//!
//! 1. [`PropertyDefinition::from_spec`] validates the configuration entry
//!    (calibration, limits, default, kind). No driver is involved, so every
//!    configuration mistake surfaces before hardware is touched.
//! 2. The registry binds the definition to the owning device's
//!    [`DriverComponents`] once drivers are built.

use crate::calibration::{Calibration, Limits};
use crate::config::schema::{PropertySpec, ValueSpec};
use crate::error::{AppResult, LabError, PropertyAddress};
use crate::hardware::capabilities::{Channel, RawValue};
use crate::hardware::driver::DriverComponents;
use crate::units::{Quantity, Unit};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

// =============================================================================
// Classification
// =============================================================================

/// Which way values flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sensor
    #[serde(alias = "read", alias = "input")]
    Readable,
    /// Actuator
    #[serde(alias = "write", alias = "output")]
    Writable,
    /// Read-back actuator
    #[serde(alias = "rw")]
    Both,
}

impl Direction {
    /// Whether `get` is allowed.
    pub fn can_read(self) -> bool {
        matches!(self, Direction::Readable | Direction::Both)
    }

    /// Whether `set` is allowed.
    pub fn can_write(self) -> bool {
        matches!(self, Direction::Writable | Direction::Both)
    }
}

/// Signal kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    /// Continuous value, optionally calibrated
    Analog,
    /// Digital line
    Digital,
    /// On/off setting
    Boolean,
    /// One of a fixed set of choices
    Enumerated,
}

impl FromStr for PropertyKind {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "analog" | "analog_input" | "analog_output" | "ai" | "ao" => Ok(PropertyKind::Analog),
            "digital" | "digital_input" | "digital_output" | "di" | "do" => {
                Ok(PropertyKind::Digital)
            }
            "boolean" | "bool" => Ok(PropertyKind::Boolean),
            "enumerated" | "enum" => Ok(PropertyKind::Enumerated),
            other => Err(LabError::Configuration(format!(
                "Unknown property type '{other}'. Must be one of: analog, digital, boolean, enumerated"
            ))),
        }
    }
}

/// A value in the target (user-facing) domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Analog value with its unit
    Quantity(Quantity),
    /// Digital or boolean state
    Flag(bool),
    /// Enumerated setting
    Choice(String),
}

impl PropertyValue {
    /// Quantity payload, if any.
    pub fn as_quantity(&self) -> Option<&Quantity> {
        match self {
            PropertyValue::Quantity(q) => Some(q),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Quantity(q) => write!(f, "{q}"),
            PropertyValue::Flag(b) => write!(f, "{b}"),
            PropertyValue::Choice(c) => f.write_str(c),
        }
    }
}

/// What the registry knows about the hardware value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyState {
    /// Never read or written
    Unset,
    /// Last successful read or write
    Known(PropertyValue),
    /// A write failed; the hardware may or may not have changed
    Unknown,
}

// =============================================================================
// Definition
// =============================================================================

/// Validated, driver-independent description of a property.
#[derive(Debug, Clone)]
pub struct PropertyDefinition {
    /// Property name
    pub name: String,
    /// Name of the owning device (back-reference only)
    pub owner_device: String,
    /// Readable, writable or both
    pub direction: Direction,
    /// Signal kind
    pub kind: PropertyKind,
    /// Unit the driver reports in
    pub raw_unit: Unit,
    /// Raw to target transform, analog only
    pub calibration: Option<Calibration>,
    /// Safety bounds in the target unit, analog only
    pub limits: Option<Limits>,
    /// Value applied during init
    pub default: Option<PropertyValue>,
    /// Allowed values for enumerated properties
    pub choices: Vec<String>,
    /// Driver binding
    pub channel: Channel,
}

impl PropertyDefinition {
    /// Validate a configuration entry.
    ///
    /// `fallback` is the direction used when the entry has no `direction`
    /// field: sensors are readable, actuators writable.
    pub fn from_spec(
        device: &str,
        name: &str,
        spec: &PropertySpec,
        fallback: Direction,
    ) -> AppResult<Self> {
        let address = PropertyAddress::new(device, name);
        let context = |e: LabError| match e {
            LabError::Configuration(msg) => LabError::Configuration(format!("{address}: {msg}")),
            LabError::Calibration(msg) => LabError::Calibration(format!("{address}: {msg}")),
            other => other,
        };

        let kind = match &spec.kind {
            Some(kind) => kind.parse().map_err(context)?,
            None => PropertyKind::Analog,
        };
        let direction = spec.direction.unwrap_or(fallback);
        let raw_unit = Unit::parse(spec.units.as_deref().unwrap_or_default()).map_err(context)?;

        if kind != PropertyKind::Analog && (spec.calibration.is_some() || spec.limits.is_some()) {
            return Err(context(LabError::Configuration(
                "calibration and limits only apply to analog properties".into(),
            )));
        }

        let calibration = spec
            .calibration
            .as_ref()
            .map(|c| Calibration::new(Unit::parse(&c.units)?, c.slope, c.offset))
            .transpose()
            .map_err(context)?;
        let target_unit = calibration
            .as_ref()
            .map_or_else(|| raw_unit.clone(), |c| c.target_unit.clone());

        let limits = spec
            .limits
            .as_ref()
            .map(|l| {
                let min = l.min.to_quantity()?.or_unit(&target_unit);
                let max = l.max.to_quantity()?.or_unit(&target_unit);
                Limits::from_quantities(&min, &max, &target_unit)
            })
            .transpose()
            .map_err(context)?;

        if direction.can_write()
            && limits.is_none()
            && calibration.as_ref().is_some_and(|c| !c.is_trivial())
        {
            return Err(context(LabError::Calibration(
                "writable calibrated property requires limits in the target unit".into(),
            )));
        }

        if kind == PropertyKind::Enumerated && spec.choices.is_empty() {
            return Err(context(LabError::Configuration(
                "enumerated property needs a non-empty 'choices' list".into(),
            )));
        }

        let mut definition = Self {
            name: name.to_string(),
            owner_device: device.to_string(),
            direction,
            kind,
            raw_unit,
            calibration,
            limits,
            default: None,
            choices: spec.choices.clone(),
            channel: Channel {
                name: name.to_string(),
                port: spec.port.as_ref().map(ValueSpec::to_string),
                kind,
                mode: spec.mode.clone(),
            },
        };

        if let Some(default) = &spec.default {
            if !direction.can_write() {
                return Err(context(LabError::Configuration(
                    "a default value needs a writable property".into(),
                )));
            }
            let value = definition.parse_value(default).map_err(context)?;
            // Out-of-range defaults would only fail later, during init.
            definition.encode(&value).map_err(|e| {
                context(LabError::Configuration(format!("default {default}: {e}")))
            })?;
            definition.default = Some(value);
        }

        Ok(definition)
    }

    /// Global address.
    pub fn address(&self) -> PropertyAddress {
        PropertyAddress::new(&self.owner_device, &self.name)
    }

    /// Unit of user-facing values.
    pub fn target_unit(&self) -> &Unit {
        self.calibration
            .as_ref()
            .map_or(&self.raw_unit, |c| &c.target_unit)
    }

    /// Interpret a configuration value for this property.
    ///
    /// Bare numbers given to an analog property are taken to be in the target unit.
    pub fn parse_value(&self, value: &ValueSpec) -> AppResult<PropertyValue> {
        match self.kind {
            PropertyKind::Analog => {
                let q = value.to_quantity()?.or_unit(self.target_unit());
                Ok(PropertyValue::Quantity(q.to(self.target_unit())?))
            }
            PropertyKind::Digital | PropertyKind::Boolean => Ok(PropertyValue::Flag(value.to_flag()?)),
            PropertyKind::Enumerated => Ok(PropertyValue::Choice(value.to_string())),
        }
    }

    /// Target value to raw driver value, enforcing units, limits and choices.
    ///
    /// Never touches the driver.
    pub fn encode(&self, value: &PropertyValue) -> AppResult<RawValue> {
        match (self.kind, value) {
            (PropertyKind::Analog, PropertyValue::Quantity(q)) => {
                let target = q.value_in(self.target_unit())?;
                let raw = match &self.calibration {
                    Some(cal) => cal.to_raw(target)?,
                    None => target,
                };
                if let Some(limits) = &self.limits {
                    limits.check(&self.address(), target)?;
                }
                Ok(RawValue::Number(raw))
            }
            (PropertyKind::Digital | PropertyKind::Boolean, PropertyValue::Flag(b)) => {
                Ok(RawValue::Flag(*b))
            }
            (PropertyKind::Enumerated, PropertyValue::Choice(c)) => {
                if self.choices.iter().any(|allowed| allowed == c) {
                    Ok(RawValue::Choice(c.clone()))
                } else {
                    Err(LabError::Configuration(format!(
                        "'{c}' is not a valid choice for {} (allowed: {})",
                        self.address(),
                        self.choices.join(", ")
                    )))
                }
            }
            (kind, value) => Err(LabError::Configuration(format!(
                "{value} is not a valid value for {kind:?} property {}",
                self.address()
            ))),
        }
    }

    /// Raw driver value to target value.
    pub fn decode(&self, raw: RawValue) -> anyhow::Result<PropertyValue> {
        match (self.kind, raw) {
            (PropertyKind::Analog, RawValue::Number(raw)) => {
                let target = match &self.calibration {
                    Some(cal) => cal.to_target(raw),
                    None => raw,
                };
                Ok(PropertyValue::Quantity(Quantity::new(
                    target,
                    self.target_unit().clone(),
                )))
            }
            (PropertyKind::Digital | PropertyKind::Boolean, RawValue::Flag(b)) => {
                Ok(PropertyValue::Flag(b))
            }
            (PropertyKind::Digital | PropertyKind::Boolean, RawValue::Number(v)) => {
                Ok(PropertyValue::Flag(v != 0.0))
            }
            (PropertyKind::Enumerated, RawValue::Choice(c)) => Ok(PropertyValue::Choice(c)),
            (kind, raw) => anyhow::bail!("driver returned {raw:?} for a {kind:?} property"),
        }
    }
}

// =============================================================================
// Bound property
// =============================================================================

/// A property bound to its driver.
///
/// Reads and writes on one property are serialized by an async I/O lock, so
/// at most one driver call is in flight for it. Definition data is immutable
/// after construction; only the tracked [`PropertyState`] changes.
pub struct Property {
    definition: PropertyDefinition,
    components: DriverComponents,
    io: tokio::sync::Mutex<()>,
    state: Mutex<PropertyState>,
}

impl Property {
    pub(crate) fn new(definition: PropertyDefinition, components: DriverComponents) -> Self {
        Self {
            definition,
            components,
            io: tokio::sync::Mutex::new(()),
            state: Mutex::new(PropertyState::Unset),
        }
    }

    /// Validated definition.
    pub fn definition(&self) -> &PropertyDefinition {
        &self.definition
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Global address.
    pub fn address(&self) -> PropertyAddress {
        self.definition.address()
    }

    /// Readable, writable or both.
    pub fn direction(&self) -> Direction {
        self.definition.direction
    }

    /// Tracked hardware state.
    pub fn state(&self) -> PropertyState {
        self.state.lock().clone()
    }

    /// Latest value read or successfully written.
    pub fn last_value(&self) -> Option<PropertyValue> {
        match &*self.state.lock() {
            PropertyState::Known(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn capability_error(&self, operation: &str) -> LabError {
        LabError::Capability {
            address: self.address(),
            operation: operation.to_string(),
        }
    }

    /// Read the current value in the target unit.
    pub async fn get(&self) -> AppResult<PropertyValue> {
        if !self.direction().can_read() {
            return Err(self.capability_error("read"));
        }
        let readable = self
            .components
            .readable
            .as_ref()
            .ok_or_else(|| self.capability_error("read"))?;

        let _io = self.io.lock().await;
        let raw = readable
            .read(&self.definition.channel)
            .await
            .map_err(|source| LabError::Driver {
                address: self.address(),
                source,
            })?;
        let value = self
            .definition
            .decode(raw)
            .map_err(|source| LabError::Driver {
                address: self.address(),
                source,
            })?;

        *self.state.lock() = PropertyState::Known(value.clone());
        Ok(value)
    }

    /// Write a value given in the target unit.
    ///
    /// Units, limits and calibration are checked before the driver is called;
    /// a rejected value never reaches the hardware. If the driver call itself
    /// fails the property becomes [`PropertyState::Unknown`].
    pub async fn set(&self, value: &PropertyValue) -> AppResult<()> {
        if !self.direction().can_write() {
            return Err(self.capability_error("write"));
        }
        let writable = self
            .components
            .writable
            .as_ref()
            .ok_or_else(|| self.capability_error("write"))?;
        let raw = self.definition.encode(value)?;

        let _io = self.io.lock().await;
        debug!(property = %self.address(), %value, %raw, "Writing");
        match writable.write(&self.definition.channel, raw).await {
            Ok(()) => {
                let applied = match value {
                    PropertyValue::Quantity(q) => {
                        PropertyValue::Quantity(q.to(self.definition.target_unit())?)
                    }
                    other => other.clone(),
                };
                *self.state.lock() = PropertyState::Known(applied);
                Ok(())
            }
            Err(source) => {
                warn!(property = %self.address(), error = %source, "Write failed, state unknown");
                *self.state.lock() = PropertyState::Unknown;
                Err(LabError::Driver {
                    address: self.address(),
                    source,
                })
            }
        }
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("address", &self.address().to_string())
            .field("direction", &self.direction())
            .field("kind", &self.definition.kind)
            .field("state", &self.state())
            .finish()
    }
}
