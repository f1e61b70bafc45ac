//! Custom error types for the library.
//!
//! This module defines the primary error type, `LabError`, used by every layer of
//! the crate. Using the `thiserror` crate, it provides a centralized and consistent
//! way to describe what went wrong, from malformed calibration tables to a power
//! meter that stopped answering mid-scan.
//!
//! ## Error Hierarchy
//!
//! The variants fall into two groups that the run engine treats differently:
//!
//! - **Configuration-time errors** (`UnknownDevice`, `Calibration`,
//!   `DriverResolution`, `UnitMismatch`, `Configuration`, `NotFound`, `Yaml`):
//!   raised while the device graph or the plan is being validated. They are fatal
//!   and always surface before any hardware I/O happens. See
//!   [`LabError::is_configuration`].
//! - **Runtime errors** (`Capability`, `LimitViolation`, `Driver`, `Timeout`):
//!   raised by individual property reads and writes. The run engine attaches them
//!   to the affected result record or collects them into the run report.
//!
//! Driver capability traits return `anyhow::Result`; the property registry wraps
//! those failures into `LabError::Driver` together with the property address.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

/// Global address of a property: `device.property`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyAddress {
    /// Owning device name
    pub device: String,
    /// Property name, scoped to the device
    pub property: String,
}

impl PropertyAddress {
    /// Build an address from its two parts.
    pub fn new(device: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            property: property.into(),
        }
    }
}

impl fmt::Display for PropertyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device, self.property)
    }
}

impl serde::Serialize for PropertyAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for PropertyAddress {
    type Err = LabError;

    /// Device names may contain dots, so the property is everything after the last one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((device, property)) if !device.is_empty() && !property.is_empty() => {
                Ok(Self::new(device, property))
            }
            _ => Err(LabError::Configuration(format!(
                "'{s}' is not a property address (expected 'device.property')"
            ))),
        }
    }
}

/// Primary error type for device graph construction, property I/O and runs.
#[derive(Error, Debug)]
pub enum LabError {
    /// Two quantities with incompatible units were combined or converted.
    #[error("Unit mismatch: expected a value in '{expected}', got '{found}'")]
    UnitMismatch {
        /// Unit the operation required
        expected: String,
        /// Unit actually supplied
        found: String,
    },

    /// Malformed calibration (zero slope, non-finite coefficients, missing limits)
    /// or a conversion that produced a non-finite value.
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// The property does not support the requested direction.
    #[error("Property {address} does not support {operation}")]
    Capability {
        /// Property that was accessed
        address: PropertyAddress,
        /// "read", "write" or an action name
        operation: String,
    },

    /// A write was refused because the requested value is outside the safety limits.
    /// The driver is never invoked when this is returned.
    #[error("Value {value} {unit} for {address} is outside limits [{min}, {max}] {unit}")]
    LimitViolation {
        /// Property that was written
        address: PropertyAddress,
        /// Requested value, in the target unit
        value: f64,
        /// Lower limit
        min: f64,
        /// Upper limit
        max: f64,
        /// Target unit of value and limits
        unit: String,
    },

    /// The underlying hardware call failed.
    #[error("Driver error on {address}: {source}")]
    Driver {
        /// Property (or `device.action`) being driven
        address: PropertyAddress,
        /// Error returned by the driver
        #[source]
        source: anyhow::Error,
    },

    /// A driver specification could not be resolved to a registered factory.
    #[error("Cannot resolve driver '{spec}': {reason}")]
    DriverResolution {
        /// The `module/Symbol` string from the device spec
        spec: String,
        /// Why resolution failed
        reason: String,
    },

    /// A sensor, actuator or plan references a device that was never declared.
    #[error("Unknown device '{device}' referenced by {referenced_by}")]
    UnknownDevice {
        /// Missing device name
        device: String,
        /// What referenced it (property or plan block)
        referenced_by: String,
    },

    /// A lookup by name found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A detector read did not answer in time.
    #[error("Timed out reading {address} after {after:?}")]
    Timeout {
        /// Property being read
        address: PropertyAddress,
        /// Configured read timeout
        after: Duration,
    },

    /// Semantic configuration error that passed parsing.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Settings file or environment could not be extracted.
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// YAML syntax or shape error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error (reading configuration files, writing result streams).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LabError {
    /// True for errors that must abort a run before hardware I/O starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LabError::UnitMismatch { .. }
                | LabError::Calibration(_)
                | LabError::DriverResolution { .. }
                | LabError::UnknownDevice { .. }
                | LabError::NotFound(_)
                | LabError::Configuration(_)
                | LabError::Settings(_)
                | LabError::Yaml(_)
        )
    }

    /// Address of the property involved, if the error concerns one.
    pub fn address(&self) -> Option<&PropertyAddress> {
        match self {
            LabError::Capability { address, .. }
            | LabError::LimitViolation { address, .. }
            | LabError::Driver { address, .. }
            | LabError::Timeout { address, .. } => Some(address),
            _ => None,
        }
    }
}

impl From<figment::Error> for LabError {
    fn from(value: figment::Error) -> Self {
        LabError::Settings(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_and_display() {
        let addr: PropertyAddress = "NI-DAQ.photodiode1".parse().unwrap();
        assert_eq!(addr.device, "NI-DAQ");
        assert_eq!(addr.property, "photodiode1");
        assert_eq!(addr.to_string(), "NI-DAQ.photodiode1");

        let dotted: PropertyAddress = "stage.x.position".parse().unwrap();
        assert_eq!(dotted.device, "stage.x");

        assert!("nodot".parse::<PropertyAddress>().is_err());
        assert!(".prop".parse::<PropertyAddress>().is_err());
    }

    #[test]
    fn test_configuration_classification() {
        assert!(LabError::Calibration("zero slope".into()).is_configuration());
        assert!(LabError::UnknownDevice {
            device: "laser".into(),
            referenced_by: "scan block".into()
        }
        .is_configuration());

        let runtime = LabError::Driver {
            address: PropertyAddress::new("daq", "ai0"),
            source: anyhow::anyhow!("bus fault"),
        };
        assert!(!runtime.is_configuration());
        assert_eq!(runtime.address().unwrap().to_string(), "daq.ai0");
        assert!(runtime.to_string().contains("bus fault"));
    }
}
