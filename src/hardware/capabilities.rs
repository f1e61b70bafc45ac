//! Atomic Hardware Capabilities
//!
//! Drivers do not implement one monolithic instrument trait. Each driver exposes
//! the capabilities it actually has, and the property registry binds properties
//! to them:
//!
//! - A DAQ card implements `Readable + Writable` (analog inputs and outputs)
//! - A tunable laser implements `Readable + Writable + Actionable` (sweeps)
//! - A shutter implements `Readable + Actionable` (open/close)
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Works in raw driver units; calibration happens above the driver
//!
//! # Example
//!
//! ```rust,ignore
//! struct Photodiode {
//!     volts: Mutex<f64>,
//! }
//!
//! #[async_trait]
//! impl Readable for Photodiode {
//!     async fn read(&self, channel: &Channel) -> Result<RawValue> {
//!         Ok(RawValue::Number(*self.volts.lock()))
//!     }
//! }
//! ```

use crate::hardware::property::PropertyKind;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// Raw value exchanged with a driver, before calibration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    /// Analog value in the driver's raw unit
    Number(f64),
    /// Digital line or boolean state
    Flag(bool),
    /// Enumerated setting
    Choice(String),
}

impl RawValue {
    /// Numeric payload, if any.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RawValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Number(v) => write!(f, "{v}"),
            RawValue::Flag(v) => write!(f, "{v}"),
            RawValue::Choice(v) => f.write_str(v),
        }
    }
}

/// Where on a device a property lives.
///
/// Drivers receive the channel on every call and use `port` (or `name` when no
/// port is wired) to pick the physical line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    /// Property name
    pub name: String,
    /// Physical port / line identifier from configuration
    pub port: Option<String>,
    /// Signal kind
    pub kind: PropertyKind,
    /// Driver-specific acquisition mode (e.g. "differential")
    pub mode: Option<String>,
}

impl Channel {
    /// Port if wired, otherwise the property name.
    pub fn key(&self) -> &str {
        self.port.as_deref().unwrap_or(&self.name)
    }
}

/// Capability: Read
///
/// Devices that can sample a channel (DAQ inputs, power meters, laser status).
///
/// # Contract
/// - Values are in the driver's raw unit
/// - Must not mutate hardware state
/// - Should return promptly; callers enforce their own timeout
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read the current raw value of `channel`.
    async fn read(&self, channel: &Channel) -> Result<RawValue>;
}

/// Capability: Write
///
/// Devices that accept set-points (DAQ outputs, laser wavelength, stage position).
///
/// # Contract
/// - `value` is already calibrated to raw units and checked against limits
/// - Returning `Err` leaves the hardware state unknown to the caller
#[async_trait]
pub trait Writable: Send + Sync {
    /// Apply a raw value to `channel`.
    async fn write(&self, channel: &Channel, value: RawValue) -> Result<()>;
}

/// Capability: Named actions and lifecycle
///
/// Devices with operations that are not property writes: opening a shutter,
/// starting a wavelength sweep, arming a trigger.
#[async_trait]
pub trait Actionable: Send + Sync {
    /// Perform a named action.
    ///
    /// # Default Implementation
    /// Returns an error indicating the action is not supported.
    async fn act(&self, action: &str, args: &[RawValue]) -> Result<()> {
        let _ = args;
        anyhow::bail!("Action '{action}' not supported by this device")
    }

    /// Bring-up hook, called once during the init phase.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Teardown hook, called once during the finish phase.
    async fn finalize(&self) -> Result<()> {
        Ok(())
    }

    /// Actions this device understands, for introspection.
    fn actions(&self) -> Vec<&'static str> {
        Vec::new()
    }
}
