//! Driver factories and the resolver that maps driver specs onto them.
//!
//! Device specs name their driver with a `module/Symbol` string
//! (`"mock/Daq"`, `"santec/Tsl710"`). Instead of looking that string up at
//! runtime by reflection, each driver crate provides a [`DriverFactory`] and the
//! application registers it explicitly with a [`DriverResolver`]:
//!
//! ```rust,ignore
//! let mut resolver = DriverResolver::new();
//! resolver.register_factory(Arc::new(MockDaqFactory::default()))?;
//!
//! let factory = resolver.resolve("mock/Daq")?;
//! factory.validate(&device_spec)?;
//! let components = factory.build(device_spec).await?;
//! ```
//!
//! A factory returns [`DriverComponents`]: a bag of optional capability trait
//! objects. Drivers fill only the capabilities they implement.

use crate::config::schema::DeviceSpec;
use crate::error::{AppResult, LabError};
use crate::hardware::capabilities::{Actionable, Readable, Writable};
use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Delimiter between module path and symbol in driver specs.
pub const SPEC_DELIMITER: char = '/';

// =============================================================================
// Capabilities
// =============================================================================

/// Capabilities a driver can expose (for introspection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Can sample channels
    Readable,
    /// Can apply set-points
    Writable,
    /// Has named actions and lifecycle hooks
    Actionable,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Readable => write!(f, "read"),
            Capability::Writable => write!(f, "write"),
            Capability::Actionable => write!(f, "act"),
        }
    }
}

/// Capability trait objects produced by a driver factory.
#[derive(Clone, Default)]
pub struct DriverComponents {
    /// Readable implementation
    pub readable: Option<Arc<dyn Readable>>,
    /// Writable implementation
    pub writable: Option<Arc<dyn Writable>>,
    /// Actionable implementation
    pub actionable: Option<Arc<dyn Actionable>>,
}

impl DriverComponents {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a Readable implementation.
    pub fn with_readable(mut self, readable: Arc<dyn Readable>) -> Self {
        self.readable = Some(readable);
        self
    }

    /// Attach a Writable implementation.
    pub fn with_writable(mut self, writable: Arc<dyn Writable>) -> Self {
        self.writable = Some(writable);
        self
    }

    /// Attach an Actionable implementation.
    pub fn with_actionable(mut self, actionable: Arc<dyn Actionable>) -> Self {
        self.actionable = Some(actionable);
        self
    }

    /// Get list of capabilities this driver supports
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.readable.is_some() {
            caps.push(Capability::Readable);
        }
        if self.writable.is_some() {
            caps.push(Capability::Writable);
        }
        if self.actionable.is_some() {
            caps.push(Capability::Actionable);
        }
        caps
    }
}

impl fmt::Debug for DriverComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverComponents")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

// =============================================================================
// Factory contract
// =============================================================================

/// Constructor for one driver implementation.
pub trait DriverFactory: Send + Sync + 'static {
    /// The `module/Symbol` spec device configurations use to select this driver.
    fn driver_spec(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// List of capabilities this driver type provides.
    ///
    /// Checked against property directions before any driver is built, so it
    /// must match what `build` returns.
    fn capabilities(&self) -> &'static [Capability];

    /// Validate a device spec without touching hardware.
    ///
    /// Called during configuration loading so that connection or option
    /// mistakes surface before any device is built.
    fn validate(&self, spec: &DeviceSpec) -> Result<()>;

    /// Instantiate the driver.
    ///
    /// Only called after every device, sensor and actuator in the configuration
    /// has been validated.
    fn build(&self, spec: DeviceSpec) -> BoxFuture<'static, Result<DriverComponents>>;
}

// =============================================================================
// Resolver
// =============================================================================

/// Split a driver spec into its module path and symbol.
pub fn parse_driver_spec(spec: &str) -> AppResult<(&str, &str)> {
    match spec.rsplit_once(SPEC_DELIMITER) {
        Some((module, symbol)) if !module.is_empty() && !symbol.is_empty() => {
            Ok((module, symbol))
        }
        _ => Err(LabError::DriverResolution {
            spec: spec.to_string(),
            reason: format!("expected '<module>{SPEC_DELIMITER}<Symbol>'"),
        }),
    }
}

/// Registry of driver factories keyed by spec string.
///
/// Resolution is a pure map lookup, so the same spec always yields the same
/// factory instance for the lifetime of the resolver.
#[derive(Default, Clone)]
pub struct DriverResolver {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its own `driver_spec()`.
    ///
    /// Re-registering a spec replaces the previous factory.
    pub fn register_factory(&mut self, factory: Arc<dyn DriverFactory>) -> AppResult<()> {
        let spec = factory.driver_spec();
        parse_driver_spec(spec)?;
        if self
            .factories
            .insert(spec.to_string(), factory)
            .is_some()
        {
            warn!(driver = spec, "Driver factory replaced");
        } else {
            debug!(driver = spec, "Driver factory registered");
        }
        Ok(())
    }

    /// Look up the factory for `spec`.
    pub fn resolve(&self, spec: &str) -> AppResult<Arc<dyn DriverFactory>> {
        let (module, symbol) = parse_driver_spec(spec)?;
        self.factories
            .get(spec)
            .cloned()
            .ok_or_else(|| LabError::DriverResolution {
                spec: spec.to_string(),
                reason: format!("no factory registered for symbol '{symbol}' in module '{module}'"),
            })
    }

    /// Registered specs, sorted.
    pub fn specs(&self) -> Vec<&str> {
        let mut specs: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        specs.sort_unstable();
        specs
    }

    /// Registered factories, sorted by spec.
    pub fn factories(&self) -> Vec<Arc<dyn DriverFactory>> {
        self.specs()
            .into_iter()
            .filter_map(|spec| self.factories.get(spec).cloned())
            .collect()
    }
}

impl fmt::Debug for DriverResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverResolver")
            .field("specs", &self.specs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFactory(&'static str);

    impl DriverFactory for NullFactory {
        fn driver_spec(&self) -> &'static str {
            self.0
        }

        fn name(&self) -> &'static str {
            "Null driver"
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[]
        }

        fn validate(&self, _spec: &DeviceSpec) -> Result<()> {
            Ok(())
        }

        fn build(&self, _spec: DeviceSpec) -> BoxFuture<'static, Result<DriverComponents>> {
            Box::pin(async { Ok(DriverComponents::new()) })
        }
    }

    #[test]
    fn test_parse_driver_spec() {
        assert_eq!(
            parse_driver_spec("santec/Tsl710").unwrap(),
            ("santec", "Tsl710")
        );
        assert_eq!(
            parse_driver_spec("ni/daq/Ni6251").unwrap(),
            ("ni/daq", "Ni6251")
        );
        assert!(parse_driver_spec("Ni6251").is_err());
        assert!(parse_driver_spec("ni/").is_err());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let mut resolver = DriverResolver::new();
        resolver
            .register_factory(Arc::new(NullFactory("null/Device")))
            .unwrap();

        let a = resolver.resolve("null/Device").unwrap();
        let b = resolver.resolve("null/Device").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(resolver.specs(), vec!["null/Device"]);
    }

    #[test]
    fn test_unknown_spec_fails() {
        let resolver = DriverResolver::new();
        let err = resolver.resolve("null/Missing").err().unwrap();
        assert!(matches!(err, LabError::DriverResolution { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_register_rejects_malformed_spec() {
        let mut resolver = DriverResolver::new();
        assert!(resolver
            .register_factory(Arc::new(NullFactory("nodelimiter")))
            .is_err());
    }
}
