//! Property Registry
//!
//! Flat `device.property` namespace over every sensor and actuator in the
//! device graph. The registry is populated once while the graph loads and is
//! read-only afterwards; concurrent readers share it behind an `Arc`.
//!
//! ```rust,ignore
//! let value = registry.get("NI-DAQ", "photodiode1").await?;
//! registry
//!     .set("laser", "wavelength", &PropertyValue::Quantity("1550 nm".parse()?))
//!     .await?;
//! ```

use crate::config::schema::PropertySpec;
use crate::error::{AppResult, LabError, PropertyAddress};
use crate::hardware::driver::DriverComponents;
use crate::hardware::property::{Direction, Property, PropertyDefinition, PropertyValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registered properties, keyed by address, remembering declaration order.
#[derive(Debug, Default)]
pub struct PropertyRegistry {
    properties: HashMap<PropertyAddress, Arc<Property>>,
    order: Vec<PropertyAddress>,
    defaults_applied: AtomicBool,
}

impl PropertyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `spec` and register it as `device.name`, bound to `components`.
    pub fn register_spec(
        &mut self,
        device: &str,
        name: &str,
        spec: &PropertySpec,
        fallback: Direction,
        components: &DriverComponents,
    ) -> AppResult<Arc<Property>> {
        let definition = PropertyDefinition::from_spec(device, name, spec, fallback)?;
        self.register(definition, components)
    }

    /// Register a validated definition, bound to its device's driver components.
    ///
    /// Fails when the address is taken or when the driver lacks the capability
    /// the property's direction needs.
    pub fn register(
        &mut self,
        definition: PropertyDefinition,
        components: &DriverComponents,
    ) -> AppResult<Arc<Property>> {
        let address = definition.address();
        if self.properties.contains_key(&address) {
            return Err(LabError::Configuration(format!(
                "Property {address} is declared more than once"
            )));
        }
        if definition.direction.can_read() && components.readable.is_none() {
            return Err(LabError::Capability {
                address,
                operation: "read".into(),
            });
        }
        if definition.direction.can_write() && components.writable.is_none() {
            return Err(LabError::Capability {
                address,
                operation: "write".into(),
            });
        }

        debug!(property = %address, direction = ?definition.direction, "Registered property");
        let property = Arc::new(Property::new(definition, components.clone()));
        self.properties.insert(address.clone(), Arc::clone(&property));
        self.order.push(address);
        Ok(property)
    }

    /// Look up a property.
    pub fn property(&self, device: &str, name: &str) -> AppResult<Arc<Property>> {
        self.lookup(&PropertyAddress::new(device, name))
    }

    /// Look up a property by address.
    pub fn lookup(&self, address: &PropertyAddress) -> AppResult<Arc<Property>> {
        self.properties
            .get(address)
            .cloned()
            .ok_or_else(|| LabError::NotFound(format!("property {address}")))
    }

    /// Read `device.name` in its target unit.
    pub async fn get(&self, device: &str, name: &str) -> AppResult<PropertyValue> {
        self.property(device, name)?.get().await
    }

    /// Write `device.name`; `value` is in the target unit.
    pub async fn set(&self, device: &str, name: &str, value: &PropertyValue) -> AppResult<()> {
        self.property(device, name)?.set(value).await
    }

    /// Properties in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Property>> {
        self.order
            .iter()
            .filter_map(|address| self.properties.get(address))
    }

    /// Properties owned by `device`, in declaration order.
    pub fn of_device<'a>(&'a self, device: &'a str) -> impl Iterator<Item = &'a Arc<Property>> {
        self.iter()
            .filter(move |p| p.definition().owner_device == device)
    }

    /// Number of registered properties.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Apply every declared default, in declaration order across devices.
    ///
    /// Best effort: a failing default is logged and collected, and the
    /// remaining defaults are still applied. Defaults are applied at most once
    /// per registry; later calls return no failures and do nothing.
    pub async fn apply_defaults(&self) -> Vec<LabError> {
        if self.defaults_applied.swap(true, Ordering::SeqCst) {
            warn!("Defaults were already applied; skipping");
            return Vec::new();
        }

        let mut failures = Vec::new();
        let mut applied = 0usize;
        for property in self.iter() {
            let Some(default) = &property.definition().default else {
                continue;
            };
            match property.set(default).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(property = %property.address(), error = %e, "Failed to apply default");
                    failures.push(e);
                }
            }
        }
        info!(applied, failed = failures.len(), "Defaults applied");
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{LimitsSpec, ValueSpec};
    use crate::hardware::mock::MockDaq;
    use crate::hardware::property::PropertyState;
    use tracing_test::traced_test;

    fn components(daq: &Arc<MockDaq>) -> DriverComponents {
        DriverComponents::new()
            .with_readable(daq.clone())
            .with_writable(daq.clone())
    }

    fn output(port: &str, default: Option<f64>) -> PropertySpec {
        PropertySpec {
            port: Some(ValueSpec::Text(port.into())),
            units: Some("V".into()),
            limits: Some(LimitsSpec {
                min: ValueSpec::Number(-5.0),
                max: ValueSpec::Number(5.0),
            }),
            default: default.map(ValueSpec::Number),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_get_set() {
        let daq = Arc::new(MockDaq::new());
        let mut registry = PropertyRegistry::new();
        registry
            .register_spec("daq", "ao0", &output("ao0", None), Direction::Both, &components(&daq))
            .unwrap();

        let value = PropertyValue::Quantity("2.5 V".parse().unwrap());
        registry.set("daq", "ao0", &value).await.unwrap();
        assert_eq!(daq.output("ao0"), Some(2.5));

        let read = registry.get("daq", "ao0").await.unwrap();
        assert_eq!(read.as_quantity().unwrap().magnitude, 2.5);
    }

    #[tokio::test]
    async fn test_out_of_limits_never_reaches_driver() {
        let daq = Arc::new(MockDaq::new());
        let mut registry = PropertyRegistry::new();
        registry
            .register_spec("daq", "ao0", &output("ao0", None), Direction::Writable, &components(&daq))
            .unwrap();

        for requested in ["5.01 V", "-7 V", "6000 mV"] {
            let value = PropertyValue::Quantity(requested.parse().unwrap());
            let err = registry.set("daq", "ao0", &value).await.unwrap_err();
            assert!(matches!(err, LabError::LimitViolation { .. }), "{requested}");
        }
        assert_eq!(daq.write_count(), 0);
    }

    #[tokio::test]
    async fn test_direction_enforced() {
        let daq = Arc::new(MockDaq::new());
        let mut registry = PropertyRegistry::new();
        let sensor = PropertySpec {
            port: Some(ValueSpec::Text("ai0".into())),
            ..Default::default()
        };
        registry
            .register_spec("daq", "ai0", &sensor, Direction::Readable, &components(&daq))
            .unwrap();
        registry
            .register_spec("daq", "ao0", &output("ao0", None), Direction::Writable, &components(&daq))
            .unwrap();

        let err = registry
            .set("daq", "ai0", &PropertyValue::Quantity("1".parse().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Capability { .. }));
        let err = registry.get("daq", "ao0").await.unwrap_err();
        assert!(matches!(err, LabError::Capability { .. }));
        assert!(matches!(
            registry.get("daq", "missing").await,
            Err(LabError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_driver_failure_leaves_state_unknown() {
        let daq = Arc::new(MockDaq::new());
        daq.fail_writes_on("ao0");
        let mut registry = PropertyRegistry::new();
        let property = registry
            .register_spec("daq", "ao0", &output("ao0", None), Direction::Writable, &components(&daq))
            .unwrap();

        let err = registry
            .set("daq", "ao0", &PropertyValue::Quantity("1 V".parse().unwrap()))
            .await
            .unwrap_err();
        match err {
            LabError::Driver { address, .. } => assert_eq!(address.to_string(), "daq.ao0"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(property.state(), PropertyState::Unknown);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_defaults_best_effort_in_order() {
        let daq = Arc::new(MockDaq::new());
        daq.fail_writes_on("ao1");
        let mut registry = PropertyRegistry::new();
        for (name, default) in [("ao0", 1.0), ("ao1", 2.0), ("ao2", 3.0)] {
            registry
                .register_spec(
                    "daq",
                    name,
                    &output(name, Some(default)),
                    Direction::Writable,
                    &components(&daq),
                )
                .unwrap();
        }

        let failures = registry.apply_defaults().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].address().unwrap().property, "ao1");
        assert_eq!(daq.output("ao0"), Some(1.0));
        assert_eq!(daq.output("ao2"), Some(3.0));
        assert_eq!(
            daq.write_log().iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["ao0", "ao2"]
        );

        assert!(logs_contain("Failed to apply default"));

        // Exactly once
        assert!(registry.apply_defaults().await.is_empty());
        assert_eq!(daq.write_count(), 3);
        assert!(logs_contain("Defaults were already applied"));
    }

    #[test]
    fn test_duplicate_and_missing_capability() {
        let daq = Arc::new(MockDaq::new());
        let mut registry = PropertyRegistry::new();
        registry
            .register_spec("daq", "ao0", &output("ao0", None), Direction::Writable, &components(&daq))
            .unwrap();
        let err = registry
            .register_spec("daq", "ao0", &output("ao0", None), Direction::Writable, &components(&daq))
            .unwrap_err();
        assert!(matches!(err, LabError::Configuration(_)));

        let read_only = DriverComponents::new().with_readable(daq.clone());
        let err = registry
            .register_spec("daq", "ao1", &output("ao1", None), Direction::Writable, &read_only)
            .unwrap_err();
        assert!(matches!(err, LabError::Capability { .. }));
    }
}
