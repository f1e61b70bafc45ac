//! Device Graph
//!
//! Owns the devices of an experiment and the properties attached to them.
//! Loading happens in two passes:
//!
//! ```text
//! ┌──────────────────────────── validate (no I/O) ─────────────────────────────┐
//! │ dedupe devices (last wins) → resolve drivers → factory.validate            │
//! │ → owning device exists? → PropertyDefinition::from_spec → unique names     │
//! │ → driver capabilities cover each property's direction                      │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ┌──────────────────────────────── build ─────────────────────────────────────┐
//! │ factory.build (declaration order) → registry.register                      │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every configuration error (unknown device, bad calibration, unresolvable
//! driver, missing capability) is reported by the first pass, before any
//! driver is instantiated.

use crate::config::schema::{ConnectionSpec, DeviceSpec, PropertyTree, ValueSpec};
use crate::error::{AppResult, LabError, PropertyAddress};
use crate::hardware::capabilities::RawValue;
use crate::hardware::driver::{Capability, DriverComponents, DriverFactory, DriverResolver};
use crate::hardware::property::{Direction, Property, PropertyDefinition};
use crate::hardware::registry::PropertyRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A device with its driver and properties.
pub struct Device {
    /// Unique name
    pub name: String,
    /// Device category
    pub device_type: String,
    /// Model identifier
    pub model: String,
    /// Driver spec it was built from
    pub driver_spec: String,
    /// Connection block
    pub connection: ConnectionSpec,
    components: DriverComponents,
    properties: Vec<Arc<Property>>,
}

impl Device {
    /// Driver capabilities.
    pub fn capabilities(&self) -> Vec<Capability> {
        self.components.capabilities()
    }

    /// Properties in declaration order.
    pub fn properties(&self) -> &[Arc<Property>] {
        &self.properties
    }

    /// Property by name.
    pub fn property(&self, name: &str) -> Option<&Arc<Property>> {
        self.properties.iter().find(|p| p.name() == name)
    }

    /// Perform a named driver action.
    pub async fn act(&self, action: &str, args: &[RawValue]) -> AppResult<()> {
        let address = PropertyAddress::new(&self.name, action);
        let actionable = self
            .components
            .actionable
            .as_ref()
            .ok_or_else(|| LabError::Capability {
                address: address.clone(),
                operation: format!("action '{action}'"),
            })?;
        info!(device = %self.name, action, "Performing action");
        actionable
            .act(action, args)
            .await
            .map_err(|source| LabError::Driver { address, source })
    }

    async fn lifecycle(&self, hook: &str) -> AppResult<()> {
        let Some(actionable) = &self.components.actionable else {
            return Ok(());
        };
        let result = if hook == "initialize" {
            actionable.initialize().await
        } else {
            actionable.finalize().await
        };
        result.map_err(|source| LabError::Driver {
            address: PropertyAddress::new(&self.name, hook),
            source,
        })
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("type", &self.device_type)
            .field("driver", &self.driver_spec)
            .field("properties", &self.properties.len())
            .finish()
    }
}

/// Devices plus the flat property registry.
#[derive(Debug, Default)]
pub struct DeviceGraph {
    devices: HashMap<String, Arc<Device>>,
    order: Vec<String>,
    registry: PropertyRegistry,
}

impl DeviceGraph {
    /// Build the graph from device specs and sensor/actuator trees.
    ///
    /// Devices sharing a name are last-write-wins: the later spec replaces the
    /// earlier one but keeps its original position in declaration order.
    #[instrument(skip_all, fields(devices = device_specs.len()))]
    pub async fn load(
        resolver: &DriverResolver,
        device_specs: Vec<DeviceSpec>,
        sensors: &PropertyTree,
        actuators: &PropertyTree,
    ) -> AppResult<Self> {
        // Pass 1: validate everything
        let mut specs: Vec<DeviceSpec> = Vec::with_capacity(device_specs.len());
        for spec in device_specs {
            if spec.name.is_empty() {
                return Err(LabError::Configuration("device spec without a name".into()));
            }
            match specs.iter_mut().find(|s| s.name == spec.name) {
                Some(existing) => {
                    warn!(device = %spec.name, "Device defined more than once; the latest definition wins");
                    *existing = spec;
                }
                None => specs.push(spec),
            }
        }

        let mut factories: Vec<Arc<dyn DriverFactory>> = Vec::with_capacity(specs.len());
        for spec in &specs {
            let factory = resolver.resolve(&spec.driver)?;
            factory.validate(spec).map_err(|e| {
                LabError::Configuration(format!(
                    "device '{}' ({}): {e}",
                    spec.name,
                    factory.name()
                ))
            })?;
            factories.push(factory);
        }

        let capabilities: HashMap<&str, &'static [Capability]> = specs
            .iter()
            .zip(&factories)
            .map(|(spec, factory)| (spec.name.as_str(), factory.capabilities()))
            .collect();
        let known: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        let mut seen: HashSet<PropertyAddress> = HashSet::new();
        let mut definitions: HashMap<&str, Vec<PropertyDefinition>> = HashMap::new();
        for (tree, fallback, role) in [
            (sensors, Direction::Readable, "sensor"),
            (actuators, Direction::Writable, "actuator"),
        ] {
            for (owner, properties) in tree.iter() {
                let Some(owner) = known.get(owner).copied() else {
                    let first = properties.iter().next().map_or("", |(name, _)| name);
                    return Err(LabError::UnknownDevice {
                        device: owner.to_string(),
                        referenced_by: format!("{role} '{owner}.{first}'"),
                    });
                };
                for (name, spec) in properties.iter() {
                    let definition = PropertyDefinition::from_spec(owner, name, spec, fallback)?;
                    let provided = capabilities.get(owner).copied().unwrap_or_default();
                    for (needed, capability, operation) in [
                        (definition.direction.can_read(), Capability::Readable, "read"),
                        (definition.direction.can_write(), Capability::Writable, "write"),
                    ] {
                        if needed && !provided.contains(&capability) {
                            return Err(LabError::Capability {
                                address: definition.address(),
                                operation: operation.into(),
                            });
                        }
                    }
                    if !seen.insert(definition.address()) {
                        return Err(LabError::Configuration(format!(
                            "{role} {} duplicates an existing property",
                            definition.address()
                        )));
                    }
                    definitions.entry(owner).or_default().push(definition);
                }
            }
        }

        // Pass 2: instantiate drivers and bind properties
        let mut graph = DeviceGraph::default();
        for (spec, factory) in specs.iter().zip(factories) {
            let components = factory.build(spec.clone()).await.map_err(|source| {
                LabError::Driver {
                    address: PropertyAddress::new(&spec.name, "driver"),
                    source,
                }
            })?;
            debug!(device = %spec.name, capabilities = ?components.capabilities(), "Driver built");

            let mut properties = Vec::new();
            for definition in definitions.remove(spec.name.as_str()).unwrap_or_default() {
                properties.push(graph.registry.register(definition, &components)?);
            }

            let device = Device {
                name: spec.name.clone(),
                device_type: spec.device_type.clone(),
                model: spec.model.clone(),
                driver_spec: spec.driver.clone(),
                connection: spec.connection.clone(),
                components,
                properties,
            };
            graph.order.push(device.name.clone());
            graph.devices.insert(device.name.clone(), Arc::new(device));
        }

        info!(
            devices = graph.order.len(),
            properties = graph.registry.len(),
            "Device graph loaded"
        );
        Ok(graph)
    }

    /// Device by name.
    pub fn resolve(&self, name: &str) -> AppResult<&Arc<Device>> {
        self.devices
            .get(name)
            .ok_or_else(|| LabError::NotFound(format!("device '{name}'")))
    }

    /// Whether `name` is a device.
    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Devices in declaration order.
    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.order.iter().filter_map(|name| self.devices.get(name))
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no devices are loaded.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The flat property registry.
    pub fn registry(&self) -> &PropertyRegistry {
        &self.registry
    }

    /// Bring-up: driver `initialize` hooks, then declared defaults.
    ///
    /// Best effort; every failure is collected and returned.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Vec<LabError> {
        let mut failures = Vec::new();
        for device in self.devices() {
            if let Err(e) = device.lifecycle("initialize").await {
                warn!(device = %device.name, error = %e, "Initialization failed");
                failures.push(e);
            }
        }
        failures.extend(self.registry.apply_defaults().await);
        failures
    }

    /// Teardown: driver `finalize` hooks in reverse declaration order.
    ///
    /// Best effort; every failure is collected and returned.
    #[instrument(skip(self))]
    pub async fn finalize(&self) -> Vec<LabError> {
        let mut failures = Vec::new();
        for name in self.order.iter().rev() {
            let Some(device) = self.devices.get(name) else {
                continue;
            };
            if let Err(e) = device.lifecycle("finalize").await {
                warn!(device = %device.name, error = %e, "Finalization failed");
                failures.push(e);
            }
        }
        failures
    }
}

/// Convert configuration action arguments to raw driver values.
pub fn action_args(args: &[ValueSpec]) -> Vec<RawValue> {
    args.iter()
        .map(|arg| match arg {
            ValueSpec::Bool(b) => RawValue::Flag(*b),
            ValueSpec::Number(v) => RawValue::Number(*v),
            ValueSpec::Text(s) => RawValue::Choice(s.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{CalibrationSpec, Ordered, PropertySpec};
    use crate::hardware::mock::{register_mock_factories, MockDaq, MockDaqFactory};

    fn device(name: &str, driver: &str, model: &str) -> DeviceSpec {
        serde_yaml::from_str(&format!(
            "name: {name}\ndriver: {driver}\nmodel: {model}\nconnection: {{type: daq, port: 1}}\n"
        ))
        .unwrap()
    }

    fn tree(owner: &str, names: &[&str]) -> PropertyTree {
        Ordered(vec![(
            owner.to_string(),
            Ordered(
                names
                    .iter()
                    .map(|n| (n.to_string(), PropertySpec::default()))
                    .collect(),
            ),
        )])
    }

    fn resolver() -> DriverResolver {
        let mut resolver = DriverResolver::new();
        register_mock_factories(&mut resolver).unwrap();
        resolver
    }

    #[tokio::test]
    async fn test_duplicate_device_last_write_wins() {
        let specs = vec![
            device("daq", "mock/Daq", "first"),
            device("shutter", "mock/Shutter", "s1"),
            device("daq", "mock/Daq", "second"),
        ];
        let graph = DeviceGraph::load(&resolver(), specs, &Ordered::default(), &Ordered::default())
            .await
            .unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.resolve("daq").unwrap().model, "second");
        let names: Vec<&str> = graph.devices().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["daq", "shutter"]);
    }

    #[tokio::test]
    async fn test_unknown_owner_device() {
        let err = DeviceGraph::load(
            &resolver(),
            vec![device("daq", "mock/Daq", "m")],
            &tree("ghost", &["pd1"]),
            &Ordered::default(),
        )
        .await
        .unwrap_err();
        match err {
            LabError::UnknownDevice { device, .. } => assert_eq!(device, "ghost"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unresolvable_driver_builds_nothing() {
        let daq = Arc::new(MockDaq::new());
        let mut resolver = DriverResolver::new();
        resolver
            .register_factory(Arc::new(MockDaqFactory::shared(daq.clone())))
            .unwrap();

        let err = DeviceGraph::load(
            &resolver,
            vec![device("daq", "mock/Daq", "m"), device("laser", "vendor/Missing", "x")],
            &Ordered::default(),
            &Ordered::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LabError::DriverResolution { .. }));
        assert!(!daq.is_initialized());
    }

    #[tokio::test]
    async fn test_zero_slope_fails_at_load() {
        let photodiode = PropertySpec {
            calibration: Some(CalibrationSpec {
                units: "uW".into(),
                slope: 0.0,
                offset: 0.0,
            }),
            ..Default::default()
        };
        let sensors = Ordered(vec![(
            "daq".to_string(),
            Ordered(vec![("pd1".to_string(), photodiode)]),
        )]);
        let err = DeviceGraph::load(
            &resolver(),
            vec![device("daq", "mock/Daq", "m")],
            &sensors,
            &Ordered::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LabError::Calibration(_)));
    }

    /// Read-only meter driver that counts how often it was built.
    #[derive(Default)]
    struct MeterFactory {
        builds: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl DriverFactory for MeterFactory {
        fn driver_spec(&self) -> &'static str {
            "test/Meter"
        }

        fn name(&self) -> &'static str {
            "Read-only meter"
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Readable]
        }

        fn validate(&self, _spec: &DeviceSpec) -> anyhow::Result<()> {
            Ok(())
        }

        fn build(&self, _spec: DeviceSpec) -> futures::future::BoxFuture<'static, anyhow::Result<DriverComponents>> {
            self.builds.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async { Ok(DriverComponents::new().with_readable(Arc::new(MockDaq::new()))) })
        }
    }

    #[tokio::test]
    async fn test_missing_capability_fails_before_building() {
        let factory = MeterFactory::default();
        let builds = Arc::clone(&factory.builds);
        let mut resolver = DriverResolver::new();
        resolver.register_factory(Arc::new(factory)).unwrap();

        let err = DeviceGraph::load(
            &resolver,
            vec![device("meter1", "test/Meter", "m"), device("meter2", "test/Meter", "m")],
            &tree("meter1", &["ch0"]),
            &tree("meter2", &["ch0"]),
        )
        .await
        .unwrap_err();

        match err {
            LabError::Capability { address, operation } => {
                assert_eq!(address.to_string(), "meter2.ch0");
                assert_eq!(operation, "write");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sensor_and_actuator_name_clash() {
        let err = DeviceGraph::load(
            &resolver(),
            vec![device("daq", "mock/Daq", "m")],
            &tree("daq", &["ch0"]),
            &tree("daq", &["ch0"]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LabError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_resolve_and_properties() {
        let graph = DeviceGraph::load(
            &resolver(),
            vec![device("daq", "mock/Daq", "m")],
            &tree("daq", &["pd1", "pd2"]),
            &tree("daq", &["ao0"]),
        )
        .await
        .unwrap();

        assert!(matches!(graph.resolve("nope"), Err(LabError::NotFound(_))));
        let daq = graph.resolve("daq").unwrap();
        let names: Vec<&str> = daq.properties().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["pd1", "pd2", "ao0"]);
        assert_eq!(daq.property("ao0").unwrap().direction(), Direction::Writable);
        assert_eq!(graph.registry().len(), 3);

        assert!(graph.initialize().await.is_empty());
        assert!(graph.finalize().await.is_empty());
    }
}
