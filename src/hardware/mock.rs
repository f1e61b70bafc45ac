//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for running plans without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockDaq` - Data-acquisition card with analog/digital channels keyed by port
//! - `MockLaser` - Tunable laser with a wavelength range and sweep actions
//! - `MockShutter` - Beam shutter with open/close actions
//!
//! Every mock has fault injection hooks (failing or hanging channels) so tests
//! can exercise the partial-failure paths of the run engine.
//!
//! # Driver specs
//!
//! | Spec | Factory | Capabilities |
//! |------|---------|--------------|
//! | `mock/Daq` | [`MockDaqFactory`] | Readable, Writable, Actionable |
//! | `mock/Laser` | [`MockLaserFactory`] | Readable, Writable, Actionable |
//! | `mock/Shutter` | [`MockShutterFactory`] | Readable, Writable, Actionable |

use crate::config::schema::{ConnectionKind, DeviceSpec};
use crate::error::AppResult;
use crate::hardware::capabilities::{Actionable, Channel, RawValue, Readable, Writable};
use crate::hardware::driver::{Capability, DriverComponents, DriverFactory, DriverResolver};
use crate::hardware::property::PropertyKind;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const ALL_CAPABILITIES: &[Capability] = &[
    Capability::Readable,
    Capability::Writable,
    Capability::Actionable,
];

/// Register every mock factory with `resolver`.
pub fn register_mock_factories(resolver: &mut DriverResolver) -> AppResult<()> {
    resolver.register_factory(Arc::new(MockDaqFactory::new()))?;
    resolver.register_factory(Arc::new(MockLaserFactory::new()))?;
    resolver.register_factory(Arc::new(MockShutterFactory::new()))?;
    Ok(())
}

// =============================================================================
// MockDaq - Simulated DAQ card
// =============================================================================

#[derive(Default)]
struct DaqChannels {
    readings: HashMap<String, f64>,
    outputs: HashMap<String, RawValue>,
    failing_reads: HashSet<String>,
    failing_writes: HashSet<String>,
    hanging_reads: HashSet<String>,
    write_log: Vec<(String, RawValue)>,
}

/// Mock DAQ card
///
/// Channels are addressed by port (or property name when unwired). A read
/// returns the injected reading for the channel, falling back to the last
/// value written to it, then to 0.
///
/// # Example
///
/// ```rust,ignore
/// let daq = MockDaq::new();
/// daq.set_reading("ai0", 1.25);
/// daq.fail_reads_on("ai1");
/// daq.hang_reads_on("ai2"); // never answers; exercises read timeouts
/// ```
#[derive(Default)]
pub struct MockDaq {
    channels: Mutex<DaqChannels>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    initialized: AtomicBool,
    finalized: AtomicBool,
    actions: Mutex<Vec<String>>,
}

impl MockDaq {
    /// Create a card with no readings configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value returned by reads of `port`.
    pub fn set_reading(&self, port: &str, value: f64) {
        self.channels.lock().readings.insert(port.to_string(), value);
    }

    /// Make every read of `port` fail.
    pub fn fail_reads_on(&self, port: &str) {
        self.channels.lock().failing_reads.insert(port.to_string());
    }

    /// Make every write to `port` fail.
    pub fn fail_writes_on(&self, port: &str) {
        self.channels.lock().failing_writes.insert(port.to_string());
    }

    /// Make every read of `port` block forever.
    pub fn hang_reads_on(&self, port: &str) {
        self.channels.lock().hanging_reads.insert(port.to_string());
    }

    /// Last numeric value successfully written to `port`.
    pub fn output(&self, port: &str) -> Option<f64> {
        self.channels
            .lock()
            .outputs
            .get(port)
            .and_then(RawValue::as_number)
    }

    /// Successful writes in order.
    pub fn write_log(&self) -> Vec<(String, RawValue)> {
        self.channels.lock().write_log.clone()
    }

    /// Write attempts, including failed ones.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Read attempts, including failed ones.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Whether `initialize` ran.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether `finalize` ran.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Actions performed, in order.
    pub fn action_log(&self) -> Vec<String> {
        self.actions.lock().clone()
    }
}

#[async_trait]
impl Readable for MockDaq {
    async fn read(&self, channel: &Channel) -> Result<RawValue> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let key = channel.key();
        let (hang, value) = {
            let channels = self.channels.lock();
            if channels.failing_reads.contains(key) {
                return Err(anyhow!("Simulated read fault on {key}"));
            }
            let value = match channels.readings.get(key) {
                Some(v) => RawValue::Number(*v),
                None => channels
                    .outputs
                    .get(key)
                    .cloned()
                    .unwrap_or(RawValue::Number(0.0)),
            };
            (channels.hanging_reads.contains(key), value)
        };
        if hang {
            futures::future::pending::<()>().await;
        }

        Ok(match (channel.kind, value) {
            (PropertyKind::Digital | PropertyKind::Boolean, RawValue::Number(v)) => {
                RawValue::Flag(v != 0.0)
            }
            (_, value) => value,
        })
    }
}

#[async_trait]
impl Writable for MockDaq {
    async fn write(&self, channel: &Channel, value: RawValue) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = channel.key().to_string();
        let mut channels = self.channels.lock();
        if channels.failing_writes.contains(&key) {
            return Err(anyhow!("Simulated write fault on {key}"));
        }
        channels.outputs.insert(key.clone(), value.clone());
        channels.write_log.push((key, value));
        Ok(())
    }
}

#[async_trait]
impl Actionable for MockDaq {
    async fn act(&self, action: &str, _args: &[RawValue]) -> Result<()> {
        match action {
            "start_task" | "stop_task" | "trigger" => {
                self.actions.lock().push(action.to_string());
                Ok(())
            }
            "reset" => {
                self.channels.lock().outputs.clear();
                self.actions.lock().push(action.to_string());
                Ok(())
            }
            other => Err(anyhow!("MockDaq has no action '{other}'")),
        }
    }

    async fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        self.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn actions(&self) -> Vec<&'static str> {
        vec!["start_task", "stop_task", "trigger", "reset"]
    }
}

/// Factory for `mock/Daq`.
///
/// `connection.port` (the board number) is required, as it is for real cards.
#[derive(Default)]
pub struct MockDaqFactory {
    instance: Option<Arc<MockDaq>>,
}

impl MockDaqFactory {
    /// Factory building a fresh card per device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory handing out `instance`, so callers can inspect and fault it.
    pub fn shared(instance: Arc<MockDaq>) -> Self {
        Self {
            instance: Some(instance),
        }
    }
}

impl DriverFactory for MockDaqFactory {
    fn driver_spec(&self) -> &'static str {
        "mock/Daq"
    }

    fn name(&self) -> &'static str {
        "Simulated DAQ card"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ALL_CAPABILITIES
    }

    fn validate(&self, spec: &DeviceSpec) -> Result<()> {
        if spec.connection.port.is_none() {
            anyhow::bail!("DAQ device '{}' needs connection.port (board number)", spec.name);
        }
        match spec.connection.kind {
            None | Some(ConnectionKind::Daq) | Some(ConnectionKind::Mock) => Ok(()),
            Some(other) => anyhow::bail!("DAQ device cannot use a {other:?} connection"),
        }
    }

    fn build(&self, _spec: DeviceSpec) -> BoxFuture<'static, Result<DriverComponents>> {
        let daq = self.instance.clone().unwrap_or_else(|| Arc::new(MockDaq::new()));
        Box::pin(async move {
            Ok(DriverComponents::new()
                .with_readable(daq.clone())
                .with_writable(daq.clone())
                .with_actionable(daq))
        })
    }
}

// =============================================================================
// MockLaser - Simulated tunable laser
// =============================================================================

struct LaserState {
    wavelength_nm: f64,
    power_mw: f64,
    speed_nm_s: f64,
    sweeping: bool,
    emission: bool,
    history: Vec<f64>,
    failing_wavelengths: Vec<f64>,
    actions: Vec<String>,
}

/// Mock tunable laser
///
/// Channels: `wavelength` (nm), `power` (mW), `speed` (nm/s), `sweeping`
/// and `emission` (flags). Wavelength writes outside the tuning range are
/// refused the way real controllers refuse them.
pub struct MockLaser {
    state: Mutex<LaserState>,
    range_nm: (f64, f64),
    tuning_delay: Duration,
}

impl Default for MockLaser {
    fn default() -> Self {
        Self::new(1480.0, 1640.0)
    }
}

impl MockLaser {
    /// Laser tunable over `[min_nm, max_nm]`, starting at the lower edge.
    pub fn new(min_nm: f64, max_nm: f64) -> Self {
        Self {
            state: Mutex::new(LaserState {
                wavelength_nm: min_nm,
                power_mw: 0.0,
                speed_nm_s: 1.0,
                sweeping: false,
                emission: false,
                history: Vec::new(),
                failing_wavelengths: Vec::new(),
                actions: Vec::new(),
            }),
            range_nm: (min_nm, max_nm),
            tuning_delay: Duration::ZERO,
        }
    }

    /// Simulated time to retune.
    pub fn with_tuning_delay(mut self, delay: Duration) -> Self {
        self.tuning_delay = delay;
        self
    }

    /// Make tuning to exactly `wavelength_nm` fail.
    pub fn fail_at(&self, wavelength_nm: f64) {
        self.state.lock().failing_wavelengths.push(wavelength_nm);
    }

    /// Current wavelength.
    pub fn wavelength(&self) -> f64 {
        self.state.lock().wavelength_nm
    }

    /// Every wavelength successfully tuned to, in order.
    pub fn history(&self) -> Vec<f64> {
        self.state.lock().history.clone()
    }

    /// Whether a sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.state.lock().sweeping
    }

    /// Whether emission is on.
    pub fn is_emitting(&self) -> bool {
        self.state.lock().emission
    }

    /// Named actions performed, in order.
    pub fn action_log(&self) -> Vec<String> {
        self.state.lock().actions.clone()
    }
}

#[async_trait]
impl Readable for MockLaser {
    async fn read(&self, channel: &Channel) -> Result<RawValue> {
        let state = self.state.lock();
        match channel.key() {
            "wavelength" => Ok(RawValue::Number(state.wavelength_nm)),
            "power" => Ok(RawValue::Number(state.power_mw)),
            "speed" => Ok(RawValue::Number(state.speed_nm_s)),
            "sweeping" => Ok(RawValue::Flag(state.sweeping)),
            "emission" => Ok(RawValue::Flag(state.emission)),
            other => Err(anyhow!("MockLaser has no channel '{other}'")),
        }
    }
}

#[async_trait]
impl Writable for MockLaser {
    async fn write(&self, channel: &Channel, value: RawValue) -> Result<()> {
        match (channel.key(), value) {
            ("wavelength", RawValue::Number(nm)) => {
                let (min, max) = self.range_nm;
                if !(min..=max).contains(&nm) {
                    anyhow::bail!("Wavelength {nm} nm outside tuning range [{min}, {max}] nm");
                }
                if self.state.lock().failing_wavelengths.contains(&nm) {
                    anyhow::bail!("Simulated tuning fault at {nm} nm");
                }
                if !self.tuning_delay.is_zero() {
                    sleep(self.tuning_delay).await;
                }
                let mut state = self.state.lock();
                state.wavelength_nm = nm;
                state.history.push(nm);
                Ok(())
            }
            ("power", RawValue::Number(mw)) => {
                self.state.lock().power_mw = mw;
                Ok(())
            }
            ("speed", RawValue::Number(speed)) => {
                if speed <= 0.0 {
                    anyhow::bail!("Sweep speed must be positive");
                }
                self.state.lock().speed_nm_s = speed;
                Ok(())
            }
            ("emission", RawValue::Flag(on)) => {
                self.state.lock().emission = on;
                Ok(())
            }
            (key, value) => Err(anyhow!("MockLaser cannot write {value:?} to '{key}'")),
        }
    }
}

#[async_trait]
impl Actionable for MockLaser {
    async fn act(&self, action: &str, _args: &[RawValue]) -> Result<()> {
        let mut state = self.state.lock();
        match action {
            "start_sweep" | "resume_sweep" => state.sweeping = true,
            "stop_sweep" | "pause_sweep" => state.sweeping = false,
            "emission_on" => state.emission = true,
            "emission_off" => state.emission = false,
            other => anyhow::bail!("MockLaser has no action '{other}'"),
        }
        state.actions.push(action.to_string());
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.sweeping = false;
        state.emission = false;
        Ok(())
    }

    fn actions(&self) -> Vec<&'static str> {
        vec![
            "start_sweep",
            "pause_sweep",
            "resume_sweep",
            "stop_sweep",
            "emission_on",
            "emission_off",
        ]
    }
}

/// Factory for `mock/Laser`.
///
/// Options: `min_wavelength`, `max_wavelength` (quantities, default 1480–1640 nm).
#[derive(Default)]
pub struct MockLaserFactory {
    instance: Option<Arc<MockLaser>>,
}

impl MockLaserFactory {
    /// Factory building a fresh laser per device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory handing out `instance`.
    pub fn shared(instance: Arc<MockLaser>) -> Self {
        Self {
            instance: Some(instance),
        }
    }

    fn range(spec: &DeviceSpec) -> Result<(f64, f64)> {
        let nm = crate::units::Unit::parse("nm")?;
        let bound = |key: &str, fallback: f64| -> Result<f64> {
            match spec.option(key) {
                Some(value) => Ok(value.to_quantity()?.or_unit(&nm).value_in(&nm)?),
                None => Ok(fallback),
            }
        };
        let range = (bound("min_wavelength", 1480.0)?, bound("max_wavelength", 1640.0)?);
        if range.0 >= range.1 {
            anyhow::bail!("min_wavelength must be below max_wavelength");
        }
        Ok(range)
    }
}

impl DriverFactory for MockLaserFactory {
    fn driver_spec(&self) -> &'static str {
        "mock/Laser"
    }

    fn name(&self) -> &'static str {
        "Simulated tunable laser"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ALL_CAPABILITIES
    }

    fn validate(&self, spec: &DeviceSpec) -> Result<()> {
        Self::range(spec).map(|_| ())
    }

    fn build(&self, spec: DeviceSpec) -> BoxFuture<'static, Result<DriverComponents>> {
        let instance = self.instance.clone();
        Box::pin(async move {
            let laser = match instance {
                Some(laser) => laser,
                None => {
                    let (min, max) = Self::range(&spec)?;
                    Arc::new(MockLaser::new(min, max))
                }
            };
            Ok(DriverComponents::new()
                .with_readable(laser.clone())
                .with_writable(laser.clone())
                .with_actionable(laser))
        })
    }
}

// =============================================================================
// MockShutter - Simulated beam shutter
// =============================================================================

/// Mock beam shutter
///
/// Exposes an `open` flag channel and `open`/`close` actions. Closes itself on
/// finalize.
#[derive(Default)]
pub struct MockShutter {
    open: AtomicBool,
    log: Mutex<Vec<String>>,
    failing_actions: Mutex<HashSet<String>>,
}

impl MockShutter {
    /// Closed shutter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the shutter is open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Make `action` fail.
    pub fn fail_action(&self, action: &str) {
        self.failing_actions.lock().insert(action.to_string());
    }

    /// Actions performed (including finalize), in order.
    pub fn action_log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Readable for MockShutter {
    async fn read(&self, channel: &Channel) -> Result<RawValue> {
        match channel.key() {
            "open" | "state" => Ok(RawValue::Flag(self.is_open())),
            other => Err(anyhow!("MockShutter has no channel '{other}'")),
        }
    }
}

#[async_trait]
impl Writable for MockShutter {
    async fn write(&self, channel: &Channel, value: RawValue) -> Result<()> {
        match (channel.key(), value) {
            ("open" | "state", RawValue::Flag(open)) => {
                self.open.store(open, Ordering::SeqCst);
                Ok(())
            }
            (key, value) => Err(anyhow!("MockShutter cannot write {value:?} to '{key}'")),
        }
    }
}

#[async_trait]
impl Actionable for MockShutter {
    async fn act(&self, action: &str, _args: &[RawValue]) -> Result<()> {
        if self.failing_actions.lock().contains(action) {
            anyhow::bail!("Simulated shutter fault during '{action}'");
        }
        match action {
            "open" => self.open.store(true, Ordering::SeqCst),
            "close" => self.open.store(false, Ordering::SeqCst),
            other => anyhow::bail!("MockShutter has no action '{other}'"),
        }
        self.log.lock().push(action.to_string());
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.log.lock().push("finalize".to_string());
        Ok(())
    }

    fn actions(&self) -> Vec<&'static str> {
        vec!["open", "close"]
    }
}

/// Factory for `mock/Shutter`.
#[derive(Default)]
pub struct MockShutterFactory {
    instance: Option<Arc<MockShutter>>,
}

impl MockShutterFactory {
    /// Factory building a fresh shutter per device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory handing out `instance`.
    pub fn shared(instance: Arc<MockShutter>) -> Self {
        Self {
            instance: Some(instance),
        }
    }
}

impl DriverFactory for MockShutterFactory {
    fn driver_spec(&self) -> &'static str {
        "mock/Shutter"
    }

    fn name(&self) -> &'static str {
        "Simulated beam shutter"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ALL_CAPABILITIES
    }

    fn validate(&self, _spec: &DeviceSpec) -> Result<()> {
        Ok(())
    }

    fn build(&self, _spec: DeviceSpec) -> BoxFuture<'static, Result<DriverComponents>> {
        let shutter = self
            .instance
            .clone()
            .unwrap_or_else(|| Arc::new(MockShutter::new()));
        Box::pin(async move {
            Ok(DriverComponents::new()
                .with_readable(shutter.clone())
                .with_writable(shutter.clone())
                .with_actionable(shutter))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str, port: Option<&str>, kind: PropertyKind) -> Channel {
        Channel {
            name: name.into(),
            port: port.map(Into::into),
            kind,
            mode: None,
        }
    }

    #[tokio::test]
    async fn test_daq_readings_and_faults() {
        let daq = MockDaq::new();
        let ai0 = channel("pd1", Some("ai0"), PropertyKind::Analog);
        let ai1 = channel("pd2", Some("ai1"), PropertyKind::Analog);

        assert_eq!(daq.read(&ai0).await.unwrap(), RawValue::Number(0.0));
        daq.set_reading("ai0", 1.25);
        assert_eq!(daq.read(&ai0).await.unwrap(), RawValue::Number(1.25));

        daq.fail_reads_on("ai1");
        assert!(daq.read(&ai1).await.is_err());
        assert_eq!(daq.read_count(), 3);
    }

    #[tokio::test]
    async fn test_daq_hanging_read_times_out() {
        let daq = MockDaq::new();
        daq.hang_reads_on("ai0");
        let ai0 = channel("pd1", Some("ai0"), PropertyKind::Analog);
        let result = tokio::time::timeout(Duration::from_millis(20), daq.read(&ai0)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_laser_refuses_out_of_range() {
        let laser = MockLaser::new(1500.0, 1600.0);
        let wl = channel("wavelength", None, PropertyKind::Analog);
        assert!(laser.write(&wl, RawValue::Number(1450.0)).await.is_err());
        laser.write(&wl, RawValue::Number(1550.0)).await.unwrap();
        assert_eq!(laser.wavelength(), 1550.0);
        assert_eq!(laser.history(), vec![1550.0]);

        laser.act("start_sweep", &[]).await.unwrap();
        assert!(laser.is_sweeping());
        laser.finalize().await.unwrap();
        assert!(!laser.is_sweeping());
    }

    #[tokio::test]
    async fn test_shutter_actions() {
        let shutter = MockShutter::new();
        shutter.act("open", &[]).await.unwrap();
        assert!(shutter.is_open());
        shutter.fail_action("close");
        assert!(shutter.act("close", &[]).await.is_err());
        shutter.finalize().await.unwrap();
        assert!(!shutter.is_open());
        assert_eq!(shutter.action_log(), vec!["open", "finalize"]);
    }

    #[test]
    fn test_register_mock_factories() {
        let mut resolver = DriverResolver::new();
        register_mock_factories(&mut resolver).unwrap();
        assert_eq!(resolver.specs(), vec!["mock/Daq", "mock/Laser", "mock/Shutter"]);
    }
}
