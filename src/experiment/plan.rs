//! Resolved experiment plans.
//!
//! A [`PlanSpec`] is what the YAML says; an [`ExperimentPlan`] is the same
//! plan checked against a loaded [`DeviceGraph`]: every device exists, every
//! scan target is a writable analog property, every detector is readable,
//! every finish value passes its property's units and limits. Resolution
//! performs no hardware I/O, so a plan that fails here aborts the run before
//! any device is touched.
//!
//! # Phases
//!
//! ```text
//! init ──> scan[0] ──> scan[1] ──> ... ──> finish
//!  │         │ repeat × set-points              ▲
//!  │         └── write target, settle, read detectors
//!  └── driver bring-up + defaults               always attempted
//! ```

use crate::config::schema::{ActionSpec, PlanSpec, ScanSpec, ValueSpec};
use crate::error::{AppResult, LabError, PropertyAddress};
use crate::hardware::capabilities::RawValue;
use crate::hardware::driver::Capability;
use crate::hardware::graph::{action_args, Device, DeviceGraph};
use crate::hardware::property::{PropertyKind, PropertyValue};
use crate::units::{Quantity, Unit};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Slack for floating point spans that should land exactly on `stop`.
const SPAN_EPSILON: f64 = 1e-9;

/// Upper bound on set-points in one range.
pub const MAX_SET_POINTS: usize = 10_000_000;

// =============================================================================
// Ranges
// =============================================================================

/// A finite arithmetic sequence of set-points in one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRange {
    start: f64,
    step: f64,
    count: usize,
    unit: Unit,
    dwell: Duration,
}

impl ScanRange {
    /// `start`, `start + step`, ... up to and including `stop`.
    ///
    /// Bare numbers are taken to be in `unit`. A descending range needs a
    /// negative step.
    pub fn stepped(start: &Quantity, stop: &Quantity, step: &Quantity, unit: &Unit) -> AppResult<Self> {
        let start = start.clone().or_unit(unit).value_in(unit)?;
        let stop = stop.clone().or_unit(unit).value_in(unit)?;
        let step = step.clone().or_unit(unit).value_in(unit)?;
        Self::build(start, stop, step, unit, Duration::ZERO)
    }

    /// Laser style sweep: one set-point every `interval` from `start` to
    /// `stop`, dwelling `interval / speed` on each.
    ///
    /// The sweep direction follows `start → stop`; the sign of `interval` is ignored.
    pub fn swept(
        start: &Quantity,
        stop: &Quantity,
        speed: &Quantity,
        interval: &Quantity,
        unit: &Unit,
    ) -> AppResult<Self> {
        let start = start.clone().or_unit(unit).value_in(unit)?;
        let stop = stop.clone().or_unit(unit).value_in(unit)?;
        let interval = interval.clone().or_unit(unit).value_in(unit)?.abs();
        let per_second = unit.per(&Unit::parse("s")?);
        let speed = speed.clone().or_unit(&per_second).value_in(&per_second)?.abs();
        if !(speed.is_finite() && speed > 0.0) {
            return Err(LabError::Configuration(format!(
                "Sweep speed must be positive, got {speed} {per_second}"
            )));
        }
        let dwell = Duration::try_from_secs_f64(interval / speed).map_err(|e| {
            LabError::Configuration(format!("Sweep dwell {interval}/{speed} is not a duration: {e}"))
        })?;
        let step = if stop < start { -interval } else { interval };
        Self::build(start, stop, step, unit, dwell)
    }

    fn build(start: f64, stop: f64, step: f64, unit: &Unit, dwell: Duration) -> AppResult<Self> {
        if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
            return Err(LabError::Configuration("Scan range must be finite".into()));
        }
        if step == 0.0 {
            return Err(LabError::Configuration("Scan step must not be zero".into()));
        }
        let span = stop - start;
        if span != 0.0 && span.signum() != step.signum() {
            return Err(LabError::Configuration(format!(
                "Step {step} never reaches {stop} from {start}"
            )));
        }
        let intervals = (span / step + SPAN_EPSILON).floor();
        if !intervals.is_finite() || intervals >= MAX_SET_POINTS as f64 {
            return Err(LabError::Configuration(format!(
                "Range {start}..{stop} by {step} exceeds {MAX_SET_POINTS} set-points"
            )));
        }
        let count = intervals as usize + 1;
        Ok(Self {
            start,
            step,
            count,
            unit: unit.clone(),
            dwell,
        })
    }

    /// Number of set-points.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Never true: a range has at least its start.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Unit of every set-point.
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Spacing between set-points.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Time spent on each set-point during a sweep; zero for stepped ranges.
    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    /// The `index`-th set-point.
    pub fn nth(&self, index: usize) -> Option<Quantity> {
        (index < self.count)
            .then(|| Quantity::new(self.start + self.step * index as f64, self.unit.clone()))
    }

    /// Lazy iterator over the set-points. Each call starts from the beginning.
    pub fn set_points(&self) -> SetPoints<'_> {
        SetPoints {
            range: self,
            next: 0,
        }
    }
}

/// Iterator returned by [`ScanRange::set_points`].
#[derive(Debug, Clone)]
pub struct SetPoints<'a> {
    range: &'a ScanRange,
    next: usize,
}

impl Iterator for SetPoints<'_> {
    type Item = Quantity;

    fn next(&mut self) -> Option<Quantity> {
        let point = self.range.nth(self.next)?;
        self.next += 1;
        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.range.count.saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for SetPoints<'_> {}

// =============================================================================
// Plan blocks
// =============================================================================

/// A named action on a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAction {
    /// Device performing the action
    pub device: String,
    /// Action name
    pub name: String,
    /// Positional arguments
    pub args: Vec<RawValue>,
}

impl std::fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.device, self.name)
    }
}

/// One resolved scan block.
#[derive(Debug, Clone)]
pub struct ScanBlock {
    /// Block key in the plan
    pub name: String,
    /// Actuator that is stepped
    pub target: PropertyAddress,
    /// Set-points
    pub range: ScanRange,
    /// Wait after each write before reading
    pub settle: Duration,
    /// Passes over the range
    pub repeat: u32,
    /// Readable properties sampled at each set-point, in declaration order
    pub detectors: Vec<PropertyAddress>,
    /// Run before the first set-point
    pub before: Vec<DeviceAction>,
    /// Run after the last set-point
    pub after: Vec<DeviceAction>,
}

impl ScanBlock {
    /// Total wait per set-point: settle time plus sweep dwell.
    pub fn wait_per_point(&self) -> Duration {
        self.settle + self.range.dwell()
    }

    /// Records this block emits when it runs to completion.
    pub fn expected_records(&self) -> usize {
        self.range.len().saturating_mul(self.repeat as usize)
    }
}

/// One resolved finish block.
#[derive(Debug, Clone)]
pub struct FinishBlock {
    /// Device the block is keyed by
    pub device: String,
    /// Values to apply, in order; already checked against units and limits
    pub set: Vec<(PropertyAddress, PropertyValue)>,
    /// Actions to run after the values are applied
    pub actions: Vec<DeviceAction>,
}

/// A plan validated against a device graph.
#[derive(Debug, Clone)]
pub struct ExperimentPlan {
    /// Plan name
    pub name: String,
    /// Scan blocks in execution order
    pub scans: Vec<ScanBlock>,
    /// Finish blocks in declaration order
    pub finish: Vec<FinishBlock>,
}

impl ExperimentPlan {
    /// Resolve `spec` against `graph`.
    ///
    /// `default_settle` applies to scan blocks without their own `settle`.
    pub fn resolve(spec: &PlanSpec, graph: &DeviceGraph, default_settle: Duration) -> AppResult<Self> {
        let scans = spec
            .scan
            .iter()
            .map(|(key, scan)| resolve_scan(key, scan, graph, default_settle))
            .collect::<AppResult<Vec<_>>>()?;

        let mut finish = Vec::with_capacity(spec.finish.len());
        for (key, block) in spec.finish.iter() {
            let referenced_by = format!("finish block '{key}'");
            let device = lookup_device(graph, key, &referenced_by)?;
            let mut set = Vec::with_capacity(block.set.len());
            for (name, value) in block.set.iter() {
                let property = device.property(name).ok_or_else(|| {
                    LabError::NotFound(format!("property {key}.{name} ({referenced_by})"))
                })?;
                let definition = property.definition();
                if !definition.direction.can_write() {
                    return Err(LabError::Configuration(format!(
                        "{referenced_by}: {} is not writable",
                        definition.address()
                    )));
                }
                let value = definition.parse_value(value)?;
                definition.encode(&value)?;
                set.push((definition.address(), value));
            }
            let actions = actions(graph, key, &block.actions, &referenced_by)?;
            finish.push(FinishBlock {
                device: key.to_string(),
                set,
                actions,
            });
        }

        debug!(scans = scans.len(), finish = finish.len(), "Plan resolved");
        Ok(Self {
            name: spec.name.clone(),
            scans,
            finish,
        })
    }

    /// Records the plan emits when every scan runs to completion.
    pub fn expected_records(&self) -> usize {
        self.scans
            .iter()
            .map(ScanBlock::expected_records)
            .fold(0, usize::saturating_add)
    }
}

fn lookup_device<'g>(graph: &'g DeviceGraph, name: &str, referenced_by: &str) -> AppResult<&'g Arc<Device>> {
    graph.resolve(name).map_err(|_| LabError::UnknownDevice {
        device: name.to_string(),
        referenced_by: referenced_by.to_string(),
    })
}

fn actions(
    graph: &DeviceGraph,
    device_name: &str,
    specs: &[ActionSpec],
    referenced_by: &str,
) -> AppResult<Vec<DeviceAction>> {
    if specs.is_empty() {
        return Ok(Vec::new());
    }
    let device = lookup_device(graph, device_name, referenced_by)?;
    if !device.capabilities().contains(&Capability::Actionable) {
        return Err(LabError::Configuration(format!(
            "{referenced_by}: device '{device_name}' has no actions"
        )));
    }
    Ok(specs
        .iter()
        .map(|spec| DeviceAction {
            device: device_name.to_string(),
            name: spec.name().to_string(),
            args: action_args(spec.args()),
        })
        .collect())
}

fn quantity(value: &ValueSpec, what: &str, block: &str) -> AppResult<Quantity> {
    value.to_quantity().map_err(|e| {
        LabError::Configuration(format!("scan '{block}': bad {what} '{value}': {e}"))
    })
}

fn resolve_scan(
    key: &str,
    scan: &ScanSpec,
    graph: &DeviceGraph,
    default_settle: Duration,
) -> AppResult<ScanBlock> {
    let referenced_by = format!("scan '{key}'");
    let device_name = scan.device.as_deref().unwrap_or(key);
    let device = lookup_device(graph, device_name, &referenced_by)?;
    let params = &scan.params;

    let target = match &params.property {
        Some(name) => device.property(name).ok_or_else(|| {
            LabError::NotFound(format!("property {device_name}.{name} ({referenced_by})"))
        })?,
        None => {
            let mut writable = device
                .properties()
                .iter()
                .filter(|p| p.direction().can_write());
            match (writable.next(), writable.next()) {
                (Some(only), None) => only,
                _ => {
                    return Err(LabError::Configuration(format!(
                        "{referenced_by}: device '{device_name}' needs exactly one writable \
                         property when 'property' is omitted"
                    )))
                }
            }
        }
    };
    let definition = target.definition();
    if !definition.direction.can_write() || definition.kind != PropertyKind::Analog {
        return Err(LabError::Configuration(format!(
            "{referenced_by}: {} must be a writable analog property",
            definition.address()
        )));
    }

    let unit = definition.target_unit();
    let start = quantity(&params.start, "start", key)?;
    let stop = quantity(&params.stop, "stop", key)?;
    let range = match (&params.step, &params.speed, &params.interval_trigger) {
        (Some(step), None, None) => {
            ScanRange::stepped(&start, &stop, &quantity(step, "step", key)?, unit)?
        }
        (None, Some(speed), Some(interval)) => ScanRange::swept(
            &start,
            &stop,
            &quantity(speed, "speed", key)?,
            &quantity(interval, "interval_trigger", key)?,
            unit,
        )?,
        _ => {
            return Err(LabError::Configuration(format!(
                "{referenced_by}: give either 'step' or 'speed' with 'interval_trigger'"
            )))
        }
    };
    if let Some(limits) = &definition.limits {
        for end in [range.nth(0), range.nth(range.len() - 1)].into_iter().flatten() {
            if !limits.contains(end.magnitude) {
                warn!(scan = key, set_point = %end, "Set-point outside limits; it will be refused");
            }
        }
    }

    let settle = match &params.settle {
        Some(value) => {
            let seconds = Unit::parse("s")?;
            let secs = quantity(value, "settle", key)?.or_unit(&seconds).value_in(&seconds)?;
            Duration::try_from_secs_f64(secs).map_err(|e| {
                LabError::Configuration(format!("{referenced_by}: bad settle {secs} s: {e}"))
            })?
        }
        None => default_settle,
    };
    if params.repeat == 0 {
        return Err(LabError::Configuration(format!("{referenced_by}: repeat must be at least 1")));
    }

    let mut detectors = Vec::new();
    for (owner, names) in scan.detectors.iter() {
        let owner_device = lookup_device(graph, owner, &referenced_by)?;
        for name in names {
            let property = owner_device.property(name).ok_or_else(|| {
                LabError::NotFound(format!("detector {owner}.{name} ({referenced_by})"))
            })?;
            if !property.direction().can_read() {
                return Err(LabError::Configuration(format!(
                    "{referenced_by}: detector {} is not readable",
                    property.address()
                )));
            }
            detectors.push(property.address());
        }
    }

    Ok(ScanBlock {
        name: key.to_string(),
        target: definition.address(),
        range,
        settle,
        repeat: params.repeat,
        detectors,
        before: actions(graph, device_name, &scan.actions.before, &referenced_by)?,
        after: actions(graph, device_name, &scan.actions.after, &referenced_by)?,
    })
}
