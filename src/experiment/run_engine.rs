//! RunEngine for executing experiment plans.
//!
//! The RunEngine resolves a plan against the device graph and drives it
//! through its phases, streaming one [`ScanRecord`] per set-point to a
//! [`ResultSink`].

use super::plan::{DeviceAction, ExperimentPlan, ScanBlock};
use super::sink::ResultSink;
use super::state::{DetectorReading, EngineState, RunOutcome, RunReport, ScanRecord};
use crate::config::schema::PlanSpec;
use crate::config::settings::Settings;
use crate::error::{AppResult, LabError, PropertyAddress};
use crate::hardware::graph::DeviceGraph;
use crate::hardware::property::PropertyValue;
use crate::units::Quantity;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default per-read detector timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Requests a running engine to stop at the next set-point boundary.
///
/// Cloneable and cheap; hand one to a signal handler or another task.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask the run to stop. The set-point in flight completes; the engine then
    /// skips the remaining set-points and the block's `after` actions and
    /// proceeds directly to finish.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Experiment executor.
///
/// The RunEngine is responsible for:
/// - Resolving plans against the device graph before any hardware I/O
/// - Bringing devices up and applying defaults (best effort)
/// - Stepping each scan's target through its set-points, one at a time
/// - Reading every detector of a set-point concurrently, each under a timeout
/// - Always attempting the finish phase once hardware has been touched
///
/// # Architecture
///
/// ```text
/// PlanSpec → ExperimentPlan → RunEngine ─set/get─> PropertyRegistry → Drivers
///                                 │
///                                 └─ScanRecord─> ResultSink
/// ```
///
/// # Example
///
/// ```rust,ignore
/// use labscan::experiment::{MemorySink, RunEngine};
///
/// let engine = RunEngine::new(Arc::new(graph)).with_read_timeout(Duration::from_millis(500));
/// let stop = engine.stop_handle();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     stop.stop();
/// });
///
/// let mut sink = MemorySink::new();
/// let report = engine.run(&plan_spec, &mut sink).await?;
/// println!("{}: {} records", report.outcome, report.records_emitted);
/// ```
pub struct RunEngine {
    graph: Arc<DeviceGraph>,
    read_timeout: Duration,
    default_settle: Duration,
    state: Mutex<EngineState>,
    stop: StopHandle,
}

impl RunEngine {
    /// Create an engine over a loaded device graph.
    pub fn new(graph: Arc<DeviceGraph>) -> Self {
        Self {
            graph,
            read_timeout: DEFAULT_READ_TIMEOUT,
            default_settle: Duration::ZERO,
            state: Mutex::new(EngineState::Idle),
            stop: StopHandle::default(),
        }
    }

    /// Create an engine using the timeouts from `settings`.
    pub fn from_settings(graph: Arc<DeviceGraph>, settings: &Settings) -> Self {
        Self::new(graph)
            .with_read_timeout(settings.read_timeout())
            .with_default_settle(settings.settle())
    }

    /// Per-read detector timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Settle time for scan blocks that do not give their own.
    pub fn with_default_settle(mut self, settle: Duration) -> Self {
        self.default_settle = settle;
        self
    }

    /// Handle for stopping a run from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Device graph the engine drives.
    pub fn graph(&self) -> &Arc<DeviceGraph> {
        &self.graph
    }

    fn set_state(&self, state: EngineState) {
        debug!(%state, "Engine state");
        *self.state.lock() = state;
    }

    /// Execute a plan.
    ///
    /// Configuration problems found while resolving the plan abort the run
    /// before any device is touched. From then on nothing aborts: scan
    /// failures are attached to their records, init and finish failures are
    /// collected, and finish is always attempted.
    ///
    /// # Errors
    ///
    /// Only when the engine is already running a plan. Everything else is
    /// reported in the returned [`RunReport`].
    #[instrument(skip_all, fields(plan = %spec.name))]
    pub async fn run(&self, spec: &PlanSpec, sink: &mut dyn ResultSink) -> AppResult<RunReport> {
        {
            let mut state = self.state.lock();
            if !state.can_begin() {
                return Err(LabError::Configuration(format!(
                    "Cannot start run: engine in {} state",
                    *state
                )));
            }
            *state = EngineState::Validating;
        }

        let run_id = Uuid::new_v4();
        let mut report = RunReport::new(run_id, spec.name.clone());
        info!(%run_id, "Starting experiment");

        let plan = match ExperimentPlan::resolve(spec, &self.graph, self.default_settle) {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "Plan rejected; aborting before hardware I/O");
                report.outcome = RunOutcome::Aborted;
                report.abort_reason = Some(e.to_string());
                report.conclude();
                self.stop.clear();
                self.set_state(EngineState::Done);
                return Ok(report);
            }
        };
        info!(
            scans = plan.scans.len(),
            expected_records = plan.expected_records(),
            "Plan resolved"
        );

        self.initialize(&mut report).await;
        self.scan(&plan, sink, &mut report).await;
        self.finish(&plan, &mut report).await;

        if let Err(e) = sink.flush().await {
            warn!(error = %e, "Result sink flush failed");
            report.scan_failures.push(format!("sink flush: {e:#}"));
        }

        report.conclude();
        self.stop.clear();
        self.set_state(EngineState::Done);
        info!(
            outcome = %report.outcome,
            records = report.records_emitted,
            failed_records = report.failed_records,
            stopped_early = report.stopped_early,
            "Experiment finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Phases
    // =========================================================================

    #[instrument(skip_all)]
    async fn initialize(&self, report: &mut RunReport) {
        self.set_state(EngineState::Initializing);
        let failures = self.graph.initialize().await;
        report
            .init_failures
            .extend(failures.into_iter().map(|e| e.to_string()));
    }

    #[instrument(skip_all)]
    async fn scan(&self, plan: &ExperimentPlan, sink: &mut dyn ResultSink, report: &mut RunReport) {
        self.set_state(EngineState::Scanning);
        for block in &plan.scans {
            if self.stop.is_stop_requested() {
                report.stopped_early = true;
                break;
            }
            info!(scan = %block.name, target = %block.target, points = block.range.len(), repeat = block.repeat, "Scan started");

            for action in &block.before {
                if let Err(e) = self.perform(action).await {
                    warn!(scan = %block.name, %action, error = %e, "Scan action failed");
                    report.scan_failures.push(e.to_string());
                }
            }

            'passes: for pass in 0..block.repeat {
                for (index, set_point) in block.range.set_points().enumerate() {
                    if self.stop.is_stop_requested() {
                        info!(scan = %block.name, pass, index, "Stop requested; skipping to finish");
                        report.stopped_early = true;
                        break 'passes;
                    }
                    let record = self.measure(block, report.run_id, pass, index, set_point).await;
                    report.records_emitted += 1;
                    if record.is_failed() {
                        report.failed_records += 1;
                    }
                    if let Err(e) = sink.accept(record).await {
                        warn!(scan = %block.name, index, error = %e, "Result sink rejected record");
                        report.scan_failures.push(format!("sink: {e:#}"));
                    }
                }
            }

            if report.stopped_early {
                break;
            }
            for action in &block.after {
                if let Err(e) = self.perform(action).await {
                    warn!(scan = %block.name, %action, error = %e, "Scan action failed");
                    report.scan_failures.push(e.to_string());
                }
            }
            info!(scan = %block.name, "Scan finished");
        }
    }

    #[instrument(skip_all)]
    async fn finish(&self, plan: &ExperimentPlan, report: &mut RunReport) {
        self.set_state(EngineState::Finishing);
        for block in &plan.finish {
            for (address, value) in &block.set {
                let result = match self.graph.registry().lookup(address) {
                    Ok(property) => property.set(value).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(property = %address, error = %e, "Finish value not applied");
                    report.finish_failures.push(e.to_string());
                }
            }
            for action in &block.actions {
                if let Err(e) = self.perform(action).await {
                    warn!(%action, error = %e, "Finish action failed");
                    report.finish_failures.push(e.to_string());
                }
            }
        }
        report
            .finish_failures
            .extend(self.graph.finalize().await.into_iter().map(|e| e.to_string()));
    }

    // =========================================================================
    // Set-points
    // =========================================================================

    async fn perform(&self, action: &DeviceAction) -> AppResult<()> {
        self.graph
            .resolve(&action.device)?
            .act(&action.name, &action.args)
            .await
    }

    /// Write one set-point, wait, read every detector.
    async fn measure(
        &self,
        block: &ScanBlock,
        run_id: Uuid,
        pass: u32,
        index: usize,
        set_point: Quantity,
    ) -> ScanRecord {
        let written = match self.graph.registry().lookup(&block.target) {
            Ok(target) => target.set(&PropertyValue::Quantity(set_point.clone())).await,
            Err(e) => Err(e),
        };

        let (readings, failure) = match written {
            Err(e) => {
                warn!(scan = %block.name, index, %set_point, error = %e, "Set-point write failed");
                (Vec::new(), Some(format!("write {set_point}: {e}")))
            }
            Ok(()) => {
                let wait = block.wait_per_point();
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                let readings = self.read_detectors(&block.detectors).await;
                let failed = readings.iter().filter(|r| !r.is_ok()).count();
                let failure = (failed > 0)
                    .then(|| format!("{failed} of {} detector reads failed", readings.len()));
                (readings, failure)
            }
        };
        debug!(scan = %block.name, pass, index, %set_point, failed = failure.is_some(), "Set-point done");

        ScanRecord {
            run_id,
            scan: block.name.clone(),
            pass,
            index,
            timestamp: Utc::now(),
            target: block.target.clone(),
            set_point,
            readings,
            failure,
        }
    }

    /// Read all detectors concurrently, returning results in declaration order.
    async fn read_detectors(&self, detectors: &[PropertyAddress]) -> Vec<DetectorReading> {
        let mut slots: Vec<Option<DetectorReading>> = vec![None; detectors.len()];
        let mut reads = JoinSet::new();

        for (slot, address) in detectors.iter().enumerate() {
            let property = match self.graph.registry().lookup(address) {
                Ok(property) => property,
                Err(e) => {
                    slots[slot] = Some(DetectorReading::failed(address.clone(), e));
                    continue;
                }
            };
            let timeout = self.read_timeout;
            let address = address.clone();
            reads.spawn(async move {
                let reading = match tokio::time::timeout(timeout, property.get()).await {
                    Ok(Ok(value)) => DetectorReading::ok(address, value),
                    Ok(Err(e)) => DetectorReading::failed(address, e),
                    Err(_) => DetectorReading::failed(
                        address.clone(),
                        LabError::Timeout {
                            address,
                            after: timeout,
                        },
                    ),
                };
                (slot, reading)
            });
        }

        while let Some(joined) = reads.join_next().await {
            match joined {
                Ok((slot, reading)) => {
                    if let Some(e) = &reading.error {
                        warn!(detector = %reading.address, error = %e, "Detector read failed");
                    }
                    slots[slot] = Some(reading);
                }
                Err(e) => error!(error = %e, "Detector read task failed"),
            }
        }

        slots
            .into_iter()
            .zip(detectors)
            .map(|(slot, address)| {
                slot.unwrap_or_else(|| DetectorReading::failed(address.clone(), "read task failed"))
            })
            .collect()
    }
}

impl std::fmt::Debug for RunEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEngine")
            .field("devices", &self.graph.len())
            .field("read_timeout", &self.read_timeout)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_plan;
    use crate::config::schema::PlanSpec;
    use crate::experiment::sink::MemorySink;

    #[test]
    fn test_stop_handle_is_shared() {
        let engine = RunEngine::new(Arc::new(DeviceGraph::default()));
        let handle = engine.stop_handle();
        assert!(!engine.stop.is_stop_requested());
        handle.stop();
        assert!(engine.stop.is_stop_requested());
        engine.stop.clear();
        assert!(!handle.is_stop_requested());
    }

    #[tokio::test]
    async fn test_aborted_run_clears_stop_request() {
        let engine = RunEngine::new(Arc::new(DeviceGraph::default()));
        let spec = parse_plan("scan:\n  ghost:\n    params: {start: 0, stop: 1, step: 1}\n").unwrap();

        engine.stop_handle().stop();
        let report = engine.run(&spec, &mut MemorySink::new()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert!(!engine.stop_handle().is_stop_requested());
        assert_eq!(engine.state(), EngineState::Done);
    }

    #[tokio::test]
    async fn test_empty_plan_completes_clean() {
        let engine = RunEngine::new(Arc::new(DeviceGraph::default()));
        assert_eq!(engine.state(), EngineState::Idle);

        let mut sink = MemorySink::new();
        let report = engine.run(&PlanSpec::default(), &mut sink).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::CompletedClean);
        assert_eq!(report.records_emitted, 0);
        assert!(sink.is_flushed());
        assert_eq!(engine.state(), EngineState::Done);
    }
}
