//! Integration tests for running experiment plans end to end.
//!
//! Instrument and plan trees are written as YAML into a temp directory,
//! loaded the way the CLI loads them, and executed against shared mock
//! drivers so the tests can inspect what reached the hardware.

use labscan::config::{load_experiment, LoadedExperiment, Overrides};
use labscan::experiment::{ChannelSink, JsonLinesSink, MemorySink, RunEngine, RunOutcome};
use labscan::hardware::mock::{
    MockDaq, MockDaqFactory, MockLaser, MockLaserFactory, MockShutter, MockShutterFactory,
};
use labscan::hardware::{DeviceGraph, DriverResolver, PropertyValue};
use labscan::PropertyAddress;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DEVICES: &str = r#"
NI-DAQ:
  type: daq
  model: PCIe-6321
  driver: mock/Daq
  connection: {type: daq, port: 1}
laser:
  type: laser
  model: TSL-710
  driver: mock/Laser
  connection: {type: GPIB, port: 10}
shutter:
  driver: mock/Shutter
  connection: {type: serial, port: /dev/ttyUSB0}
"#;

const SENSORS: &str = r#"
NI-DAQ:
  photodiode1:
    port: ai0
    type: analog
    units: V
  photodiode2:
    port: ai1
    type: analog
    calibration: {units: mW, slope: 2.0, offset: 0.5}
"#;

const ACTUATORS: &str = r#"
laser:
  wavelength:
    units: nm
    limits: {min: 1480 nm, max: 1640 nm}
    default: 1550 nm
shutter:
  open:
    type: boolean
    default: true
"#;

const LASER_SCAN: &str = r#"
name: laser_scan
init:
  devices: devices.yml
  sensors: sensors.yml
  actuators: actuators.yml
scan:
  laser:
    params:
      start: 1491 nm
      stop: 1510 nm
      step: 1 nm
    detectors:
      NI-DAQ: [photodiode1, photodiode2]
    actions:
      before: [emission_on]
      after: [emission_off]
finish:
  shutter:
    set: {open: false}
    actions: [close]
"#;

/// Mock drivers shared with the graph so tests can inspect them.
struct Bench {
    daq: Arc<MockDaq>,
    laser: Arc<MockLaser>,
    shutter: Arc<MockShutter>,
    resolver: DriverResolver,
    dir: TempDir,
}

impl Bench {
    fn new() -> Self {
        Self::with_laser(MockLaser::default())
    }

    fn with_laser(laser: MockLaser) -> Self {
        let daq = Arc::new(MockDaq::new());
        let laser = Arc::new(laser);
        let shutter = Arc::new(MockShutter::new());

        let mut resolver = DriverResolver::new();
        resolver
            .register_factory(Arc::new(MockDaqFactory::shared(daq.clone())))
            .unwrap();
        resolver
            .register_factory(Arc::new(MockLaserFactory::shared(laser.clone())))
            .unwrap();
        resolver
            .register_factory(Arc::new(MockShutterFactory::shared(shutter.clone())))
            .unwrap();

        let dir = TempDir::new().unwrap();
        for (name, yaml) in [
            ("devices.yml", DEVICES),
            ("sensors.yml", SENSORS),
            ("actuators.yml", ACTUATORS),
        ] {
            fs::write(dir.path().join(name), yaml).unwrap();
        }

        Self {
            daq,
            laser,
            shutter,
            resolver,
            dir,
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    async fn load(&self, plan_yaml: &str) -> (LoadedExperiment, Arc<DeviceGraph>) {
        let plan_path = self.path().join("plan.yml");
        fs::write(&plan_path, plan_yaml).unwrap();
        let experiment = load_experiment(&plan_path, &Overrides::default()).unwrap();
        let graph = DeviceGraph::load(
            &self.resolver,
            experiment.devices.clone(),
            &experiment.sensors,
            &experiment.actuators,
        )
        .await
        .unwrap();
        (experiment, Arc::new(graph))
    }
}

#[tokio::test]
async fn test_laser_scan_emits_one_record_per_set_point() {
    let bench = Bench::new();
    bench.daq.set_reading("ai0", 0.25);
    bench.daq.set_reading("ai1", 1.0);
    let (experiment, graph) = bench.load(LASER_SCAN).await;

    let engine = RunEngine::new(graph);
    let mut sink = MemorySink::new();
    let report = engine.run(&experiment.plan, &mut sink).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::CompletedClean, "{report:?}");
    assert_eq!(report.records_emitted, 20);
    assert_eq!(report.failed_records, 0);

    let records = sink.records();
    assert_eq!(records.len(), 20);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.index, i);
        assert_eq!(record.set_point.magnitude, 1491.0 + i as f64);
        assert_eq!(record.set_point.unit.symbol(), "nm");
        assert_eq!(record.readings.len(), 2);
        assert!(record.readings.iter().all(|r| r.is_ok()));
        assert_eq!(record.run_id, report.run_id);
    }
    assert!(records.windows(2).all(|w| w[0].set_point.magnitude < w[1].set_point.magnitude));

    // Calibrated detector: 2.0 * 1.0 + 0.5
    let pd2 = records[0]
        .reading(&PropertyAddress::new("NI-DAQ", "photodiode2"))
        .unwrap();
    let value = pd2.value.as_ref().and_then(PropertyValue::as_quantity).unwrap();
    assert_eq!(value.magnitude, 2.5);
    assert_eq!(value.unit.symbol(), "mW");

    // Default first, then the scan
    let history = bench.laser.history();
    assert_eq!(history.len(), 21);
    assert_eq!(history[0], 1550.0);
    assert_eq!(history[20], 1510.0);

    // Finish closed the shutter, which the default had opened
    assert!(!bench.shutter.is_open());
    assert_eq!(bench.shutter.action_log(), vec!["close", "finalize"]);
    assert!(!bench.laser.is_emitting());
    assert_eq!(bench.laser.action_log(), vec!["emission_on", "emission_off"]);
    assert!(bench.daq.is_initialized());
    assert!(bench.daq.is_finalized());
}

#[tokio::test]
async fn test_failed_detector_keeps_other_readings() {
    let bench = Bench::new();
    bench.daq.set_reading("ai0", 0.75);
    bench.daq.fail_reads_on("ai1");
    let (experiment, graph) = bench.load(LASER_SCAN).await;

    let mut sink = MemorySink::new();
    let report = RunEngine::new(graph)
        .run(&experiment.plan, &mut sink)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(report.records_emitted, 20);
    assert_eq!(report.failed_records, 20);
    for record in sink.records() {
        assert!(record.is_failed());
        let pd1 = record
            .reading(&PropertyAddress::new("NI-DAQ", "photodiode1"))
            .unwrap();
        assert!(pd1.is_ok());
        let pd2 = record
            .reading(&PropertyAddress::new("NI-DAQ", "photodiode2"))
            .unwrap();
        assert!(pd2.error.as_deref().unwrap().contains("Simulated read fault"));
    }
}

#[tokio::test]
async fn test_finish_runs_after_scan_failures() {
    let bench = Bench::new();
    bench.laser.fail_at(1495.0);
    bench.laser.fail_at(1500.0);
    let (experiment, graph) = bench.load(LASER_SCAN).await;

    let mut sink = MemorySink::new();
    let report = RunEngine::new(graph)
        .run(&experiment.plan, &mut sink)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(report.records_emitted, 20);
    assert_eq!(report.failed_records, 2);

    let failed = &sink.records()[4];
    assert_eq!(failed.set_point.magnitude, 1495.0);
    assert!(failed.readings.is_empty());
    assert!(failed.failure.as_deref().unwrap().contains("1495"));
    assert!(!sink.records()[5].is_failed());

    assert_eq!(bench.shutter.action_log(), vec!["close", "finalize"]);
    assert!(report.finish_failures.is_empty());
}

#[tokio::test]
async fn test_finish_failures_are_collected() {
    let bench = Bench::new();
    bench.shutter.fail_action("close");
    let (experiment, graph) = bench.load(LASER_SCAN).await;

    let report = RunEngine::new(graph)
        .run(&experiment.plan, &mut MemorySink::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(report.finish_failures.len(), 1);
    assert!(report.finish_failures[0].contains("shutter.close"));
    // Finalize still ran
    assert_eq!(bench.shutter.action_log(), vec!["finalize"]);
}

#[tokio::test]
async fn test_slow_detector_times_out() {
    let bench = Bench::new();
    bench.daq.hang_reads_on("ai0");
    let plan = LASER_SCAN.replace("stop: 1510 nm", "stop: 1493 nm");
    let (experiment, graph) = bench.load(&plan).await;

    let engine = RunEngine::new(graph).with_read_timeout(Duration::from_millis(50));
    let mut sink = MemorySink::new();
    let report = engine.run(&experiment.plan, &mut sink).await.unwrap();

    assert_eq!(report.records_emitted, 3);
    for record in sink.records() {
        assert!(record.readings[0].error.as_deref().unwrap().contains("Timed out"));
        assert!(record.readings[1].is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn test_detectors_are_read_concurrently() {
    let bench = Bench::new();
    bench.daq.hang_reads_on("ai0");
    bench.daq.hang_reads_on("ai1");
    let plan = LASER_SCAN.replace("stop: 1510 nm", "stop: 1493 nm");
    let (experiment, graph) = bench.load(&plan).await;

    let timeout = Duration::from_millis(100);
    let engine = RunEngine::new(graph).with_read_timeout(timeout);
    let mut sink = MemorySink::new();
    let started = tokio::time::Instant::now();
    let report = engine.run(&experiment.plan, &mut sink).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.records_emitted, 3);
    assert_eq!(report.failed_records, 3);
    for record in sink.records() {
        assert_eq!(record.readings.len(), 2);
        assert!(record
            .readings
            .iter()
            .all(|r| r.error.as_deref().unwrap().contains("Timed out")));
    }
    // One timeout per set-point, not one per detector
    assert!(elapsed >= timeout * 3, "elapsed {elapsed:?}");
    assert!(elapsed < timeout * 5, "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_unknown_device_aborts_before_io() {
    let bench = Bench::new();
    let plan = LASER_SCAN.replace("NI-DAQ: [photodiode1, photodiode2]", "lockin: [x]");
    let (experiment, graph) = bench.load(&plan).await;

    let mut sink = MemorySink::new();
    let report = RunEngine::new(graph)
        .run(&experiment.plan, &mut sink)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert!(report.abort_reason.as_deref().unwrap().contains("lockin"));
    assert_eq!(report.records_emitted, 0);
    assert!(!bench.daq.is_initialized());
    assert!(bench.laser.history().is_empty());
    assert!(bench.shutter.action_log().is_empty());
}

#[tokio::test]
async fn test_stop_request_skips_to_finish() {
    let bench = Bench::new();
    let (experiment, graph) = bench.load(LASER_SCAN).await;
    let engine = RunEngine::new(graph);
    let stop = engine.stop_handle();

    let (mut sink, mut rx) = ChannelSink::new(1);
    let collector = tokio::spawn(async move {
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
            if received == 5 {
                stop.stop();
            }
        }
        received
    });

    let report = engine.run(&experiment.plan, &mut sink).await.unwrap();
    drop(sink);
    let received = collector.await.unwrap();

    assert!(report.stopped_early);
    assert!(report.records_emitted >= 5 && report.records_emitted < 20);
    assert_eq!(received, report.records_emitted);
    // Straight to finish: the block's after actions are skipped
    assert_eq!(bench.laser.action_log(), vec!["emission_on"]);
    assert!(report.scan_failures.is_empty());
    assert_eq!(bench.shutter.action_log(), vec!["close", "finalize"]);
    assert!(!bench.laser.is_emitting());
    // Stop requests do not leak into the next run
    assert!(!engine.stop_handle().is_stop_requested());
}

#[tokio::test]
async fn test_sweep_with_repeats() {
    let bench = Bench::new();
    let plan = r#"
init: {devices: devices.yml, sensors: sensors.yml, actuators: actuators.yml}
scan:
  sweep:
    device: laser
    params:
      property: wavelength
      start: 1500 nm
      stop: 1.501 um
      speed: 100 nm/s
      interval_trigger: 0.25 nm
      repeat: 2
    detectors:
      NI-DAQ: [photodiode1]
"#;
    let (experiment, graph) = bench.load(plan).await;

    let mut sink = MemorySink::new();
    let report = RunEngine::new(graph)
        .run(&experiment.plan, &mut sink)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::CompletedClean);
    assert_eq!(report.records_emitted, 10);
    let records = sink.records();
    assert_eq!(records[4].pass, 0);
    assert_eq!(records[5].pass, 1);
    assert_eq!(records[5].index, 0);
    assert_eq!(records[9].set_point.magnitude, 1501.0);
    assert_eq!(records[0].scan, "sweep");
}

#[tokio::test]
async fn test_records_written_as_json_lines() {
    let bench = Bench::new();
    let (experiment, graph) = bench.load(LASER_SCAN).await;
    let output = bench.path().join("out").join("laser_scan.jsonl");

    let mut sink = JsonLinesSink::create(&output).await.unwrap();
    let report = RunEngine::new(graph)
        .run(&experiment.plan, &mut sink)
        .await
        .unwrap();
    assert_eq!(sink.written(), report.records_emitted);

    let text = fs::read_to_string(&output).unwrap();
    let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(first["scan"], "laser");
    assert_eq!(first["target"], "laser.wavelength");
    assert_eq!(first["set_point"]["magnitude"], 1491.0);
    assert_eq!(first["readings"][0]["address"], "NI-DAQ.photodiode1");
    assert_eq!(text.lines().count(), 20);
}
