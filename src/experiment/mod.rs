//! Experiment orchestration
//!
//! Plans run strictly in phase order, `init → scan* → finish`. Scan blocks
//! run one after another; within a set-point the detectors are read
//! concurrently. See [`RunEngine`] for the failure policy.

pub mod plan;
pub mod run_engine;
pub mod sink;
pub mod state;

pub use plan::{DeviceAction, ExperimentPlan, FinishBlock, ScanBlock, ScanRange, SetPoints};
pub use run_engine::{RunEngine, StopHandle};
pub use sink::{ChannelSink, JsonLinesSink, MemorySink, ResultSink};
pub use state::{DetectorReading, EngineState, RunOutcome, RunReport, ScanRecord};
