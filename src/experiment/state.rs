//! Run state, result records and run reports.

use crate::error::PropertyAddress;
use crate::hardware::property::PropertyValue;
use crate::units::Quantity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Orchestrator execution state.
///
/// # State Machine
///
/// ```text
/// Idle ──> Validating ──> Initializing ──> Scanning ──> Finishing ──> Done
///              │                              │  ▲          ▲
///              │ config error                 └──┘ next     │
///              └──────────────────────────────> Done  block │
///                                          stop request ────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// No run started
    Idle,
    /// Resolving the plan against the device graph
    Validating,
    /// Driver bring-up and defaults
    Initializing,
    /// Executing scan blocks
    Scanning,
    /// Teardown
    Finishing,
    /// Run over (completed or aborted)
    Done,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "Idle"),
            EngineState::Validating => write!(f, "Validating"),
            EngineState::Initializing => write!(f, "Initializing"),
            EngineState::Scanning => write!(f, "Scanning"),
            EngineState::Finishing => write!(f, "Finishing"),
            EngineState::Done => write!(f, "Done"),
        }
    }
}

impl EngineState {
    /// Check if the state allows starting a new run.
    pub fn can_begin(&self) -> bool {
        matches!(self, EngineState::Idle | EngineState::Done)
    }

    /// Whether hardware may already have been touched.
    pub fn has_touched_hardware(&self) -> bool {
        matches!(
            self,
            EngineState::Initializing | EngineState::Scanning | EngineState::Finishing
        )
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// All phases attempted, nothing failed
    CompletedClean,
    /// All phases attempted, something failed along the way
    CompletedWithErrors,
    /// Configuration error before any hardware I/O
    Aborted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::CompletedClean => write!(f, "completed-clean"),
            RunOutcome::CompletedWithErrors => write!(f, "completed-with-errors"),
            RunOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// One detector value, or why there is none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorReading {
    /// Detector property
    pub address: PropertyAddress,
    /// Value in the detector's target unit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<PropertyValue>,
    /// Failure reason when the read failed or timed out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectorReading {
    /// A successful read.
    pub fn ok(address: PropertyAddress, value: PropertyValue) -> Self {
        Self {
            address,
            value: Some(value),
            error: None,
        }
    }

    /// A failed read.
    pub fn failed(address: PropertyAddress, error: impl ToString) -> Self {
        Self {
            address,
            value: None,
            error: Some(error.to_string()),
        }
    }

    /// True when the read produced a value.
    pub fn is_ok(&self) -> bool {
        self.value.is_some()
    }
}

/// Result of one set-point.
///
/// A record is failed when the write or any detector read failed; readings
/// that succeeded are still carried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRecord {
    /// Run this record belongs to
    pub run_id: Uuid,
    /// Scan block name
    pub scan: String,
    /// Pass over the range, from 0
    pub pass: u32,
    /// Set-point index within the pass, from 0
    pub index: usize,
    /// When the detectors were read (or the write failed)
    pub timestamp: DateTime<Utc>,
    /// Target actuator
    pub target: PropertyAddress,
    /// Value requested for the target
    pub set_point: Quantity,
    /// Detector values in declaration order
    pub readings: Vec<DetectorReading>,
    /// Why the record is failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ScanRecord {
    /// True when the write or any read failed.
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Reading for `address`, if that detector is part of the record.
    pub fn reading(&self, address: &PropertyAddress) -> Option<&DetectorReading> {
        self.readings.iter().find(|r| &r.address == address)
    }
}

/// Summary of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Plan name
    pub plan: String,
    /// Terminal outcome
    pub outcome: RunOutcome,
    /// Why the run aborted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Bring-up and default failures
    pub init_failures: Vec<String>,
    /// Scan action and sink failures (failed set-points are counted in `failed_records`)
    pub scan_failures: Vec<String>,
    /// Teardown failures
    pub finish_failures: Vec<String>,
    /// Records handed to the sink
    pub records_emitted: usize,
    /// Of those, records marked failed
    pub failed_records: usize,
    /// A stop request cut the scans short
    pub stopped_early: bool,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub(crate) fn new(run_id: Uuid, plan: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            plan,
            outcome: RunOutcome::CompletedClean,
            abort_reason: None,
            init_failures: Vec::new(),
            scan_failures: Vec::new(),
            finish_failures: Vec::new(),
            records_emitted: 0,
            failed_records: 0,
            stopped_early: false,
            started_at: now,
            finished_at: now,
        }
    }

    /// Total failures of any kind.
    pub fn failure_count(&self) -> usize {
        self.init_failures.len()
            + self.scan_failures.len()
            + self.finish_failures.len()
            + self.failed_records
    }

    pub(crate) fn conclude(&mut self) {
        self.finished_at = Utc::now();
        if self.outcome != RunOutcome::Aborted {
            self.outcome = if self.failure_count() == 0 {
                RunOutcome::CompletedClean
            } else {
                RunOutcome::CompletedWithErrors
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(EngineState::Idle.can_begin());
        assert!(EngineState::Done.can_begin());
        assert!(!EngineState::Scanning.can_begin());
        assert!(EngineState::Scanning.has_touched_hardware());
        assert!(!EngineState::Validating.has_touched_hardware());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(RunOutcome::CompletedClean.to_string(), "completed-clean");
        assert_eq!(RunOutcome::CompletedWithErrors.to_string(), "completed-with-errors");
        assert_eq!(RunOutcome::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_report_conclusion() {
        let mut report = RunReport::new(Uuid::new_v4(), "plan".into());
        report.conclude();
        assert_eq!(report.outcome, RunOutcome::CompletedClean);

        report.failed_records = 1;
        report.conclude();
        assert_eq!(report.outcome, RunOutcome::CompletedWithErrors);

        report.outcome = RunOutcome::Aborted;
        report.conclude();
        assert_eq!(report.outcome, RunOutcome::Aborted);
    }

    #[test]
    fn test_record_serialization() {
        let address = PropertyAddress::new("daq", "pd1");
        let record = ScanRecord {
            run_id: Uuid::nil(),
            scan: "laser".into(),
            pass: 0,
            index: 3,
            timestamp: Utc::now(),
            target: PropertyAddress::new("laser", "wavelength"),
            set_point: "1494 nm".parse().unwrap(),
            readings: vec![
                DetectorReading::ok(address.clone(), PropertyValue::Quantity("0.5 V".parse().unwrap())),
                DetectorReading::failed(PropertyAddress::new("daq", "pd2"), "timeout"),
            ],
            failure: Some("1 detector failed".into()),
        };
        assert!(record.is_failed());
        assert!(record.reading(&address).unwrap().is_ok());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["target"], "laser.wavelength");
        assert_eq!(json["set_point"]["unit"], "nm");
        assert_eq!(json["readings"][1]["error"], "timeout");
        assert!(json["readings"][0].get("error").is_none());
    }
}
