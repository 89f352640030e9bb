//! Run state and reconstruction from the progress log.
//!
//! A Run is one execution of a manifest. The orchestrator is the sole
//! writer of run state while the run is live; observers reconstruct the
//! same state by folding the run's progress events in order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::events::{EventType, ProgressEvent, RunStatus, StepStatus};

/// One execution of a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique correlation identifier for this run
    pub correlation_id: Uuid,

    /// Caller-supplied project identifier
    pub project_id: String,

    /// Name of the manifest being executed
    pub manifest_name: String,

    /// Current status of the run
    pub status: RunStatus,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,

    /// Result of each step (step name -> result)
    pub steps: HashMap<String, StepResult>,
}

/// Result of a single step within a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResult {
    /// Current status; transitions monotonically and is never revisited
    /// once terminal
    pub status: StepStatus,

    /// Step output payload (present on completed and fallback results;
    /// not carried by the event log, so absent on folded reconstructions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Error message on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Wall-clock duration of the step across all attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Run {
    /// Create a new run in the started state
    pub fn new(
        correlation_id: Uuid,
        project_id: impl Into<String>,
        manifest_name: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            project_id: project_id.into(),
            manifest_name: manifest_name.into(),
            status: RunStatus::Started,
            started_at: Utc::now(),
            completed_at: None,
            steps: HashMap::new(),
        }
    }

    /// Reconstruct run state by folding a sequence of events.
    ///
    /// Step outputs are not carried by the event log, so the folded
    /// StepResults describe status, error, and duration only.
    pub fn from_events(events: &[ProgressEvent]) -> Option<Self> {
        let first = events.first()?;

        let mut run = Self {
            correlation_id: first.correlation_id,
            project_id: first.project_id.clone(),
            manifest_name: String::new(),
            status: RunStatus::Started,
            started_at: first.timestamp,
            completed_at: None,
            steps: HashMap::new(),
        };

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &ProgressEvent) {
        match event.event_type {
            EventType::RunStarted => {
                self.status = RunStatus::Running;
                self.started_at = event.timestamp;
            }
            EventType::RunCompleted => {
                self.status = RunStatus::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.status = RunStatus::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::StepStarted | EventType::StepRetrying => {
                self.transition_step(event, StepStatus::Running);
            }
            EventType::StepCompleted => {
                self.transition_step(event, StepStatus::Completed);
            }
            EventType::StepFallback => {
                self.transition_step(event, StepStatus::Fallback);
            }
            EventType::StepFailed => {
                self.transition_step(event, StepStatus::Failed);
            }
        }
    }

    /// Move a step to a new status, preserving the monotonic invariant:
    /// a terminal step result is never revisited.
    fn transition_step(&mut self, event: &ProgressEvent, status: StepStatus) {
        let Some(ref name) = event.step_name else {
            return;
        };

        let result = self.steps.entry(name.clone()).or_default();
        if result.status.is_terminal() {
            return;
        }

        result.status = status;
        if event.duration_ms.is_some() {
            result.duration_ms = event.duration_ms;
        }
        if status == StepStatus::Failed {
            result.error = event.error.clone();
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Status of a named step (Pending if never started)
    pub fn step_status(&self, step_name: &str) -> StepStatus {
        self.steps
            .get(step_name)
            .map(|r| r.status)
            .unwrap_or(StepStatus::Pending)
    }

    /// Terminal record handed back to callers
    pub fn report(&self) -> RunReport {
        RunReport {
            ok: self.status == RunStatus::Completed,
            project_id: self.project_id.clone(),
            correlation_id: self.correlation_id,
            steps: self.steps.clone(),
        }
    }
}

/// Terminal run result returned to the caller that started the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// True when every step reached completed or fallback
    pub ok: bool,
    pub project_id: String,
    pub correlation_id: Uuid,
    pub steps: HashMap<String, StepResult>,
}
