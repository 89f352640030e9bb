//! Progress events for run observation.
//!
//! Every state transition of a run is recorded as an immutable event in an
//! append-only log. The current state of a run is always a fold over its
//! event sequence, never a separately maintained mutable record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single progress event in the append-only run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Caller-supplied project identifier
    pub project_id: String,

    /// The run this event belongs to
    pub correlation_id: Uuid,

    /// Step name (None for run-level events)
    pub step_name: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Status carried by this transition
    pub status: StepStatus,

    /// Human-readable detail (NO secrets)
    pub detail: String,

    /// Time taken in milliseconds (for terminal step events)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl ProgressEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        project_id: impl Into<String>,
        correlation_id: Uuid,
        step_name: Option<String>,
        event_type: EventType,
        status: StepStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            project_id: project_id.into(),
            correlation_id,
            step_name,
            event_type,
            status,
            detail: detail.into(),
            duration_ms: None,
            error: None,
        }
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Whether this event is a terminal transition for its step
    pub fn is_step_terminal(&self) -> bool {
        matches!(
            self.event_type,
            EventType::StepCompleted | EventType::StepFallback | EventType::StepFailed
        )
    }

    /// Whether this event is run-level (no step attached)
    pub fn is_run_level(&self) -> bool {
        self.step_name.is_none()
    }
}

/// Types of events emitted during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// A run completed (possibly with fallback steps)
    RunCompleted,

    /// A run failed
    RunFailed,

    /// A step has started execution
    StepStarted,

    /// A step attempt failed and is being retried
    StepRetrying,

    /// A step completed successfully
    StepCompleted,

    /// A non-critical step exhausted retries and was substituted
    StepFallback,

    /// A step failed permanently
    StepFailed,
}

/// Status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,

    /// Currently executing (or between retry attempts)
    Running,

    /// Completed successfully
    Completed,

    /// Failed permanently
    Failed,

    /// Substituted with a synthetic fallback result
    Fallback,
}

impl StepStatus {
    /// Terminal statuses are never revisited
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Fallback)
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Overall status of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    /// Manifest loaded, context constructed
    Started,

    /// Steps executing
    Running,

    /// Every step reached completed or fallback
    Completed,

    /// A critical step exhausted retries, or the run was cancelled
    Failed { error: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ProgressEvent::new(
            "proj-1",
            Uuid::new_v4(),
            Some("narrate".to_string()),
            EventType::StepStarted,
            StepStatus::Running,
            "Step 'narrate' attempt 1",
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: ProgressEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.status, StepStatus::Running);
        assert_eq!(parsed.project_id, "proj-1");
    }

    #[test]
    fn test_event_with_duration_and_error() {
        let event = ProgressEvent::new(
            "proj-1",
            Uuid::new_v4(),
            Some("assemble".to_string()),
            EventType::StepFailed,
            StepStatus::Failed,
            "Step 'assemble' failed",
        )
        .with_duration(420)
        .with_error("connection refused");

        assert_eq!(event.duration_ms, Some(420));
        assert_eq!(event.error.as_deref(), Some("connection refused"));
        assert!(event.is_step_terminal());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Fallback.is_terminal());
    }
}
