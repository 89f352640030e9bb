//! Append-only progress log with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) per run, keyed by
//! correlation id. Every append also persists the run's folded snapshot,
//! so pull consumers can read "latest state" without replaying history.
//! The event write lands (and is flushed) before anything else happens
//! for a transition; a consumer can reconstruct full history even if the
//! recording process dies right after the write.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::{ProgressEvent, Run};

/// Retention cap per run. Oldest events are trimmed past this point, but
/// run-level events and the most recent terminal event of each step are
/// always kept.
pub const DEFAULT_MAX_EVENTS: usize = 1000;

const BROADCAST_CAPACITY: usize = 256;

/// Durable, run-scoped progress log
pub struct ProgressLog {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Path to the folded snapshot
    snapshot_path: PathBuf,

    /// Retention cap
    max_events: usize,

    /// Live subscribers; events are sent in emission order
    events_tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressLog {
    /// Create or open the progress log for a run under the configured
    /// runs directory
    pub async fn open(correlation_id: Uuid) -> Result<Self> {
        let base_dir = crate::config::runs_dir()?;
        Self::open_in(&base_dir, correlation_id).await
    }

    /// Create or open a progress log under an explicit base directory
    pub async fn open_in(base_dir: &Path, correlation_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(correlation_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        Ok(Self {
            events_path: run_dir.join("events.jsonl"),
            snapshot_path: run_dir.join("snapshot.json"),
            run_dir,
            max_events: DEFAULT_MAX_EVENTS,
            events_tx,
        })
    }

    /// Override the retention cap
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append one event, persist the folded snapshot, and notify live
    /// subscribers
    pub async fn append(&self, event: &ProgressEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!("Failed to open events file: {}", self.events_path.display())
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;
        drop(file);

        let mut events = self.read_all().await?;
        if events.len() > self.max_events {
            events = trim_events(events, self.max_events);
            self.rewrite(&events).await?;
        }

        if let Some(run) = Run::from_events(&events) {
            let snapshot = serde_json::to_string_pretty(&run)
                .context("Failed to serialize snapshot")?;
            fs::write(&self.snapshot_path, snapshot)
                .await
                .with_context(|| {
                    format!("Failed to write snapshot: {}", self.snapshot_path.display())
                })?;
        }

        // No receivers is fine
        let _ = self.events_tx.send(event.clone());

        Ok(())
    }

    /// Read the full event history in emission order
    pub async fn read_all(&self) -> Result<Vec<ProgressEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: ProgressEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Read the folded per-step snapshot, falling back to a fold over the
    /// event history when no snapshot file exists yet
    pub async fn read_snapshot(&self) -> Result<Option<Run>> {
        if self.snapshot_path.exists() {
            let content = fs::read_to_string(&self.snapshot_path)
                .await
                .with_context(|| {
                    format!("Failed to read snapshot: {}", self.snapshot_path.display())
                })?;
            let run = serde_json::from_str(&content).context("Failed to parse snapshot")?;
            return Ok(Some(run));
        }

        let events = self.read_all().await?;
        Ok(Run::from_events(&events))
    }

    /// Subscribe to live events in emission order
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events_tx.subscribe()
    }

    /// Rewrite the event file after trimming
    async fn rewrite(&self, events: &[ProgressEvent]) -> Result<()> {
        let tmp_path = self.run_dir.join("events.jsonl.tmp");

        let mut buffer = String::new();
        for event in events {
            buffer.push_str(&serde_json::to_string(event)?);
            buffer.push('\n');
        }

        fs::write(&tmp_path, buffer)
            .await
            .context("Failed to write trimmed events")?;
        fs::rename(&tmp_path, &self.events_path)
            .await
            .context("Failed to replace events file")?;

        Ok(())
    }

    /// List all run ids under a base directory
    pub async fn list_runs_in(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }

    /// List all run ids under the configured runs directory
    pub async fn list_runs() -> Result<Vec<Uuid>> {
        let base_dir = crate::config::runs_dir()?;
        Self::list_runs_in(&base_dir).await
    }
}

/// Drop the oldest events down to the cap, keeping every run-level event
/// and the most recent terminal event of each step.
fn trim_events(events: Vec<ProgressEvent>, max_events: usize) -> Vec<ProgressEvent> {
    if events.len() <= max_events {
        return events;
    }

    // The last terminal event per step, by position
    let mut protected = vec![false; events.len()];
    let mut seen_terminal: Vec<String> = Vec::new();
    for (idx, event) in events.iter().enumerate().rev() {
        if event.is_run_level() {
            protected[idx] = true;
            continue;
        }
        if event.is_step_terminal() {
            let name = event.step_name.clone().unwrap_or_default();
            if !seen_terminal.contains(&name) {
                seen_terminal.push(name);
                protected[idx] = true;
            }
        }
    }

    let mut to_drop = events.len() - max_events;
    let mut kept = Vec::with_capacity(max_events);
    for (idx, event) in events.into_iter().enumerate() {
        if to_drop > 0 && !protected[idx] {
            to_drop -= 1;
            continue;
        }
        kept.push(event);
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, StepStatus};
    use tempfile::TempDir;

    fn step_event(run_id: Uuid, step: &str, event_type: EventType, status: StepStatus) -> ProgressEvent {
        ProgressEvent::new(
            "proj-1",
            run_id,
            Some(step.to_string()),
            event_type,
            status,
            format!("{} {:?}", step, event_type),
        )
    }

    #[tokio::test]
    async fn test_append_and_read_all() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let log = ProgressLog::open_in(temp.path(), run_id).await.unwrap();

        let start = ProgressEvent::new(
            "proj-1",
            run_id,
            None,
            EventType::RunStarted,
            StepStatus::Running,
            "Run started",
        );
        log.append(&start).await.unwrap();
        log.append(&step_event(run_id, "curate", EventType::StepStarted, StepStatus::Running))
            .await
            .unwrap();

        let events = log.read_all().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].event_type, EventType::StepStarted);
    }

    #[tokio::test]
    async fn test_snapshot_written_per_append() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let log = ProgressLog::open_in(temp.path(), run_id).await.unwrap();

        log.append(&step_event(
            run_id,
            "curate",
            EventType::StepCompleted,
            StepStatus::Completed,
        ))
        .await
        .unwrap();

        let run = log.read_snapshot().await.unwrap().unwrap();
        assert_eq!(run.step_status("curate"), StepStatus::Completed);
    }

    #[test]
    fn test_trim_protects_terminal_events() {
        let run_id = Uuid::new_v4();
        let mut events = vec![step_event(
            run_id,
            "curate",
            EventType::StepCompleted,
            StepStatus::Completed,
        )];
        // Flood with retry noise for a later step
        for _ in 0..20 {
            events.push(step_event(
                run_id,
                "narrate",
                EventType::StepRetrying,
                StepStatus::Running,
            ));
        }
        events.push(step_event(
            run_id,
            "narrate",
            EventType::StepFailed,
            StepStatus::Failed,
        ));

        let kept = trim_events(events, 5);

        assert!(kept.len() <= 6, "kept {}", kept.len());
        assert!(kept
            .iter()
            .any(|e| e.event_type == EventType::StepCompleted
                && e.step_name.as_deref() == Some("curate")));
        assert!(kept
            .iter()
            .any(|e| e.event_type == EventType::StepFailed
                && e.step_name.as_deref() == Some("narrate")));
    }
}
