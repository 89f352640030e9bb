//! Run orchestrator: the state machine that drives a manifest.
//!
//! One run is one logical thread of control. Steps execute strictly in
//! manifest order because a step's resolved input may reference any prior
//! step's output; there is no cross-step parallelism by design. The
//! orchestrator is the sole writer of run state, and every transition is
//! recorded through the progress log before execution continues.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::agents::{AgentClient, HttpAgentClient};
use crate::domain::{EventType, ProgressEvent, Run, RunStatus, StepResult, StepStatus};

use super::manifest::{Manifest, Step};
use super::policy::{self, StepError};
use super::progress::ProgressLog;
use super::resolver::ResolveContext;

/// Caller-supplied identity and metadata for a run
#[derive(Debug, Clone, Default)]
pub struct ProjectSpec {
    /// Project identifier; the run's correlation id stands in when absent
    pub id: Option<String>,

    /// Free-form metadata, referenced as `${project.<field>}`
    pub metadata: HashMap<String, String>,
}

impl ProjectSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Manifest execution engine
pub struct Orchestrator {
    /// Client used to dispatch step attempts
    client: Arc<dyn AgentClient>,

    /// Override for the runs directory (tests use a temp dir)
    runs_root: Option<PathBuf>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Create an orchestrator dispatching over HTTP
    pub fn new() -> Self {
        Self {
            client: Arc::new(HttpAgentClient::new()),
            runs_root: None,
        }
    }

    /// Create an orchestrator with a custom agent client
    pub fn with_client(client: Arc<dyn AgentClient>) -> Self {
        Self {
            client,
            runs_root: None,
        }
    }

    /// Store run state under an explicit directory instead of the
    /// configured default
    pub fn runs_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runs_root = Some(dir.into());
        self
    }

    /// Execute a manifest to its terminal state.
    ///
    /// Returns the terminal run record; a failed run is a normal return,
    /// not an `Err` (errors here mean the engine itself could not operate,
    /// e.g. an invalid manifest or an unwritable progress log).
    #[instrument(skip(self, manifest, project, cancel), fields(manifest = %manifest.name))]
    pub async fn run_manifest(
        &self,
        manifest: &Manifest,
        project: ProjectSpec,
        cancel: CancellationToken,
    ) -> Result<Run> {
        manifest.validate()?;

        let correlation_id = Uuid::new_v4();
        let project_id = project
            .id
            .clone()
            .unwrap_or_else(|| correlation_id.to_string());

        info!(%correlation_id, %project_id, "Starting manifest run");

        let log = self.open_log(correlation_id).await?;

        let mut run = Run::new(correlation_id, project_id.clone(), manifest.name.clone());
        for step in &manifest.steps {
            run.steps.insert(step.name.clone(), StepResult::default());
        }

        let mut ctx = ResolveContext::new(
            project_id.clone(),
            project.metadata,
            manifest.constants.clone(),
            correlation_id,
            run.started_at,
        );

        log.append(&ProgressEvent::new(
            &project_id,
            correlation_id,
            None,
            EventType::RunStarted,
            StepStatus::Running,
            format!("Manifest '{}' started", manifest.name),
        ))
        .await?;
        run.status = RunStatus::Running;

        for step in &manifest.steps {
            log.append(&ProgressEvent::new(
                &project_id,
                correlation_id,
                Some(step.name.clone()),
                EventType::StepStarted,
                StepStatus::Running,
                format!("Step '{}' started (agent '{}')", step.name, step.agent),
            ))
            .await?;
            if let Some(result) = run.steps.get_mut(&step.name) {
                result.status = StepStatus::Running;
            }

            match policy::run_step(self.client.as_ref(), step, manifest, &ctx, &log, &cancel)
                .await
            {
                Ok(outcome) => {
                    let (event_type, status, detail) = if outcome.fallback {
                        (
                            EventType::StepFallback,
                            StepStatus::Fallback,
                            format!(
                                "Step '{}' substituted with fallback after {} attempts",
                                step.name, outcome.attempts
                            ),
                        )
                    } else {
                        (
                            EventType::StepCompleted,
                            StepStatus::Completed,
                            format!("Step '{}' completed in {}ms", step.name, outcome.duration_ms),
                        )
                    };

                    log.append(
                        &ProgressEvent::new(
                            &project_id,
                            correlation_id,
                            Some(step.name.clone()),
                            event_type,
                            status,
                            detail,
                        )
                        .with_duration(outcome.duration_ms),
                    )
                    .await?;

                    ctx.publish(&step.name, outcome.output.clone(), step.output.clone());
                    run.steps.insert(
                        step.name.clone(),
                        StepResult {
                            status,
                            output: Some(outcome.output),
                            error: None,
                            duration_ms: Some(outcome.duration_ms),
                        },
                    );
                }
                Err(e) => {
                    return self.fail_run(&log, &mut run, step, e).await;
                }
            }
        }

        self.complete_run(&log, &mut run).await
    }

    /// Record a fatal step failure and move the run to its terminal state.
    /// The terminal event always names the failing step and error.
    async fn fail_run(
        &self,
        log: &ProgressLog,
        run: &mut Run,
        step: &Step,
        step_error: StepError,
    ) -> Result<Run> {
        let cancelled = matches!(step_error, StepError::Cancelled { .. });
        let error_msg = step_error.to_string();
        error!(step = %step.name, %error_msg, "Run failed");

        log.append(
            &ProgressEvent::new(
                &run.project_id,
                run.correlation_id,
                Some(step.name.clone()),
                EventType::StepFailed,
                StepStatus::Failed,
                format!("Step '{}' failed: {}", step.name, error_msg),
            )
            .with_error(error_msg.clone()),
        )
        .await?;
        run.steps.insert(
            step.name.clone(),
            StepResult {
                status: StepStatus::Failed,
                output: None,
                error: Some(error_msg.clone()),
                duration_ms: None,
            },
        );

        let detail = if cancelled {
            format!("Run cancelled at step '{}'", step.name)
        } else {
            format!("Run failed at step '{}': {}", step.name, error_msg)
        };
        log.append(
            &ProgressEvent::new(
                &run.project_id,
                run.correlation_id,
                None,
                EventType::RunFailed,
                StepStatus::Failed,
                detail,
            )
            .with_error(error_msg.clone()),
        )
        .await?;

        run.status = RunStatus::Failed { error: error_msg };
        run.completed_at = Some(chrono::Utc::now());

        Ok(run.clone())
    }

    /// Record run completion
    async fn complete_run(&self, log: &ProgressLog, run: &mut Run) -> Result<Run> {
        info!(correlation_id = %run.correlation_id, "Run completed");

        log.append(&ProgressEvent::new(
            &run.project_id,
            run.correlation_id,
            None,
            EventType::RunCompleted,
            StepStatus::Completed,
            format!("Manifest '{}' completed", run.manifest_name),
        ))
        .await?;

        run.status = RunStatus::Completed;
        run.completed_at = Some(chrono::Utc::now());

        Ok(run.clone())
    }

    /// Latest folded state of a run
    pub async fn get_run_status(&self, correlation_id: Uuid) -> Result<Run> {
        let log = self.open_log(correlation_id).await?;
        log.read_snapshot()
            .await?
            .with_context(|| format!("Run {} not found", correlation_id))
    }

    /// List recent runs, most recent first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let run_ids = match &self.runs_root {
            Some(root) => ProgressLog::list_runs_in(root).await?,
            None => ProgressLog::list_runs().await?,
        };

        let mut runs = Vec::new();
        for run_id in run_ids {
            if let Ok(Some(run)) = self.open_log(run_id).await?.read_snapshot().await {
                runs.push(run);
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }

    /// Open the progress log for a run under the configured or overridden
    /// runs directory
    pub async fn open_log(&self, correlation_id: Uuid) -> Result<ProgressLog> {
        match &self.runs_root {
            Some(root) => ProgressLog::open_in(root, correlation_id).await,
            None => ProgressLog::open(correlation_id).await,
        }
    }
}
