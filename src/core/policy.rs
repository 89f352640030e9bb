//! Retry and criticality policy for step execution.
//!
//! A step gets a bounded number of attempts with linear backoff, and the
//! resolver runs fresh before every attempt so retries observe the latest
//! published outputs. Exhaustion consults the static criticality table:
//! critical agents fail the whole run, non-critical agents are substituted
//! with a synthetic fallback result and the run continues.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agents::{AgentClient, DispatchError};
use crate::domain::{EventType, ProgressEvent, StepStatus};

use super::manifest::{Manifest, Step};
use super::progress::ProgressLog;
use super::resolver::ResolveContext;

/// Retry policy for failed step attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts in milliseconds; the delay grows
    /// linearly (attempt x base)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following this one (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms * u64::from(attempt))
    }

    /// Check whether another attempt is allowed after this one
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Criticality class of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Exhausted retries abort the run
    Critical,

    /// Exhausted retries degrade to a fallback result
    NonCritical,
}

/// Static criticality classification, keyed by agent identity. Review this
/// table whenever a new agent type is added.
const CRITICALITY: &[(&str, Criticality)] = &[
    ("curator", Criticality::Critical),
    ("scriptwriter", Criticality::Critical),
    ("narrator", Criticality::Critical),
    ("composer", Criticality::NonCritical),
    ("assembler", Criticality::Critical),
    ("attribution", Criticality::NonCritical),
    ("publisher", Criticality::Critical),
];

/// Classify an agent. Unknown agents are critical; aborting loudly beats
/// inventing a fallback payload for an agent the table has never seen.
pub fn criticality_of(agent: &str) -> Criticality {
    CRITICALITY
        .iter()
        .find(|(name, _)| *name == agent)
        .map(|(_, c)| *c)
        .unwrap_or(Criticality::Critical)
}

/// Synthetic placeholder output for a non-critical agent that exhausted
/// its retries. Downstream steps can reference it like real output; the
/// `fallback` flag lets them (and operators) tell the difference.
pub fn fallback_output(agent: &str) -> Value {
    match agent {
        "composer" => json!({
            "fallback": true,
            "track": Value::Null,
            "detail": "background music unavailable"
        }),
        "attribution" => json!({
            "fallback": true,
            "credits": []
        }),
        _ => json!({ "fallback": true }),
    }
}

/// Outcome of a step that is allowed to continue the run
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Recorded step output (real or fallback)
    pub output: Value,

    /// True when the output is a fallback substitution
    pub fallback: bool,

    /// Wall-clock duration across all attempts
    pub duration_ms: u64,

    /// Number of attempts made
    pub attempts: u32,
}

/// Failure of a step that the orchestrator must treat as fatal
#[derive(Debug, Error)]
pub enum StepError {
    /// A critical agent exhausted all attempts
    #[error("step '{step}' failed after {attempts} attempts: {source}")]
    Exhausted {
        step: String,
        attempts: u32,
        #[source]
        source: DispatchError,
    },

    /// The run was cancelled while the step was in flight
    #[error("run cancelled during step '{step}'")]
    Cancelled { step: String },

    /// No endpoint could be resolved for the step's agent
    #[error("step '{step}' has no resolvable endpoint for agent '{agent}'")]
    NoEndpoint { step: String, agent: String },

    /// The progress log rejected a write
    #[error("failed to record progress for step '{step}': {message}")]
    Recorder { step: String, message: String },
}

/// Execute one step under retry and criticality policy.
///
/// Dispatches up to `retry.max_attempts` attempts, re-resolving endpoint
/// and input before each one, and logging a retry event between attempts.
/// Cancellation aborts any in-flight dispatch or backoff wait.
pub async fn run_step(
    client: &dyn AgentClient,
    step: &Step,
    manifest: &Manifest,
    ctx: &ResolveContext,
    log: &ProgressLog,
    cancel: &CancellationToken,
) -> Result<StepOutcome, StepError> {
    let timeout = step.timeout(manifest);
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        if cancel.is_cancelled() {
            return Err(StepError::Cancelled {
                step: step.name.clone(),
            });
        }

        // Re-resolve on every attempt; resolution is pure, so this only
        // changes when the context does
        let endpoint = resolve_endpoint(step, ctx)?;
        let payload = build_payload(ctx.resolve(&step.input), ctx.project_id());

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(StepError::Cancelled {
                    step: step.name.clone(),
                });
            }
            result = client.dispatch(&endpoint, &payload, timeout, attempt) => result,
        };

        let error = match result {
            Ok(output) => {
                debug!(step = %step.name, attempt, "Step attempt succeeded");
                return Ok(StepOutcome {
                    output,
                    fallback: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    attempts: attempt,
                });
            }
            Err(e) => e,
        };

        if step.retry.should_retry(attempt) {
            let delay = step.retry.delay_for_attempt(attempt);

            let retry_event = ProgressEvent::new(
                ctx.project_id(),
                ctx.correlation_id(),
                Some(step.name.clone()),
                EventType::StepRetrying,
                StepStatus::Running,
                format!(
                    "Step '{}' attempt {} failed, retrying in {:?}: {}",
                    step.name, attempt, delay, error
                ),
            )
            .with_error(error.to_string());
            log.append(&retry_event).await.map_err(|e| StepError::Recorder {
                step: step.name.clone(),
                message: e.to_string(),
            })?;

            warn!(
                step = %step.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Step attempt failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(StepError::Cancelled {
                        step: step.name.clone(),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        // Attempts exhausted: the criticality table decides
        return match criticality_of(&step.agent) {
            Criticality::NonCritical => {
                warn!(
                    step = %step.name,
                    agent = %step.agent,
                    attempts = attempt,
                    error = %error,
                    "Non-critical step exhausted retries, substituting fallback"
                );
                Ok(StepOutcome {
                    output: fallback_output(&step.agent),
                    fallback: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                    attempts: attempt,
                })
            }
            Criticality::Critical => Err(StepError::Exhausted {
                step: step.name.clone(),
                attempts: attempt,
                source: error,
            }),
        };
    }
}

/// Resolve the endpoint for a step: explicit override first, then the
/// configured registry for its agent. Variable references are resolved in
/// either case.
fn resolve_endpoint(step: &Step, ctx: &ResolveContext) -> Result<String, StepError> {
    let raw = match &step.endpoint {
        Some(endpoint) => endpoint.clone(),
        None => {
            crate::config::agent_endpoint(&step.agent).ok_or_else(|| StepError::NoEndpoint {
                step: step.name.clone(),
                agent: step.agent.clone(),
            })?
        }
    };

    Ok(match ctx.resolve_str(&raw) {
        Value::String(endpoint) => endpoint,
        other => other.to_string(),
    })
}

/// Wrap the resolved input with the injected project id. Mapping inputs
/// gain a `project_id` field; anything else is nested under `input`.
fn build_payload(resolved_input: Value, project_id: &str) -> Value {
    match resolved_input {
        Value::Object(mut map) => {
            map.insert("project_id".to_string(), Value::String(project_id.to_string()));
            Value::Object(map)
        }
        Value::Null => json!({ "project_id": project_id }),
        other => json!({ "input": other, "project_id": project_id }),
    }
}
