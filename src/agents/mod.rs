//! Agent interfaces for remote step execution.
//!
//! Every step delegates to an opaque agent endpoint. The client trait
//! reports a single attempt's outcome; retry decisions live in the policy
//! layer, never here.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

// Re-export the HTTP client
pub use http::HttpAgentClient;

/// Classified failure of one dispatch attempt
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Transport never produced a response
    #[error("network error calling {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    /// The agent answered with a non-success HTTP status
    #[error("agent returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body carried an explicit failure flag
    #[error("agent reported failure: {message}")]
    Application { message: String },

    /// The attempt outlived its timeout
    #[error("attempt timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Trait for dispatching one step attempt to an agent endpoint
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Human-readable client name
    fn name(&self) -> &str;

    /// Perform one outbound call and classify the outcome. The attempt
    /// number is for log correlation only; implementations never retry.
    async fn dispatch(
        &self,
        endpoint: &str,
        payload: &Value,
        timeout: Duration,
        attempt: u32,
    ) -> Result<Value, DispatchError>;
}

/// Built-in endpoint defaults for the known agents. Operators override
/// these per deployment via `REELFORGE_AGENT_<NAME>` or the config file.
pub fn default_endpoint(agent: &str) -> Option<&'static str> {
    match agent {
        "curator" => Some("http://localhost:7801/run"),
        "scriptwriter" => Some("http://localhost:7802/run"),
        "narrator" => Some("http://localhost:7803/run"),
        "composer" => Some("http://localhost:7804/run"),
        "assembler" => Some("http://localhost:7805/run"),
        "attribution" => Some("http://localhost:7806/run"),
        "publisher" => Some("http://localhost:7807/run"),
        _ => None,
    }
}
