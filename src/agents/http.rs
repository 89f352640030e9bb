//! HTTP client for remote agent endpoints.
//!
//! One dispatch = one POST of the resolved step payload. The call is
//! treated as failed if the transport errors, the status is non-2xx, or
//! the body carries an explicit failure flag; on success the `data` field
//! (or the whole body when absent) becomes the step output.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{AgentClient, DispatchError};

/// Longest error-body excerpt carried into logs and events
const MAX_BODY_EXCERPT: usize = 300;

/// Agent client speaking the step endpoint protocol over HTTP
pub struct HttpAgentClient {
    http: reqwest::Client,
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAgentClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn dispatch(
        &self,
        endpoint: &str,
        payload: &Value,
        timeout: Duration,
        attempt: u32,
    ) -> Result<Value, DispatchError> {
        // Endpoint and attempt only; payloads may carry credentials
        debug!(endpoint, attempt, "Dispatching step attempt");

        let response = match self
            .http
            .post(endpoint)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(DispatchError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(e) => {
                return Err(DispatchError::Network {
                    endpoint: endpoint.to_string(),
                    message: e.to_string(),
                })
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body: excerpt(&body),
            });
        }

        let body: Value = response.json().await.map_err(|e| DispatchError::Application {
            message: format!("response body is not valid JSON: {}", e),
        })?;

        if let Some(failure) = failure_message(&body) {
            return Err(DispatchError::Application { message: failure });
        }

        Ok(body.get("data").cloned().unwrap_or(body))
    }
}

/// Extract an application-level failure flag from a response body, if any
fn failure_message(body: &Value) -> Option<String> {
    if let Some(error) = body.get("error") {
        if !error.is_null() {
            return Some(match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
    }

    for flag in ["success", "ok"] {
        if body.get(flag).and_then(Value::as_bool) == Some(false) {
            return Some(format!("agent set {} = false", flag));
        }
    }

    None
}

fn excerpt(body: &str) -> String {
    if body.len() <= MAX_BODY_EXCERPT {
        return body.to_string();
    }
    let mut end = MAX_BODY_EXCERPT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_flag_detection() {
        assert!(failure_message(&json!({"data": {"x": 1}})).is_none());
        assert!(failure_message(&json!({"error": null, "data": 1})).is_none());

        assert_eq!(
            failure_message(&json!({"error": "no voices available"})),
            Some("no voices available".to_string())
        );
        assert!(failure_message(&json!({"success": false})).is_some());
        assert!(failure_message(&json!({"ok": false})).is_some());
        assert!(failure_message(&json!({"ok": true})).is_none());
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = "x".repeat(1000);
        let cut = excerpt(&long);
        assert!(cut.len() <= MAX_BODY_EXCERPT + 3);
        assert!(cut.ends_with("..."));

        assert_eq!(excerpt("short"), "short");
    }
}
