//! Manifest definitions and loading.
//!
//! Manifests are operator-authored YAML documents describing an ordered
//! production pipeline: a constants section plus a list of steps, each
//! bound to an agent and an input template. Step position is the only
//! dependency mechanism, so validation rejects references to steps that
//! have not run yet by the time they would be resolved.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::policy::RetryPolicy;
use super::resolver::referenced_steps;

fn default_step_timeout() -> u64 {
    120
}

/// A complete manifest definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest name (used in CLI and progress output)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Manifest-level constants, referenced as `${manifest.<field>}`
    #[serde(default)]
    pub constants: HashMap<String, Value>,

    /// Default per-attempt timeout in seconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Ordered list of steps to execute
    pub steps: Vec<Step>,
}

impl Manifest {
    /// Load a manifest from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a manifest from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse manifest YAML")
    }

    /// Validate the manifest definition.
    ///
    /// Fails fast on authoring errors: empty names, duplicate steps, and
    /// inputs or endpoints that reference a step at the same or a later
    /// position (ordering is the only dependency mechanism, so such a
    /// reference could never resolve).
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Manifest name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Manifest must have at least one step");
        }

        let step_names: Vec<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();

        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                anyhow::bail!("Step {} has an empty name", i);
            }
            if step.agent.is_empty() {
                anyhow::bail!("Step '{}' has an empty agent", step.name);
            }
            if step_names[..i].contains(&step.name.as_str()) {
                anyhow::bail!("Duplicate step name '{}'", step.name);
            }

            for referenced in step.referenced_steps() {
                match step_names.iter().position(|&n| n == referenced) {
                    Some(idx) if idx >= i => {
                        anyhow::bail!(
                            "Step '{}' references step '{}' which has not run yet \
                             (forward references not allowed)",
                            step.name,
                            referenced
                        );
                    }
                    None => {
                        anyhow::bail!(
                            "Step '{}' references non-existent step '{}'",
                            step.name,
                            referenced
                        );
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Get a step by name
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// A single step in a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within the manifest)
    pub name: String,

    /// Logical agent identity, used to resolve an endpoint and a
    /// criticality class
    pub agent: String,

    /// Explicit endpoint override (may contain variable references)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Input template; string leaves may contain `${...}` references
    #[serde(default)]
    pub input: Value,

    /// Declared output path, published as `steps.<name>.output_path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Retry policy for this step
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Override per-attempt timeout (uses the manifest default if not set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl Step {
    /// Effective per-attempt timeout for this step
    pub fn timeout(&self, manifest: &Manifest) -> Duration {
        let seconds = self.timeout_seconds.unwrap_or(manifest.step_timeout_seconds);
        Duration::from_secs(seconds)
    }

    /// Names of steps this step's input and endpoint reference
    pub fn referenced_steps(&self) -> Vec<String> {
        let mut names = referenced_steps(&self.input);
        if let Some(ref endpoint) = self.endpoint {
            for name in referenced_steps(&Value::String(endpoint.clone())) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}
