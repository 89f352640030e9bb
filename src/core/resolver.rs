//! Variable resolution for step inputs and endpoints.
//!
//! Step inputs may contain `${scope.path}` references that are resolved
//! against the run context just before dispatch. Resolution is pure: the
//! same context always produces the same output, and it runs fresh before
//! every retry attempt so retries observe the latest published outputs.
//!
//! Unresolved references are left in place literally. Manifests rely on
//! this to embed defaults alongside optional values, so a missing
//! reference is leniency, not an error.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

/// `${scope.path}` token, where path segments are dot-separated
fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_][A-Za-z0-9_.\-]*)\}").unwrap())
}

/// Lookup function for one resolution scope
type ScopeFn = fn(&ResolveContext, &str) -> Option<Value>;

/// Resolution scopes in the order they are consulted. Adding a scope is a
/// one-line extension here.
const SCOPES: &[(&str, ScopeFn)] = &[
    ("env", scope_env),
    ("project", scope_project),
    ("steps", scope_steps),
    ("manifest", scope_manifest),
    ("run", scope_run),
];

/// Context a run resolves variables against.
///
/// The orchestrator owns one context per run and publishes each step's
/// output into it as the step completes.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    project_id: String,
    project_meta: HashMap<String, String>,
    constants: HashMap<String, Value>,
    outputs: HashMap<String, Value>,
    output_paths: HashMap<String, String>,
    correlation_id: Uuid,
    started_at: DateTime<Utc>,
}

impl ResolveContext {
    pub fn new(
        project_id: impl Into<String>,
        project_meta: HashMap<String, String>,
        constants: HashMap<String, Value>,
        correlation_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            project_meta,
            constants,
            outputs: HashMap::new(),
            output_paths: HashMap::new(),
            correlation_id,
            started_at,
        }
    }

    /// Record a completed step's output (and declared output path) so
    /// later steps can reference it
    pub fn publish(&mut self, step_name: &str, output: Value, output_path: Option<String>) {
        self.outputs.insert(step_name.to_string(), output);
        if let Some(path) = output_path {
            self.output_paths.insert(step_name.to_string(), path);
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Resolve every `${...}` reference in a value, returning a
    /// structurally identical value. Lists resolve element-wise, mappings
    /// key-wise; non-string scalars pass through unchanged.
    pub fn resolve(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolve a single string leaf.
    ///
    /// A leaf that is exactly one token takes the referenced value with
    /// its original type, so `${steps.curate.output}` injects the whole
    /// object. Tokens embedded in longer strings interpolate as text.
    pub fn resolve_str(&self, s: &str) -> Value {
        let re = token_regex();

        if let Some(m) = re.find(s) {
            if m.start() == 0 && m.end() == s.len() {
                let path = &s[2..s.len() - 1];
                return match self.lookup(path) {
                    Some(value) => value,
                    None => Value::String(s.to_string()),
                };
            }
        }

        let replaced = re.replace_all(s, |caps: &regex::Captures| {
            match self.lookup(&caps[1]) {
                Some(Value::String(text)) => text,
                Some(other) => other.to_string(),
                // Leniency: leave the token for the reader
                None => caps[0].to_string(),
            }
        });

        Value::String(replaced.into_owned())
    }

    /// Look up a dotted reference path across the scope table
    fn lookup(&self, path: &str) -> Option<Value> {
        let (scope, rest) = path.split_once('.')?;
        let (_, lookup) = SCOPES.iter().find(|(name, _)| *name == scope)?;
        lookup(self, rest)
    }
}

fn scope_env(_ctx: &ResolveContext, name: &str) -> Option<Value> {
    std::env::var(name).ok().map(Value::String)
}

fn scope_project(ctx: &ResolveContext, field: &str) -> Option<Value> {
    if let Some(value) = ctx.project_meta.get(field) {
        return Some(Value::String(value.clone()));
    }
    // The run's own identifier stands in when the caller supplied no id
    if field == "id" {
        return Some(Value::String(ctx.project_id.clone()));
    }
    None
}

fn scope_steps(ctx: &ResolveContext, path: &str) -> Option<Value> {
    let (step_name, field) = path.split_once('.')?;

    match field {
        "output" => ctx.outputs.get(step_name).cloned(),
        "output_path" | "outputPath" => ctx
            .output_paths
            .get(step_name)
            .map(|p| Value::String(p.clone())),
        _ => {
            let subpath = field.strip_prefix("output.")?;
            descend(ctx.outputs.get(step_name)?, subpath)
        }
    }
}

fn scope_manifest(ctx: &ResolveContext, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => ctx.constants.get(path).cloned(),
        Some((field, subpath)) => descend(ctx.constants.get(field)?, subpath),
    }
}

fn scope_run(ctx: &ResolveContext, field: &str) -> Option<Value> {
    match field {
        "start_time" => Some(Value::String(ctx.started_at.to_rfc3339())),
        "correlation_id" => Some(Value::String(ctx.correlation_id.to_string())),
        _ => None,
    }
}

/// Walk a dotted subpath into a value; array segments index numerically
fn descend(value: &Value, subpath: &str) -> Option<Value> {
    let mut current = value;
    for segment in subpath.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Names of steps referenced via `${steps.<name>...}` anywhere in a value.
/// Used by manifest validation to reject forward references at load time.
pub fn referenced_steps(value: &Value) -> Vec<String> {
    let mut names = Vec::new();
    collect_referenced_steps(value, &mut names);
    names
}

fn collect_referenced_steps(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for caps in token_regex().captures_iter(s) {
                if let Some(rest) = caps[1].strip_prefix("steps.") {
                    let step = rest.split('.').next().unwrap_or(rest);
                    if !names.iter().any(|n| n == step) {
                        names.push(step.to_string());
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_referenced_steps(item, names);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_referenced_steps(item, names);
            }
        }
        _ => {}
    }
}
