//! Configuration for reelforge paths and agent endpoints.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (REELFORGE_HOME, REELFORGE_AGENT_<NAME>)
//! 2. Config file (.reelforge/config.yaml)
//! 3. Defaults (~/.reelforge, built-in localhost agent endpoints)
//!
//! Config file discovery searches the current directory and parents for
//! .reelforge/config.yaml.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agents::default_endpoint;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Engine state directory
    #[serde(default)]
    pub home: Option<String>,

    /// Agent name -> endpoint URL
    #[serde(default)]
    pub agents: HashMap<String, String>,
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to reelforge home (engine state)
    pub home: PathBuf,

    /// Agent endpoint overrides from the config file
    pub agents: HashMap<String, String>,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".reelforge").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".reelforge");

    let config_file = find_config_file();

    let (home, agents) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        let home = if let Ok(env_home) = std::env::var("REELFORGE_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.home {
            let base = config_path.parent().unwrap_or(Path::new("."));
            let path = PathBuf::from(home_path);
            if path.is_absolute() {
                path
            } else {
                base.join(path)
            }
        } else {
            default_home
        };

        (home, config.agents)
    } else {
        let home = std::env::var("REELFORGE_HOME")
            .map(PathBuf::from)
            .unwrap_or(default_home);

        (home, HashMap::new())
    };

    Ok(ResolvedConfig {
        home,
        agents,
        config_file,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the reelforge home directory (engine state)
pub fn reelforge_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($REELFORGE_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}

/// Resolve the endpoint for an agent: `REELFORGE_AGENT_<NAME>` env var,
/// then the config file's `agents:` map, then the built-in default.
pub fn agent_endpoint(agent: &str) -> Option<String> {
    let env_key = format!(
        "REELFORGE_AGENT_{}",
        agent.to_uppercase().replace('-', "_")
    );
    if let Ok(endpoint) = std::env::var(&env_key) {
        return Some(endpoint);
    }

    if let Ok(config) = config() {
        if let Some(endpoint) = config.agents.get(agent) {
            return Some(endpoint.clone());
        }
    }

    default_endpoint(agent).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".reelforge");
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
home: ./state
agents:
  narrator: http://voice-farm.internal:9000/run
  composer: http://music.internal:9000/run
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.home, Some("./state".to_string()));
        assert_eq!(
            config.agents.get("narrator").map(String::as_str),
            Some("http://voice-farm.internal:9000/run")
        );
    }

    #[test]
    fn test_empty_config_file() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.yaml");
        std::fs::write(&config_path, "{}").unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert!(config.home.is_none());
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_builtin_agent_fallback() {
        // Unknown to env and config file, known to the built-in table
        let endpoint = agent_endpoint("publisher");
        assert!(endpoint.is_some());

        assert!(agent_endpoint("never-heard-of-it").is_none());
    }
}
