//! Orchestrator configuration loaded from `buildsmith.toml`.
//!
//! Every section has serde defaults so a missing or partial config file
//! still yields a runnable configuration. Database and vector-store paths
//! can be overridden through environment variables and default to the
//! `.buildsmith` dot-directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the dot-directory holding state, databases, and artifacts.
pub const DOT_DIR: &str = ".buildsmith";

/// Environment variable overriding the learning-store SQLite path.
pub const ENV_RUNS_DB: &str = "BUILDSMITH_RUNS_DB";
/// Environment variable overriding the graph snapshot SQLite path.
pub const ENV_GRAPH_DB: &str = "BUILDSMITH_GRAPH_DB";
/// Environment variable overriding the vector-store SQLite path.
pub const ENV_VECTOR_DB: &str = "BUILDSMITH_VECTOR_DB";

/// Builder depth: how thoroughly the builder worker iterates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Quick,
    #[default]
    Standard,
    Thorough,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Quick => "quick",
            Depth::Standard => "standard",
            Depth::Thorough => "thorough",
        }
    }
}

impl std::fmt::Display for Depth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchitectConfig {
    /// Command invoked when falling back from MCP to a subprocess.
    pub command: String,
    pub max_retries: u32,
    pub timeout_s: u64,
    /// MCP server command; empty disables the MCP path entirely.
    pub mcp_command: String,
}

impl Default for ArchitectConfig {
    fn default() -> Self {
        Self {
            command: "architect".to_string(),
            max_retries: 2,
            timeout_s: 600,
            mcp_command: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuilderConfig {
    /// Command line prefix for the builder worker subprocess.
    pub command: Vec<String>,
    pub max_concurrent: usize,
    pub timeout_s: u64,
    pub depth: Depth,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            command: vec!["builder-worker".to_string()],
            max_concurrent: 3,
            timeout_s: 1800,
            depth: Depth::Standard,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntegrationConfig {
    pub compose_timeout_s: u64,
    pub health_poll_interval_s: u64,
    pub traefik_image: String,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            compose_timeout_s: 300,
            health_poll_interval_s: 2,
            traefik_image: "traefik:v3.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityGateConfig {
    /// External scanner command invoked per gate run.
    pub command: String,
    pub max_fix_retries: u32,
    pub timeout_s: u64,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            command: "quality-gate".to_string(),
            max_fix_retries: 2,
            timeout_s: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub max_patterns_per_injection: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_patterns_per_injection: 5,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Root for all generated artifacts and per-service output dirs.
    pub output_dir: PathBuf,
    /// Overall cost ceiling in dollars; `None` disables the budget gate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_limit: Option<f64>,
    pub architect: ArchitectConfig,
    pub builder: BuilderConfig,
    pub integration: IntegrationConfig,
    pub quality_gate: QualityGateConfig,
    pub persistence: PersistenceConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("build-output"),
            budget_limit: None,
            architect: ArchitectConfig::default(),
            builder: BuilderConfig::default(),
            integration: IntegrationConfig::default(),
            quality_gate: QualityGateConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file, or defaults when `path` is None.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file: {}", p.display()))?;
                let config: OrchestratorConfig = toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file: {}", p.display()))?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Dot-directory under the project root.
    pub fn dot_dir(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(DOT_DIR)
    }

    /// State directory holding `PIPELINE_STATE.json`.
    pub fn state_dir(&self, project_dir: &Path) -> PathBuf {
        self.dot_dir(project_dir).join("state")
    }

    /// Learning-store SQLite path (env override, then dot-dir default).
    pub fn runs_db_path(&self, project_dir: &Path) -> PathBuf {
        env_path(ENV_RUNS_DB).unwrap_or_else(|| self.dot_dir(project_dir).join("runs.db"))
    }

    /// Graph snapshot SQLite path (env override, then dot-dir default).
    pub fn graph_db_path(&self, project_dir: &Path) -> PathBuf {
        env_path(ENV_GRAPH_DB).unwrap_or_else(|| self.dot_dir(project_dir).join("graph.db"))
    }

    /// Vector-store SQLite path (env override, then dot-dir default).
    pub fn vector_db_path(&self, project_dir: &Path) -> PathBuf {
        env_path(ENV_VECTOR_DB).unwrap_or_else(|| self.dot_dir(project_dir).join("vectors.db"))
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.builder.max_concurrent, 3);
        assert_eq!(config.builder.depth, Depth::Standard);
        assert_eq!(config.quality_gate.max_fix_retries, 2);
        assert!(config.budget_limit.is_none());
        assert!(config.persistence.enabled);
    }

    #[test]
    fn load_without_path_returns_defaults() {
        let config = OrchestratorConfig::load(None).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buildsmith.toml");
        std::fs::write(
            &path,
            "budget_limit = 25.0\n\n[builder]\nmax_concurrent = 5\ndepth = \"thorough\"\n",
        )
        .unwrap();

        let config = OrchestratorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.budget_limit, Some(25.0));
        assert_eq!(config.builder.max_concurrent, 5);
        assert_eq!(config.builder.depth, Depth::Thorough);
        // Untouched sections keep their defaults
        assert_eq!(config.architect.max_retries, 2);
        assert_eq!(config.integration.compose_timeout_s, 300);
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let missing = Path::new("/nonexistent/buildsmith.toml");
        assert!(OrchestratorConfig::load(Some(missing)).is_err());
    }

    #[test]
    fn db_paths_default_under_dot_dir() {
        let config = OrchestratorConfig::default();
        let project = Path::new("/tmp/project");
        assert_eq!(
            config.runs_db_path(project),
            PathBuf::from("/tmp/project/.buildsmith/runs.db")
        );
        assert_eq!(
            config.state_dir(project),
            PathBuf::from("/tmp/project/.buildsmith/state")
        );
    }

    #[test]
    fn depth_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Depth::Quick).unwrap(), "\"quick\"");
        let depth: Depth = serde_json::from_str("\"thorough\"").unwrap();
        assert_eq!(depth, Depth::Thorough);
    }
}
