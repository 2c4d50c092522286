use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "agent-lab.toml";
pub const LAB_ROOT_ENV: &str = "AGENT_LAB_ROOT";
pub const CLAUDE_CMD_ENV: &str = "CLAUDE_CMD";

/// `[runner]` section: how the container runner image is built and how the
/// agent CLI is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSection {
    /// Dockerfile for the runner image, relative to the lab root.
    #[serde(default = "default_dockerfile")]
    pub dockerfile: PathBuf,
    /// Files and directories hashed into the runner image fingerprint.
    #[serde(default = "default_fingerprint_inputs")]
    pub fingerprint_inputs: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_cmd: Option<String>,
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("docker/claude-runner.Dockerfile")
}

fn default_fingerprint_inputs() -> Vec<PathBuf> {
    vec![
        default_dockerfile(),
        PathBuf::from("Cargo.toml"),
        PathBuf::from("src"),
    ]
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            dockerfile: default_dockerfile(),
            fingerprint_inputs: default_fingerprint_inputs(),
            claude_cmd: None,
        }
    }
}

/// `[paths]` section, all relative to the lab root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    #[serde(default = "default_problems_dir")]
    pub problems_dir: PathBuf,
    #[serde(default = "default_architectures_dir")]
    pub architectures_dir: PathBuf,
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_problems_dir() -> PathBuf {
    PathBuf::from("problems")
}

fn default_architectures_dir() -> PathBuf {
    PathBuf::from("architectures")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            problems_dir: default_problems_dir(),
            architectures_dir: default_architectures_dir(),
        }
    }
}

/// The complete agent-lab.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabToml {
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub paths: PathsSection,
}

impl LabToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agent-lab.toml")
    }

    /// Load `<lab_root>/agent-lab.toml`, or defaults when it does not exist.
    pub fn load_or_default(lab_root: &Path) -> Result<Self> {
        let config_path = lab_root.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Resolved lab layout. Every path is absolute.
///
/// Precedence for the lab root: `--lab-root`, then `AGENT_LAB_ROOT`, then the
/// current directory. Precedence for the agent command: `agent-lab.toml`, then
/// `CLAUDE_CMD`, then `claude`.
#[derive(Debug, Clone)]
pub struct LabConfig {
    pub lab_root: PathBuf,
    pub runs_dir: PathBuf,
    pub problems_dir: PathBuf,
    pub architectures_dir: PathBuf,
    pub dockerfile: PathBuf,
    pub fingerprint_inputs: Vec<PathBuf>,
    pub claude_cmd: String,
}

impl LabConfig {
    pub fn load(lab_root_override: Option<PathBuf>) -> Result<Self> {
        let root = match lab_root_override {
            Some(root) => root,
            None => match std::env::var_os(LAB_ROOT_ENV) {
                Some(root) => PathBuf::from(root),
                None => std::env::current_dir().context("Failed to read current directory")?,
            },
        };
        Self::from_root(&root)
    }

    pub fn from_root(root: &Path) -> Result<Self> {
        let lab_root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve lab root {}", root.display()))?;
        let toml = LabToml::load_or_default(&lab_root)?;
        let claude_cmd = toml
            .runner
            .claude_cmd
            .clone()
            .or_else(|| std::env::var(CLAUDE_CMD_ENV).ok())
            .unwrap_or_else(|| "claude".to_string());

        Ok(Self {
            runs_dir: lab_root.join(&toml.paths.runs_dir),
            problems_dir: lab_root.join(&toml.paths.problems_dir),
            architectures_dir: lab_root.join(&toml.paths.architectures_dir),
            dockerfile: lab_root.join(&toml.runner.dockerfile),
            fingerprint_inputs: toml
                .runner
                .fingerprint_inputs
                .iter()
                .map(|p| lab_root.join(p))
                .collect(),
            claude_cmd,
            lab_root,
        })
    }
}
