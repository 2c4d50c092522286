//! Run manifests, architecture configs, and run resolution.
//!
//! `run_manifest.yaml` is written once by `scaffold` and is read-only afterwards.
//! It embeds the architecture config resolved at scaffold time:
//!
//! ```yaml
//! schema_version: 1
//! run: { id: 002_ralph, name: ralph, problem: kalshi, created_at: ..., run_dir: ... }
//! architecture:
//!   name: ralph_loop
//!   source: architectures/ralph_loop/arch.yaml
//!   config:
//!     agent: { provider: claude, model: ..., permission_mode: acceptEdits }
//!     limits: { max_cost_usd: 25.0, max_time_minutes: 240 }
//!     hyperparameters: { max_iterations: 100 }
//!     execution: { mode: container, container: { runtime: docker, network: none } }
//! ```

use crate::orchestrator::{DEFAULT_PROVIDER, RunIdentity, RunLimits};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_MANIFEST_NAME: &str = "run_manifest.yaml";
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub run_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns_per_iteration: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_bypass_permissions: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default)]
    pub container: ContainerSettings,
}

/// An architecture config, as found in `architectures/` and embedded in manifests.
///
/// Sections the harness does not interpret are kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub limits: LimitsSettings,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureInfo {
    #[serde(default = "unknown_architecture")]
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub config: ArchitectureConfig,
}

fn unknown_architecture() -> String {
    "unknown".to_string()
}

fn default_manifest_schema() -> u32 {
    MANIFEST_SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(default = "default_manifest_schema")]
    pub schema_version: u32,
    #[serde(default)]
    pub run: RunInfo,
    pub architecture: ArchitectureInfo,
}

impl RunManifest {
    /// Ceilings declared by the architecture config.
    pub fn limits(&self) -> RunLimits {
        let config = &self.architecture.config;
        RunLimits {
            max_cost_usd: config.limits.max_cost_usd,
            max_time_minutes: config.limits.max_time_minutes,
            max_tokens_total: config.limits.max_tokens_total,
            max_iterations: config.hyperparameters.max_iterations,
            max_turns_per_iteration: config.limits.max_turns_per_iteration,
        }
    }

    pub fn identity(&self, run_id: &str) -> RunIdentity {
        let agent = &self.architecture.config.agent;
        RunIdentity {
            run_id: run_id.to_string(),
            architecture_name: self.architecture.name.clone(),
            provider: agent
                .provider
                .clone()
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            model: agent.model.clone(),
            permission_mode: agent.permission_mode.clone(),
        }
    }

    /// Lower-cased provider, empty when the manifest does not name one.
    pub fn provider(&self) -> String {
        self.architecture
            .config
            .agent
            .provider
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
    }
}

pub fn load_run_manifest(run_dir: &Path) -> Result<RunManifest> {
    let path = run_dir.join(RUN_MANIFEST_NAME);
    if !path.exists() {
        bail!(
            "Run manifest not found: {}. Scaffold a new run first.",
            path.display()
        );
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn write_run_manifest(run_dir: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let path = run_dir.join(RUN_MANIFEST_NAME);
    let content = serde_yaml::to_string(manifest).context("Failed to serialize run manifest")?;
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// `architectures/<arch>/arch.yaml` when `<arch>` is a directory, else `architectures/<arch>.yaml`.
pub fn architecture_file(architectures_dir: &Path, arch: &str) -> PathBuf {
    let arch_dir = architectures_dir.join(arch);
    if arch_dir.is_dir() {
        arch_dir.join("arch.yaml")
    } else {
        architectures_dir.join(format!("{}.yaml", arch))
    }
}

pub fn load_architecture(architectures_dir: &Path, arch: &str) -> Result<(PathBuf, ArchitectureConfig)> {
    let path = architecture_file(architectures_dir, arch);
    if !path.exists() {
        bail!("Architecture not found: {}", arch);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = serde_yaml::from_str(&content)
        .with_context(|| format!("Expected mapping in YAML file: {}", path.display()))?;
    Ok((path, config))
}

/// A run directory and its id (the directory name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRef {
    pub run_dir: PathBuf,
    pub run_id: String,
}

impl RunRef {
    fn from_dir(dir: &Path) -> Result<Self> {
        let run_dir = dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve run directory {}", dir.display()))?;
        let run_id = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self { run_dir, run_id })
    }
}

/// Resolve a run by path, by id under `runs_dir`, or by unique `_<name>` suffix.
///
/// `claude_ralph` resolves to `runs/002_claude_ralph` when that is the only match.
pub fn resolve_run(runs_dir: &Path, name: &str) -> Result<RunRef> {
    let candidate = PathBuf::from(name);
    if candidate.is_dir() {
        return RunRef::from_dir(&candidate);
    }

    let by_id = runs_dir.join(name);
    if by_id.is_dir() {
        return RunRef::from_dir(&by_id);
    }

    let suffix = format!("_{}", name);
    let mut matches: Vec<PathBuf> = match fs::read_dir(runs_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().ends_with(&suffix))
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    matches.sort();

    match matches.len() {
        1 => RunRef::from_dir(&matches[0]),
        0 => bail!("Run not found: {}", name),
        _ => {
            let options: Vec<String> = matches
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .collect();
            bail!(
                "Run name is ambiguous: {}. Matching runs: {}",
                name,
                options.join(", ")
            )
        }
    }
}
