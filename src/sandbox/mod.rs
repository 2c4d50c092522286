//! Container isolation for run workers.
//!
//! A run executes either in-process on the host or inside a container that
//! re-enters this binary as `agent-lab worker ...`. This module decides which
//! (`resolve_execution_config`), plans the container invocation
//! (`build_container_launch_spec`), keeps the runner image fresh, and launches
//! the worker.

mod image;
mod launcher;
mod runtime;
mod spec;

pub use image::{FINGERPRINT_LABEL, ImageStatus, compute_fingerprint, ensure_fresh_image};
pub use launcher::{LAUNCH_FAILED_REASON, LaunchRequest, launch_container_worker};
pub use runtime::{CliRuntime, ContainerRuntime, ImageBuild, verify_runtime};
pub use spec::{
    AGENT_LAB_ANTHROPIC_API_KEY_ENV, ANTHROPIC_API_KEY_ENV, BindMount, ContainerLaunchSpec,
    PERMISSION_BYPASS, WORKER_DATA_DIR, WORKER_RUN_DIR, build_container_launch_spec,
    passthrough_env_names, runtime_process_env,
};

use crate::errors::LaunchError;
use crate::manifest::RunManifest;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_CONTAINER_IMAGE: &str = "agent-lab-claude-runner:latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Host,
    Container,
}

impl FromStr for ExecutionMode {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(ExecutionMode::Host),
            "container" => Ok(ExecutionMode::Container),
            other => Err(LaunchError::InvalidExecutionMode(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Host => write!(f, "host"),
            ExecutionMode::Container => write!(f, "container"),
        }
    }
}

/// Container runtime CLI. The binary name equals the variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(RuntimeKind::Docker),
            "podman" => Ok(RuntimeKind::Podman),
            other => Err(LaunchError::InvalidRuntime(other.to_string())),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network at all inside the container.
    None,
    /// The runtime's default bridge network.
    Default,
}

impl FromStr for NetworkMode {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(NetworkMode::None),
            "default" => Ok(NetworkMode::Default),
            other => Err(LaunchError::InvalidNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::None => write!(f, "none"),
            NetworkMode::Default => write!(f, "default"),
        }
    }
}

/// CLI-level execution overrides. `None` defers to the manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOverrides {
    pub mode: Option<ExecutionMode>,
    pub runtime: Option<RuntimeKind>,
    pub network: Option<NetworkMode>,
    pub use_bypass_permissions: Option<bool>,
}

/// Effective execution configuration. Derived per launch, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    pub runtime: RuntimeKind,
    pub image: String,
    pub network: NetworkMode,
    pub use_bypass_permissions: bool,
}

/// Merge the manifest's `execution` block with CLI overrides and validate.
///
/// The `claude` provider needs outbound network access, so a manifest network of
/// `none` is promoted to `default` unless the CLI explicitly asks for a network.
pub fn resolve_execution_config(
    manifest: &RunManifest,
    overrides: &ExecutionOverrides,
) -> Result<ExecutionConfig, LaunchError> {
    let execution = &manifest.architecture.config.execution;
    let container = &execution.container;

    let mode = match overrides.mode {
        Some(mode) => mode,
        None => execution.mode.as_deref().unwrap_or("host").parse()?,
    };
    let runtime = match overrides.runtime {
        Some(runtime) => runtime,
        None => container.runtime.as_deref().unwrap_or("docker").parse()?,
    };
    let network = match overrides.network {
        Some(network) => network,
        None => {
            let declared: NetworkMode = container.network.as_deref().unwrap_or("none").parse()?;
            if manifest.provider() == "claude" && declared == NetworkMode::None {
                NetworkMode::Default
            } else {
                declared
            }
        }
    };
    let use_bypass_permissions = overrides
        .use_bypass_permissions
        .or(container.use_bypass_permissions)
        .unwrap_or(false);

    Ok(ExecutionConfig {
        mode,
        runtime,
        image: container
            .image
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTAINER_IMAGE.to_string()),
        network,
        use_bypass_permissions,
    })
}
