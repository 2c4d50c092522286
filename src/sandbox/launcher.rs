use super::image::{compute_fingerprint, ensure_fresh_image};
use super::runtime::ContainerRuntime;
use super::spec::{build_container_launch_spec, runtime_process_env};
use super::ExecutionConfig;
use crate::audit::RunLogger;
use crate::config::LabConfig;
use crate::errors::LaunchError;
use crate::orchestrator::{LoopConfig, LoopMode, RunState, RunStatus, default_state_path};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{error, info, warn};

pub const LAUNCH_FAILED_REASON: &str = "container_launch_failed";

/// Everything needed to start one container worker for a run.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub run_dir: PathBuf,
    pub run_id: String,
    pub mode: LoopMode,
    pub loop_config: LoopConfig,
    pub execution: ExecutionConfig,
    /// Environment of the launching process.
    pub env: HashMap<String, String>,
}

/// Build or reuse the runner image, then run the worker to completion.
///
/// Blocks until the container exits. A nonzero exit becomes
/// [`LaunchError::WorkerFailed`]. Any launch failure is saved to an existing
/// `state.json` as `failed` before it is returned, unless the worker already
/// recorded its own failure during this launch.
pub async fn launch_container_worker(
    lab: &LabConfig,
    request: &LaunchRequest,
    runtime: &dyn ContainerRuntime,
) -> Result<()> {
    let started = Utc::now();
    let outcome = run_container_worker(lab, request, runtime).await;
    if let Err(ref e) = outcome
        && let Err(persist_err) = persist_launch_failure(request, started, &format!("{:#}", e))
    {
        warn!(error = %persist_err, run_id = %request.run_id, "Failed to record launch failure");
    }
    outcome
}

fn persist_launch_failure(
    request: &LaunchRequest,
    started: DateTime<Utc>,
    detail: &str,
) -> Result<()> {
    let state_path = default_state_path(&request.run_dir);
    if !state_path.exists() {
        return Ok(());
    }
    let mut state = RunState::load(&state_path)?;
    if state.status == RunStatus::Failed && state.updated_at >= started {
        return Ok(());
    }
    state.mark_failed(LAUNCH_FAILED_REASON, Some(detail.to_string()));
    state.save(&state_path)?;
    RunLogger::new(&request.run_dir)?.append_event(
        "run.error",
        Some(state.iteration),
        json!({"reason": LAUNCH_FAILED_REASON, "error": detail}),
    )?;
    Ok(())
}

async fn run_container_worker(
    lab: &LabConfig,
    request: &LaunchRequest,
    runtime: &dyn ContainerRuntime,
) -> Result<()> {
    runtime.verify()?;
    let logger = RunLogger::new(&request.run_dir)?;

    let fingerprint = compute_fingerprint(&lab.lab_root, &lab.fingerprint_inputs)?;
    ensure_fresh_image(
        runtime,
        &request.execution.image,
        &lab.dockerfile,
        &lab.lab_root,
        &fingerprint,
        &logger,
    )
    .await?;

    let spec = build_container_launch_spec(
        &request.run_dir,
        &request.run_id,
        request.mode,
        &request.loop_config,
        &request.execution,
        &request.env,
    )?;
    let mounts: Vec<_> = spec
        .mounts
        .iter()
        .map(|m| {
            json!({
                "source": m.source.display().to_string(),
                "target": m.target,
                "read_only": m.read_only,
            })
        })
        .collect();
    logger.append_event(
        "launcher.container.start",
        None,
        json!({
            "mode": request.mode.as_str(),
            "runtime": spec.runtime,
            "image": spec.image,
            "network": spec.network,
            "mounts": mounts,
            "run_as_user": spec.run_as_user,
            "allocate_tty": spec.allocate_tty,
            "env_passthrough": spec.env_passthrough,
            "env_assignments": spec.env_assignments,
            "worker_args": spec.worker_args,
        }),
    )?;
    info!(
        run_id = %request.run_id,
        runtime = runtime.name(),
        image = %spec.image,
        "Starting container worker"
    );

    let command = spec.to_command(&request.run_id);
    let exit_code = runtime
        .run(&command, &runtime_process_env(&request.env))
        .await?;
    logger.append_event(
        "launcher.container.exit",
        None,
        json!({"exit_code": exit_code}),
    )?;

    if exit_code != 0 {
        error!(run_id = %request.run_id, exit_code, "Container worker failed");
        return Err(LaunchError::WorkerFailed { exit_code }.into());
    }
    Ok(())
}
