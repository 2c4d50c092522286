//! Outer-loop execution: `agent-lab run`, `agent-lab resume`, and the hidden
//! `agent-lab worker` entry point used inside containers.

use agent_lab::agent::{ClaudeCli, Conversation};
use agent_lab::config::{CLAUDE_CMD_ENV, LabConfig};
use agent_lab::manifest::{RunRef, load_run_manifest, resolve_run};
use agent_lab::orchestrator::{LoopConfig, LoopMode, RunState, default_state_path, run_loop};
use agent_lab::sandbox::{
    CliRuntime, ExecutionMode, ExecutionOverrides, LaunchRequest, NetworkMode, RuntimeKind,
    launch_container_worker, resolve_execution_config,
};
use agent_lab::telemetry::init_tracing;
use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::super::{Cli, ExecutionArgs, ExtendArgs, LimitArgs};
use super::lab_config;

fn execution_overrides(args: &ExecutionArgs) -> Result<ExecutionOverrides> {
    let mode = match args.execution_mode.as_str() {
        "auto" | "" => None,
        other => Some(other.parse::<ExecutionMode>()?),
    };
    let use_bypass_permissions = if args.use_bypass_permissions {
        Some(true)
    } else if args.no_use_bypass_permissions {
        Some(false)
    } else {
        None
    };
    Ok(ExecutionOverrides {
        mode,
        runtime: args
            .container_runtime
            .as_deref()
            .map(str::parse::<RuntimeKind>)
            .transpose()?,
        network: args
            .container_network
            .as_deref()
            .map(str::parse::<NetworkMode>)
            .transpose()?,
        use_bypass_permissions,
    })
}

fn loop_config(limits: &LimitArgs, extend: &ExtendArgs) -> LoopConfig {
    LoopConfig {
        max_cost_usd: limits.max_cost_usd,
        max_time_minutes: limits.max_time_minutes,
        max_tokens_total: limits.max_tokens_total,
        max_iterations: limits.max_iterations,
        new_session_from_checkpoint: extend.new_session_from_checkpoint,
        extend_cost_usd: extend.extend_cost_usd,
        extend_time_minutes: extend.extend_time_minutes,
        extend_tokens_total: extend.extend_tokens_total,
        extend_iterations: extend.extend_iterations,
        permission_mode_override: None,
    }
}

fn state_summary(state: &RunState) -> String {
    format!(
        "Run stopped: {} reason={} cost=${:.4} iterations={}",
        state.run_id,
        state.last_stop_reason.as_deref().unwrap_or("none"),
        state.cumulative_cost_usd,
        state.iteration
    )
}

fn conversation(claude_cmd: &str) -> Arc<dyn Conversation> {
    Arc::new(ClaudeCli::new(claude_cmd))
}

/// Run the loop on the host, or hand it to a container worker and read back the
/// state it persisted.
async fn execute_with_selected_mode(
    lab: &LabConfig,
    run: &RunRef,
    mode: LoopMode,
    config: LoopConfig,
    overrides: &ExecutionOverrides,
) -> Result<RunState> {
    let manifest = load_run_manifest(&run.run_dir)?;
    let execution = resolve_execution_config(&manifest, overrides)?;
    info!(
        run_id = %run.run_id,
        mode = %mode,
        execution = %execution.mode,
        "Executing run"
    );

    match execution.mode {
        ExecutionMode::Host => {
            run_loop(
                &run.run_dir,
                &run.run_id,
                mode,
                &config,
                conversation(&lab.claude_cmd),
            )
            .await
        }
        ExecutionMode::Container => {
            let runtime = CliRuntime::new(execution.runtime);
            let request = LaunchRequest {
                run_dir: run.run_dir.clone(),
                run_id: run.run_id.clone(),
                mode,
                loop_config: config,
                execution,
                env: std::env::vars().collect(),
            };
            launch_container_worker(lab, &request, &runtime).await?;

            let state_path = default_state_path(&run.run_dir);
            if !state_path.exists() {
                bail!(
                    "Container worker exited but state file is missing: {}",
                    state_path.display()
                );
            }
            Ok(RunState::load(&state_path)?)
        }
    }
}

async fn execute(
    cli: &Cli,
    name: &str,
    mode: LoopMode,
    config: LoopConfig,
    execution: &ExecutionArgs,
) -> Result<()> {
    let lab = lab_config(cli)?;
    let run = resolve_run(&lab.runs_dir, name)?;
    let _guard = init_tracing(cli.verbose, Some(&run.run_dir.join("logs")))?;
    let overrides = execution_overrides(execution)?;

    let state = execute_with_selected_mode(&lab, &run, mode, config, &overrides).await?;
    println!("{}", style(state_summary(&state)).bold());
    Ok(())
}

pub async fn cmd_run(
    cli: &Cli,
    name: &str,
    limits: &LimitArgs,
    execution: &ExecutionArgs,
) -> Result<()> {
    let config = loop_config(limits, &ExtendArgs::default());
    execute(cli, name, LoopMode::Run, config, execution).await
}

pub async fn cmd_resume(
    cli: &Cli,
    name: &str,
    extend: &ExtendArgs,
    execution: &ExecutionArgs,
) -> Result<()> {
    let config = loop_config(&LimitArgs::default(), extend);
    execute(cli, name, LoopMode::Resume, config, execution).await
}

pub async fn cmd_worker(
    cli: &Cli,
    run_dir: &Path,
    run_id: &str,
    mode: &str,
    limits: &LimitArgs,
    extend: &ExtendArgs,
    permission_mode_override: Option<String>,
) -> Result<()> {
    let _guard = init_tracing(cli.verbose, Some(&run_dir.join("logs")))?;
    let mode: LoopMode = mode.parse()?;
    let config = LoopConfig {
        permission_mode_override,
        ..loop_config(limits, extend)
    };
    let claude_cmd = std::env::var(CLAUDE_CMD_ENV).unwrap_or_else(|_| "claude".to_string());

    let run_dir = run_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve run directory {}", run_dir.display()))?;
    let state = run_loop(&run_dir, run_id, mode, &config, conversation(&claude_cmd)).await?;
    info!(summary = %state_summary(&state), "Worker finished");
    Ok(())
}
