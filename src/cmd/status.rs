//! `agent-lab status`.

use agent_lab::manifest::resolve_run;
use agent_lab::orchestrator::{RunLimits, RunState, RunStatus, default_state_path};
use agent_lab::telemetry::init_tracing;
use anyhow::Result;
use console::style;

use super::super::Cli;
use super::lab_config;

fn styled_status(status: RunStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        RunStatus::Initialized => style(text).dim(),
        RunStatus::Running => style(text).cyan(),
        RunStatus::Stopped => style(text).yellow(),
        RunStatus::Failed => style(text).red().bold(),
    }
}

fn limit<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn print_limits(limits: &RunLimits) {
    println!(
        "  Limits:      cost=${} time={}m tokens={} iterations={} turns/iter={}",
        limit(limits.max_cost_usd),
        limit(limits.max_time_minutes),
        limit(limits.max_tokens_total),
        limit(limits.max_iterations),
        limit(limits.max_turns_per_iteration),
    );
}

pub fn cmd_status(cli: &Cli, name: &str) -> Result<()> {
    let _guard = init_tracing(cli.verbose, None)?;
    let lab = lab_config(cli)?;
    let run = resolve_run(&lab.runs_dir, name)?;

    let state_path = default_state_path(&run.run_dir);
    println!();
    println!("Run: {}", style(&run.run_id).bold());
    if !state_path.exists() {
        println!("  Status:      {}", style("not started").dim());
        println!();
        return Ok(());
    }

    let state = RunState::load(&state_path)?;
    println!("  Status:      {}", styled_status(state.status));
    println!("  Arch:        {} ({})", state.architecture_name, state.provider);
    if let Some(ref model) = state.model {
        println!("  Model:       {}", model);
    }
    println!("  Iteration:   {}", state.iteration);
    println!("  Cost:        ${:.4}", state.cumulative_cost_usd);
    println!("  Tokens:      {}", state.cumulative_tokens);
    println!(
        "  Wall time:   {:.1} min",
        state.cumulative_wall_time_minutes()
    );
    if let Some(ref session) = state.session_id {
        println!("  Session:     {}", session);
    }
    print_limits(&state.limits);
    if let Some(ref reason) = state.last_stop_reason {
        let detail = state.last_stop_detail.as_deref().unwrap_or("");
        println!("  Last stop:   {} {}", reason, style(detail).dim());
    }
    println!("  Resumes:     {}", state.resume_history.len());
    println!("  Updated:     {}", state.updated_at.to_rfc3339());
    println!();
    Ok(())
}
