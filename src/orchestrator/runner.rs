use super::accounting::{compute_cost_delta, extract_token_total, result_stop_reason};
use super::budget::{evaluate_budget, remaining_budget_usd};
use super::prompt::{build_iteration_prompt, build_system_prompt};
use super::state::{LoopMode, RunState, RunStatus, default_state_path};
use crate::agent::{Conversation, QueryOptions};
use crate::audit::{IterationSummary, RunLogger};
use crate::compaction::{
    CheckpointSnapshot, CheckpointTrigger, Checkpointer, CompactionSignal, ensure_research_files,
};
use crate::errors::LoopError;
use crate::manifest::load_run_manifest;
use crate::stream::{AgentMessage, ResultMessage};
use anyhow::{Context, Result};
use fs2::FileExt;
use futures::StreamExt;
use serde_json::{Map, Value, json};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const RUN_LOCK_NAME: &str = ".agent-lab.lock";

/// Caller-supplied options for one `run` or `resume` invocation.
///
/// `max_*` values are absolute and only apply in `run` mode. `extend_*` values are
/// added to the current ceilings and only apply in `resume` mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopConfig {
    pub max_cost_usd: Option<f64>,
    pub max_time_minutes: Option<u64>,
    pub max_tokens_total: Option<u64>,
    pub max_iterations: Option<u64>,
    pub new_session_from_checkpoint: bool,
    pub extend_cost_usd: f64,
    pub extend_time_minutes: u64,
    pub extend_tokens_total: u64,
    pub extend_iterations: u64,
    pub permission_mode_override: Option<String>,
}

/// The outer loop for a single run directory.
///
/// Holds an exclusive advisory lock on `<run>/.agent-lab.lock` until dropped.
pub struct RunLoop {
    run_dir: PathBuf,
    run_id: String,
    mode: LoopMode,
    logger: RunLogger,
    state_path: PathBuf,
    state: RunState,
    conversation: Arc<dyn Conversation>,
    _lock: File,
}

impl std::fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoop")
            .field("run_dir", &self.run_dir)
            .field("run_id", &self.run_id)
            .field("mode", &self.mode)
            .field("iteration", &self.state.iteration)
            .finish()
    }
}

fn acquire_run_lock(run_dir: &Path) -> Result<File> {
    let path = run_dir.join(RUN_LOCK_NAME);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;
    if file.try_lock_exclusive().is_err() {
        return Err(LoopError::RunLocked {
            path: run_dir.to_path_buf(),
        }
        .into());
    }
    Ok(file)
}

impl RunLoop {
    /// Lock the run, load or initialize its state, and apply this invocation's
    /// overrides. The state is saved before returning.
    ///
    /// Validation failures (`run` on a started run, unsupported provider) leave an
    /// existing state file untouched.
    pub fn open(
        run_dir: &Path,
        run_id: &str,
        mode: LoopMode,
        config: &LoopConfig,
        conversation: Arc<dyn Conversation>,
    ) -> Result<Self> {
        let lock = acquire_run_lock(run_dir)?;
        let logger = RunLogger::new(run_dir)?;
        let state_path = default_state_path(run_dir);
        let state = load_or_initialize_state(run_dir, run_id, mode, config, &state_path)?;
        ensure_research_files(run_dir)?;

        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            run_id: run_id.to_string(),
            mode,
            logger,
            state_path,
            state,
            conversation,
            _lock: lock,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    fn save(&mut self) -> Result<()> {
        self.state.save(&self.state_path)?;
        Ok(())
    }

    fn stop(&mut self, iteration: u64, status: RunStatus, reason: &str, detail: String) -> Result<()> {
        if status == RunStatus::Failed {
            self.state.mark_failed(reason, Some(detail.clone()));
        } else {
            self.state.mark_stopped(reason, Some(detail.clone()));
        }
        self.save()?;
        self.logger.append_event(
            "run.stop",
            Some(iteration),
            json!({"reason": reason, "detail": detail}),
        )?;
        info!(run_id = %self.run_id, iteration, reason, %detail, status = %status, "Run stopped");
        Ok(())
    }

    fn fail(&mut self, iteration: u64, reason: &str, detail: String) -> Result<()> {
        self.state.mark_failed(reason, Some(detail.clone()));
        self.save()?;
        self.logger
            .append_event("run.error", Some(iteration), json!({"error": detail}))?;
        warn!(run_id = %self.run_id, iteration, reason, error = %detail, "Run failed");
        Ok(())
    }

    /// Drive iterations until a budget ceiling, an agent-side stop, or an error.
    ///
    /// Soft stops return the final state. Errors are persisted as `failed` first.
    pub async fn run(mut self) -> Result<RunState> {
        self.logger.append_event(
            "run.start",
            Some(self.state.iteration),
            json!({
                "mode": self.mode.as_str(),
                "run_id": self.run_id,
                "limits": self.state.limits,
                "session_id": self.state.session_id,
            }),
        )?;
        info!(
            run_id = %self.run_id,
            mode = %self.mode,
            iteration = self.state.iteration,
            "Starting outer loop"
        );

        loop {
            if let Some(check) = evaluate_budget(&self.state) {
                let iteration = self.state.iteration;
                self.stop(iteration, RunStatus::Stopped, check.reason, check.detail)?;
                return Ok(self.state);
            }

            let iteration = self.state.iteration + 1;
            let remaining_budget = remaining_budget_usd(&self.state);
            let started = Instant::now();

            let checkpointer = Arc::new(Checkpointer::new(
                &self.run_dir,
                self.logger.clone(),
                CheckpointSnapshot {
                    run_id: self.run_id.clone(),
                    iteration,
                    session_id: self.state.session_id.clone(),
                    cumulative_cost_usd: self.state.cumulative_cost_usd,
                    cumulative_tokens: self.state.cumulative_tokens,
                },
            ));
            let options = QueryOptions {
                cwd: self.run_dir.clone(),
                model: self.state.model.clone(),
                permission_mode: self.state.permission_mode.clone(),
                resume: self.state.session_id.clone(),
                max_turns: self.state.limits.max_turns_per_iteration,
                max_budget_usd: remaining_budget,
                system_prompt: Some(build_system_prompt()),
                pre_compact: Some(checkpointer.clone() as Arc<dyn CheckpointTrigger>),
            };

            self.logger.append_event(
                "iteration.start",
                Some(iteration),
                json!({
                    "remaining_budget_usd": remaining_budget,
                    "session_id": self.state.session_id,
                }),
            )?;
            info!(iteration, remaining_budget_usd = ?remaining_budget, "Iteration started");

            let prompt = build_iteration_prompt(iteration);
            let (result, messages_seen) = match self
                .consume(iteration, &prompt, options, checkpointer.as_ref())
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = format!("{:#}", e);
                    self.fail(iteration, "runtime_exception", message.clone())?;
                    return Err(LoopError::Runtime { iteration, message }.into());
                }
            };

            let Some(result) = result else {
                self.fail(
                    iteration,
                    "missing_result_message",
                    LoopError::MissingResult.to_string(),
                )?;
                return Err(LoopError::MissingResult.into());
            };

            self.record_iteration(iteration, &result, messages_seen, started)?;

            if let Some(stop) = result_stop_reason(&result.subtype, result.is_error) {
                self.stop(iteration, stop.status, stop.reason, result.subtype.clone())?;
                return Ok(self.state);
            }
        }
    }

    /// Consume one conversation stream, logging every message and checkpointing
    /// on inline compaction boundaries. Returns the result message, if any, and
    /// the number of messages seen.
    async fn consume(
        &self,
        iteration: u64,
        prompt: &str,
        options: QueryOptions,
        checkpointer: &Checkpointer,
    ) -> Result<(Option<ResultMessage>, u64)> {
        let mut stream = self.conversation.query(prompt, options).await?;
        let mut result = None;
        let mut messages_seen = 0u64;

        while let Some(message) = stream.next().await {
            let message = message?;
            messages_seen += 1;
            self.logger.append_event(
                "sdk.message",
                Some(iteration),
                json!({"message_type": message.type_name(), "message": message}),
            )?;
            if let Some(session) = message.session_id() {
                checkpointer.observe_session(session);
            }
            if let Some(metadata) = message.compact_metadata() {
                checkpointer.on_compaction(CompactionSignal::compact_boundary(metadata));
            }
            if let AgentMessage::Result(r) = message {
                debug!(iteration, subtype = %r.subtype, "Result message received");
                result = Some(r);
            }
        }
        Ok((result, messages_seen))
    }

    fn record_iteration(
        &mut self,
        iteration: u64,
        result: &ResultMessage,
        messages_seen: u64,
        started: Instant,
    ) -> Result<()> {
        let elapsed = started.elapsed().as_secs_f64();
        let cost_delta = compute_cost_delta(result.total_cost_usd, &self.state, &result.session_id);
        let token_delta = extract_token_total(result.usage.as_ref());

        let state = &mut self.state;
        state.iteration = iteration;
        state.session_id = Some(result.session_id.clone()).filter(|s| !s.is_empty());
        if let Some(total) = result.total_cost_usd {
            state.session_total_cost_usd = total;
        }
        state.cumulative_cost_usd += cost_delta;
        state.cumulative_tokens = state.cumulative_tokens.saturating_add(token_delta);
        state.cumulative_wall_time_seconds += elapsed;
        state.last_result_subtype = Some(result.subtype.clone());

        self.logger.append_iteration(&IterationSummary {
            iteration,
            session_id: state.session_id.clone(),
            result_subtype: result.subtype.clone(),
            is_error: result.is_error,
            num_turns: result.num_turns,
            messages_seen,
            duration_ms: result.duration_ms,
            duration_api_ms: result.duration_api_ms,
            elapsed_seconds_wall: elapsed,
            cost_delta_usd: cost_delta,
            cumulative_cost_usd: state.cumulative_cost_usd,
            token_delta,
            cumulative_tokens: state.cumulative_tokens,
        })?;
        info!(
            iteration,
            cost_delta_usd = cost_delta,
            cumulative_cost_usd = state.cumulative_cost_usd,
            token_delta,
            "Iteration finished"
        );
        self.save()
    }
}

fn load_or_initialize_state(
    run_dir: &Path,
    run_id: &str,
    mode: LoopMode,
    config: &LoopConfig,
    state_path: &Path,
) -> Result<RunState> {
    let mut state = if state_path.exists() {
        RunState::load(state_path)?
    } else {
        let manifest = load_run_manifest(run_dir)?;
        RunState::initialize(manifest.identity(run_id), manifest.limits())
    };

    if let Some(ref mode_override) = config.permission_mode_override {
        state.permission_mode = Some(mode_override.clone());
    }
    if state.provider != "claude" {
        return Err(LoopError::UnsupportedProvider {
            provider: state.provider.clone(),
        }
        .into());
    }

    match mode {
        LoopMode::Run => {
            if !state.is_virgin() {
                return Err(LoopError::AlreadyStarted {
                    iteration: state.iteration,
                }
                .into());
            }
            state.mark_running();
            apply_run_overrides(&mut state, config);
            let mut details = Map::new();
            details.insert("kind".to_string(), Value::from("fresh_start"));
            state.add_resume_event(LoopMode::Run, details);
        }
        LoopMode::Resume => {
            state.mark_running();
            let details = apply_resume_overrides(&mut state, config);
            state.add_resume_event(LoopMode::Resume, details);
        }
    }

    state.save(state_path)?;
    Ok(state)
}

fn apply_run_overrides(state: &mut RunState, config: &LoopConfig) {
    let limits = &mut state.limits;
    if config.max_cost_usd.is_some() {
        limits.max_cost_usd = config.max_cost_usd;
    }
    if config.max_time_minutes.is_some() {
        limits.max_time_minutes = config.max_time_minutes;
    }
    if config.max_tokens_total.is_some() {
        limits.max_tokens_total = config.max_tokens_total;
    }
    if config.max_iterations.is_some() {
        limits.max_iterations = config.max_iterations;
    }
}

/// Extend ceilings additively. An unset ceiling is established at the extension,
/// except iterations, which count from the current iteration.
fn apply_resume_overrides(state: &mut RunState, config: &LoopConfig) -> Map<String, Value> {
    let mut details = Map::new();
    let limits = &mut state.limits;

    if config.extend_cost_usd != 0.0 {
        limits.max_cost_usd = Some(limits.max_cost_usd.unwrap_or(0.0) + config.extend_cost_usd);
        details.insert("extend_cost_usd".into(), json!(config.extend_cost_usd));
    }
    if config.extend_time_minutes != 0 {
        limits.max_time_minutes =
            Some(limits.max_time_minutes.unwrap_or(0) + config.extend_time_minutes);
        details.insert("extend_time_minutes".into(), json!(config.extend_time_minutes));
    }
    if config.extend_tokens_total != 0 {
        limits.max_tokens_total =
            Some(limits.max_tokens_total.unwrap_or(0) + config.extend_tokens_total);
        details.insert("extend_tokens_total".into(), json!(config.extend_tokens_total));
    }
    if config.extend_iterations != 0 {
        let base = limits.max_iterations.unwrap_or(state.iteration);
        limits.max_iterations = Some(base + config.extend_iterations);
        details.insert("extend_iterations".into(), json!(config.extend_iterations));
    }

    if config.new_session_from_checkpoint {
        state.session_id = None;
        state.session_total_cost_usd = 0.0;
        details.insert("new_session_from_checkpoint".into(), json!(true));
    }
    details
}

/// Open the run and drive it to completion.
pub async fn run_loop(
    run_dir: &Path,
    run_id: &str,
    mode: LoopMode,
    config: &LoopConfig,
    conversation: Arc<dyn Conversation>,
) -> Result<RunState> {
    RunLoop::open(run_dir, run_id, mode, config, conversation)?
        .run()
        .await
}
