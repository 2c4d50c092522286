//! Typed error hierarchy for the agent-lab harness.
//!
//! Three top-level enums cover the three subsystems:
//! - `StateError` — persisted run state loading and saving
//! - `LoopError` — outer-loop validation and runtime failures
//! - `LaunchError` — execution config, image and container worker failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the run state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Corrupt state file at {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("State file I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the outer-loop orchestrator.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("Run already has state (iteration={iteration}). Use `resume` to continue.")]
    AlreadyStarted { iteration: u64 },

    #[error(
        "Unsupported provider for this runner: {provider}. Only provider=claude is implemented."
    )]
    UnsupportedProvider { provider: String },

    #[error("Run directory {path} is locked by another orchestrator")]
    RunLocked { path: PathBuf },

    #[error("Conversation stream ended without a result message")]
    MissingResult,

    #[error("Iteration {iteration} failed: {message}")]
    Runtime { iteration: u64, message: String },
}

/// Errors from the container launch planner and launcher.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Invalid execution mode: {0}")]
    InvalidExecutionMode(String),

    #[error("Invalid container runtime: {0}")]
    InvalidRuntime(String),

    #[error("Invalid container network mode: {0}")]
    InvalidNetwork(String),

    #[error("Unsupported worker mode: {0}")]
    UnsupportedWorkerMode(String),

    #[error(
        "Container runtime `{runtime}` not found. Install Docker (recommended) or use --execution-mode host."
    )]
    RuntimeNotFound { runtime: String },

    #[error("Runner image input missing: {path}")]
    ImageInputMissing { path: PathBuf },

    #[error("Container image build failed for `{image}` with exit code {exit_code}")]
    ImageBuildFailed { image: String, exit_code: i32 },

    #[error("Container worker failed with exit code {exit_code}")]
    WorkerFailed { exit_code: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_corrupt_state_carries_path() {
        let err = StateError::CorruptState {
            path: PathBuf::from("/runs/001/state.json"),
            reason: "expected a mapping".to_string(),
        };
        match &err {
            StateError::CorruptState { path, reason } => {
                assert_eq!(path, &PathBuf::from("/runs/001/state.json"));
                assert_eq!(reason, "expected a mapping");
            }
            _ => panic!("Expected CorruptState"),
        }
        assert!(err.to_string().contains("state.json"));
    }

    #[test]
    fn loop_error_already_started_mentions_resume() {
        let err = LoopError::AlreadyStarted { iteration: 3 };
        assert!(err.to_string().contains("resume"));
        assert!(err.to_string().contains("iteration=3"));
    }

    #[test]
    fn launch_error_build_failed_carries_exit_code() {
        let err = LaunchError::ImageBuildFailed {
            image: "runner:latest".into(),
            exit_code: 2,
        };
        match &err {
            LaunchError::ImageBuildFailed { exit_code, .. } => assert_eq!(*exit_code, 2),
            _ => panic!("Expected ImageBuildFailed"),
        }
    }

    #[test]
    fn errors_survive_anyhow_round_trip() {
        let err: anyhow::Error = LaunchError::WorkerFailed { exit_code: 137 }.into();
        assert!(matches!(
            err.downcast_ref::<LaunchError>(),
            Some(LaunchError::WorkerFailed { exit_code: 137 })
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&LoopError::MissingResult);
        assert_std_error(&LaunchError::InvalidRuntime("lxc".into()));
        assert_std_error(&StateError::CorruptState {
            path: PathBuf::new(),
            reason: String::new(),
        });
    }
}
