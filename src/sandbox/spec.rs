use super::{ExecutionConfig, NetworkMode, RuntimeKind};
use crate::orchestrator::{LoopConfig, LoopMode};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

pub const WORKER_RUN_DIR: &str = "/workspace/run";
pub const WORKER_DATA_DIR: &str = "/workspace/data";
pub const PERMISSION_BYPASS: &str = "bypassPermissions";
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const AGENT_LAB_ANTHROPIC_API_KEY_ENV: &str = "AGENT_LAB_ANTHROPIC_API_KEY";
const RUNTIME_HOME: &str = ".runtime_home";

const PASSTHROUGH_ENV: [&str; 7] = [
    ANTHROPIC_API_KEY_ENV,
    "ANTHROPIC_BASE_URL",
    "ANTHROPIC_AUTH_TOKEN",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "ALL_PROXY",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Resolved container launch plan for one worker execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerLaunchSpec {
    pub runtime: RuntimeKind,
    pub image: String,
    pub network: NetworkMode,
    pub workdir: String,
    pub mounts: Vec<BindMount>,
    /// Variable names forwarded from the launching process's environment.
    pub env_passthrough: Vec<String>,
    pub env_assignments: BTreeMap<String, String>,
    pub worker_args: Vec<String>,
    pub run_as_user: Option<String>,
    pub allocate_tty: bool,
}

impl ContainerLaunchSpec {
    /// Full runtime argv for this launch.
    pub fn to_command(&self, run_id: &str) -> Vec<String> {
        let mut cmd: Vec<String> = vec![
            self.runtime.binary().to_string(),
            "run".into(),
            "--rm".into(),
            "--interactive".into(),
        ];
        if self.allocate_tty {
            cmd.push("--tty".into());
        }
        if self.network == NetworkMode::None {
            cmd.extend(["--network".into(), "none".into()]);
        }
        if let Some(ref user) = self.run_as_user {
            cmd.extend(["--user".into(), user.clone()]);
        }

        for mount in &self.mounts {
            let rw_mode = if mount.read_only { "ro" } else { "rw" };
            cmd.push("--volume".into());
            cmd.push(format!(
                "{}:{}:{}",
                mount.source.display(),
                mount.target,
                rw_mode
            ));
        }

        for key in &self.env_passthrough {
            cmd.extend(["--env".into(), key.clone()]);
        }
        for (key, value) in &self.env_assignments {
            cmd.extend(["--env".into(), format!("{}={}", key, value)]);
        }
        cmd.extend(["--env".into(), format!("AGENT_LAB_RUN_ID={}", run_id)]);
        cmd.extend(["--env".into(), "AGENT_LAB_WORKER=1".into()]);
        cmd.extend(["--workdir".into(), self.workdir.clone(), self.image.clone()]);
        cmd.extend(self.worker_args.iter().cloned());
        cmd
    }
}

/// Names to forward into the container: the fixed allow-list plus every
/// `ANTHROPIC_*` variable present. `ANTHROPIC_API_KEY` is always listed since the
/// runtime process env may supply it from the alias.
pub fn passthrough_env_names(env: &HashMap<String, String>) -> Vec<String> {
    let mut keys: BTreeSet<String> = PASSTHROUGH_ENV
        .iter()
        .filter(|k| env.contains_key(**k))
        .map(|k| k.to_string())
        .collect();
    keys.extend(
        env.keys()
            .filter(|k| k.starts_with("ANTHROPIC_"))
            .cloned(),
    );
    keys.insert(ANTHROPIC_API_KEY_ENV.to_string());
    keys.into_iter().collect()
}

/// Environment for the container runtime process itself, with the
/// `AGENT_LAB_ANTHROPIC_API_KEY` alias promoted when the canonical key is absent.
pub fn runtime_process_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut out = env.clone();
    if !out.contains_key(ANTHROPIC_API_KEY_ENV)
        && let Some(alias) = env.get(AGENT_LAB_ANTHROPIC_API_KEY_ENV)
    {
        out.insert(ANTHROPIC_API_KEY_ENV.to_string(), alias.clone());
    }
    out
}

/// Mount `data/` read-only at the worker data dir. When `data` is a symlink its
/// resolved target is mounted at the same absolute path too, so the link still
/// resolves inside the container.
fn resolve_data_mounts(run_dir: &Path) -> Result<Vec<BindMount>> {
    let data_path = run_dir.join("data");
    if !data_path.exists() {
        return Ok(Vec::new());
    }
    let source = data_path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", data_path.display()))?;
    let mut mounts = vec![BindMount {
        source: source.clone(),
        target: WORKER_DATA_DIR.to_string(),
        read_only: true,
    }];

    let is_symlink = fs::symlink_metadata(&data_path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    let mirrored = source.to_string_lossy().to_string();
    if is_symlink && mirrored != WORKER_DATA_DIR {
        mounts.push(BindMount {
            source,
            target: mirrored,
            read_only: true,
        });
    }
    Ok(mounts)
}

#[cfg(unix)]
fn current_user() -> Option<String> {
    // SAFETY: getuid/getgid take no arguments and cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some(format!("{}:{}", uid, gid))
}

#[cfg(not(unix))]
fn current_user() -> Option<String> {
    None
}

fn worker_args(run_id: &str, mode: LoopMode, cfg: &LoopConfig, bypass: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "worker".into(),
        "--run-dir".into(),
        WORKER_RUN_DIR.into(),
        "--run-id".into(),
        run_id.into(),
        "--mode".into(),
        mode.to_string(),
    ];
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    match mode {
        LoopMode::Run => {
            if let Some(v) = cfg.max_cost_usd {
                push("--max-cost-usd", v.to_string());
            }
            if let Some(v) = cfg.max_time_minutes {
                push("--max-time-minutes", v.to_string());
            }
            if let Some(v) = cfg.max_tokens_total {
                push("--max-tokens-total", v.to_string());
            }
            if let Some(v) = cfg.max_iterations {
                push("--max-iterations", v.to_string());
            }
        }
        LoopMode::Resume => {
            if cfg.extend_cost_usd != 0.0 {
                push("--extend-cost-usd", cfg.extend_cost_usd.to_string());
            }
            if cfg.extend_time_minutes != 0 {
                push("--extend-time-minutes", cfg.extend_time_minutes.to_string());
            }
            if cfg.extend_tokens_total != 0 {
                push("--extend-tokens-total", cfg.extend_tokens_total.to_string());
            }
            if cfg.extend_iterations != 0 {
                push("--extend-iterations", cfg.extend_iterations.to_string());
            }
            if cfg.new_session_from_checkpoint {
                args.push("--new-session-from-checkpoint".into());
            }
        }
    }

    if bypass {
        args.push("--permission-mode-override".into());
        args.push(PERMISSION_BYPASS.into());
    }
    args
}

/// Build the container launch plan for this run mode.
///
/// Creates `<run>/.runtime_home/{.config,.cache}` on the host so the worker's
/// `HOME` and XDG directories live inside the mounted run directory.
pub fn build_container_launch_spec(
    run_dir: &Path,
    run_id: &str,
    mode: LoopMode,
    loop_config: &LoopConfig,
    execution: &ExecutionConfig,
    env: &HashMap<String, String>,
) -> Result<ContainerLaunchSpec> {
    let run_source = run_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve run directory {}", run_dir.display()))?;
    let mut mounts = vec![BindMount {
        source: run_source,
        target: WORKER_RUN_DIR.to_string(),
        read_only: false,
    }];
    mounts.extend(resolve_data_mounts(run_dir)?);

    let runtime_home = run_dir.join(RUNTIME_HOME);
    for dir in [
        runtime_home.clone(),
        runtime_home.join(".config"),
        runtime_home.join(".cache"),
    ] {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let worker_home = format!("{}/{}", WORKER_RUN_DIR, RUNTIME_HOME);
    let env_assignments = BTreeMap::from([
        ("HOME".to_string(), worker_home.clone()),
        ("XDG_CONFIG_HOME".to_string(), format!("{}/.config", worker_home)),
        ("XDG_CACHE_HOME".to_string(), format!("{}/.cache", worker_home)),
    ]);

    Ok(ContainerLaunchSpec {
        runtime: execution.runtime,
        image: execution.image.clone(),
        network: execution.network,
        workdir: WORKER_RUN_DIR.to_string(),
        mounts,
        env_passthrough: passthrough_env_names(env),
        env_assignments,
        worker_args: worker_args(run_id, mode, loop_config, execution.use_bypass_permissions),
        run_as_user: current_user(),
        allocate_tty: std::io::stdin().is_terminal() && std::io::stdout().is_terminal(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecutionMode;
    use tempfile::tempdir;

    fn execution(bypass: bool) -> ExecutionConfig {
        ExecutionConfig {
            mode: ExecutionMode::Container,
            runtime: RuntimeKind::Docker,
            image: "agent-lab-claude-runner:latest".to_string(),
            network: NetworkMode::None,
            use_bypass_permissions: bypass,
        }
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[cfg(unix)]
    #[test]
    fn test_spec_mounts_run_and_data() {
        let dir = tempdir().unwrap();
        let run_dir = dir.path().join("runs/001_test");
        fs::create_dir_all(&run_dir).unwrap();
        let data_source = dir.path().join("problems/kalshi/data");
        fs::create_dir_all(&data_source).unwrap();
        let data_source = data_source.canonicalize().unwrap();
        std::os::unix::fs::symlink(&data_source, run_dir.join("data")).unwrap();

        let cfg = LoopConfig {
            max_cost_usd: Some(5.0),
            max_iterations: Some(2),
            ..Default::default()
        };
        let spec = build_container_launch_spec(
            &run_dir,
            "001_test",
            LoopMode::Run,
            &cfg,
            &execution(true),
            &HashMap::new(),
        )
        .unwrap();

        assert_eq!(spec.workdir, WORKER_RUN_DIR);
        assert_eq!(spec.mounts[0].source, run_dir.canonicalize().unwrap());
        assert_eq!(spec.mounts[0].target, WORKER_RUN_DIR);
        assert!(!spec.mounts[0].read_only);
        assert!(
            spec.mounts
                .iter()
                .any(|m| m.target == WORKER_DATA_DIR && m.read_only)
        );
        assert!(
            spec.mounts
                .iter()
                .any(|m| m.target == data_source.to_string_lossy() && m.read_only)
        );
        assert!(spec.run_as_user.is_some());
        assert_eq!(spec.env_assignments["HOME"], "/workspace/run/.runtime_home");
        assert!(run_dir.join(".runtime_home/.config").is_dir());
        assert!(run_dir.join(".runtime_home/.cache").is_dir());

        let args = spec.worker_args.join(" ");
        assert!(args.starts_with("worker --run-dir /workspace/run --run-id 001_test --mode run"));
        assert!(args.contains("--max-cost-usd 5"));
        assert!(args.contains("--max-iterations 2"));
        assert!(args.ends_with("--permission-mode-override bypassPermissions"));

        let cmd = spec.to_command("001_test");
        assert_eq!(cmd[..4], ["docker", "run", "--rm", "--interactive"]);
        let joined = cmd.join(" ");
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--user "));
        assert!(cmd.contains(&"HOME=/workspace/run/.runtime_home".to_string()));
        assert!(cmd.contains(&"AGENT_LAB_RUN_ID=001_test".to_string()));
        assert!(cmd.contains(&"AGENT_LAB_WORKER=1".to_string()));
        let image_at = cmd.iter().position(|a| a == "agent-lab-claude-runner:latest").unwrap();
        assert_eq!(cmd[image_at - 1], WORKER_RUN_DIR);
        assert_eq!(cmd[image_at + 1], "worker");
    }

    #[test]
    fn test_spec_without_data_has_single_mount() {
        let dir = tempdir().unwrap();
        let spec = build_container_launch_spec(
            dir.path(),
            "002",
            LoopMode::Run,
            &LoopConfig::default(),
            &execution(false),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(spec.mounts.len(), 1);
        assert!(!spec.worker_args.contains(&"--permission-mode-override".to_string()));
    }

    #[test]
    fn test_resume_worker_args_carry_extensions() {
        let dir = tempdir().unwrap();
        let cfg = LoopConfig {
            extend_cost_usd: 2.5,
            extend_iterations: 3,
            new_session_from_checkpoint: true,
            max_cost_usd: Some(100.0),
            ..Default::default()
        };
        let spec = build_container_launch_spec(
            dir.path(),
            "003",
            LoopMode::Resume,
            &cfg,
            &execution(false),
            &HashMap::new(),
        )
        .unwrap();
        let args = spec.worker_args.join(" ");
        assert!(args.contains("--mode resume"));
        assert!(args.contains("--extend-cost-usd 2.5"));
        assert!(args.contains("--extend-iterations 3"));
        assert!(args.contains("--new-session-from-checkpoint"));
        assert!(!args.contains("--extend-time-minutes"));
        assert!(!args.contains("--max-cost-usd"));
    }

    #[test]
    fn test_to_command_tty_and_default_network() {
        let spec = ContainerLaunchSpec {
            runtime: RuntimeKind::Podman,
            image: "img".to_string(),
            network: NetworkMode::Default,
            workdir: WORKER_RUN_DIR.to_string(),
            mounts: vec![BindMount {
                source: PathBuf::from("/tmp/run"),
                target: WORKER_RUN_DIR.to_string(),
                read_only: false,
            }],
            env_passthrough: vec!["ANTHROPIC_API_KEY".to_string()],
            env_assignments: BTreeMap::new(),
            worker_args: vec!["worker".to_string()],
            run_as_user: Some("1000:1000".to_string()),
            allocate_tty: true,
        };
        let cmd = spec.to_command("001");
        assert_eq!(cmd[0], "podman");
        assert!(cmd.contains(&"--tty".to_string()));
        assert!(!cmd.contains(&"--network".to_string()));
        assert!(cmd.contains(&"1000:1000".to_string()));
        assert!(cmd.contains(&"/tmp/run:/workspace/run:rw".to_string()));
        let env_at = cmd.iter().position(|a| a == "ANTHROPIC_API_KEY").unwrap();
        assert_eq!(cmd[env_at - 1], "--env");
    }

    #[test]
    fn test_passthrough_includes_allow_list_and_prefix() {
        let names = passthrough_env_names(&env(&[
            ("HTTPS_PROXY", "http://proxy"),
            ("ANTHROPIC_MODEL", "x"),
            ("PATH", "/usr/bin"),
        ]));
        assert_eq!(
            names,
            vec!["ANTHROPIC_API_KEY", "ANTHROPIC_MODEL", "HTTPS_PROXY"]
        );
    }

    #[test]
    fn test_passthrough_lists_canonical_key_for_alias() {
        let names = passthrough_env_names(&env(&[(AGENT_LAB_ANTHROPIC_API_KEY_ENV, "alias-key")]));
        assert!(names.contains(&ANTHROPIC_API_KEY_ENV.to_string()));
        assert!(!names.contains(&AGENT_LAB_ANTHROPIC_API_KEY_ENV.to_string()));
    }

    #[test]
    fn test_runtime_env_promotes_alias() {
        let out = runtime_process_env(&env(&[(AGENT_LAB_ANTHROPIC_API_KEY_ENV, "alias-key")]));
        assert_eq!(out[ANTHROPIC_API_KEY_ENV], "alias-key");
    }

    #[test]
    fn test_runtime_env_keeps_canonical_precedence() {
        let out = runtime_process_env(&env(&[
            (AGENT_LAB_ANTHROPIC_API_KEY_ENV, "alias-key"),
            (ANTHROPIC_API_KEY_ENV, "canonical-key"),
        ]));
        assert_eq!(out[ANTHROPIC_API_KEY_ENV], "canonical-key");
    }
}
