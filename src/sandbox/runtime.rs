use super::RuntimeKind;
use crate::errors::LaunchError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Arguments for one `build` call against the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuild {
    pub dockerfile: PathBuf,
    pub image: String,
    /// `KEY=VALUE` label stamped on the built image.
    pub label: String,
    pub context: PathBuf,
}

/// The container runtime CLI as seen by the launcher.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Fail with [`LaunchError::RuntimeNotFound`] when the runtime is unavailable.
    fn verify(&self) -> Result<(), LaunchError>;

    /// Labels of a local image, or `None` when the image does not exist.
    async fn inspect_labels(&self, image: &str) -> Result<Option<HashMap<String, String>>>;

    /// Build an image and return the runtime's exit code.
    async fn build(&self, build: &ImageBuild) -> Result<i32>;

    /// Execute a full argv (starting with the runtime binary) with stdio inherited.
    async fn run(&self, argv: &[String], env: &HashMap<String, String>) -> Result<i32>;
}

/// Look up `binary` on `PATH`, or accept it as given when it is a path to a file.
pub fn verify_runtime(binary: &str) -> Result<PathBuf, LaunchError> {
    let not_found = || LaunchError::RuntimeNotFound {
        runtime: binary.to_string(),
    };
    let direct = Path::new(binary);
    if direct.components().count() > 1 {
        return if direct.is_file() {
            Ok(direct.to_path_buf())
        } else {
            Err(not_found())
        };
    }
    let path = std::env::var_os("PATH").ok_or_else(not_found)?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
        .ok_or_else(not_found)
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// `docker` or `podman` driven through its command line.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    kind: RuntimeKind,
}

impl CliRuntime {
    pub fn new(kind: RuntimeKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        self.kind.binary()
    }

    fn verify(&self) -> Result<(), LaunchError> {
        verify_runtime(self.kind.binary()).map(|_| ())
    }

    async fn inspect_labels(&self, image: &str) -> Result<Option<HashMap<String, String>>> {
        let output = Command::new(self.kind.binary())
            .args(["image", "inspect", image])
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {} image inspect", self.kind))?;
        if !output.status.success() {
            debug!(image, "Image not present locally");
            return Ok(None);
        }

        let parsed: Value = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Failed to parse image inspect output for {}", image))?;
        let labels = parsed
            .get(0)
            .and_then(|entry| entry.get("Config"))
            .and_then(|config| config.get("Labels"))
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(labels))
    }

    async fn build(&self, build: &ImageBuild) -> Result<i32> {
        let status = Command::new(self.kind.binary())
            .arg("build")
            .arg("-f")
            .arg(&build.dockerfile)
            .args(["-t", &build.image, "--label", &build.label])
            .arg(&build.context)
            .status()
            .await
            .with_context(|| format!("Failed to run {} build", self.kind))?;
        Ok(exit_code(status))
    }

    async fn run(&self, argv: &[String], env: &HashMap<String, String>) -> Result<i32> {
        let (program, args) = argv
            .split_first()
            .context("Container command is empty")?;
        let status = Command::new(program)
            .args(args)
            .env_clear()
            .envs(env)
            .status()
            .await
            .with_context(|| format!("Failed to run {}", program))?;
        Ok(exit_code(status))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory runtime that records every call.
    #[derive(Default)]
    pub struct RecordingRuntime {
        pub labels: Option<HashMap<String, String>>,
        pub build_exit: i32,
        pub run_exit: i32,
        pub available: bool,
        pub builds: Mutex<Vec<ImageBuild>>,
        pub runs: Mutex<Vec<(Vec<String>, HashMap<String, String>)>>,
        /// Invoked on `run`, to stand in for the worker's side effects.
        pub on_run: Option<Box<dyn Fn() + Send + Sync>>,
    }

    impl RecordingRuntime {
        pub fn with_image(labels: &[(&str, &str)]) -> Self {
            Self {
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                available: true,
                ..Default::default()
            }
        }

        pub fn without_image() -> Self {
            Self {
                available: true,
                ..Default::default()
            }
        }

        pub fn build_count(&self) -> usize {
            self.builds.lock().unwrap().len()
        }

        pub fn run_calls(&self) -> Vec<(Vec<String>, HashMap<String, String>)> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        fn name(&self) -> &str {
            "docker"
        }

        fn verify(&self) -> Result<(), LaunchError> {
            if self.available {
                Ok(())
            } else {
                Err(LaunchError::RuntimeNotFound {
                    runtime: "docker".to_string(),
                })
            }
        }

        async fn inspect_labels(&self, _image: &str) -> Result<Option<HashMap<String, String>>> {
            Ok(self.labels.clone())
        }

        async fn build(&self, build: &ImageBuild) -> Result<i32> {
            self.builds.lock().unwrap().push(build.clone());
            Ok(self.build_exit)
        }

        async fn run(&self, argv: &[String], env: &HashMap<String, String>) -> Result<i32> {
            self.runs.lock().unwrap().push((argv.to_vec(), env.clone()));
            if let Some(ref hook) = self.on_run {
                hook();
            }
            Ok(self.run_exit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_runtime_missing_binary() {
        let err = verify_runtime("definitely-not-a-container-runtime-xyz").unwrap_err();
        assert!(matches!(err, LaunchError::RuntimeNotFound { ref runtime } if runtime == "definitely-not-a-container-runtime-xyz"));
        assert!(err.to_string().contains("--execution-mode host"));
    }

    #[cfg(unix)]
    #[test]
    fn test_verify_runtime_finds_sh() {
        assert!(verify_runtime("sh").is_ok());
    }

    #[test]
    fn test_verify_runtime_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("docker");
        std::fs::write(&fake, "").unwrap();
        assert_eq!(verify_runtime(fake.to_str().unwrap()).unwrap(), fake);
        assert!(verify_runtime(dir.path().join("podman").to_str().unwrap()).is_err());
    }

    #[test]
    fn test_cli_runtime_name() {
        assert_eq!(CliRuntime::new(RuntimeKind::Podman).name(), "podman");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_run_reports_exit_code() {
        let runtime = CliRuntime::new(RuntimeKind::Docker);
        let argv = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let env = HashMap::from([("PATH".to_string(), std::env::var("PATH").unwrap())]);
        assert_eq!(runtime.run(&argv, &env).await.unwrap(), 3);
    }
}
