use super::runtime::{ContainerRuntime, ImageBuild};
use crate::audit::RunLogger;
use crate::errors::LaunchError;
use anyhow::{Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

/// Image label carrying the fingerprint of the inputs the image was built from.
pub const FINGERPRINT_LABEL: &str = "io.agent_lab.runner_fingerprint";

const SKIPPED_DIRS: [&str; 4] = ["target", ".git", "node_modules", "__pycache__"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageStatus {
    Reused,
    /// Built because the image was `missing` or `stale`.
    Built { reason: &'static str },
}

fn collect_files(lab_root: &Path, input: &Path) -> Result<Vec<PathBuf>> {
    if !input.exists() {
        return Err(LaunchError::ImageInputMissing {
            path: input.to_path_buf(),
        }
        .into());
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(input).into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && SKIPPED_DIRS
                .iter()
                .any(|skip| entry.file_name() == std::ffi::OsStr::new(skip)))
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", input.display()))?;
        if entry.file_type().is_file() {
            files.push(
                entry
                    .path()
                    .strip_prefix(lab_root)
                    .unwrap_or(entry.path())
                    .to_path_buf(),
            );
        }
    }
    Ok(files)
}

/// SHA-256 over every file under `inputs`, visited in sorted relative-path order.
///
/// Each file contributes its lab-relative path and its bytes, so renames change
/// the fingerprint as well as edits.
pub fn compute_fingerprint(lab_root: &Path, inputs: &[PathBuf]) -> Result<String> {
    let mut files = Vec::new();
    for input in inputs {
        let absolute = if input.is_absolute() {
            input.clone()
        } else {
            lab_root.join(input)
        };
        files.extend(collect_files(lab_root, &absolute)?);
    }
    files.sort();
    files.dedup();

    let mut hasher = Sha256::new();
    for rel in &files {
        let path = lab_root.join(rel);
        let bytes =
            std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(&bytes);
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Reuse `image` when its fingerprint label matches, otherwise build it once.
pub async fn ensure_fresh_image(
    runtime: &dyn ContainerRuntime,
    image: &str,
    dockerfile: &Path,
    context: &Path,
    fingerprint: &str,
    logger: &RunLogger,
) -> Result<ImageStatus> {
    let labels = runtime.inspect_labels(image).await?;
    let current = labels
        .as_ref()
        .and_then(|l| l.get(FINGERPRINT_LABEL))
        .cloned();

    if current.as_deref() == Some(fingerprint) {
        logger.append_event(
            "launcher.container.image.reuse",
            None,
            json!({"runtime": runtime.name(), "image": image, "fingerprint": fingerprint}),
        )?;
        info!(image, "Reusing runner image");
        return Ok(ImageStatus::Reused);
    }

    let reason = if labels.is_none() { "missing" } else { "stale" };
    logger.append_event(
        "launcher.container.image.build_start",
        None,
        json!({
            "runtime": runtime.name(),
            "image": image,
            "reason": reason,
            "current_fingerprint": current,
            "desired_fingerprint": fingerprint,
        }),
    )?;
    info!(image, reason, "Building runner image");

    let exit_code = runtime
        .build(&ImageBuild {
            dockerfile: dockerfile.to_path_buf(),
            image: image.to_string(),
            label: format!("{}={}", FINGERPRINT_LABEL, fingerprint),
            context: context.to_path_buf(),
        })
        .await?;
    logger.append_event(
        "launcher.container.image.build_finish",
        None,
        json!({
            "runtime": runtime.name(),
            "image": image,
            "exit_code": exit_code,
            "reason": reason,
            "desired_fingerprint": fingerprint,
        }),
    )?;

    if exit_code != 0 {
        return Err(LaunchError::ImageBuildFailed {
            image: image.to_string(),
            exit_code,
        }
        .into());
    }
    Ok(ImageStatus::Built { reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::read_events;
    use crate::sandbox::runtime::testing::RecordingRuntime;
    use std::fs;
    use tempfile::tempdir;

    fn lab() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docker")).unwrap();
        fs::write(dir.path().join("docker/runner.Dockerfile"), "FROM rust\n").unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::write(dir.path().join("src/nested/a.rs"), "// a\n").unwrap();
        dir
    }

    fn inputs() -> Vec<PathBuf> {
        vec![PathBuf::from("docker/runner.Dockerfile"), PathBuf::from("src")]
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let dir = lab();
        let first = compute_fingerprint(dir.path(), &inputs()).unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(first, compute_fingerprint(dir.path(), &inputs()).unwrap());

        fs::write(dir.path().join("src/nested/a.rs"), "// b\n").unwrap();
        assert_ne!(first, compute_fingerprint(dir.path(), &inputs()).unwrap());
    }

    #[test]
    fn test_fingerprint_ignores_build_output() {
        let dir = lab();
        let before = compute_fingerprint(dir.path(), &inputs()).unwrap();
        fs::create_dir_all(dir.path().join("src/target")).unwrap();
        fs::write(dir.path().join("src/target/junk.o"), "bin").unwrap();
        assert_eq!(before, compute_fingerprint(dir.path(), &inputs()).unwrap());
    }

    #[test]
    fn test_fingerprint_missing_input_errors() {
        let dir = lab();
        let err = compute_fingerprint(dir.path(), &[PathBuf::from("nope")]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LaunchError>(),
            Some(LaunchError::ImageInputMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_matching_fingerprint_reuses_image() {
        let dir = lab();
        let logger = RunLogger::new(dir.path()).unwrap();
        let runtime = RecordingRuntime::with_image(&[(FINGERPRINT_LABEL, "abc")]);
        let status = ensure_fresh_image(
            &runtime,
            "img",
            &dir.path().join("docker/runner.Dockerfile"),
            dir.path(),
            "abc",
            &logger,
        )
        .await
        .unwrap();
        assert_eq!(status, ImageStatus::Reused);
        assert_eq!(runtime.build_count(), 0);
        let events = read_events(dir.path()).unwrap();
        assert_eq!(events[0].event_type, "launcher.container.image.reuse");
    }

    #[tokio::test]
    async fn test_stale_image_is_rebuilt_once() {
        let dir = lab();
        let logger = RunLogger::new(dir.path()).unwrap();
        let runtime = RecordingRuntime::with_image(&[(FINGERPRINT_LABEL, "old")]);
        let status = ensure_fresh_image(
            &runtime,
            "img",
            &dir.path().join("docker/runner.Dockerfile"),
            dir.path(),
            "new",
            &logger,
        )
        .await
        .unwrap();
        assert_eq!(status, ImageStatus::Built { reason: "stale" });
        assert_eq!(runtime.build_count(), 1);
        let build = runtime.builds.lock().unwrap()[0].clone();
        assert_eq!(build.label, format!("{}=new", FINGERPRINT_LABEL));

        let events = read_events(dir.path()).unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec![
            "launcher.container.image.build_start",
            "launcher.container.image.build_finish"
        ]);
        assert_eq!(events[0].payload["current_fingerprint"], "old");
    }

    #[tokio::test]
    async fn test_missing_image_build_failure() {
        let dir = lab();
        let logger = RunLogger::new(dir.path()).unwrap();
        let runtime = RecordingRuntime {
            build_exit: 2,
            ..RecordingRuntime::without_image()
        };
        let err = ensure_fresh_image(
            &runtime,
            "img",
            &dir.path().join("docker/runner.Dockerfile"),
            dir.path(),
            "new",
            &logger,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LaunchError>(),
            Some(LaunchError::ImageBuildFailed { exit_code: 2, .. })
        ));
        let events = read_events(dir.path()).unwrap();
        assert_eq!(events[0].payload["reason"], "missing");
        assert_eq!(events[1].payload["exit_code"], 2);
    }
}
