//! Scaffolding of isolated run workspaces.
//!
//! `agent-lab scaffold` creates a numbered directory under `runs/`:
//!
//! ```text
//! runs/003_baseline/
//! ├── run_manifest.yaml     # architecture config frozen at scaffold time
//! ├── brief.md              # copy of problems/<problem>/problem.md
//! ├── data -> /abs/problems/<problem>/data
//! ├── .claude/CLAUDE.md     # workspace instructions for the agent
//! ├── src/  tests/  logs/
//! ├── results/strategies.csv
//! └── research/
//!     ├── current_round/
//!     └── checkpoints/
//! ```

use crate::config::LabConfig;
use crate::manifest::{
    ArchitectureInfo, MANIFEST_SCHEMA_VERSION, RunInfo, RunManifest, load_architecture,
    write_run_manifest,
};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const STRATEGIES_HEADER: &str = "strategy_name,taker_side,category,fee_type,time_bucket,price_min,price_max,confidence,rationale\n";

const STANDARD_DIRS: [&str; 6] = [
    "src",
    "tests",
    "results",
    "research/current_round",
    "research/checkpoints",
    "logs",
];

/// What `create_run` produced.
#[derive(Debug)]
pub struct ScaffoldResult {
    pub run_dir: PathBuf,
    pub run_id: String,
    /// Absolute target of the `data` symlink, if the problem ships data.
    pub data_target: Option<PathBuf>,
    pub brief_copied: bool,
}

/// Next free run number: one past the highest numeric prefix under `runs_dir`.
fn next_run_number(runs_dir: &Path) -> Result<u32> {
    if !runs_dir.exists() {
        return Ok(1);
    }
    let mut highest = 0;
    for entry in fs::read_dir(runs_dir)
        .with_context(|| format!("Failed to read {}", runs_dir.display()))?
    {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(n) = digits.parse::<u32>() {
            highest = highest.max(n);
        }
    }
    Ok(highest + 1)
}

fn title_case(name: &str) -> String {
    name.split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn workspace_instructions(problem: &str) -> String {
    format!(
        r#"# {title} Analysis Workspace

You are analyzing the problem described in `brief.md` to discover and validate strategies.

## Data Access
- Problem data is mounted read-only at `data/`
- See `brief.md` for dataset schema and analysis guidelines

## Where to Write
- Analysis and simulation code: `src/`
- Tests: `tests/`
- Research memory: `research/` (findings, open questions, strategies, current round)
- Results: `results/strategies.csv` (required output format)

## Expected Output
Your final output must include `results/strategies.csv` with columns:
{columns}"#,
        title = title_case(problem),
        columns = STRATEGIES_HEADER.replace(',', ", "),
    )
}

#[cfg(unix)]
fn link_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn link_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Create a new run workspace for `problem` using architecture `arch`.
pub fn create_run(lab: &LabConfig, arch: &str, problem: &str, name: &str) -> Result<ScaffoldResult> {
    let problem_dir = lab.problems_dir.join(problem);
    if !problem_dir.is_dir() {
        bail!("Problem not found: {}", problem_dir.display());
    }
    let (arch_path, arch_config) = load_architecture(&lab.architectures_dir, arch)?;

    let run_id = format!("{:03}_{}", next_run_number(&lab.runs_dir)?, name);
    let run_dir = lab.runs_dir.join(&run_id);
    fs::create_dir_all(&lab.runs_dir)
        .with_context(|| format!("Failed to create {}", lab.runs_dir.display()))?;
    fs::create_dir(&run_dir)
        .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;
    info!(run_id = %run_id, arch, problem, "Scaffolding run workspace");

    let data_source = problem_dir.join("data");
    let data_target = if data_source.exists() {
        let target = data_source
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", data_source.display()))?;
        link_dir(&target, &run_dir.join("data"))
            .with_context(|| format!("Failed to link data -> {}", target.display()))?;
        Some(target)
    } else {
        None
    };

    let problem_md = problem_dir.join("problem.md");
    let brief_copied = problem_md.exists();
    if brief_copied {
        fs::copy(&problem_md, run_dir.join("brief.md"))
            .with_context(|| format!("Failed to copy {}", problem_md.display()))?;
    }

    for dir in STANDARD_DIRS {
        fs::create_dir_all(run_dir.join(dir))
            .with_context(|| format!("Failed to create {}/{}", run_dir.display(), dir))?;
    }

    let claude_dir = run_dir.join(".claude");
    fs::create_dir_all(&claude_dir)?;
    fs::write(claude_dir.join("CLAUDE.md"), workspace_instructions(problem))
        .context("Failed to write .claude/CLAUDE.md")?;
    fs::write(run_dir.join("results/strategies.csv"), STRATEGIES_HEADER)
        .context("Failed to write results/strategies.csv")?;

    let manifest = RunManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        run: RunInfo {
            id: run_id.clone(),
            name: name.to_string(),
            problem: problem.to_string(),
            created_at: Utc::now().to_rfc3339(),
            run_dir: run_dir.display().to_string(),
        },
        architecture: ArchitectureInfo {
            name: arch.to_string(),
            source: arch_path
                .strip_prefix(&lab.lab_root)
                .unwrap_or(&arch_path)
                .display()
                .to_string(),
            config: arch_config,
        },
    };
    write_run_manifest(&run_dir, &manifest)?;

    Ok(ScaffoldResult {
        run_dir,
        run_id,
        data_target,
        brief_copied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::load_run_manifest;
    use tempfile::tempdir;

    fn lab() -> (tempfile::TempDir, LabConfig) {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("problems/kalshi/data")).unwrap();
        fs::write(root.join("problems/kalshi/problem.md"), "# Kalshi\n").unwrap();
        fs::create_dir_all(root.join("architectures/ralph_loop")).unwrap();
        fs::write(
            root.join("architectures/ralph_loop/arch.yaml"),
            "agent:\n  provider: claude\nhyperparameters:\n  max_iterations: 5\n",
        )
        .unwrap();
        fs::write(
            root.join("architectures/flat.yaml"),
            "agent:\n  provider: claude\nlimits:\n  max_cost_usd: 2.5\n",
        )
        .unwrap();
        let lab = LabConfig::from_root(root).unwrap();
        (dir, lab)
    }

    #[test]
    fn test_create_run_layout() {
        let (_dir, lab) = lab();
        let result = create_run(&lab, "ralph_loop", "kalshi", "baseline").unwrap();

        assert_eq!(result.run_id, "001_baseline");
        let run_dir = &result.run_dir;
        for dir in STANDARD_DIRS {
            assert!(run_dir.join(dir).is_dir(), "missing {}", dir);
        }
        assert_eq!(fs::read_to_string(run_dir.join("brief.md")).unwrap(), "# Kalshi\n");
        assert!(result.brief_copied);
        assert_eq!(
            fs::read_link(run_dir.join("data")).unwrap(),
            lab.problems_dir.join("kalshi/data")
        );
        assert_eq!(
            fs::read_to_string(run_dir.join("results/strategies.csv")).unwrap(),
            STRATEGIES_HEADER
        );
        let instructions = fs::read_to_string(run_dir.join(".claude/CLAUDE.md")).unwrap();
        assert!(instructions.starts_with("# Kalshi Analysis Workspace"));

        let manifest = load_run_manifest(run_dir).unwrap();
        assert_eq!(manifest.run.id, "001_baseline");
        assert_eq!(manifest.run.problem, "kalshi");
        assert_eq!(manifest.architecture.name, "ralph_loop");
        assert_eq!(manifest.architecture.source, "architectures/ralph_loop/arch.yaml");
        assert_eq!(manifest.limits().max_iterations, Some(5));
    }

    #[test]
    fn test_run_numbers_increase() {
        let (_dir, lab) = lab();
        fs::create_dir_all(lab.runs_dir.join("007_old")).unwrap();
        fs::create_dir_all(lab.runs_dir.join("notes")).unwrap();
        let result = create_run(&lab, "flat", "kalshi", "next").unwrap();
        assert_eq!(result.run_id, "008_next");
        let manifest = load_run_manifest(&result.run_dir).unwrap();
        assert_eq!(manifest.limits().max_cost_usd, Some(2.5));
    }

    #[test]
    fn test_missing_problem_or_architecture() {
        let (_dir, lab) = lab();
        let err = create_run(&lab, "ralph_loop", "nope", "x").unwrap_err();
        assert!(err.to_string().contains("Problem not found"));
        let err = create_run(&lab, "missing", "kalshi", "x").unwrap_err();
        assert!(err.to_string().contains("Architecture not found: missing"));
        assert!(!lab.runs_dir.exists());
    }

    #[test]
    fn test_problem_without_data_or_brief() {
        let (_dir, lab) = lab();
        fs::create_dir_all(lab.problems_dir.join("bare")).unwrap();
        let result = create_run(&lab, "flat", "bare", "plain").unwrap();
        assert!(result.data_target.is_none());
        assert!(!result.brief_copied);
        assert!(!result.run_dir.join("data").exists());
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("kalshi"), "Kalshi");
        assert_eq!(title_case("sports_betting-odds"), "Sports Betting Odds");
    }
}
