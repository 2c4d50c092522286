use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

pub const RESEARCH_DIR: &str = "research";
pub const CHECKPOINTS_DIR: &str = "checkpoints";
pub const LATEST_CHECKPOINT: &str = "latest_precompact.md";
pub const TAIL_LINES: usize = 40;

/// Research memory files the agent keeps up to date, with their seed headings.
const MEMORY_FILES: [(&str, &str); 4] = [
    ("findings.md", "# Findings\n\n"),
    ("open_questions.md", "# Open Questions\n\n"),
    ("strategies.md", "# Strategies\n\n"),
    ("current_round/summary.md", "# Current Round Summary\n\n"),
];

/// Values stamped into a checkpoint header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointSnapshot {
    pub run_id: String,
    pub iteration: u64,
    pub session_id: Option<String>,
    pub cumulative_cost_usd: f64,
    pub cumulative_tokens: u64,
}

pub fn checkpoints_dir(run_dir: &Path) -> PathBuf {
    run_dir.join(RESEARCH_DIR).join(CHECKPOINTS_DIR)
}

/// Create the research layout and seed any missing memory file with its heading.
///
/// Existing files are never touched.
pub fn ensure_research_files(run_dir: &Path) -> Result<()> {
    let research = run_dir.join(RESEARCH_DIR);
    for dir in [
        research.clone(),
        research.join("current_round"),
        research.join(CHECKPOINTS_DIR),
        run_dir.join("logs"),
    ] {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    for (name, heading) in MEMORY_FILES {
        let path = research.join(name);
        if !path.exists() {
            fs::write(&path, heading)
                .with_context(|| format!("Failed to seed {}", path.display()))?;
        }
    }
    Ok(())
}

/// Last `max_lines` lines of a file, or `_missing_` / `_empty_` placeholders.
pub fn read_file_tail(path: &Path, max_lines: usize) -> String {
    let Ok(content) = fs::read_to_string(path) else {
        return "_missing_".to_string();
    };
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return "_empty_".to_string();
    }
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

fn render_checkpoint(run_dir: &Path, snapshot: &CheckpointSnapshot, trigger: &str) -> String {
    let research = run_dir.join(RESEARCH_DIR);
    let tail = |name: &str| read_file_tail(&research.join(name), TAIL_LINES);

    format!(
        "# Pre-Compaction Checkpoint\n\
         \n\
         - Timestamp: {timestamp}\n\
         - Run: {run_id}\n\
         - Iteration: {iteration}\n\
         - Session ID: {session}\n\
         - Trigger: {trigger}\n\
         - Cumulative cost (USD): {cost:.6}\n\
         - Cumulative tokens: {tokens}\n\
         \n\
         ## Current Round Summary (tail)\n\n```\n{summary}\n```\n\n\
         ## Findings (tail)\n\n```\n{findings}\n```\n\n\
         ## Open Questions (tail)\n\n```\n{questions}\n```\n\n\
         ## Strategies (tail)\n\n```\n{strategies}\n```\n",
        timestamp = Utc::now().to_rfc3339(),
        run_id = snapshot.run_id,
        iteration = snapshot.iteration,
        session = snapshot.session_id.as_deref().unwrap_or("_none_"),
        trigger = trigger,
        cost = snapshot.cumulative_cost_usd,
        tokens = snapshot.cumulative_tokens,
        summary = tail("current_round/summary.md"),
        findings = tail("findings.md"),
        questions = tail("open_questions.md"),
        strategies = tail("strategies.md"),
    )
}

/// Snapshot research memory into `research/checkpoints/`.
///
/// Writes a timestamped `precompact_<YYYYmmdd_HHMMSS>.md` and overwrites
/// `latest_precompact.md` with the same content. Returns the timestamped path.
pub fn write_precompact_checkpoint(
    run_dir: &Path,
    snapshot: &CheckpointSnapshot,
    trigger: &str,
) -> Result<PathBuf> {
    let dir = checkpoints_dir(run_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create checkpoint directory {}", dir.display()))?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("precompact_{}.md", stamp));
    let content = render_checkpoint(run_dir, snapshot, trigger);

    fs::write(&path, &content)
        .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
    let latest = dir.join(LATEST_CHECKPOINT);
    fs::write(&latest, &content)
        .with_context(|| format!("Failed to write checkpoint {}", latest.display()))?;
    Ok(path)
}
