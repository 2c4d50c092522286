//! Prompts handed to the agent service on each iteration.

/// Research memory files the agent must keep current, relative to the run directory.
pub const MEMORY_FILES: [&str; 4] = [
    "research/findings.md",
    "research/open_questions.md",
    "research/strategies.md",
    "research/current_round/summary.md",
];

pub fn build_system_prompt() -> String {
    "You are an autonomous quantitative research agent working through a problem brief \
     (brief.md) in this run directory. You must iteratively investigate, implement, run \
     analyses/backtests, and update persistent research memory files in this repository."
        .to_string()
}

/// The per-iteration instruction. Depends only on the iteration number.
pub fn build_iteration_prompt(iteration: u64) -> String {
    let memory: String = MEMORY_FILES
        .iter()
        .map(|f| format!("   - {}\n", f))
        .collect();

    format!(
        r#"Continue the iterative research loop (iteration {iteration}).

Required steps this iteration:
1) Ask one concrete next research question from current evidence.
2) Implement or refine code required to answer it.
3) Run analysis/simulation commands and inspect outputs.
4) Save artifacts (figures/csv/text) in the run workspace.
5) Update persistent memory files:
{memory}6) If a promising strategy is found/refined, update results/strategies.csv.
7) End with concise bullets:
   - Findings
   - Strategy implications
   - Next hypothesis

Constraints:
- Keep methods reproducible and deterministic where possible.
- Use the existing project code patterns and tests.
- Do not skip artifact updates.
"#
    )
}
