//! `agent-lab scaffold`.

use agent_lab::scaffold::create_run;
use agent_lab::telemetry::init_tracing;
use anyhow::Result;
use console::style;

use super::super::Cli;
use super::lab_config;

pub fn cmd_scaffold(cli: &Cli, arch: &str, problem: &str, name: &str) -> Result<()> {
    let _guard = init_tracing(cli.verbose, None)?;
    let lab = lab_config(cli)?;

    let result = create_run(&lab, arch, problem, name)?;

    println!("Created run workspace: {}", result.run_dir.display());
    if let Some(ref target) = result.data_target {
        println!("  Linked data -> {}", target.display());
    }
    if result.brief_copied {
        println!("  Copied problem brief -> brief.md");
    }
    println!("  Generated .claude/CLAUDE.md");
    println!("  Wrote run_manifest.yaml");
    println!();
    println!(
        "{} {}",
        style("Run workspace ready:").green().bold(),
        result.run_id
    );
    println!("  agent-lab run --name {}", result.run_id);
    Ok(())
}
