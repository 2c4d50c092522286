use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "agent-lab")]
#[command(version, about = "Resumable outer-loop orchestrator for long-running agent research runs")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Lab root containing runs/, problems/ and architectures/ (defaults to $AGENT_LAB_ROOT or the current directory)
    #[arg(long, global = true)]
    pub lab_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Absolute ceilings applied when a run starts.
#[derive(Args, Debug, Clone, Default)]
pub struct LimitArgs {
    /// Override max cost limit
    #[arg(long)]
    pub max_cost_usd: Option<f64>,
    /// Override max wall time limit
    #[arg(long)]
    pub max_time_minutes: Option<u64>,
    /// Override max total token limit
    #[arg(long)]
    pub max_tokens_total: Option<u64>,
    /// Override max outer-loop iterations
    #[arg(long)]
    pub max_iterations: Option<u64>,
}

/// Additive extensions applied when a run resumes.
#[derive(Args, Debug, Clone, Default)]
pub struct ExtendArgs {
    /// Add to the max cost limit
    #[arg(long, default_value_t = 0.0)]
    pub extend_cost_usd: f64,
    /// Add to the max wall time limit
    #[arg(long, default_value_t = 0)]
    pub extend_time_minutes: u64,
    /// Add to the max total token limit
    #[arg(long, default_value_t = 0)]
    pub extend_tokens_total: u64,
    /// Add to the max outer-loop iterations
    #[arg(long, default_value_t = 0)]
    pub extend_iterations: u64,
    /// Drop the session id and start a fresh agent session seeded from the research memory
    #[arg(long)]
    pub new_session_from_checkpoint: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ExecutionArgs {
    /// Execution mode override; auto uses the architecture config
    #[arg(long, default_value = "auto", value_parser = ["auto", "host", "container"])]
    pub execution_mode: String,
    /// Override container runtime when using container mode
    #[arg(long, value_parser = ["docker", "podman"])]
    pub container_runtime: Option<String>,
    /// Override container network mode
    #[arg(long, value_parser = ["none", "default"])]
    pub container_network: Option<String>,
    /// Run the containerized agent with bypassPermissions
    #[arg(long, overrides_with = "no_use_bypass_permissions")]
    pub use_bypass_permissions: bool,
    /// Keep the architecture's permission mode inside the container
    #[arg(long, overrides_with = "use_bypass_permissions")]
    pub no_use_bypass_permissions: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an isolated run workspace
    Scaffold {
        /// Architecture name (e.g., ralph_loop)
        #[arg(long)]
        arch: String,
        /// Problem name (e.g., kalshi)
        #[arg(long)]
        problem: String,
        /// Run name (e.g., baseline_test)
        #[arg(long)]
        name: String,
    },
    /// Start the outer loop on a freshly scaffolded run
    Run {
        /// Run id, path, or name suffix (e.g., 002_ralph)
        #[arg(long)]
        name: String,
        #[command(flatten)]
        limits: LimitArgs,
        #[command(flatten)]
        execution: ExecutionArgs,
    },
    /// Continue a stopped or failed run, optionally extending its budgets
    Resume {
        /// Run id, path, or name suffix
        #[arg(long)]
        name: String,
        #[command(flatten)]
        extend: ExtendArgs,
        #[command(flatten)]
        execution: ExecutionArgs,
    },
    /// Internal command executed inside the containerized worker
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        run_id: String,
        #[arg(long, value_parser = ["run", "resume"])]
        mode: String,
        #[command(flatten)]
        limits: LimitArgs,
        #[command(flatten)]
        extend: ExtendArgs,
        #[arg(long)]
        permission_mode_override: Option<String>,
    },
    /// Show the persisted state of a run
    Status {
        /// Run id, path, or name suffix
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Scaffold {
            arch,
            problem,
            name,
        } => cmd::cmd_scaffold(&cli, arch, problem, name),
        Commands::Run {
            name,
            limits,
            execution,
        } => cmd::cmd_run(&cli, name, limits, execution).await,
        Commands::Resume {
            name,
            extend,
            execution,
        } => cmd::cmd_resume(&cli, name, extend, execution).await,
        Commands::Worker {
            run_dir,
            run_id,
            mode,
            limits,
            extend,
            permission_mode_override,
        } => {
            cmd::cmd_worker(
                &cli,
                run_dir,
                run_id,
                mode,
                limits,
                extend,
                permission_mode_override.clone(),
            )
            .await
        }
        Commands::Status { name } => cmd::cmd_status(&cli, name),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", console::style("Error:").red().bold(), e);
        std::process::exit(1);
    }
    Ok(())
}
