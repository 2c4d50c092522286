//! CLI command implementations.
//!
//! | Module     | Commands handled               |
//! |------------|--------------------------------|
//! | `run`      | `Run`, `Resume`, `Worker`      |
//! | `scaffold` | `Scaffold`                     |
//! | `status`   | `Status`                       |

pub mod run;
pub mod scaffold;
pub mod status;

pub use run::{cmd_resume, cmd_run, cmd_worker};
pub use scaffold::cmd_scaffold;
pub use status::cmd_status;

use agent_lab::config::LabConfig;
use anyhow::Result;

use super::Cli;

pub(crate) fn lab_config(cli: &Cli) -> Result<LabConfig> {
    let lab = LabConfig::load(cli.lab_root.clone())?;
    // Only the lab root's .env is considered, and it may be absent.
    if dotenvy::from_path(lab.lab_root.join(".env")).is_ok() {
        return LabConfig::from_root(&lab.lab_root);
    }
    Ok(lab)
}
