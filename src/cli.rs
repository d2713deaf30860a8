//! Thin `clap` command tree. Parses flags and calls into the core
//! components; no orchestration logic lives here.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::NetworkModeName;

#[derive(Debug, Parser)]
#[command(name = "coi", about = "Isolated, resumable sandboxes for AI coding agents", version)]
pub struct Cli {
    /// Path to a config.toml overriding the default `~/.config/coi/config.toml`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start (or resume, if a session already exists for this workspace) an agent session.
    Start(StartArgs),

    /// List known sessions and their container/status.
    List(ListArgs),

    /// Resume a specific saved session by id.
    Resume(ResumeArgs),

    /// Stop a running container without deleting its saved state.
    Stop(TargetArgs),

    /// Delete a container and, unless `--keep-session` is given, its saved state.
    Rm(RmArgs),

    /// Print detailed information about one session.
    Info(TargetArgs),
}

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Workspace directory to mount and hash for naming. Defaults to the current directory.
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Agent CLI to run inside the container.
    #[arg(long)]
    pub tool: Option<String>,

    /// Container image reference passed to the hypervisor's `launch`/`init`.
    #[arg(long)]
    pub image: Option<String>,

    /// Keep the container running (and its agent state inside it) after exit.
    #[arg(long)]
    pub persistent: bool,

    #[arg(long, value_enum)]
    pub network: Option<NetworkModeArg>,

    /// Domains to allow when `--network allowlist` is set. Repeatable.
    #[arg(long = "allow-domain")]
    pub allow_domains: Vec<String>,

    #[arg(long)]
    pub allow_local_network_access: bool,

    /// Request a specific slot instead of taking the lowest free one.
    #[arg(long)]
    pub slot: Option<u32>,

    /// Attach interactively instead of running in the background.
    #[arg(long)]
    pub interactive: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum NetworkModeArg {
    Open,
    Restricted,
    Allowlist,
}

impl From<NetworkModeArg> for NetworkModeName {
    fn from(value: NetworkModeArg) -> Self {
        match value {
            NetworkModeArg::Open => NetworkModeName::Open,
            NetworkModeArg::Restricted => NetworkModeName::Restricted,
            NetworkModeArg::Allowlist => NetworkModeName::Allowlist,
        }
    }
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only list sessions for this tool; defaults to every known tool.
    #[arg(long)]
    pub tool: Option<String>,
}

#[derive(Debug, Args)]
pub struct ResumeArgs {
    pub session_id: String,

    #[arg(long)]
    pub interactive: bool,
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    pub session_id: String,
}

#[derive(Debug, Args)]
pub struct RmArgs {
    pub session_id: String,

    #[arg(long)]
    pub keep_session: bool,
}
