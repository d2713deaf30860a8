use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{fmt, EnvFilter};

use coi::cli::{Cli, Command, ListArgs, RmArgs, StartArgs, TargetArgs};
use coi::config::{self, Config};
use coi::container::ContainerManager;
use coi::hypervisor::HypervisorDriver;
use coi::network::{NetworkConfig, NetworkMode};
use coi::orchestrator::{SessionOrchestrator, StartRequest};
use coi::session_store::SessionStore;
use coi::tool;

fn host_term() -> String {
    std::env::var("TERM").unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let raw = config::load_file(cli.config.as_deref())?;
    let settings = config::resolve(raw);

    if let Err(e) = dispatch(cli.command, settings).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn network_mode(settings: &Config, override_: Option<coi::cli::NetworkModeArg>) -> NetworkMode {
    use coi::config::NetworkModeName;

    let name = override_.map(Into::into).unwrap_or(settings.network_mode);
    match name {
        NetworkModeName::Open => NetworkMode::Open,
        NetworkModeName::Restricted => NetworkMode::Restricted {
            allow_local_network_access: settings.allow_local_network_access,
        },
        NetworkModeName::Allowlist => NetworkMode::Allowlist {
            domains: settings.allowlist_domains.clone(),
            allow_local_network_access: settings.allow_local_network_access,
        },
    }
}

async fn dispatch(command: Command, settings: Config) -> Result<()> {
    let driver = HypervisorDriver::new(settings.hypervisor_bin.clone());

    match command {
        Command::Start(args) => start(args, settings, driver).await,
        Command::List(args) => list(args, settings),
        Command::Resume(args) => resume(args, settings, driver).await,
        Command::Stop(args) => stop(args, settings, driver),
        Command::Rm(args) => rm(args, settings, driver),
        Command::Info(args) => info(args, settings),
    }
}

async fn start(args: StartArgs, settings: Config, driver: HypervisorDriver) -> Result<()> {
    let workspace = args
        .workspace
        .unwrap_or(std::env::current_dir().context("resolving current directory as workspace")?);
    let tool_name = args.tool.unwrap_or(settings.tool.clone());
    let tool = tool::by_name(&tool_name).with_context(|| format!("unknown tool `{tool_name}`"))?;

    let domains = if args.allow_domains.is_empty() {
        settings.allowlist_domains.clone()
    } else {
        args.allow_domains
    };
    let mut resolved_settings = settings.clone();
    resolved_settings.allowlist_domains = domains;
    resolved_settings.allow_local_network_access |= args.allow_local_network_access;
    let mode = network_mode(&resolved_settings, args.network);

    let orchestrator = SessionOrchestrator::new(tool, driver.clone(), resolved_settings.base_dir.clone(), resolved_settings.max_slots);

    let request = StartRequest {
        workspace,
        image: args.image.unwrap_or(resolved_settings.image.clone()),
        persistent: args.persistent || resolved_settings.persistent,
        network: NetworkConfig {
            mode,
            refresh_interval: resolved_settings.refresh_interval,
        },
        requested_slot: args.slot,
    };

    let (handle, network) = orchestrator.start(request).await?;
    println!(
        "{} session {} on {}",
        "started".green().bold(),
        handle.session_id,
        handle.container_name
    );

    let term = host_term();
    orchestrator.dispatch_and_cleanup(&handle, network, args.interactive, &term).await?;
    Ok(())
}

fn list(args: ListArgs, settings: Config) -> Result<()> {
    let tools: Vec<String> = match args.tool {
        Some(t) => vec![t],
        None => vec![settings.tool.clone()],
    };

    for tool_name in tools {
        let Some(tool) = tool::by_name(&tool_name) else {
            continue;
        };
        let store = SessionStore::new(&settings.base_dir, &tool.sessions_dir_name());
        for session_id in store.all_session_ids() {
            match store.load_metadata(&session_id) {
                Ok(meta) => println!(
                    "{:<38} {:<24} {}",
                    meta.session_id,
                    meta.container_name,
                    if meta.persistent { "persistent" } else { "ephemeral" }
                ),
                Err(e) => eprintln!("warning: skipping {session_id}: {e}"),
            }
        }
    }
    Ok(())
}

async fn resume(args: coi::cli::ResumeArgs, settings: Config, driver: HypervisorDriver) -> Result<()> {
    let tool = tool::by_name(&settings.tool).with_context(|| format!("unknown tool `{}`", settings.tool))?;
    let store = SessionStore::new(&settings.base_dir, &tool.sessions_dir_name());
    let metadata = store.load_metadata(&args.session_id)?;

    let orchestrator = SessionOrchestrator::new(tool, driver.clone(), settings.base_dir.clone(), settings.max_slots);
    let request = StartRequest {
        workspace: metadata.workspace,
        image: settings.image.clone(),
        persistent: metadata.persistent,
        network: NetworkConfig {
            mode: network_mode(&settings, None),
            refresh_interval: settings.refresh_interval,
        },
        requested_slot: None,
    };
    let (handle, network) = orchestrator.start(request).await?;

    let term = host_term();
    orchestrator.dispatch_and_cleanup(&handle, network, args.interactive, &term).await?;
    Ok(())
}

fn stop(args: TargetArgs, settings: Config, driver: HypervisorDriver) -> Result<()> {
    let tool = tool::by_name(&settings.tool).with_context(|| format!("unknown tool `{}`", settings.tool))?;
    let store = SessionStore::new(&settings.base_dir, &tool.sessions_dir_name());
    let metadata = store.load_metadata(&args.session_id)?;

    let containers = ContainerManager::new(driver);
    containers.stop(&metadata.container_name, false)?;
    println!("stopped {}", metadata.container_name);
    Ok(())
}

fn rm(args: RmArgs, settings: Config, driver: HypervisorDriver) -> Result<()> {
    let tool = tool::by_name(&settings.tool).with_context(|| format!("unknown tool `{}`", settings.tool))?;
    let store = SessionStore::new(&settings.base_dir, &tool.sessions_dir_name());
    let metadata = store.load_metadata(&args.session_id)?;

    let containers = ContainerManager::new(driver);
    containers.delete(&metadata.container_name, true)?;

    if !args.keep_session {
        let dir = store.session_dir(&args.session_id);
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)?;
        }
    }
    println!("removed {}", metadata.container_name);
    Ok(())
}

fn info(args: TargetArgs, settings: Config) -> Result<()> {
    let tool = tool::by_name(&settings.tool).with_context(|| format!("unknown tool `{}`", settings.tool))?;
    let store = SessionStore::new(&settings.base_dir, &tool.sessions_dir_name());
    let metadata = store.load_metadata(&args.session_id)?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}
