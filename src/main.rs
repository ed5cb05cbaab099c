mod cli;
mod config;
mod cron;
mod engine;
mod gateway;
mod hooks;
mod logging;
mod memory;
mod paths;
mod provider;
mod routing;
mod runtime;
mod sessions;
mod tools;
mod util;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "bashclaw", version)]
#[command(about = "bashclaw — multi-agent conversational runtime", long_about = None)]
struct Cli {
    /// Port for the gateway (overrides gateway.port)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway and cron runner (the default)
    Serve,
    /// Print runtime state summary
    Status,
    /// Write a default config file
    Init,
    /// Dispatch one tool call
    Tool {
        /// Tool name
        name: Option<String>,

        /// A JSON document or --key value pairs
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Bridge an external engine's hook event into the hook chain
    HooksBridge {
        /// Event name (pre_compact, post_tool_use, …)
        event: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let state_dir = paths::state_dir().clone();

    // Lightweight subcommands — no tracing needed, and their stdout is
    // consumed by scripts and the external engine.
    match &cli.cmd {
        Some(Command::Tool { name, args }) => {
            let rt = runtime::Runtime::new(state_dir, paths::config_file())?;
            let code = cli::tool_cmd::run(&rt, name.clone(), args.clone()).await?;
            std::process::exit(code);
        }
        Some(Command::HooksBridge { event }) => {
            let rt = runtime::Runtime::new(state_dir, paths::config_file())?;
            let code = cli::hooks_bridge::run(&rt, event).await?;
            std::process::exit(code);
        }
        Some(Command::Init) => {
            let path = paths::config_file();
            config::ConfigStore::init_default(&path)?;
            println!("wrote default config to {}", path.display());
            return Ok(());
        }
        Some(Command::Status) => {
            let rt = runtime::Runtime::new(state_dir.clone(), paths::config_file())?;
            let summary = json!({
                "stateDir": state_dir.to_string_lossy(),
                "configFile": rt.config.path().to_string_lossy(),
                "agents": rt.config.agent_ids(),
                "sessions": rt.sessions.list().map(|l| l.len()).unwrap_or(0),
                "cronJobs": rt.cron.list().len(),
                "hooks": rt.hooks.list().len(),
                "memoryEntries": rt.memory.count(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            return Ok(());
        }
        Some(Command::Serve) | None => {}
    }

    // Full server path. The runtime comes up first so logging can read its
    // retention window from config.
    let rt = runtime::Runtime::new(state_dir, paths::config_file())?;
    let retention_days = rt.config.get_u64("logging.retentionDays").unwrap_or(7);
    match logging::setup_tracing(retention_days) {
        Ok(dir) => tracing::info!("logging to {}", dir.display()),
        Err(e) => eprintln!("Failed to initialize logging: {e}"),
    }

    if let Err(e) = rt.config.validate() {
        tracing::warn!("config validation: {e}");
    }
    // Declarative hook scripts live alongside the registrations.
    match rt.hooks.load_dir(&paths::state_dir().join("hooks.d")) {
        Ok(loaded) if !loaded.is_empty() => {
            tracing::info!("registered {} hooks from hooks.d", loaded.len())
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("failed to load hooks.d: {e}"),
    }

    // Reap day-old spawn records from previous runs.
    let reaped = rt.spawns.reap();
    if reaped > 0 {
        tracing::info!("reaped {} expired spawn records", reaped);
    }

    tracing::info!("--- bashclaw startup ---");
    tracing::info!("State Dir: {}", paths::state_dir().display());
    tracing::info!("Config File: {}", rt.config.path().display());
    tracing::info!("Agents: {:?}", rt.config.agent_ids());
    tracing::info!("Cron Jobs: {}", rt.cron.list().len());
    tracing::info!("Hooks: {}", rt.hooks.list().len());
    tracing::info!("------------------------");

    let cron_rt = rt.clone();
    tokio::spawn(async move {
        cron::runner_loop(cron_rt).await;
    });

    gateway::start_server(rt, cli.port).await
}
