//! rbridge: run Lua command handlers against an in-process engine
//!
//! Every `--cmd NAME` is received by the engine and handed to the script's
//! handler as `on_cmd(ten_env, cmd_id, name)`. Results the script returns
//! are printed to stdout as JSON lines once the engine has settled.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use resultbridge_core::logging::{LogFormat, init_logging};
use resultbridge_core::lua::LuaScriptEnv;
use resultbridge_core::{Config, EngineRuntime};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rbridge", version)]
#[command(about = "Run Lua command handlers and print the results they return")]
struct Cli {
    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true, env = "RBRIDGE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script and feed it commands
    Run {
        /// Lua script defining the handler
        script: PathBuf,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Command to deliver to the handler (repeatable)
        #[arg(long = "cmd", value_name = "NAME")]
        cmds: Vec<String>,

        /// Global function called for every command
        #[arg(long, default_value = "on_cmd")]
        handler: String,

        /// Make every result fail to deliver with this reason
        #[arg(long, value_name = "MSG")]
        fail_delivery: Option<String>,

        /// Close the engine before the handler runs
        #[arg(long)]
        close_first: bool,
    },
    /// Print the default configuration as TOML
    DefaultConfig,
}

struct RunArgs {
    script: PathBuf,
    config: Option<PathBuf>,
    cmds: Vec<String>,
    handler: String,
    fail_delivery: Option<String>,
    close_first: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            config,
            cmds,
            handler,
            fail_delivery,
            close_first,
        } => {
            let args = RunArgs {
                script,
                config,
                cmds,
                handler,
                fail_delivery,
                close_first,
            };
            let config = load_config(
                args.config.as_deref(),
                cli.log_level.as_deref(),
                cli.log_format,
            )?;
            run(&args, config)
        }
        Commands::DefaultConfig => {
            print!("{}", Config::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(
    path: Option<&Path>,
    log_level: Option<&str>,
    log_format: Option<LogFormat>,
) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = log_level {
        config.logging.level = level.to_string();
    }
    if let Some(format) = log_format {
        config.logging.format = format;
    }
    Ok(config)
}

fn run(args: &RunArgs, mut config: Config) -> Result<()> {
    init_logging(&config.logging).context("failed to initialize logging")?;
    if args.fail_delivery.is_some() {
        config.runtime.delivery_fault.clone_from(&args.fail_delivery);
    }

    let source = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read script {}", args.script.display()))?;

    let runtime = EngineRuntime::start(&config.runtime).context("failed to start engine")?;
    let env = LuaScriptEnv::new();
    env.install(runtime.binding())
        .context("failed to install lua environment")?;
    env.run_script(&args.script.display().to_string(), &source)
        .with_context(|| format!("failed to run script {}", args.script.display()))?;

    let received: Vec<(String, &str)> = args
        .cmds
        .iter()
        .map(|name| (runtime.receive_cmd(name.as_str()), name.as_str()))
        .collect();
    if args.close_first {
        runtime.close();
    }

    for (cmd_id, name) in &received {
        tracing::debug!(cmd_id = %cmd_id, name, "delivering command to script");
        env.call_handler(&args.handler, cmd_id, name)
            .with_context(|| format!("{}({name}) failed", args.handler))?;
    }
    runtime.settle();

    let mut out = std::io::stdout().lock();
    for delivered in runtime.take_delivered() {
        serde_json::to_writer(&mut out, &delivered)?;
        writeln!(out)?;
    }

    let pending = runtime.pending_cmds();
    if !pending.is_empty() {
        tracing::warn!(?pending, "commands left without a final result");
    }
    runtime.close();
    Ok(())
}
