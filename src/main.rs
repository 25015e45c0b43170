use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use testforge::config::{CliOverrides, Config};

mod cmd;

#[derive(Parser)]
#[command(name = "testforge")]
#[command(version, about = "AI-driven browser end-to-end test runs with self-healing")]
pub struct Cli {
    /// Path to the config file (default: .testforge/testforge.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the run database. Overrides [server].db_path.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// Run one pipeline in-process and exit with its exit code
    Run(RunArgs),
    /// Print a run record as JSON
    Status { run_id: String },
    /// Print a run's healing report as JSON
    Healing { run_id: String },
    /// Print a run's log
    Logs { run_id: String },
    /// Create the run database
    InitDb,
    /// List the scenario templates accepted by `run --scenario`
    Scenarios,
    /// Show or initialize the configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Target URL
    pub url: String,
    /// ai, record or hybrid
    #[arg(long, default_value = "ai")]
    pub mode: String,
    /// quick, balanced or deep
    #[arg(long)]
    pub preset: Option<String>,
    /// Show the browser while recording and executing
    #[arg(long)]
    pub headed: bool,
    /// User story to steer test generation
    #[arg(long)]
    pub story: Option<String>,
    /// Fail on the first failing execution instead of healing
    #[arg(long)]
    pub no_heal: bool,
    #[arg(long)]
    pub max_heal_attempts: Option<i64>,
    /// Scenario template id, or "auto" to pick one from discovery
    #[arg(long)]
    pub scenario: Option<String>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default testforge.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(cli.config.as_deref(), command.clone());
    }

    let overrides = CliOverrides {
        port: match &cli.command {
            Commands::Serve { port, .. } => *port,
            _ => None,
        },
        db_path: cli.db_path.clone(),
        dev: matches!(cli.command, Commands::Serve { dev: true, .. }),
        json_logs: cli.json_logs,
    };
    let mut config = Config::resolve(cli.config.as_deref(), &overrides)?;
    if matches!(cli.command, Commands::Run(_)) && std::env::var_os("RUST_LOG").is_none() {
        // Keep the progress bars readable.
        config.logging.level = "warn".to_string();
    }
    let guard = testforge::telemetry::init(&config.logging)?;

    match &cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(&config).await?,
        Commands::Run(args) => {
            let code = cmd::cmd_run(&config, args).await?;
            drop(guard);
            std::process::exit(code);
        }
        Commands::Status { run_id } => cmd::cmd_status(&config, run_id)?,
        Commands::Healing { run_id } => cmd::cmd_healing(&config, run_id)?,
        Commands::Logs { run_id } => cmd::cmd_logs(&config, run_id)?,
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Scenarios => cmd::cmd_scenarios()?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
