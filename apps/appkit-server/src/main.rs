use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use std::path::{Path, PathBuf};

use appkit::{Application, ShutdownOptions};
use appkit_bootstrap::{AppConfig, CliArgs};

mod registered_modules;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Appkit Server - modular application server
#[derive(Parser)]
#[command(name = "appkit-server")]
#[command(about = "Appkit Server - modular application server")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use an in-memory SQLite database
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and module wiring, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        port: cli.port,
        print_config: cli.print_config,
        verbose: cli.verbose,
        mock: cli.mock,
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (APP__*) -> 4) CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    appkit_bootstrap::init_logging(&logging_config, Path::new(&config.server.home_dir));

    tracing::info!("Appkit Server starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(config),
    }
}

fn build_app(config: AppConfig) -> Result<Application> {
    let mut app = Application::new(config);
    registered_modules::register_all(&mut app).context("module registration failed")?;
    Ok(app)
}

async fn run_server(config: AppConfig) -> Result<()> {
    let app = build_app(config)?;
    let report = app
        .run(ShutdownOptions::Signals)
        .await
        .context("server failed to start")?;

    if !report.is_clean() {
        tracing::warn!(?report, "Shutdown finished with problems");
    }
    Ok(())
}

fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("Checking configuration…");
    config
        .resolved_database()
        .context("invalid database section")?;
    let app = build_app(config)?;
    let order = app
        .registry()
        .resolve_order()
        .context("module dependencies do not resolve")?;

    println!("Configuration is valid");
    println!("Module order: {}", order.join(" -> "));
    println!("{}", app.config().to_yaml()?);
    Ok(())
}
