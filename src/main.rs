use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use odmigrate::config::{AppConfig, DEFAULT_CONFIG_FILE, PlatformKind};
use odmigrate::context::MigrationContext;
use odmigrate::core::exporter::{self, Exporter};
use odmigrate::core::importer::Importer;
use odmigrate::core::markers::read_metadata;
use odmigrate::core::models::Package;
use odmigrate::core::operator::ConsoleOperator;
use odmigrate::core::transfer_engine::TransferEngineType;
use odmigrate::core::wait::TokioSleeper;
use odmigrate::error::MigrationError;
use odmigrate::logging::{self, LogConfig};
use odmigrate::adapters;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "odmigrate")]
#[command(about = "Move an Open Dental server to new hardware over a network share", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: odmigrate.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,

    /// Also append the session log to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// OS tooling to drive (default: the one this binary runs on)
    #[arg(long, global = true)]
    platform: Option<PlatformKind>,

    /// Bulk copy engine
    #[arg(long, global = true)]
    engine: Option<TransferEngineType>,
}

#[derive(Subcommand)]
enum Commands {
    /// Old server: stop services, package the data and wait for the new server
    Export(ExportArgs),
    /// New server: pull the newest package, restore it and signal the old server
    Import(ImportArgs),
    /// Old server: remove the export share after an interrupted wait
    Cleanup,
    /// List packages under the staging root
    Status,
    /// Write a configuration file with every default spelled out
    InitConfig {
        path: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Serialize)]
struct ExportArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    staging_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    share_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    attachments_hint: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    config_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rename_attachments: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    block_db_port: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Args, Serialize)]
struct ImportArgs {
    /// Old server name or address; prompted for when omitted
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    server: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    share_name: Option<String>,

    /// Package id to import instead of the newest ready one
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    package: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    stage_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    attachments_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    download_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    open_db_port: Option<bool>,

    /// Install the database engine without asking
    #[serde(skip_serializing_if = "is_false")]
    #[arg(long = "yes", short = 'y')]
    assume_yes: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(LogConfig {
        json: cli.json_logs,
        verbose: cli.verbose,
        file: cli.log_file.clone(),
    }) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "Migration step failed");
            eprintln!("Error: {e:#}");
            let code = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<MigrationError>())
                .map(MigrationError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_file = cli.config.as_deref();
    let mut config = match &cli.command {
        Commands::Export(args) => AppConfig::new(config_file, "export", Some(args))?,
        Commands::Import(args) => AppConfig::new(config_file, "import", Some(args))?,
        _ => AppConfig::new(config_file, "export", None::<&ExportArgs>)?,
    };
    if let Some(platform) = cli.platform {
        config.platform = platform;
    }
    if let Some(engine) = cli.engine {
        config.copy.engine = engine;
    }

    match cli.command {
        Commands::Export(_) => run_export(config).await.context("Export failed"),
        Commands::Import(_) => run_import(config).await.context("Import failed"),
        Commands::Cleanup => run_cleanup(config).await.context("Cleanup failed"),
        Commands::Status => run_status(&config),
        Commands::InitConfig { path, force } => run_init_config(&config, path, force),
    }
}

async fn elevated_context(config: AppConfig) -> Result<MigrationContext> {
    let platform = adapters::get_platform(&config);
    if !platform.services.is_elevated().await {
        return Err(MigrationError::NotElevated.into());
    }

    let host_name = whoami::fallible::hostname().unwrap_or_else(|e| {
        warn!(error = %e, "Could not read the host name");
        "localhost".to_string()
    });

    Ok(MigrationContext::new(
        config,
        platform,
        Arc::new(ConsoleOperator),
        Arc::new(TokioSleeper),
        host_name,
    ))
}

async fn run_export(config: AppConfig) -> Result<()> {
    let ctx = elevated_context(config).await?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received; the export stops before publishing or ends its wait. Press Ctrl-C again to abort now");
        trigger.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Aborted; services stay stopped and any partial package is left in place");
            std::process::exit(MigrationError::Cancelled.exit_code().into());
        }
    });

    let report = Exporter::new(ctx).run(&cancel).await?;
    info!(
        package = %report.package.id,
        engine = %report.metadata.engine,
        version = %report.metadata.version,
        checks = report.checks,
        "Export finished"
    );
    Ok(())
}

async fn run_import(config: AppConfig) -> Result<()> {
    let ctx = elevated_context(config).await?;
    let report = Importer::new(ctx).run().await?;

    info!(
        package = %report.remote.id,
        service = %report.service,
        data_dir = %report.data_dir.display(),
        signaled = report.signaled,
        "Import finished"
    );
    if let Some(backup) = &report.backup {
        println!("Previous data directory kept at {}", backup.display());
    }
    if !report.signaled {
        println!(
            "The old server was not signalled. Create {} on it to let it finish.",
            report.remote.completion_marker().display()
        );
    }
    Ok(())
}

async fn run_cleanup(config: AppConfig) -> Result<()> {
    let ctx = elevated_context(config).await?;
    exporter::cleanup(&ctx).await
}

fn run_status(config: &AppConfig) -> Result<()> {
    let root = &config.export.staging_root;
    let packages = exporter::package_status(root)?;
    if packages.is_empty() {
        println!("No packages under {}", root.display());
        return Ok(());
    }
    println!("Packages under {}:", root.display());
    for package in packages {
        let state = match (package.ready, package.copied) {
            (_, true) => "copied",
            (true, false) => "ready, waiting for import",
            (false, false) => "incomplete",
        };
        let metadata = Package::new(root, &package.id).metadata_file();
        match read_metadata(&metadata) {
            Ok(Some(m)) => println!(
                "  {}  {}  ({} {} from {})",
                package.id, state, m.engine, m.version, m.source_host
            ),
            Ok(None) => println!("  {}  {}", package.id, state),
            Err(e) => println!("  {}  {}  (metadata unreadable: {e:#})", package.id, state),
        }
    }
    Ok(())
}

fn run_init_config(config: &AppConfig, path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(&path, config.to_toml()?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
