//! Main binary for the image classification daemon (visiond)

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use vision_adapter_gpu::{ChainConfig, TelemetryChain};
use vision_core::{AppConfig, DeviceSelector, Precision};
use vision_engine::{ArtifactStatus, InferencePipeline};
use vision_server::{init_logging, HttpServer};

#[derive(Parser)]
#[command(name = "visiond")]
#[command(about = "GPU image classification service with tiered telemetry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "VISIOND_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Address to bind the HTTP server to
    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// Execution device (cpu, cuda:N)
    #[arg(long, value_name = "DEVICE")]
    device: Option<DeviceSelector>,

    /// Artifact precision (reduced, full)
    #[arg(long, value_name = "PRECISION")]
    precision: Option<Precision>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve,
    /// Build the compiled artifact ahead of serving
    Compile {
        /// Remove this configuration's stored artifact before building
        #[arg(long)]
        force: bool,
    },
    /// Print the default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve) | None => serve(load_config(&cli)?).await,
        Some(Commands::Compile { force }) => compile(load_config(&cli)?, force).await,
        Some(Commands::Config { ref output }) => generate_config(output.clone()),
        Some(Commands::Validate { ref config }) => validate_config(config.clone()),
    }
}

/// Defaults, then file, then environment, then CLI flags
fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if let Some(device) = cli.device {
        config.engine.device = device;
    }
    if let Some(precision) = cli.precision {
        config.engine.precision = precision;
    }

    config.validate().context("Invalid configuration")?;
    init_logging(&config.logging)?;
    Ok(config)
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let pipeline = Arc::new(InferencePipeline::new(config.engine.clone())?);
    let telemetry = Arc::new(TelemetryChain::new(ChainConfig::from(&config.telemetry)));

    // Compile in the background so the listener comes up immediately.
    let warming = Arc::clone(&pipeline);
    tokio::spawn(async move {
        match warming.ensure_artifact().await {
            Ok(resolved) if resolved.descriptor.status == ArtifactStatus::Failed => warn!(
                "Compiled artifact unavailable, serving through fallback: {}",
                resolved.descriptor.failure.unwrap_or_default()
            ),
            Ok(resolved) => info!("Artifact {}", resolved.descriptor.status),
            Err(e) => error!("Artifact warm-up failed: {}", e),
        }
    });

    let state = telemetry.describe().await;
    info!("Telemetry source: {} ({})", state.active_tier, state.device_id);

    let server = HttpServer::new(config.server, &config.telemetry, pipeline, telemetry)?;
    server.serve(shutdown_signal()).await?;
    Ok(())
}

async fn compile(config: AppConfig, force: bool) -> anyhow::Result<()> {
    let pipeline = InferencePipeline::new(config.engine)?;

    if force && pipeline.cache().remove_stored(pipeline.fingerprint())? {
        println!("Removed stored artifact for {}", pipeline.fingerprint().short());
    }

    let resolved = pipeline.ensure_artifact().await?;
    let descriptor = resolved.descriptor;
    println!("fingerprint: {}", descriptor.fingerprint);
    println!("path: {}", descriptor.path.display());
    println!("status: {}", descriptor.status);

    if descriptor.status != ArtifactStatus::Ready {
        bail!(
            "compilation did not produce an artifact: {}",
            descriptor.failure.unwrap_or_else(|| descriptor.status.to_string())
        );
    }
    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> anyhow::Result<()> {
    let yaml = AppConfig::default().to_yaml()?;

    match output {
        Some(path) => {
            std::fs::write(&path, yaml).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Configuration written to: {}", path.display());
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

fn validate_config(path: PathBuf) -> anyhow::Result<()> {
    let config = AppConfig::load_from_file(&path).with_context(|| format!("Failed to load {}", path.display()))?;
    config.validate()?;
    println!("Configuration is valid: {}", path.display());
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
    }
}
