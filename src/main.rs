use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use pulsar_operator::autoscaler::{AutoscalerContext, SchedulingDaemon};
use pulsar_operator::config::{LogFormat, OperatorConfig};
use pulsar_operator::kubernetes::{self, KubePodExecutor, KubeResources};
use pulsar_operator::{controller, crd};

#[derive(Parser)]
#[command(name = "pulsar-operator")]
#[command(about = "Kubernetes operator that autoscales Apache Pulsar brokers and bookies")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch PulsarCluster resources and run their autoscalers
    Run {
        /// Path to pulsar-operator.toml config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Log format (overrides config)
        #[arg(long, value_enum)]
        log_format: Option<LogFormat>,
    },
    /// Print the PulsarCluster CRD manifest
    Crd,
    /// Validate a config file and print the effective settings
    CheckConfig {
        /// Path to the config file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, log_format } => {
            let config = match config {
                Some(path) => OperatorConfig::from_file(&path)?,
                None => OperatorConfig::default(),
            };
            init_tracing(log_format.unwrap_or(config.logging.format));
            run(config).await?;
        }
        Commands::Crd => {
            print!("{}", crd::generate_crd_manifest()?);
        }
        Commands::CheckConfig { path } => {
            let config = OperatorConfig::from_file(&path)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("Configuration OK: {}", path.display());
            println!();
            print!("{}", rendered);
        }
    }

    Ok(())
}

/// Initialize tracing; `RUST_LOG` overrides the default `info` level.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn run(config: OperatorConfig) -> Result<()> {
    let client = kubernetes::build_client(&config.kubernetes).await?;
    let namespace = config
        .kubernetes
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty());

    let ctx = Arc::new(AutoscalerContext::new(
        Arc::new(KubeResources::new(client.clone())),
        Arc::new(KubePodExecutor::new(client.clone())),
        config.autoscaler.clone(),
    ));
    let daemon = Arc::new(SchedulingDaemon::new(ctx));

    info!(
        namespace = namespace.as_deref().unwrap_or("*"),
        "starting pulsar operator"
    );
    controller::run_controller(client, daemon.clone(), namespace.as_deref()).await?;

    daemon.shutdown().await;
    info!("pulsar operator stopped");
    Ok(())
}
