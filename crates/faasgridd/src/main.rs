//! faasgridd: the faasgrid daemon.
//!
//! Loads the global configuration, connects to the cluster, selects the
//! serverless backend and runs one service lifecycle operation.
//!
//! # Usage
//!
//! ```text
//! faasgridd --config /etc/faasgrid/faasgrid.toml list
//! faasgridd apply service.yaml --script handler.sh
//! faasgridd --backend knative delete my-service
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use faasgrid_backends::Backend;
use faasgrid_cluster::KubeCluster;
use faasgrid_core::GlobalConfig;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "faasgridd", about = "faasgrid daemon", version)]
struct Cli {
    /// Path to faasgrid.toml. Defaults apply when omitted.
    #[arg(long, env = "FAASGRID_CONFIG")]
    config: Option<PathBuf>,

    /// Override `serverless_backend` (kubernetes, knative, openfaas, fake).
    #[arg(long, env = "FAASGRID_BACKEND")]
    backend: Option<String>,

    /// Override `services_namespace`.
    #[arg(long, env = "FAASGRID_SERVICES_NAMESPACE")]
    services_namespace: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the backend name and version.
    Info,
    /// List registered services.
    List,
    /// Print one service descriptor as JSON.
    Get { name: String },
    /// Create a service, or update it if it already exists.
    Apply {
        /// Service descriptor (YAML).
        descriptor: PathBuf,
        /// Entrypoint script, replacing the descriptor's `script`.
        #[arg(long)]
        script: Option<PathBuf>,
    },
    /// Delete a service.
    Delete { name: String },
    /// Pull an image onto every worker node.
    Prefetch {
        image: String,
        /// Pull secrets for private registries.
        #[arg(long = "pull-secret")]
        pull_secrets: Vec<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,faasgridd=debug,faasgrid=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<GlobalConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            debug!(path = %path.display(), "loading configuration");
            GlobalConfig::from_file(path)?
        }
        None => GlobalConfig::default(),
    };
    if let Some(backend) = &cli.backend {
        config.serverless_backend = backend.clone();
    }
    if let Some(namespace) = &cli.services_namespace {
        config.services_namespace = namespace.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Arc::new(load_config(&cli)?);
    let cluster = KubeCluster::connect(config.api_timeout()).await?;
    info!(
        backend = %config.serverless_backend,
        namespace = %config.services_namespace,
        "connected to cluster"
    );

    let backend = Backend::from_config(cluster.clone(), config.clone())?;
    let output = match cli.command {
        Command::Info => commands::info(&backend).await?,
        Command::List => commands::list(&backend).await?,
        Command::Get { name } => commands::get(&backend, &name).await?,
        Command::Apply { descriptor, script } => {
            let service = commands::load_descriptor(&descriptor, script.as_deref())?;
            commands::apply(&backend, &service).await?.to_string()
        }
        Command::Delete { name } => commands::delete(&backend, &name).await?,
        Command::Prefetch { image, pull_secrets } => {
            commands::prefetch(cluster, &config, image, pull_secrets).await?
        }
    };
    println!("{output}");
    Ok(())
}
