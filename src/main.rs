//! cloud-bootstrap - instance bootstrap for VMware-style guests
//!
//! Probes the hypervisor channels for instance data, records it under the
//! state directory and ingests user-data and vendor-data.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cloud_bootstrap::bootstrap;
use cloud_bootstrap::config::BootstrapConfig;
use cloud_bootstrap::config::loader::ConfigLoader;
use cloud_bootstrap::datasources::controller::DatasourceController;
use cloud_bootstrap::state::paths::{CLOUD_DIR, CONFIG_DIR};
use cloud_bootstrap::state::{CloudPaths, InstanceState};
use cloud_bootstrap::userdata::{DataOrigin, Dispatcher, Frequency, HandlerRegistry, UserDataProcessor};

#[derive(Parser)]
#[command(name = "cloud-bootstrap")]
#[command(author, version, about = "Instance data acquisition and user-data ingestion", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (drop-ins are still read from the config dir)
    #[arg(long, env = "CLOUD_BOOTSTRAP_CONFIG")]
    config: Option<PathBuf>,

    /// State directory
    #[arg(long, default_value = CLOUD_DIR)]
    base: PathBuf,

    /// Configuration directory
    #[arg(long, default_value = CONFIG_DIR)]
    config_dir: PathBuf,

    /// Skip the platform check on transports that require one
    #[arg(long)]
    hint: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe, record instance data and ingest user-data (default)
    Init,
    /// Report which transport yields instance data
    Probe,
    /// Print a key from the recorded metadata
    Query {
        /// Key to query (e.g., instance-id, local-hostname)
        key: String,
    },
    /// Run a local user-data file through the handlers
    Ingest {
        file: PathBuf,
        /// Walk frequency: always or once-per-instance
        #[arg(long, default_value = "always")]
        frequency: String,
    },
}

fn init_logging(verbosity: u8) -> Result<()> {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")
}

async fn load(cli: &Cli, paths: &CloudPaths) -> Result<BootstrapConfig> {
    let mut loader = ConfigLoader::new().with_paths(paths.clone());
    if let Some(file) = &cli.config {
        loader = loader.with_file(file);
    }
    loader.load().await.context("failed to load configuration")
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let paths = CloudPaths::with_dirs(&cli.base, &cli.config_dir);
    let config = load(&cli, &paths).await?;
    let cancel = cancel_on_ctrl_c();

    match &cli.command {
        None | Some(Commands::Init) => {
            let outcome = bootstrap(&config, &paths, cli.hint.as_deref(), &cancel).await?;
            info!(
                "Instance {} ({}) from {}",
                outcome.instance_id,
                if outcome.new_instance { "new" } else { "existing" },
                outcome.provenance
            );
            for (origin, summary) in [("vendor-data", outcome.vendordata), ("user-data", outcome.userdata)] {
                if let Some(summary) = summary {
                    info!("{}: {:?}", origin, summary);
                }
            }
        }
        Some(Commands::Probe) => {
            let mut controller = DatasourceController::from_config(&config.datasource);
            let method = controller.probe(cli.hint.as_deref(), &cancel).await?;
            println!("{method}");
            if let Some(id) = controller.instance_id() {
                println!("instance-id: {id}");
            }
        }
        Some(Commands::Query { key }) => query(&paths, key).await?,
        Some(Commands::Ingest { file, frequency }) => {
            ingest(&config, &paths, file, frequency).await?;
        }
    }

    Ok(())
}

async fn query(paths: &CloudPaths, key: &str) -> Result<()> {
    let file = paths.instance_link().join("metadata.json");
    let text = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("no recorded metadata at {}", file.display()))?;
    let metadata: serde_json::Value = serde_json::from_str(&text)?;

    match metadata.get(key) {
        Some(serde_json::Value::String(s)) => println!("{s}"),
        Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
        None => bail!("key not found: {key}"),
    }
    Ok(())
}

async fn ingest(config: &BootstrapConfig, paths: &CloudPaths, file: &Path, frequency: &str) -> Result<()> {
    let Some(frequency) = Frequency::parse(frequency) else {
        bail!("unknown frequency: {frequency}");
    };

    let mut state = InstanceState::with_paths(paths.clone());
    let instance_id = state
        .load_cached_instance_id()
        .await?
        .unwrap_or_else(|| "local".to_string());

    let raw = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let document = UserDataProcessor::from_config(&config.userdata)?
        .with_cache_dir(paths.urlcache_dir(&instance_id))
        .process(&raw)
        .await?;

    let registry = HandlerRegistry::with_defaults(paths, &instance_id, DataOrigin::User);
    let mut dispatcher = Dispatcher::new(registry).with_handlers_dir(paths.handlers_dir(&instance_id));
    let summary = dispatcher.walk(&document, frequency).await;
    println!("{summary:?}");
    Ok(())
}
