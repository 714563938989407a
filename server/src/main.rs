//! jitreg - just-in-time OCI registry gateway binary.
//!
//! Serves the OCI Distribution pull API and derives each requested image
//! from an upstream base image the first time it is pulled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use jitreg_core::event::log_events;
use jitreg_core::{EventEmitter, GatewayConfig, RuleSet};
use jitreg_runtime::{DirectoryRuleSource, DiskImageStore, DynamicRules, RegistryAuth, RuleSource};
use jitreg_server::{Gateway, GatewayServer};

/// jitreg registry gateway
#[derive(Parser, Debug)]
#[command(name = "jitreg", version, about = "Just-in-time OCI registry gateway")]
struct Args {
    /// Address to serve the registry API on.
    #[arg(long, env = "JITREG_LISTEN", default_value = "0.0.0.0:8888")]
    listen: SocketAddr,

    /// Directory holding built manifests and blobs.
    #[arg(long, env = "JITREG_CACHE_DIR", default_value = "~/.jitreg/cache")]
    cache_dir: String,

    /// YAML file with static image rules.
    #[arg(long, env = "JITREG_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of Image objects watched for dynamic rules.
    #[arg(long, env = "JITREG_RULES_DIR")]
    rules_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Resolve cache directory (expand ~)
    let cache_dir = if args.cache_dir.starts_with('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(args.cache_dir.strip_prefix("~/").unwrap_or(&args.cache_dir))
    } else {
        PathBuf::from(&args.cache_dir)
    };

    tracing::info!(
        listen = %args.listen,
        cache_dir = %cache_dir.display(),
        config = ?args.config,
        rules_dir = ?args.rules_dir,
        "Starting jitreg"
    );

    let config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    let statics = RuleSet::from_specs(&config.images)?;
    tracing::info!(rules = statics.len(), "Loaded static rules");

    let source: Option<Arc<dyn RuleSource>> = match &args.rules_dir {
        Some(dir) => Some(Arc::new(DirectoryRuleSource::open(dir)?)),
        None => None,
    };

    let events = EventEmitter::default();
    tokio::spawn(log_events(events.subscribe()));
    let rules = Arc::new(DynamicRules::new(statics, source, events.clone()));

    let store = Arc::new(
        DiskImageStore::new(&cache_dir, RegistryAuth::from_env())
            .map_err(|e| format!("Failed to initialize image store: {}", e))?,
    );

    let gateway = Arc::new(Gateway::new(store, rules, events));
    let server = GatewayServer::new(args.listen, gateway).start()?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}
