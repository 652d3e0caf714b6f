//! The BOSSWAVE designated router daemon.
//!
//! Loads the router configuration, constructs the resolution layer over
//! the registry, starts the cache maintenance tasks and serves until
//! interrupted. Without a config file it runs a self-contained dev
//! router: a fresh entity, an in-memory registry and store, owning only
//! its own namespace.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use bosswave_core::MemoryStore;
use bosswave_resolver::MemoryRegistry;
use bosswave_resolver::Resolution;
use bosswave_router::Router;
use bosswave_router::RouterConfig;
use bosswave_router::load_entity_keyfile;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bosswaved", about = "BOSSWAVE designated router")]
struct Args {
    /// Path to the router configuration file.
    #[arg(long, env = "BOSSWAVE_CONFIG")]
    config: Option<String>,

    /// Enable debug-level logging.
    #[arg(long, short)]
    verbose: bool,
}

fn init_tracing(verbose: bool, config_filter: Option<&str>) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config_filter.unwrap_or("info")))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RouterConfig::load(path)?,
        None => RouterConfig::default(),
    };
    init_tracing(args.verbose, config.log_filter.as_deref());

    let registry = Arc::new(MemoryRegistry::new());
    let resolution = Resolution::new(registry.clone());
    let store = Arc::new(MemoryStore::new());

    let (entity_kp, mut mvks) = match &config.entity_keyfile {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading keyfile {path}"))?;
            let (entity, kp) = load_entity_keyfile(&bytes)?;
            registry.publish_entity(Arc::new(entity));
            (kp, config.owned_mvks()?)
        }
        None => {
            // Dev mode: a throwaway identity that owns its own namespace.
            let kp = bosswave_crypto::Keypair::generate(&mut rand::thread_rng());
            info!(vk = %kp.vk(), "no keyfile configured, generated a dev entity");
            (kp, Vec::new())
        }
    };
    if mvks.is_empty() {
        mvks.push(entity_kp.vk());
    }

    let (sweep, tail) = resolution.clone().start_tasks().await;
    let router = Router::new(entity_kp, mvks.clone(), resolution, store, config.peer_table()?);

    info!(
        vk = %router.entity_vk(),
        namespaces = mvks.len(),
        "designated router up"
    );

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    sweep.abort();
    tail.abort();
    Ok(())
}
