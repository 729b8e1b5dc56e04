#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use corehost::{ContainerConfig, CoreContainer, TantivyCoreFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "corehost")]
struct Cli {
    /// Container home: holds cores.json and relative instance directories.
    #[arg(long, env = "COREHOST_HOME", default_value = "./cores")]
    home: PathBuf,

    /// Overrides coreLoadThreads from cores.json and the environment.
    #[arg(long)]
    core_load_threads: Option<usize>,

    /// Overrides transientCacheSize from cores.json and the environment.
    #[arg(long)]
    transient_cache_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    std::fs::create_dir_all(&cli.home)?;
    let mut config = ContainerConfig::load_or_default(&cli.home)?;
    config.settings = config.settings.with_env_overrides();
    if let Some(n) = cli.core_load_threads {
        config.settings.core_load_threads = n;
    }
    if let Some(n) = cli.transient_cache_size {
        config.settings.transient_cache_size = n;
    }

    let container = CoreContainer::builder(&cli.home, Arc::new(TantivyCoreFactory))
        .config(Arc::new(config))
        .build();
    container.load().await?;

    tracing::info!(
        "Serving {} cores ({} known): {:?}",
        container.core_names().len(),
        container.all_core_names().len(),
        container.core_names()
    );
    for (name, err) in container.core_init_failures() {
        tracing::warn!("Core {} failed to load: {}", name, err);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("[shutdown] signal received");

    let shutting_down = Arc::clone(&container);
    tokio::task::spawn_blocking(move || shutting_down.shutdown()).await?;
    Ok(())
}
