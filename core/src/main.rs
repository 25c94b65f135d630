use std::path::PathBuf;

use clap::Parser;
use common::config::{self, CacheConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Standalone binary wrapping the cache-proxy library: a thin CLI over
/// `Manager::init`/`dispose`, for running the range proxy as its own
/// process rather than embedded in a larger application.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML config file (see common::config::parse_toml for the `[config]`
    /// table shape). Flags below override whatever it sets.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding `<id>.video` / `<id>.meta` pairs.
    #[arg(long, default_value = "./cache")]
    storage_dir: PathBuf,

    /// Loopback port the hybrid server binds to.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// User-Agent sent with every origin request.
    #[arg(long)]
    user_agent: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cache_core=info")))
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => match tokio::fs::read_to_string(path).await {
            Ok(doc) => match config::parse_toml(&doc) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("failed to parse config file {}: {e}", path.display());
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("failed to read config file {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => CacheConfig::new(cli.storage_dir.clone()),
    };

    cfg.http.port = cli.port;
    if let Some(ua) = &cli.user_agent {
        cfg.origin.user_agent = Some(ua.clone());
    }

    let manager = match cache_core::Manager::init(cfg).await {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to start cache proxy: {e}");
            std::process::exit(1);
        }
    };

    let resumed = manager.list_all().await;
    info!(
        port = manager.port(),
        resumed = resumed.len(),
        "cache proxy ready"
    );
    for entry in &resumed {
        info!(id = %entry.id, progress = entry.progress, "resumed resource");
    }

    manager.resume_all().await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c, shutting down anyway");
    }

    info!("shutting down");
    manager.dispose().await;
}
