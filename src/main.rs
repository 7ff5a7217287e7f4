use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use ts_proxy_core::channels::{fetch_m3u, M3uCatalog};
use ts_proxy_core::config::ProxyConfig;
use ts_proxy_core::kv::RedisKv;
use ts_proxy_core::lifecycle::LifecycleConfig;
use ts_proxy_core::stream_manager::StreamManagerConfig;
use ts_proxy_core::streamer::StreamerConfig;
use ts_proxy_core::{create_app, Core};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Pin this process's worker id (random v4 UUID if unset).
    #[arg(long)]
    worker_id: Option<String>,

    /// Path to configuration file (TOML; env vars under TS_PROXY__ also apply).
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// One or more M3U playlist URLs to seed the channel catalog from.
    #[arg(long = "playlist")]
    playlists: Vec<String>,
}

fn lifecycle_config(cfg: &ProxyConfig) -> LifecycleConfig {
    LifecycleConfig {
        owner_lock_ttl: Duration::from_secs(cfg.owner_lock_ttl_secs),
        chunk_ttl: Duration::from_secs(cfg.redis_chunk_ttl_secs),
        max_local_chunks: cfg.max_local_chunks,
        client_ttl: Duration::from_secs(cfg.client_keepalive_interval_secs * 3),
        channel_shutdown_delay: Duration::from_secs(cfg.channel_shutdown_delay_secs),
        channel_init_grace_period: Duration::from_secs(cfg.channel_init_grace_period_secs),
        client_sweep_interval: Duration::from_secs(cfg.client_cleanup_interval_secs),
        client_inactivity_timeout: Duration::from_secs(cfg.client_keepalive_interval_secs * 3),
        stream_manager: StreamManagerConfig {
            connection_timeout: Duration::from_secs(cfg.connection_timeout_secs),
            stream_timeout: Duration::from_secs(cfg.stream_timeout_secs),
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            read_chunk_size: 32 * 1024,
            metadata_ttl: Duration::from_secs(cfg.owner_lock_ttl_secs * 4),
        },
    }
}

fn streamer_config(cfg: &ProxyConfig) -> StreamerConfig {
    StreamerConfig {
        max_chunks: cfg.max_chunks,
        max_bytes: 2 * 1024 * 1024,
        initial_behind_chunks: cfg.initial_behind_chunks,
        stream_timeout: Duration::from_secs(cfg.stream_timeout_secs),
        client_wait_timeout: Duration::from_secs(cfg.client_wait_timeout_secs),
        keepalive_interval: Duration::from_millis(cfg.keepalive_interval_ms),
        min_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_secs(1),
        ghost_empty_reads_threshold: 100,
        ghost_chunks_ahead_threshold: 50,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = ProxyConfig::load(&args.config)?;
    let worker_id = args.worker_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(worker_id = %worker_id, "starting ts-proxy worker");

    let mut channels = Vec::new();
    for playlist_url in &args.playlists {
        info!(url = %playlist_url, "fetching playlist");
        match fetch_m3u(playlist_url).await {
            Ok(mut c) => {
                info!(url = %playlist_url, count = c.len(), "loaded channels");
                channels.append(&mut c);
            }
            Err(e) => error!(url = %playlist_url, error = %e, "failed to fetch playlist"),
        }
    }
    if channels.is_empty() {
        warn!("no channels loaded from any playlist");
    }
    let catalog = Arc::new(M3uCatalog::from_channels(channels, "ts-proxy-core/1.0".to_string()));

    let kv = Arc::new(RedisKv::connect(&cfg.redis_url).await?);
    let core = Arc::new(Core::new(
        worker_id,
        kv,
        catalog,
        lifecycle_config(&cfg),
        streamer_config(&cfg),
    ));

    let app = create_app(core);
    let addr = format!("{}:{}", cfg.host, cfg.port);
    info!(addr = %addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
