use serde::Deserialize;

/// Tunables from spec.md §6, one field per env/config entry, defaults matching the spec.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_redis_chunk_ttl")]
    pub redis_chunk_ttl_secs: u64,

    #[serde(default = "default_owner_lock_ttl")]
    pub owner_lock_ttl_secs: u64,

    #[serde(default = "default_client_wait_timeout")]
    pub client_wait_timeout_secs: u64,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,

    #[serde(default = "default_channel_shutdown_delay")]
    pub channel_shutdown_delay_secs: u64,

    #[serde(default = "default_channel_init_grace_period")]
    pub channel_init_grace_period_secs: u64,

    #[serde(default = "default_initial_behind_chunks")]
    pub initial_behind_chunks: u64,

    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,

    #[serde(default = "default_max_local_chunks")]
    pub max_local_chunks: u64,

    #[serde(default = "default_target_bitrate")]
    pub target_bitrate: f64,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,

    #[serde(default = "default_client_keepalive_interval")]
    pub client_keepalive_interval_secs: u64,

    #[serde(default = "default_client_cleanup_interval")]
    pub client_cleanup_interval_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_redis_chunk_ttl() -> u64 {
    60
}
fn default_owner_lock_ttl() -> u64 {
    30
}
fn default_client_wait_timeout() -> u64 {
    30
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_stream_timeout() -> u64 {
    30
}
fn default_channel_shutdown_delay() -> u64 {
    5
}
fn default_channel_init_grace_period() -> u64 {
    5
}
fn default_initial_behind_chunks() -> u64 {
    10
}
fn default_max_chunks() -> usize {
    20
}
fn default_max_local_chunks() -> u64 {
    600
}
fn default_target_bitrate() -> f64 {
    8_000_000.0
}
fn default_keepalive_interval() -> u64 {
    500
}
fn default_client_keepalive_interval() -> u64 {
    5
}
fn default_client_cleanup_interval() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    10
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            redis_chunk_ttl_secs: default_redis_chunk_ttl(),
            owner_lock_ttl_secs: default_owner_lock_ttl(),
            client_wait_timeout_secs: default_client_wait_timeout(),
            connection_timeout_secs: default_connection_timeout(),
            stream_timeout_secs: default_stream_timeout(),
            channel_shutdown_delay_secs: default_channel_shutdown_delay(),
            channel_init_grace_period_secs: default_channel_init_grace_period(),
            initial_behind_chunks: default_initial_behind_chunks(),
            max_chunks: default_max_chunks(),
            max_local_chunks: default_max_local_chunks(),
            target_bitrate: default_target_bitrate(),
            keepalive_interval_ms: default_keepalive_interval(),
            client_keepalive_interval_secs: default_client_keepalive_interval(),
            client_cleanup_interval_secs: default_client_cleanup_interval(),
            max_retries: default_max_retries(),
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ProxyConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("TS_PROXY").separator("__"))
            .build()?;
        Ok(settings.try_deserialize().unwrap_or_default())
    }
}
