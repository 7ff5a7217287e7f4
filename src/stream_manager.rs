use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::ChunkBuffer;
use crate::kv::Kv;
use crate::metrics;

type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Owner-only fetch loop state (spec §4.4). Encoded as a single byte so readers
/// (`/status`, `healthy()`, `connected()`) never block on a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Active,
    Switching,
    Error,
    Stopped,
}

impl StreamState {
    fn encode(self) -> u8 {
        match self {
            StreamState::Connecting => 0,
            StreamState::Active => 1,
            StreamState::Switching => 2,
            StreamState::Error => 3,
            StreamState::Stopped => 4,
        }
    }

    fn decode(byte: u8) -> Self {
        match byte {
            1 => StreamState::Active,
            2 => StreamState::Switching,
            3 => StreamState::Error,
            4 => StreamState::Stopped,
            _ => StreamState::Connecting,
        }
    }

    /// The string this state is mirrored into `metadata:{channel}.state` as.
    /// `Switching` collapses to `"connecting"` since it is immediately followed
    /// by a real `Connecting` transition once `run()`'s loop re-enters, and
    /// `wait_ready` already treats the two as equivalent "not ready yet, not an
    /// error either" states.
    fn as_str(self) -> &'static str {
        match self {
            StreamState::Connecting | StreamState::Switching => "connecting",
            StreamState::Active => "active",
            StreamState::Error => "error",
            StreamState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
struct UpstreamTarget {
    url: String,
    user_agent: String,
    transcode_cmd: Option<Vec<String>>,
}

pub struct StreamManagerConfig {
    pub connection_timeout: Duration,
    pub stream_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub read_chunk_size: usize,
    pub metadata_ttl: Duration,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(30),
            max_retries: 10,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            read_chunk_size: 32 * 1024,
            metadata_ttl: Duration::from_secs(120),
        }
    }
}

enum PumpOutcome {
    Ended,
    Switching,
    Stopped,
}

/// Owns exactly one upstream connection for a channel (spec §4.4). Only the
/// worker that holds `owner:{channel}` constructs and starts one of these; the
/// fetch loop is the sole writer into `ChunkBuffer`.
pub struct StreamManager {
    channel_uuid: String,
    kv: Arc<dyn Kv>,
    buffer: Arc<ChunkBuffer>,
    http: reqwest::Client,
    config: StreamManagerConfig,
    current: Mutex<UpstreamTarget>,
    switch: Notify,
    cancel: CancellationToken,
    state: AtomicU8,
    healthy: AtomicBool,
    connected: AtomicBool,
    should_retry: AtomicBool,
    retry_count: AtomicU32,
}

impl StreamManager {
    pub fn new(
        channel_uuid: String,
        kv: Arc<dyn Kv>,
        buffer: Arc<ChunkBuffer>,
        url: String,
        user_agent: String,
        transcode_cmd: Option<Vec<String>>,
        config: StreamManagerConfig,
    ) -> Self {
        Self {
            channel_uuid,
            kv,
            buffer,
            http: reqwest::Client::new(),
            config,
            current: Mutex::new(UpstreamTarget { url, user_agent, transcode_cmd }),
            switch: Notify::new(),
            cancel: CancellationToken::new(),
            state: AtomicU8::new(StreamState::Connecting.encode()),
            healthy: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            should_retry: AtomicBool::new(true),
            retry_count: AtomicU32::new(0),
        }
    }

    /// Updates the in-process state only. Followers and `/status` read state
    /// from KV, not this atomic, so every transition that's meant to be
    /// observable outside this process must also go through `set_state` or
    /// `spawn_persist_state`.
    fn set_state_local(&self, state: StreamState) {
        self.state.store(state.encode(), Ordering::Release);
    }

    /// Updates the local atomic and mirrors `state` into `metadata:{channel}`
    /// with the sliding TTL, so `/status` and `wait_ready` (which keys off
    /// `state == "error"` to fail a pending request) observe the live state
    /// instead of whatever `ensure_channel`/`start_owned` last wrote.
    async fn set_state(&self, state: StreamState) {
        self.set_state_local(state);
        if let Err(e) = self
            .kv
            .hash_set(&self.metadata_key(), "state", state.as_str(), self.config.metadata_ttl)
            .await
        {
            warn!(channel = %self.channel_uuid, error = %e, state = state.as_str(), "failed to persist stream state");
        }
    }

    /// Fire-and-forget variant for callers that can't `.await` (`update_url`
    /// is called synchronously from HTTP handlers and the event subscriber).
    fn spawn_persist_state(&self, state: StreamState) {
        self.set_state_local(state);
        let kv = self.kv.clone();
        let key = self.metadata_key();
        let ttl = self.config.metadata_ttl;
        let channel_uuid = self.channel_uuid.clone();
        tokio::spawn(async move {
            if let Err(e) = kv.hash_set(&key, "state", state.as_str(), ttl).await {
                warn!(channel = %channel_uuid, error = %e, state = state.as_str(), "failed to persist stream state");
            }
        });
    }

    pub fn state(&self) -> StreamState {
        StreamState::decode(self.state.load(Ordering::Acquire))
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn should_retry(&self) -> bool {
        self.should_retry.load(Ordering::Acquire)
    }

    /// Atomic swap of the upstream target. Returns `false` (no-op) if the new
    /// URL/user-agent match the current one, matching spec §8's idempotence
    /// property for `update_url`.
    pub fn update_url(&self, new_url: String, new_user_agent: Option<String>) -> bool {
        let mut current = self.current.lock();
        let ua = new_user_agent.unwrap_or_else(|| current.user_agent.clone());
        if current.url == new_url && current.user_agent == ua {
            return false;
        }
        current.url = new_url;
        current.user_agent = ua;
        drop(current);

        self.spawn_persist_state(StreamState::Switching);
        self.switch.notify_one();
        true
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn metadata_key(&self) -> String {
        format!("metadata:{}", self.channel_uuid)
    }

    /// Launches the fetch loop as its own task (spec §4.4 `start()`).
    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = self.config.initial_backoff;

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(StreamState::Stopped).await;
                return;
            }

            self.set_state(StreamState::Connecting).await;
            let target = self.current.lock().clone();
            info!(channel = %self.channel_uuid, url = %target.url, "connecting to upstream");

            let attempt = if let Some(cmd) = target.transcode_cmd.clone() {
                self.spawn_transcode(cmd).await
            } else {
                self.connect_http(&target).await
            };

            match attempt {
                Ok(mut stream) => {
                    self.connected.store(true, Ordering::Release);
                    self.healthy.store(true, Ordering::Release);
                    self.retry_count.store(0, Ordering::Release);
                    metrics::RETRY_COUNT.with_label_values(&[&self.channel_uuid]).set(0.0);
                    metrics::STREAM_HEALTHY.with_label_values(&[&self.channel_uuid]).set(1.0);
                    backoff = self.config.initial_backoff;
                    self.set_state(StreamState::Active).await;
                    info!(channel = %self.channel_uuid, "upstream active");

                    match self.pump(&mut stream).await {
                        PumpOutcome::Switching => continue,
                        PumpOutcome::Stopped => {
                            self.set_state(StreamState::Stopped).await;
                            return;
                        }
                        PumpOutcome::Ended => {
                            warn!(channel = %self.channel_uuid, "upstream read ended; reconnecting");
                        }
                    }
                }
                Err(e) => {
                    warn!(channel = %self.channel_uuid, error = %e, "failed to connect upstream");
                }
            }

            self.healthy.store(false, Ordering::Release);
            metrics::STREAM_HEALTHY.with_label_values(&[&self.channel_uuid]).set(0.0);
            let retries = self.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
            metrics::RETRY_COUNT.with_label_values(&[&self.channel_uuid]).set(retries as f64);
            if retries >= self.config.max_retries {
                self.should_retry.store(false, Ordering::Release);
                self.set_state(StreamState::Error).await;
                warn!(channel = %self.channel_uuid, "exhausted retries; giving up");
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.cancel.cancelled() => {
                    self.set_state(StreamState::Stopped).await;
                    return;
                }
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Reads from `stream` until it ends, a switch is requested, or the channel
    /// is stopped. Each read is bounded by `stream_timeout`; a timeout just marks
    /// the stream unhealthy and keeps trying (spec §4.4 "continue trying").
    async fn pump(&self, stream: &mut ByteStream) -> PumpOutcome {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpOutcome::Stopped,
                _ = self.switch.notified() => return PumpOutcome::Switching,
                item = tokio::time::timeout(self.config.stream_timeout, stream.next()) => {
                    match item {
                        Ok(Some(Ok(bytes))) => {
                            self.healthy.store(true, Ordering::Release);
                            let index = self.buffer.append(bytes).await;
                            metrics::BUFFER_INDEX.with_label_values(&[&self.channel_uuid]).set(index as f64);
                            if let Err(e) = self
                                .kv
                                .hash_set(&self.metadata_key(), "buffer_index", &index.to_string(), self.config.metadata_ttl)
                                .await
                            {
                                debug!(channel = %self.channel_uuid, error = %e, "failed to publish buffer_index");
                            }
                        }
                        Ok(Some(Err(e))) => {
                            warn!(channel = %self.channel_uuid, error = %e, "upstream read error");
                            return PumpOutcome::Ended;
                        }
                        Ok(None) => {
                            return PumpOutcome::Ended;
                        }
                        Err(_elapsed) => {
                            self.healthy.store(false, Ordering::Release);
                            metrics::STREAM_HEALTHY.with_label_values(&[&self.channel_uuid]).set(0.0);
                        }
                    }
                }
            }
        }
    }

    async fn connect_http(&self, target: &UpstreamTarget) -> anyhow::Result<ByteStream> {
        let resp = self
            .http
            .get(&target.url)
            .header("User-Agent", target.user_agent.clone())
            .timeout(self.config.connection_timeout)
            .send()
            .await?
            .error_for_status()?;

        let stream = resp
            .bytes_stream()
            .map(|item| item.map_err(std::io::Error::other));
        Ok(Box::pin(stream))
    }

    /// Transcode variant (spec §4.4): spawn the external command, read its
    /// stdout as the byte source. The child is tied to this manager's
    /// cancellation token so `stop()`/`update_url()` also kills the process.
    async fn spawn_transcode(&self, cmd: Vec<String>) -> anyhow::Result<ByteStream> {
        let Some((program, args)) = cmd.split_first() else {
            anyhow::bail!("empty transcode_cmd");
        };

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stderr_ring = Arc::new(Mutex::new(std::collections::VecDeque::<String>::with_capacity(50)));
        {
            let mut reader = tokio::io::BufReader::new(stderr);
            let channel_uuid = self.channel_uuid.clone();
            let ring = stderr_ring.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let trimmed = line.trim().to_string();
                            let mut ring = ring.lock();
                            if ring.len() >= 50 {
                                ring.pop_front();
                            }
                            ring.push_back(trimmed.clone());
                            drop(ring);
                            debug!(channel = %channel_uuid, "transcode stderr: {}", trimmed);
                        }
                    }
                }
            });
        }

        let cancel = self.cancel.clone();
        let read_chunk_size = self.config.read_chunk_size;

        let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(8);
        tokio::spawn(async move {
            let mut buf = vec![0u8; read_chunk_size];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        break;
                    }
                    n = stdout.read(&mut buf) => {
                        match n {
                            Ok(0) => break,
                            Ok(n) => {
                                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                        }
                    }
                }
            }
            let _ = child.kill().await;
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn manager(url: &str) -> StreamManager {
        StreamManager::new(
            "chan-1".to_string(),
            Arc::new(MemoryKv::new()),
            Arc::new(ChunkBuffer::new(
                "chan-1".to_string(),
                Arc::new(MemoryKv::new()),
                Duration::from_secs(60),
                600,
            )),
            url.to_string(),
            "ua/1.0".to_string(),
            None,
            StreamManagerConfig::default(),
        )
    }

    #[tokio::test]
    async fn update_url_is_noop_when_unchanged() {
        let mgr = manager("http://a");
        assert!(!mgr.update_url("http://a".to_string(), Some("ua/1.0".to_string())));
    }

    #[tokio::test]
    async fn update_url_changes_and_signals_switching() {
        let mgr = manager("http://a");
        assert!(mgr.update_url("http://b".to_string(), None));
        assert_eq!(mgr.state(), StreamState::Switching);
    }

    #[tokio::test]
    async fn pump_appends_bytes_and_reports_ended_on_eof() {
        let mgr = manager("http://a");
        let items = vec![
            Ok(Bytes::from_static(b"one")),
            Ok(Bytes::from_static(b"two")),
        ];
        let mut stream: ByteStream = Box::pin(futures::stream::iter(items));
        let outcome = mgr.pump(&mut stream).await;
        assert!(matches!(outcome, PumpOutcome::Ended));
        assert_eq!(mgr.buffer.latest_index(), 2);
    }

    #[tokio::test]
    async fn pump_stops_when_cancelled() {
        let mgr = manager("http://a");
        mgr.stop();
        let mut stream: ByteStream = Box::pin(futures::stream::pending());
        let outcome = mgr.pump(&mut stream).await;
        assert!(matches!(outcome, PumpOutcome::Stopped));
    }

    #[tokio::test]
    async fn pump_reports_switching_when_update_url_fires() {
        let mgr = manager("http://a");
        let mut stream: ByteStream = Box::pin(futures::stream::pending());
        mgr.update_url("http://b".to_string(), None);
        let outcome = mgr.pump(&mut stream).await;
        assert!(matches!(outcome, PumpOutcome::Switching));
    }
}
