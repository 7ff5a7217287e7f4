use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::buffer::ChunkBuffer;
use crate::channels::ChannelCatalog;
use crate::clients::ClientRegistry;
use crate::error::{ProxyError, ProxyResult};
use crate::kv::Kv;
use crate::metrics;
use crate::stream_manager::{StreamManager, StreamManagerConfig, StreamState};

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn metadata_key(channel_uuid: &str) -> String {
    format!("metadata:{channel_uuid}")
}

fn owner_key(channel_uuid: &str) -> String {
    format!("owner:{channel_uuid}")
}

/// Everything this worker holds locally for one channel (spec §3 "Worker" entity):
/// a stream manager (owner-only; `None` on a follower), a chunk buffer, and a
/// client registry.
pub struct ChannelHandle {
    pub buffer: Arc<ChunkBuffer>,
    pub clients: Arc<ClientRegistry>,
    pub stream_manager: Option<Arc<StreamManager>>,
    pub cancel: CancellationToken,
}

pub struct LifecycleConfig {
    pub owner_lock_ttl: Duration,
    pub chunk_ttl: Duration,
    pub max_local_chunks: u64,
    pub client_ttl: Duration,
    pub channel_shutdown_delay: Duration,
    pub channel_init_grace_period: Duration,
    pub client_sweep_interval: Duration,
    pub client_inactivity_timeout: Duration,
    pub stream_manager: StreamManagerConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            owner_lock_ttl: Duration::from_secs(30),
            chunk_ttl: Duration::from_secs(60),
            max_local_chunks: 600,
            client_ttl: Duration::from_secs(30),
            channel_shutdown_delay: Duration::from_secs(5),
            channel_init_grace_period: Duration::from_secs(5),
            client_sweep_interval: Duration::from_secs(10),
            client_inactivity_timeout: Duration::from_secs(30),
            stream_manager: StreamManagerConfig::default(),
        }
    }
}

/// Creates channels on demand, acquires/renews ownership, and runs the
/// shutdown-grace protocol (spec §4.5). One instance per worker process,
/// shared by every HTTP handler (spec §9's anti-globals note: this replaces
/// the source's module-level `stream_managers`/`stream_buffers` dicts).
pub struct ChannelLifecycle {
    worker_id: String,
    kv: Arc<dyn Kv>,
    catalog: Arc<dyn ChannelCatalog>,
    config: LifecycleConfig,
    channels: DashMap<String, Arc<ChannelHandle>>,
}

impl ChannelLifecycle {
    pub fn new(worker_id: String, kv: Arc<dyn Kv>, catalog: Arc<dyn ChannelCatalog>, config: LifecycleConfig) -> Self {
        Self {
            worker_id,
            kv,
            catalog,
            config,
            channels: DashMap::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn handle(&self, channel_uuid: &str) -> Option<Arc<ChannelHandle>> {
        self.channels.get(channel_uuid).map(|e| e.clone())
    }

    pub fn channel_uuids(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Idempotent: makes the channel locally usable (buffer + registry exist,
    /// metadata is present in KV), resolving via the catalog on first sight and
    /// racing with other workers for ownership. Returns once local state exists,
    /// regardless of which worker ends up owning the channel.
    pub async fn ensure_channel(self: &Arc<Self>, channel_uuid: &str) -> ProxyResult<Arc<ChannelHandle>> {
        if let Some(handle) = self.handle(channel_uuid) {
            return Ok(handle);
        }

        let descriptor = self.catalog.resolve(channel_uuid).await?;

        // `entry()` holds the shard lock for this key across the occupied/vacant
        // check and the insert, so two concurrent first-requests for the same
        // brand-new channel can't both observe a vacant slot: only one inserts a
        // handle, the other gets that same handle back and returns immediately
        // below without building its own buffer/registry (spec §8 idempotence).
        let (handle, created) = match self.channels.entry(channel_uuid.to_string()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let buffer = Arc::new(ChunkBuffer::new(
                    channel_uuid.to_string(),
                    self.kv.clone(),
                    self.config.chunk_ttl,
                    self.config.max_local_chunks,
                ));
                let clients = Arc::new(ClientRegistry::new(channel_uuid.to_string(), self.kv.clone(), self.config.client_ttl));
                let handle = Arc::new(ChannelHandle {
                    buffer,
                    clients,
                    stream_manager: None,
                    cancel: CancellationToken::new(),
                });
                vacant.insert(handle.clone());
                (handle, true)
            }
        };

        if !created {
            return Ok(handle);
        }

        let existing = self.kv.hash_get_all(&metadata_key(channel_uuid)).await?;
        if existing.is_empty() {
            let now = now_secs().to_string();
            let transcode_cmd_json = serde_json::to_string(&descriptor.transcode_cmd).unwrap();
            let meta = &[
                ("url", descriptor.url.as_str()),
                ("user_agent", descriptor.user_agent.as_str()),
                ("state", "initializing"),
                ("owner", ""),
                ("buffer_index", "0"),
                ("created_at", now.as_str()),
                ("updated_at", now.as_str()),
                ("transcode_cmd", transcode_cmd_json.as_str()),
            ];
            for (field, value) in meta {
                self.kv
                    .hash_set(&metadata_key(channel_uuid), field, value, self.config.owner_lock_ttl * 4)
                    .await?;
            }
        }

        self.spawn_sweeper(channel_uuid.to_string(), handle.clone());

        if self.try_acquire_ownership(channel_uuid).await? {
            self.start_owned(channel_uuid, descriptor.url, descriptor.user_agent, descriptor.transcode_cmd, handle.clone())
                .await?;
        }

        Ok(self.handle(channel_uuid).unwrap_or(handle))
    }

    async fn start_owned(
        self: &Arc<Self>,
        channel_uuid: &str,
        url: String,
        user_agent: String,
        transcode_cmd: Option<Vec<String>>,
        handle: Arc<ChannelHandle>,
    ) -> ProxyResult<()> {
        let manager = Arc::new(StreamManager::new(
            channel_uuid.to_string(),
            self.kv.clone(),
            handle.buffer.clone(),
            url,
            user_agent,
            transcode_cmd,
            StreamManagerConfig {
                connection_timeout: self.config.stream_manager.connection_timeout,
                stream_timeout: self.config.stream_manager.stream_timeout,
                max_retries: self.config.stream_manager.max_retries,
                initial_backoff: self.config.stream_manager.initial_backoff,
                max_backoff: self.config.stream_manager.max_backoff,
                read_chunk_size: self.config.stream_manager.read_chunk_size,
                metadata_ttl: self.config.stream_manager.metadata_ttl,
            },
        ));
        manager.clone().start();

        self.kv
            .hash_set(&metadata_key(channel_uuid), "state", "connecting", self.config.owner_lock_ttl * 4)
            .await?;
        self.kv
            .hash_set(&metadata_key(channel_uuid), "owner", &self.worker_id, self.config.owner_lock_ttl * 4)
            .await?;

        let updated = Arc::new(ChannelHandle {
            buffer: handle.buffer.clone(),
            clients: handle.clients.clone(),
            stream_manager: Some(manager.clone()),
            cancel: handle.cancel.clone(),
        });
        // Only swap in the new handle if the map still holds the exact handle we
        // were handed; `ensure_channel`'s atomic `entry()` install means this is
        // always true in practice, but guarding on it means a stale caller can
        // never clobber a handle some other path has since replaced.
        if let Some(mut slot) = self.channels.get_mut(channel_uuid) {
            if Arc::ptr_eq(&*slot, &handle) {
                *slot = updated;
            }
        }

        self.spawn_heartbeat(channel_uuid.to_string(), manager.clone());
        crate::events::spawn_owner_subscriber(channel_uuid.to_string(), self.kv.clone(), self.clone(), manager);
        self.spawn_init_grace_check(channel_uuid.to_string());
        info!(channel = %channel_uuid, worker = %self.worker_id, "acquired ownership and started stream manager");
        Ok(())
    }

    /// Removes local state for a channel without publishing or touching KV
    /// (spec §4.7: a follower reacting to someone else's `stop_channel` event
    /// just drops its own bookkeeping; the owner that issued the event already
    /// deleted the shared KV state).
    pub fn teardown_local(&self, channel_uuid: &str) {
        if let Some((_, handle)) = self.channels.remove(channel_uuid) {
            handle.cancel.cancel();
            if let Some(manager) = &handle.stream_manager {
                manager.stop();
            }
        }
    }

    /// Per-channel client-registry sweeper (spec §4.3 `sweep`, §5 "exactly one
    /// client-registry sweeper timer"). Runs for the lifetime of the channel
    /// handle regardless of ownership: both owners and followers accept local
    /// clients, so both need local inactivity cleanup. Also keeps the
    /// per-channel client-count gauges current, since this is the one place
    /// that already ticks on a fixed interval for every locally-known channel.
    fn spawn_sweeper(&self, channel_uuid: String, handle: Arc<ChannelHandle>) {
        let interval = self.config.client_sweep_interval;
        let timeout = self.config.client_inactivity_timeout;
        let cancel = handle.cancel.clone();
        let kv = self.kv.clone();
        let worker_id = self.worker_id.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let swept = handle.clients.sweep(timeout).await;
                        let local_count = handle.clients.local_count() as u64;
                        if swept > 0 {
                            info!(channel = %channel_uuid, swept, "swept inactive clients");
                            let event = crate::events::Event::ClientCountChanged {
                                requester: worker_id.clone(),
                                count: local_count,
                                ts: now_secs(),
                            };
                            let _ = kv
                                .publish(&crate::events::channel_topic(&channel_uuid), &serde_json::to_string(&event).unwrap())
                                .await;
                        }
                        metrics::LOCAL_CLIENTS
                            .with_label_values(&[&channel_uuid])
                            .set(local_count as f64);
                        metrics::GLOBAL_CLIENTS
                            .with_label_values(&[&channel_uuid])
                            .set(handle.clients.global_count().await as f64);
                    }
                }
            }
        });
    }

    fn spawn_heartbeat(&self, channel_uuid: String, manager: Arc<StreamManager>) {
        let kv = self.kv.clone();
        let worker_id = self.worker_id.clone();
        let ttl = self.config.owner_lock_ttl;
        let cancel = manager.cancellation_token();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl / 3);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        match kv.renew(&owner_key(&channel_uuid), &worker_id, ttl).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(channel = %channel_uuid, worker = %worker_id, "lost ownership lock; stopping stream manager");
                                manager.stop();
                                return;
                            }
                            Err(e) => {
                                warn!(channel = %channel_uuid, error = %e, "heartbeat renew failed (store error)");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Atomic acquire on `owner:{channel}` (spec §4.5). Safe to call whether or
    /// not the channel is already locally known.
    pub async fn try_acquire_ownership(&self, channel_uuid: &str) -> ProxyResult<bool> {
        self.kv
            .atomic_acquire(&owner_key(channel_uuid), &self.worker_id, self.config.owner_lock_ttl)
            .await
    }

    pub async fn am_owner(&self, channel_uuid: &str) -> bool {
        self.handle(channel_uuid)
            .map(|h| h.stream_manager.is_some() && h.stream_manager.as_ref().unwrap().state() != StreamState::Stopped)
            .unwrap_or(false)
    }

    /// Waits until metadata state reaches `connecting` or `active`, up to
    /// `timeout` (spec §4.5/§4.6's follower wait gate). This crate has no
    /// separate `waiting_for_clients` state — the stream manager starts
    /// fetching as soon as ownership is acquired rather than waiting for a
    /// first client — so `connecting` is accepted too: the chunk buffer is
    /// safe to poll before any bytes have arrived (`get_chunks_from` just
    /// returns empty), so letting a client register while still connecting
    /// only changes where the "no bytes yet" wait happens, not whether it
    /// happens.
    pub async fn wait_ready(&self, channel_uuid: &str, timeout: Duration) -> ProxyResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let meta = self.kv.hash_get_all(&metadata_key(channel_uuid)).await?;
            match meta.get("state").map(String::as_str) {
                Some("active") | Some("connecting") | Some("waiting_for_clients") => return Ok(()),
                Some("error") => return Err(ProxyError::UpstreamConnect(channel_uuid.to_string(), "stream manager in error state".to_string())),
                Some("stopped") | None => {}
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProxyError::InitTimeout(channel_uuid.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Spec §4.6 step 4: if this worker has no local stream manager for the
    /// channel yet, try to become owner and, if successful, start one from
    /// whatever metadata is currently in KV. No-op (returns `Ok(false)`) if
    /// already owner or if another worker wins the race.
    pub async fn promote_to_owner_if_needed(self: &Arc<Self>, channel_uuid: &str) -> ProxyResult<bool> {
        if self.am_owner(channel_uuid).await {
            return Ok(false);
        }
        if !self.try_acquire_ownership(channel_uuid).await? {
            return Ok(false);
        }

        let meta = self.kv.hash_get_all(&metadata_key(channel_uuid)).await?;
        let url = meta.get("url").cloned().unwrap_or_default();
        let user_agent = meta.get("user_agent").cloned().unwrap_or_default();
        let transcode_cmd = meta
            .get("transcode_cmd")
            .and_then(|raw| serde_json::from_str::<Option<Vec<String>>>(raw).ok())
            .flatten();

        let Some(handle) = self.handle(channel_uuid) else {
            return Ok(false);
        };
        self.start_owned(channel_uuid, url, user_agent, transcode_cmd, handle).await?;
        Ok(true)
    }

    /// Spec §4.5 shutdown-grace: call once local client count hits zero. Schedules
    /// `stop_channel` after `channel_shutdown_delay` if this worker owns the
    /// channel and global client count is still zero when the delay fires.
    pub fn schedule_shutdown_if_owner_and_empty(self: &Arc<Self>, channel_uuid: &str) {
        let Some(handle) = self.handle(channel_uuid) else { return };
        if handle.stream_manager.is_none() {
            return;
        }

        let lifecycle = self.clone();
        let channel_uuid = channel_uuid.to_string();
        let delay = self.config.channel_shutdown_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(handle) = lifecycle.handle(&channel_uuid) else { return };
            if handle.clients.global_count().await == 0 {
                lifecycle.stop_channel(&channel_uuid).await;
            }
        });
    }

    /// `CHANNEL_INIT_GRACE_PERIOD` (spec §6): a freshly-created, freshly-owned
    /// channel is allowed this long to pick up its first client before the
    /// owner gives up on it. Without this, a channel created by a request that
    /// is itself abandoned before registering (e.g. a probe that never reads
    /// the body) would hold its upstream connection open indefinitely, since
    /// the ordinary shutdown-grace timer (`channel_shutdown_delay`) only runs
    /// when a local client that was actually registered disconnects.
    fn spawn_init_grace_check(self: &Arc<Self>, channel_uuid: String) {
        let lifecycle = self.clone();
        let grace = self.config.channel_init_grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(handle) = lifecycle.handle(&channel_uuid) else { return };
            if handle.clients.global_count().await == 0 {
                info!(channel = %channel_uuid, "no clients registered within init grace period; stopping");
                lifecycle.stop_channel(&channel_uuid).await;
            }
        });
    }

    /// Publishes `stop_channel`, stops the stream manager, and deletes local and
    /// KV state for the channel (spec §4.5).
    pub async fn stop_channel(&self, channel_uuid: &str) {
        let event = crate::events::Event::StopChannel {
            requester: self.worker_id.clone(),
            ts: now_secs(),
        };
        let _ = self
            .kv
            .publish(&crate::events::channel_topic(channel_uuid), &serde_json::to_string(&event).unwrap())
            .await;

        self.teardown_local(channel_uuid);

        let _ = self.kv.del(&metadata_key(channel_uuid)).await;
        let _ = self.kv.del(&owner_key(channel_uuid)).await;
        let _ = self.kv.del(&format!("clients:{channel_uuid}")).await;
        info!(channel = %channel_uuid, worker = %self.worker_id, "stopped channel");
    }

    pub async fn status_all(&self) -> ProxyResult<Vec<HashMap<String, String>>> {
        let mut out = Vec::new();
        for key in self.kv.scan("metadata:").await? {
            if let Some(channel_uuid) = key.strip_prefix("metadata:") {
                let mut meta = self.kv.hash_get_all(&key).await?;
                meta.insert("channel_uuid".to_string(), channel_uuid.to_string());
                out.push(meta);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{Channel, M3uCatalog};
    use crate::kv::MemoryKv;

    fn lifecycle_with(catalog: M3uCatalog) -> (Arc<ChannelLifecycle>, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let lifecycle = Arc::new(ChannelLifecycle::new(
            "worker-1".to_string(),
            kv.clone(),
            Arc::new(catalog),
            LifecycleConfig::default(),
        ));
        (lifecycle, kv)
    }

    fn single_channel_catalog() -> (M3uCatalog, String) {
        let channel = Channel { name: "Test".to_string(), url: "http://upstream/test".to_string() };
        let uuid = crate::channels::derive_channel_uuid(&channel);
        (M3uCatalog::from_channels(vec![channel], "ua/1.0".to_string()), uuid)
    }

    #[tokio::test]
    async fn ensure_channel_creates_metadata_and_acquires_ownership() {
        let (catalog, uuid) = single_channel_catalog();
        let (lifecycle, kv) = lifecycle_with(catalog);

        let handle = lifecycle.ensure_channel(&uuid).await.unwrap();
        assert!(handle.stream_manager.is_some());
        assert!(lifecycle.am_owner(&uuid).await);

        let meta = kv.hash_get_all(&metadata_key(&uuid)).await.unwrap();
        assert_eq!(meta.get("owner").map(String::as_str), Some("worker-1"));
    }

    #[tokio::test]
    async fn ensure_channel_twice_is_idempotent() {
        let (catalog, uuid) = single_channel_catalog();
        let (lifecycle, _kv) = lifecycle_with(catalog);

        let first = lifecycle.ensure_channel(&uuid).await.unwrap();
        let second = lifecycle.ensure_channel(&uuid).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn ensure_channel_unknown_uuid_fails() {
        let (catalog, _uuid) = single_channel_catalog();
        let (lifecycle, _kv) = lifecycle_with(catalog);
        let err = lifecycle.ensure_channel("not-a-real-uuid").await;
        assert!(matches!(err, Err(ProxyError::ChannelNotFound(_))));
    }

    #[tokio::test]
    async fn second_worker_does_not_acquire_ownership_while_first_holds_it() {
        let channel = Channel { name: "Test".to_string(), url: "http://upstream/test".to_string() };
        let uuid = crate::channels::derive_channel_uuid(&channel);
        let kv = Arc::new(MemoryKv::new());

        let catalog_a = Arc::new(M3uCatalog::from_channels(vec![channel.clone()], "ua/1.0".to_string()));
        let lifecycle_a = Arc::new(ChannelLifecycle::new("worker-a".to_string(), kv.clone(), catalog_a, LifecycleConfig::default()));
        lifecycle_a.ensure_channel(&uuid).await.unwrap();

        let acquired_b = lifecycle_a.try_acquire_ownership(&uuid).await.unwrap();
        assert!(!acquired_b, "owner key already held by worker-a");
    }
}
