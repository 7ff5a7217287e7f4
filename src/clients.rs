use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::info;

use crate::kv::Kv;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Clone)]
pub struct ClientState {
    pub user_agent: Option<String>,
    pub connected_at: i64,
    pub last_activity_at: Arc<AtomicI64>,
}

/// Per-channel client registry (spec §4.3). Local membership lives in a
/// concurrent map touched by the handler task that owns each client plus the
/// sweeper timer; global membership is mirrored into a KV set with a per-client
/// hash whose TTL is refreshed on `touch`.
pub struct ClientRegistry {
    channel_uuid: String,
    kv: Arc<dyn Kv>,
    client_ttl: Duration,
    local: DashMap<String, ClientState>,
}

impl ClientRegistry {
    pub fn new(channel_uuid: String, kv: Arc<dyn Kv>, client_ttl: Duration) -> Self {
        Self {
            channel_uuid,
            kv,
            client_ttl,
            local: DashMap::new(),
        }
    }

    fn set_key(&self) -> String {
        format!("clients:{}", self.channel_uuid)
    }

    fn client_key(&self, client_id: &str) -> String {
        format!("client:{}:{}", self.channel_uuid, client_id)
    }

    pub async fn add(&self, client_id: &str, user_agent: Option<String>) -> usize {
        let now = now_secs();
        self.local.insert(
            client_id.to_string(),
            ClientState {
                user_agent: user_agent.clone(),
                connected_at: now,
                last_activity_at: Arc::new(AtomicI64::new(now)),
            },
        );

        let _ = self.kv.set_add(&self.set_key(), client_id).await;
        let key = self.client_key(client_id);
        let _ = self
            .kv
            .hash_set(&key, "user_agent", user_agent.as_deref().unwrap_or(""), self.client_ttl)
            .await;
        let _ = self
            .kv
            .hash_set(&key, "connected_at", &now.to_string(), self.client_ttl)
            .await;
        let _ = self
            .kv
            .hash_set(&key, "last_activity_at", &now.to_string(), self.client_ttl)
            .await;

        info!("client {} added to channel {} (local={})", client_id, self.channel_uuid, self.local.len());
        self.local.len()
    }

    pub async fn touch(&self, client_id: &str) {
        let now = now_secs();
        if let Some(state) = self.local.get(client_id) {
            state.last_activity_at.store(now, Ordering::Relaxed);
        }
        let _ = self
            .kv
            .hash_set(&self.client_key(client_id), "last_activity_at", &now.to_string(), self.client_ttl)
            .await;
    }

    pub async fn remove(&self, client_id: &str) -> usize {
        self.local.remove(client_id);
        let _ = self.kv.set_remove(&self.set_key(), client_id).await;
        let _ = self.kv.hash_del(&self.client_key(client_id), "user_agent").await;
        info!("client {} removed from channel {} (local={})", client_id, self.channel_uuid, self.local.len());
        self.local.len()
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    /// Advisory: sum of KV set cardinality across all workers. May briefly
    /// overcount due to TTL lag (spec §4.3).
    pub async fn global_count(&self) -> u64 {
        self.kv.set_card(&self.set_key()).await.unwrap_or(0)
    }

    /// Removes locally tracked clients that have been inactive past `timeout`
    /// and drops their mirrored KV entries too, so a crashed/stuck handler
    /// task (one that never reached `remove`'s normal exit path) doesn't leave
    /// a permanent phantom member in `clients:{channel}` inflating
    /// `global_count` forever. Returns the number of clients swept.
    pub async fn sweep(&self, timeout: Duration) -> usize {
        let now = now_secs();
        let timeout_secs = timeout.as_secs() as i64;
        let stale: Vec<String> = self
            .local
            .iter()
            .filter(|entry| now - entry.value().last_activity_at.load(Ordering::Relaxed) > timeout_secs)
            .map(|entry| entry.key().clone())
            .collect();

        for client_id in &stale {
            self.local.remove(client_id);
            let _ = self.kv.set_remove(&self.set_key(), client_id).await;
            let _ = self.kv.hash_del(&self.client_key(client_id), "user_agent").await;
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn registry() -> ClientRegistry {
        ClientRegistry::new("chan-1".to_string(), Arc::new(MemoryKv::new()), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn add_and_remove_track_local_count() {
        let reg = registry();
        assert_eq!(reg.add("c1", Some("ua".to_string())).await, 1);
        assert_eq!(reg.add("c2", None).await, 2);
        assert_eq!(reg.local_count(), 2);
        assert_eq!(reg.remove("c1").await, 1);
        assert_eq!(reg.local_count(), 1);
    }

    #[tokio::test]
    async fn global_count_reflects_kv_set() {
        let reg = registry();
        reg.add("c1", None).await;
        reg.add("c2", None).await;
        assert_eq!(reg.global_count().await, 2);
        reg.remove("c1").await;
        assert_eq!(reg.global_count().await, 1);
    }

    #[tokio::test]
    async fn sweep_removes_inactive_clients() {
        let reg = registry();
        reg.add("c1", None).await;
        if let Some(state) = reg.local.get("c1") {
            state.last_activity_at.store(now_secs() - 120, Ordering::Relaxed);
        }
        let swept = reg.sweep(Duration::from_secs(60)).await;
        assert_eq!(swept, 1);
        assert_eq!(reg.local_count(), 0);
        assert_eq!(reg.global_count().await, 0);
    }
}
