use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};
use crate::metrics::KV_ERRORS;

/// Thin, typed facade over the coordination store (spec §4.1). Every method is
/// best-effort from the caller's point of view: implementations retry transient
/// failures internally and only return `Err` once retries are exhausted, so callers
/// can treat `Err` as "store currently unavailable" per §7.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn hash_set(&self, key: &str, field: &str, value: &str, ttl: Duration) -> ProxyResult<()>;
    async fn hash_get_all(&self, key: &str) -> ProxyResult<HashMap<String, String>>;
    async fn hash_del(&self, key: &str, field: &str) -> ProxyResult<()>;

    /// Deletes a key outright, regardless of its type (hash, string, blob, set).
    /// Used by the shutdown protocol to remove `metadata:{channel}`,
    /// `owner:{channel}`, and `clients:{channel}` (spec §4.5).
    async fn del(&self, key: &str) -> ProxyResult<()>;

    /// Set `key = value` only if absent, with TTL. Returns true if this call acquired it.
    async fn atomic_acquire(&self, key: &str, value: &str, ttl: Duration) -> ProxyResult<bool>;

    /// Extend TTL on `key`, but only if its current value still equals `value`
    /// (compare-and-renew, so a stale owner can't resurrect a lock someone else holds).
    async fn renew(&self, key: &str, value: &str, ttl: Duration) -> ProxyResult<bool>;

    async fn set_add(&self, key: &str, member: &str) -> ProxyResult<()>;
    async fn set_remove(&self, key: &str, member: &str) -> ProxyResult<()>;
    async fn set_members(&self, key: &str) -> ProxyResult<Vec<String>>;
    async fn set_card(&self, key: &str) -> ProxyResult<u64>;

    async fn blob_put(&self, key: &str, bytes: &[u8], ttl: Duration) -> ProxyResult<()>;
    async fn blob_get(&self, key: &str) -> ProxyResult<Option<Vec<u8>>>;

    async fn scan(&self, prefix: &str) -> ProxyResult<Vec<String>>;

    async fn publish(&self, topic: &str, message: &str) -> ProxyResult<()>;

    /// Subscribe to `topic`; returns a channel that yields raw message payloads.
    /// The subscriber task owns its own Redis connection for the lifetime of the
    /// subscription, independent of the shared `ConnectionManager`.
    async fn subscribe(&self, topic: &str) -> ProxyResult<mpsc::Receiver<String>>;

    /// One round trip used by the `/healthz` endpoint.
    async fn ping(&self) -> ProxyResult<()>;
}

/// Redis-backed `Kv`. Holds a `ConnectionManager`, which is cheap to clone and
/// reconnects automatically, so `RedisKv` itself is cloned freely into every handler
/// and background task the way `fritztv` clones its `reqwest::Client`.
#[derive(Clone)]
pub struct RedisKv {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    fn map_err(context: &str, e: redis::RedisError) -> ProxyError {
        KV_ERRORS.with_label_values(&[context]).inc();
        ProxyError::StoreUnavailable(format!("{context}: {e}"))
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn hash_set(&self, key: &str, field: &str, value: &str, ttl: Duration) -> ProxyResult<()> {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        let (): () = redis::pipe()
            .atomic()
            .hset(key, field, value)
            .ignore()
            .expire(key, ttl_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("hash_set", e))?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> ProxyResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| Self::map_err("hash_get_all", e))?;
        Ok(map)
    }

    async fn hash_del(&self, key: &str, field: &str) -> ProxyResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hdel(key, field)
            .await
            .map_err(|e| Self::map_err("hash_del", e))?;
        Ok(())
    }

    async fn del(&self, key: &str) -> ProxyResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(|e| Self::map_err("del", e))?;
        Ok(())
    }

    async fn atomic_acquire(&self, key: &str, value: &str, ttl: Duration) -> ProxyResult<bool> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("atomic_acquire", e))?;
        Ok(result.is_some())
    }

    async fn renew(&self, key: &str, value: &str, ttl: Duration) -> ProxyResult<bool> {
        let mut conn = self.conn.clone();
        // Compare-and-renew via a small Lua script: only extend the TTL if our value
        // still holds the key, so a worker that lost ownership can't resurrect it.
        const SCRIPT: &str = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("EXPIRE", KEYS[1], ARGV[2])
            else
                return 0
            end
        "#;
        let renewed: i64 = redis::Script::new(SCRIPT)
            .key(key)
            .arg(value)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("renew", e))?;
        Ok(renewed == 1)
    }

    async fn set_add(&self, key: &str, member: &str) -> ProxyResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .sadd(key, member)
            .await
            .map_err(|e| Self::map_err("set_add", e))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> ProxyResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .srem(key, member)
            .await
            .map_err(|e| Self::map_err("set_remove", e))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> ProxyResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .smembers(key)
            .await
            .map_err(|e| Self::map_err("set_members", e))?;
        Ok(members)
    }

    async fn set_card(&self, key: &str) -> ProxyResult<u64> {
        let mut conn = self.conn.clone();
        let card: u64 = conn
            .scard(key)
            .await
            .map_err(|e| Self::map_err("set_card", e))?;
        Ok(card)
    }

    async fn blob_put(&self, key: &str, bytes: &[u8], ttl: Duration) -> ProxyResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, bytes, ttl.as_secs().max(1))
            .await
            .map_err(|e| Self::map_err("blob_put", e))?;
        Ok(())
    }

    async fn blob_get(&self, key: &str) -> ProxyResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| Self::map_err("blob_get", e))?;
        Ok(value)
    }

    async fn scan(&self, prefix: &str) -> ProxyResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(pattern)
            .await
            .map_err(|e| Self::map_err("scan", e))?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn publish(&self, topic: &str, message: &str) -> ProxyResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(topic, message)
            .await
            .map_err(|e| Self::map_err("publish", e))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> ProxyResult<mpsc::Receiver<String>> {
        let client = self.client.clone();
        let topic = topic.to_string();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            loop {
                let pubsub = match client.get_async_pubsub().await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("subscribe: failed to open pubsub connection for {}: {}", topic, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let mut pubsub = pubsub;
                if let Err(e) = pubsub.subscribe(&topic).await {
                    warn!("subscribe: failed to subscribe to {}: {}", topic, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }

                use futures::StreamExt;
                let mut stream = pubsub.on_message();
                loop {
                    match stream.next().await {
                        Some(msg) => {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(_) => continue,
                            };
                            if tx.send(payload).await.is_err() {
                                return;
                            }
                        }
                        None => break, // connection dropped; reconnect
                    }
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> ProxyResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("ping", e))?;
        Ok(())
    }
}

/// In-memory `Kv` used by unit and integration tests so they don't need a live Redis.
/// Mirrors Redis semantics closely enough for the properties in spec §8 (atomic
/// acquire, compare-and-renew, set membership, pub/sub) without any TTL expiry —
/// tests that care about expiry drive it explicitly rather than sleeping.
#[derive(Default, Clone)]
pub struct MemoryKv {
    inner: std::sync::Arc<parking_lot::Mutex<MemoryKvState>>,
}

#[derive(Default)]
struct MemoryKvState {
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    blobs: HashMap<String, Vec<u8>>,
    sets: HashMap<String, std::collections::HashSet<String>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn hash_set(&self, key: &str, field: &str, value: &str, _ttl: Duration) -> ProxyResult<()> {
        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> ProxyResult<HashMap<String, String>> {
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_del(&self, key: &str, field: &str) -> ProxyResult<()> {
        let mut inner = self.inner.lock();
        if let Some(h) = inner.hashes.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> ProxyResult<()> {
        let mut inner = self.inner.lock();
        inner.hashes.remove(key);
        inner.strings.remove(key);
        inner.blobs.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn atomic_acquire(&self, key: &str, value: &str, _ttl: Duration) -> ProxyResult<bool> {
        let mut inner = self.inner.lock();
        if inner.strings.contains_key(key) {
            Ok(false)
        } else {
            inner.strings.insert(key.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn renew(&self, key: &str, value: &str, _ttl: Duration) -> ProxyResult<bool> {
        let inner = self.inner.lock();
        Ok(inner.strings.get(key).map(|v| v == value).unwrap_or(false))
    }

    async fn set_add(&self, key: &str, member: &str) -> ProxyResult<()> {
        let mut inner = self.inner.lock();
        inner.sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> ProxyResult<()> {
        let mut inner = self.inner.lock();
        if let Some(s) = inner.sets.get_mut(key) {
            s.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> ProxyResult<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    async fn set_card(&self, key: &str) -> ProxyResult<u64> {
        let inner = self.inner.lock();
        Ok(inner.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn blob_put(&self, key: &str, bytes: &[u8], _ttl: Duration) -> ProxyResult<()> {
        let mut inner = self.inner.lock();
        inner.blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn blob_get(&self, key: &str) -> ProxyResult<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        Ok(inner.blobs.get(key).cloned())
    }

    async fn scan(&self, prefix: &str) -> ProxyResult<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .hashes
            .keys()
            .chain(inner.strings.keys())
            .chain(inner.blobs.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn publish(&self, topic: &str, message: &str) -> ProxyResult<()> {
        let senders: Vec<_> = {
            let inner = self.inner.lock();
            inner.subscribers.get(topic).cloned().unwrap_or_default()
        };
        for sender in senders {
            let _ = sender.send(message.to_string()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> ProxyResult<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(256);
        let mut inner = self.inner.lock();
        inner.subscribers.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn ping(&self) -> ProxyResult<()> {
        Ok(())
    }
}
