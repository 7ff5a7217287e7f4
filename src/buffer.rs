use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

use crate::kv::Kv;

/// Shared chunk ring buffer (spec §4.2). One writer (the owning channel's fetch
/// loop), many readers (client streamer tasks on this worker and, via `Kv`, on
/// others). The local deque is guarded by a plain mutex: the critical section is a
/// push/evict or a snapshot-copy, never an `.await`, so a sync lock is the right
/// tool (see §9, "lock held across sleeps: forbidden").
pub struct ChunkBuffer {
    channel_uuid: String,
    kv: Arc<dyn Kv>,
    chunk_ttl: Duration,
    max_local_chunks: u64,
    latest_index: AtomicU64,
    local: Mutex<VecDeque<(u64, Bytes)>>,
}

impl ChunkBuffer {
    pub fn new(channel_uuid: String, kv: Arc<dyn Kv>, chunk_ttl: Duration, max_local_chunks: u64) -> Self {
        Self {
            channel_uuid,
            kv,
            chunk_ttl,
            max_local_chunks,
            latest_index: AtomicU64::new(0),
            local: Mutex::new(VecDeque::new()),
        }
    }

    fn chunk_key(&self, index: u64) -> String {
        format!("chunk:{}:{}", self.channel_uuid, index)
    }

    /// Writes a chunk, returns its new index. Mirrors it into KV with a short TTL
    /// so a non-owner worker can serve late-joining clients during ownership
    /// migration, then evicts local chunks older than the retention window.
    pub async fn append(&self, bytes: Bytes) -> u64 {
        let index = {
            let mut local = self.local.lock();
            let index = self.latest_index.fetch_add(1, Ordering::AcqRel) + 1;
            local.push_back((index, bytes.clone()));
            let floor = index.saturating_sub(self.max_local_chunks);
            while local.front().map(|(i, _)| *i < floor).unwrap_or(false) {
                local.pop_front();
            }
            index
        };

        if let Err(e) = self
            .kv
            .blob_put(&self.chunk_key(index), &bytes, self.chunk_ttl)
            .await
        {
            warn!("chunk buffer: failed to mirror chunk {} to kv: {}", index, e);
        }

        index
    }

    /// Returns up to `max_count` contiguous chunks starting at `start_index`,
    /// bounded by `max_bytes`, plus the cursor to resume from. Never errors; an
    /// out-of-range start simply yields nothing (spec §8 boundary behavior).
    pub async fn get_chunks_from(
        &self,
        start_index: u64,
        max_count: usize,
        max_bytes: usize,
    ) -> (Vec<Bytes>, u64) {
        let latest = self.latest_index();
        if start_index > latest {
            return (Vec::new(), start_index);
        }

        let snapshot: Vec<(u64, Bytes)> = {
            let local = self.local.lock();
            local.iter().cloned().collect()
        };

        let mut chunks = Vec::new();
        let mut total_bytes = 0usize;
        let mut next_index = start_index;

        for want in (start_index + 1)..=latest {
            if chunks.len() >= max_count {
                break;
            }
            let found = snapshot
                .iter()
                .find(|(i, _)| *i == want)
                .map(|(_, b)| b.clone());

            let chunk = match found {
                Some(b) => Some(b),
                None => self
                    .kv
                    .blob_get(&self.chunk_key(want))
                    .await
                    .ok()
                    .flatten()
                    .map(Bytes::from),
            };

            let Some(chunk) = chunk else {
                // Gap: the chunk fell out of both local memory and KV (TTL expiry
                // while a slow client was still behind it). Stop here; the client
                // will stall and either catch up once the writer advances past
                // this gap, or time out per spec §8.
                break;
            };

            if !chunks.is_empty() && total_bytes + chunk.len() > max_bytes {
                break;
            }

            total_bytes += chunk.len();
            chunks.push(chunk);
            next_index = want;
        }

        (chunks, next_index)
    }

    pub fn latest_index(&self) -> u64 {
        self.latest_index.load(Ordering::Acquire)
    }

    pub fn evict_older_than(&self, index: u64) {
        let mut local = self.local.lock();
        while local.front().map(|(i, _)| *i < index).unwrap_or(false) {
            local.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn buffer() -> ChunkBuffer {
        ChunkBuffer::new(
            "chan-1".to_string(),
            Arc::new(MemoryKv::new()),
            Duration::from_secs(60),
            10,
        )
    }

    #[tokio::test]
    async fn append_is_monotonic_and_ordered() {
        let buf = buffer();
        let i1 = buf.append(Bytes::from_static(b"a")).await;
        let i2 = buf.append(Bytes::from_static(b"b")).await;
        assert_eq!(i1, 1);
        assert_eq!(i2, 2);
        assert_eq!(buf.latest_index(), 2);

        let (chunks, next) = buf.get_chunks_from(0, 10, 1 << 20).await;
        assert_eq!(chunks, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(next, 2);
    }

    #[tokio::test]
    async fn cursor_past_latest_returns_empty() {
        let buf = buffer();
        buf.append(Bytes::from_static(b"a")).await;
        let (chunks, next) = buf.get_chunks_from(100, 10, 1 << 20).await;
        assert!(chunks.is_empty());
        assert_eq!(next, 100);
    }

    #[tokio::test]
    async fn eviction_drops_old_local_chunks() {
        let buf = ChunkBuffer::new(
            "chan-1".to_string(),
            Arc::new(MemoryKv::new()),
            Duration::from_secs(60),
            2,
        );
        for i in 0..5 {
            buf.append(Bytes::from(vec![i as u8])).await;
        }
        let local = buf.local.lock();
        assert!(local.len() <= 2);
    }

    #[tokio::test]
    async fn respects_max_count_and_max_bytes() {
        let buf = buffer();
        for i in 0..5u8 {
            buf.append(Bytes::from(vec![i; 4])).await;
        }
        let (chunks, next) = buf.get_chunks_from(0, 2, 1 << 20).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(next, 2);

        let (chunks, _) = buf.get_chunks_from(0, 10, 5).await;
        assert_eq!(chunks.len(), 1);
    }
}
