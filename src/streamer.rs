use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ProxyResult;
use crate::lifecycle::ChannelLifecycle;

/// Keep-alive TS null packet (spec §4.6, glossary): 188 bytes, sync byte
/// `0x47`, PID `0x1FFF`. Matches the source's literal construction
/// (`bytearray(188)` with only the first three bytes set) rather than also
/// setting the adaptation-field-control byte, so a byte-for-byte comparison
/// against the source's output holds.
fn ts_null_packet() -> Bytes {
    let mut pkt = vec![0u8; 188];
    pkt[0] = 0x47;
    pkt[1] = 0x1F;
    pkt[2] = 0xFF;
    Bytes::from(pkt)
}

fn generate_client_id() -> String {
    use rand::Rng;
    let unix_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix: u32 = rand::thread_rng().gen();
    format!("client_{unix_ms}_{suffix:08x}")
}

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub max_chunks: usize,
    pub max_bytes: usize,
    pub initial_behind_chunks: u64,
    pub stream_timeout: Duration,
    pub client_wait_timeout: Duration,
    pub keepalive_interval: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub ghost_empty_reads_threshold: u64,
    pub ghost_chunks_ahead_threshold: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            max_chunks: 20,
            max_bytes: 2 * 1024 * 1024,
            initial_behind_chunks: 10,
            stream_timeout: Duration::from_secs(30),
            client_wait_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_millis(500),
            min_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
            ghost_empty_reads_threshold: 100,
            ghost_chunks_ahead_threshold: 50,
        }
    }
}

/// RAII client-guard (spec §4.6 step 7): removes the client from the registry
/// and, if it was the last local client on an owned channel, schedules the
/// grace-shutdown task. Runs on every exit path — normal completion,
/// disconnect, or ghost-client eviction — by living inside the
/// `async_stream::stream!` body and being dropped with it.
struct ClientGuard {
    lifecycle: Arc<ChannelLifecycle>,
    channel_uuid: String,
    client_id: String,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.clone();
        let channel_uuid = self.channel_uuid.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            if let Some(handle) = lifecycle.handle(&channel_uuid) {
                let remaining = handle.clients.remove(&client_id).await;
                info!(channel = %channel_uuid, client = %client_id, remaining, "client disconnected");
                if remaining == 0 {
                    lifecycle.schedule_shutdown_if_owner_and_empty(&channel_uuid);
                }
            }
        });
    }
}

fn initial_cursor(latest: u64, behind: u64) -> u64 {
    latest.saturating_sub(behind)
}

/// Per-HTTP-request generator (spec §4.6). Ensures the channel exists, waits
/// for it to become ready, registers the client, and returns a `Stream` of
/// response body chunks that the HTTP layer can hand to
/// `axum::body::Body::from_stream`.
pub async fn stream_channel(
    channel_uuid: String,
    lifecycle: Arc<ChannelLifecycle>,
    config: StreamerConfig,
    user_agent: Option<String>,
) -> ProxyResult<impl Stream<Item = std::io::Result<Bytes>>> {
    let handle = lifecycle.ensure_channel(&channel_uuid).await?;
    lifecycle.wait_ready(&channel_uuid, config.client_wait_timeout).await?;

    let client_id = generate_client_id();
    let local_count = handle.clients.add(&client_id, user_agent).await;
    if local_count == 1 {
        let _ = lifecycle.promote_to_owner_if_needed(&channel_uuid).await;
    }
    // Re-fetch: promotion may have installed a stream manager on this handle.
    let handle = lifecycle.handle(&channel_uuid).unwrap_or(handle);

    let guard = ClientGuard {
        lifecycle: lifecycle.clone(),
        channel_uuid: channel_uuid.clone(),
        client_id: client_id.clone(),
    };

    let buffer = handle.buffer.clone();
    let clients = handle.clients.clone();
    let stream_manager = handle.stream_manager.clone();

    let stream = async_stream::stream! {
        let _guard = guard;
        let keepalive = ts_null_packet();

        let mut cursor = initial_cursor(buffer.latest_index(), config.initial_behind_chunks);
        let mut empty_reads: u64 = 0;
        let mut backoff = config.min_backoff;
        let mut last_yield = Instant::now();

        loop {
            let (chunks, next_cursor) = buffer
                .get_chunks_from(cursor, config.max_chunks, config.max_bytes)
                .await;

            if !chunks.is_empty() {
                for chunk in chunks {
                    yield Ok::<Bytes, std::io::Error>(chunk);
                }
                cursor = next_cursor;
                clients.touch(&client_id).await;
                last_yield = Instant::now();
                empty_reads = 0;
                backoff = config.min_backoff;
                continue;
            }

            empty_reads += 1;
            let latest = buffer.latest_index();
            let unhealthy = stream_manager.as_ref().map(|m| !m.healthy()).unwrap_or(false);

            if cursor >= latest && unhealthy && last_yield.elapsed() >= config.keepalive_interval {
                yield Ok(keepalive.clone());
                clients.touch(&client_id).await;
                last_yield = Instant::now();
            }

            if unhealthy && last_yield.elapsed() > config.stream_timeout {
                debug!(channel = %channel_uuid, client = %client_id, "stream timed out while unhealthy; closing");
                break;
            }

            // Ghost client: the buffer has moved on (the chunk this cursor
            // wants has already been evicted from both tiers) for many
            // consecutive empty reads, and it's nowhere near the live edge.
            if empty_reads > config.ghost_empty_reads_threshold
                && latest.saturating_sub(cursor) > config.ghost_chunks_ahead_threshold
            {
                debug!(channel = %channel_uuid, client = %client_id, cursor, latest, "ghost client detected; closing");
                break;
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(config.max_backoff);
        }
    };

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_packet_matches_source_byte_layout() {
        let pkt = ts_null_packet();
        assert_eq!(pkt.len(), 188);
        assert_eq!(pkt[0], 0x47);
        assert_eq!(pkt[1], 0x1F);
        assert_eq!(pkt[2], 0xFF);
        assert!(pkt[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn initial_cursor_clamps_to_zero() {
        assert_eq!(initial_cursor(5, 10), 0);
        assert_eq!(initial_cursor(100, 10), 90);
    }

    #[test]
    fn client_ids_are_unique_and_well_formed() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_ne!(a, b);
        assert!(a.starts_with("client_"));
    }
}
