use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ProxyResult;
use crate::kv::Kv;
use crate::lifecycle::ChannelLifecycle;
use crate::stream_manager::StreamManager;

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

pub fn channel_topic(channel_uuid: &str) -> String {
    format!("events:{channel_uuid}")
}

fn metadata_key(channel_uuid: &str) -> String {
    format!("metadata:{channel_uuid}")
}

fn switch_request_key(channel_uuid: &str) -> String {
    format!("switch_request:{channel_uuid}")
}

/// Pub/sub payloads on `events:{channel}` (spec §3 "Event", §4.7). Channel is
/// implicit in the topic, so it is not repeated in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    StreamSwitch { url: String, user_agent: Option<String>, requester: String, ts: i64 },
    StopChannel { requester: String, ts: i64 },
    OwnerHeartbeat { requester: String, ts: i64 },
    ClientCountChanged { requester: String, count: u64, ts: i64 },
}

/// Non-owner switch-request flow (spec §4.7, steps 1-4): update metadata's
/// `url`/`user_agent` eagerly so `/status` reflects the request immediately,
/// leave a short-TTL advisory hint, then publish so the owner reconnects.
pub async fn request_stream_switch(
    kv: &dyn Kv,
    channel_uuid: &str,
    new_url: &str,
    new_user_agent: Option<&str>,
    requester: &str,
) -> ProxyResult<()> {
    let meta = kv.hash_get_all(&metadata_key(channel_uuid)).await?;
    let metadata_ttl = Duration::from_secs(120);

    kv.hash_set(&metadata_key(channel_uuid), "url", new_url, metadata_ttl).await?;
    if let Some(ua) = new_user_agent {
        kv.hash_set(&metadata_key(channel_uuid), "user_agent", ua, metadata_ttl).await?;
    }
    kv.hash_set(
        &metadata_key(channel_uuid),
        "updated_at",
        &now_secs().to_string(),
        metadata_ttl,
    )
    .await?;

    kv.hash_set(&switch_request_key(channel_uuid), "url", new_url, Duration::from_secs(30)).await?;
    let _ = meta; // existence already validated by caller (ensure_channel) before reaching here

    let event = Event::StreamSwitch {
        url: new_url.to_string(),
        user_agent: new_user_agent.map(str::to_string),
        requester: requester.to_string(),
        ts: now_secs(),
    };
    kv.publish(&channel_topic(channel_uuid), &serde_json::to_string(&event).unwrap()).await
}

/// Subscribes the owner to its channel's topic for the lifetime of the stream
/// manager. Reacts to `stream_switch` (calls `update_url`) and `stop_channel`
/// (tears down local state) requests made by other workers; ignores events
/// this worker published itself.
pub fn spawn_owner_subscriber(channel_uuid: String, kv: Arc<dyn Kv>, lifecycle: Arc<ChannelLifecycle>, manager: Arc<StreamManager>) {
    let cancel = manager.cancellation_token();

    tokio::spawn(async move {
        let topic = channel_topic(&channel_uuid);
        let mut rx = match kv.subscribe(&topic).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(channel = %channel_uuid, error = %e, "failed to subscribe to channel events");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                msg = rx.recv() => {
                    let Some(payload) = msg else { return };
                    match serde_json::from_str::<Event>(&payload) {
                        Ok(Event::StreamSwitch { url, user_agent, requester, .. }) => {
                            if requester == lifecycle.worker_id() {
                                continue;
                            }
                            let changed = manager.update_url(url, user_agent);
                            if changed {
                                let count = lifecycle
                                    .handle(&channel_uuid)
                                    .map(|h| h.clients.local_count() as u64)
                                    .unwrap_or(0);
                                let ack = Event::ClientCountChanged {
                                    requester: lifecycle.worker_id().to_string(),
                                    count,
                                    ts: now_secs(),
                                };
                                let _ = kv.publish(&topic, &serde_json::to_string(&ack).unwrap()).await;
                            }
                        }
                        Ok(Event::StopChannel { requester, .. }) => {
                            if requester == lifecycle.worker_id() {
                                continue;
                            }
                            lifecycle.teardown_local(&channel_uuid);
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(channel = %channel_uuid, error = %e, "malformed event payload"),
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn request_stream_switch_updates_metadata_and_publishes() {
        let kv = MemoryKv::new();
        kv.hash_set(&metadata_key("chan-1"), "url", "http://old", Duration::from_secs(60)).await.unwrap();

        let mut rx = kv.subscribe(&channel_topic("chan-1")).await.unwrap();
        request_stream_switch(&kv, "chan-1", "http://new", Some("ua/2.0"), "worker-2").await.unwrap();

        let meta = kv.hash_get_all(&metadata_key("chan-1")).await.unwrap();
        assert_eq!(meta.get("url").map(String::as_str), Some("http://new"));
        assert_eq!(meta.get("user_agent").map(String::as_str), Some("ua/2.0"));

        let payload = rx.recv().await.unwrap();
        let event: Event = serde_json::from_str(&payload).unwrap();
        assert!(matches!(event, Event::StreamSwitch { requester, .. } if requester == "worker-2"));
    }

    #[test]
    fn event_kinds_round_trip_through_json() {
        let event = Event::StopChannel { requester: "worker-1".to_string(), ts: 123 };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, Event::StopChannel { ts: 123, .. }));
    }
}
