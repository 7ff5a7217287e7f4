use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};

/// One entry parsed out of an M3U playlist: a display name plus its upstream URL.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Channel {
    pub name: String,
    pub url: String,
}

pub fn parse_m3u(content: &str) -> Result<Vec<Channel>> {
    let mut channels = Vec::new();
    let lines: Vec<&str> = content.lines().collect();
    let mut current_name = None;

    let re_extinf = Regex::new(r"#EXTINF:-?\d+,(.*)").unwrap();

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = re_extinf.captures(line) {
            current_name = Some(caps[1].trim().to_string());
        } else if line.starts_with("http://") || line.starts_with("https://") || line.starts_with("rtsp://") {
            if let Some(name) = current_name.take() {
                channels.push(Channel {
                    name,
                    url: line.to_string(),
                });
            }
        }
    }

    Ok(channels)
}

pub async fn fetch_m3u(url: &str) -> Result<Vec<Channel>> {
    let client = reqwest::Client::builder().build()?;
    let resp = client.get(url).send().await?;
    let text = resp.text().await?;
    parse_m3u(&text)
}

/// What the stream manager needs to open an upstream connection for a channel
/// (spec §3, §6): its current URL, the user agent to present upstream, and an
/// optional transcode command for the proxied-transcode variant.
#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
    pub url: String,
    pub user_agent: String,
    pub transcode_cmd: Option<Vec<String>>,
}

/// External collaborator (spec §6): resolves a channel UUID to its upstream
/// details. The core treats this as a plain async call returning values or
/// error; the catalog itself (database, playlist, API) is out of scope.
#[async_trait]
pub trait ChannelCatalog: Send + Sync {
    async fn resolve(&self, channel_uuid: &str) -> ProxyResult<ChannelDescriptor>;
}

/// Namespace used to derive stable channel UUIDs from an M3U entry's name+URL,
/// so the same playlist always maps to the same set of channel ids across
/// restarts and across workers.
const CHANNEL_UUID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3b, 0x1a, 0x4d, 0x2e, 0x7c, 0x91, 0x4a, 0x6f, 0x9d, 0x22, 0x5e, 0x8b, 0x0c, 0x17, 0x4a, 0x33,
]);

pub fn derive_channel_uuid(channel: &Channel) -> String {
    Uuid::new_v5(&CHANNEL_UUID_NAMESPACE, format!("{}|{}", channel.name, channel.url).as_bytes())
        .to_string()
}

/// Catalog backed by one or more M3U playlists, carried over from the single
/// concrete catalog source the teacher crate already implements.
pub struct M3uCatalog {
    channels: HashMap<String, ChannelDescriptor>,
}

impl M3uCatalog {
    pub fn from_channels(channels: Vec<Channel>, default_user_agent: String) -> Self {
        let mut map = HashMap::with_capacity(channels.len());
        for channel in channels {
            let uuid = derive_channel_uuid(&channel);
            map.insert(
                uuid,
                ChannelDescriptor {
                    url: channel.url,
                    user_agent: default_user_agent.clone(),
                    transcode_cmd: None,
                },
            );
        }
        Self { channels: map }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl ChannelCatalog for M3uCatalog {
    async fn resolve(&self, channel_uuid: &str) -> ProxyResult<ChannelDescriptor> {
        self.channels
            .get(channel_uuid)
            .cloned()
            .ok_or_else(|| ProxyError::ChannelNotFound(channel_uuid.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_m3u() {
        let data = r#"#EXTM3U
#EXTINF:0,3sat SD
#EXTVLCOPT:network-caching=1000
rtsp://192.168.178.1:554/?avm=1&freq=450&bw=8&msys=dvbc&mtype=256qam&sr=6900&specinv=1&pids=0,16,17,18,20,200,210,220,221,222,231,250
#EXTINF:0,KiKA SD
#EXTVLCOPT:network-caching=1000
rtsp://192.168.178.1:554/?avm=1&freq=450&bw=8&msys=dvbc&mtype=256qam&sr=6900&specinv=1&pids=0,16,17,18,20,300,310,320,321,322,331"#;

        let channels = parse_m3u(data).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].name, "3sat SD");
        assert!(channels[0].url.starts_with("rtsp://"));
        assert_eq!(channels[1].name, "KiKA SD");
    }

    #[test]
    fn derived_uuids_are_stable_and_distinct() {
        let a = Channel { name: "A".to_string(), url: "http://a".to_string() };
        let b = Channel { name: "B".to_string(), url: "http://b".to_string() };
        assert_eq!(derive_channel_uuid(&a), derive_channel_uuid(&a));
        assert_ne!(derive_channel_uuid(&a), derive_channel_uuid(&b));
    }

    #[tokio::test]
    async fn catalog_resolves_known_channel_and_rejects_unknown() {
        let channel = Channel { name: "A".to_string(), url: "http://upstream/a".to_string() };
        let uuid = derive_channel_uuid(&channel);
        let catalog = M3uCatalog::from_channels(vec![channel], "test-agent/1.0".to_string());

        let resolved = catalog.resolve(&uuid).await.unwrap();
        assert_eq!(resolved.url, "http://upstream/a");
        assert_eq!(resolved.user_agent, "test-agent/1.0");

        let err = catalog.resolve("not-a-real-uuid").await;
        assert!(matches!(err, Err(ProxyError::ChannelNotFound(_))));
    }
}
