pub mod buffer;
pub mod channels;
pub mod clients;
pub mod config;
pub mod error;
pub mod events;
pub mod kv;
pub mod lifecycle;
pub mod metrics;
pub mod stream_manager;
pub mod streamer;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use channels::ChannelCatalog;
use error::ProxyError;
use kv::Kv;
use lifecycle::{ChannelLifecycle, LifecycleConfig};
use streamer::StreamerConfig;

/// Replaces the teacher's module-level globals (spec §9) with one struct
/// holding everything a handler needs: the KV handle, this worker's id, and
/// the lifecycle that owns all per-channel state.
pub struct Core {
    pub lifecycle: Arc<ChannelLifecycle>,
    pub kv: Arc<dyn Kv>,
    pub worker_id: String,
    pub streamer_config: StreamerConfig,
}

impl Core {
    pub fn new(
        worker_id: String,
        kv: Arc<dyn Kv>,
        catalog: Arc<dyn ChannelCatalog>,
        lifecycle_config: LifecycleConfig,
        streamer_config: StreamerConfig,
    ) -> Self {
        let lifecycle = Arc::new(ChannelLifecycle::new(worker_id.clone(), kv.clone(), catalog, lifecycle_config));
        Self { lifecycle, kv, worker_id, streamer_config }
    }
}

pub fn create_app(core: Arc<Core>) -> Router {
    Router::new()
        .route("/stream/{channel_uuid}", get(stream_handler))
        .route("/change_stream/{channel_uuid}", post(change_stream_handler))
        .route("/status/", get(status_all_handler))
        .route("/status/{channel_uuid}", get(status_one_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(core)
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ProxyError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::InitTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamConnect(_, _) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamStall(_) => StatusCode::BAD_GATEWAY,
            ProxyError::StoreUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::OwnershipLost(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ClientWrite(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

/// `GET /stream/{channel_uuid}` (spec §6). Streams `video/mp2t` to the client
/// until it disconnects, the upstream goes permanently unhealthy, or it's
/// flagged as a ghost client; see `streamer::stream_channel`.
async fn stream_handler(
    State(core): State<Arc<Core>>,
    Path(channel_uuid): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ProxyError> {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let stream = streamer::stream_channel(
        channel_uuid.clone(),
        core.lifecycle.clone(),
        core.streamer_config.clone(),
        user_agent,
    )
    .await?;

    info!(channel = %channel_uuid, worker = %core.worker_id, "client stream started");

    let body = Body::from_stream(stream);
    Ok((
        [
            (axum::http::header::CONTENT_TYPE, "video/mp2t"),
            (axum::http::header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    ))
}

#[derive(Debug, Deserialize)]
struct ChangeStreamRequest {
    url: Option<String>,
    user_agent: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChangeStreamResponse {
    message: String,
    channel: String,
    url: String,
    owner: bool,
    worker_id: String,
}

/// `POST /change_stream/{channel_uuid}` (spec §4.7, §6). Any worker can accept
/// this request; if it owns the channel it switches in place, otherwise it
/// publishes a `stream_switch` event for the current owner to pick up.
async fn change_stream_handler(
    State(core): State<Arc<Core>>,
    Path(channel_uuid): Path<String>,
    Json(req): Json<ChangeStreamRequest>,
) -> Result<impl IntoResponse, ProxyError> {
    let Some(url) = req.url.filter(|u| !u.is_empty()) else {
        return Ok((StatusCode::BAD_REQUEST, Json(json!({"error": "missing url"}))).into_response());
    };

    // Validates the channel exists before touching any state (§7 "resolution
    // error ... no state written").
    core.lifecycle.ensure_channel(&channel_uuid).await?;

    let is_owner = core.lifecycle.am_owner(&channel_uuid).await;
    if is_owner {
        if let Some(handle) = core.lifecycle.handle(&channel_uuid) {
            if let Some(manager) = &handle.stream_manager {
                manager.update_url(url.clone(), req.user_agent.clone());
            }
        }
    } else {
        events::request_stream_switch(
            core.kv.as_ref(),
            &channel_uuid,
            &url,
            req.user_agent.as_deref(),
            &core.worker_id,
        )
        .await?;
    }

    let resp = ChangeStreamResponse {
        message: "stream switch accepted".to_string(),
        channel: channel_uuid,
        url,
        owner: is_owner,
        worker_id: core.worker_id.clone(),
    };
    Ok((StatusCode::OK, Json(resp)).into_response())
}

/// `GET /status/` (spec §6): every channel known to KV, summarized.
async fn status_all_handler(State(core): State<Arc<Core>>) -> Result<impl IntoResponse, ProxyError> {
    let channels = core.lifecycle.status_all().await?;
    Ok(Json(json!({"count": channels.len(), "channels": channels})))
}

/// `GET /status/{channel_uuid}` (spec §6): metadata plus live counts this
/// worker can see locally (owner/state/buffer index come from KV; client
/// counts blend local state with the advisory KV set cardinality).
async fn status_one_handler(
    State(core): State<Arc<Core>>,
    Path(channel_uuid): Path<String>,
) -> Result<impl IntoResponse, ProxyError> {
    let meta: HashMap<String, String> = core.kv.hash_get_all(&format!("metadata:{channel_uuid}")).await?;
    if meta.is_empty() {
        return Err(ProxyError::ChannelNotFound(channel_uuid));
    }

    let handle = core.lifecycle.handle(&channel_uuid);
    let local_clients = handle.as_ref().map(|h| h.clients.local_count()).unwrap_or(0);
    let global_clients = match &handle {
        Some(h) => h.clients.global_count().await,
        None => 0,
    };
    let is_owner = core.lifecycle.am_owner(&channel_uuid).await;

    Ok(Json(json!({
        "channel_uuid": channel_uuid,
        "metadata": meta,
        "owner": is_owner,
        "worker_id": core.worker_id,
        "local_clients": local_clients,
        "global_clients": global_clients,
    })))
}

async fn healthz_handler(State(core): State<Arc<Core>>) -> impl IntoResponse {
    match core.kv.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            warn!(error = %e, "healthz: store unreachable");
            (StatusCode::SERVICE_UNAVAILABLE, "store unreachable")
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}
