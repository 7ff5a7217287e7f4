use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder};

lazy_static! {
    pub static ref BUFFER_INDEX: GaugeVec = register_gauge_vec!(
        "ts_proxy_buffer_index",
        "Latest chunk index appended to the ring buffer per channel",
        &["channel_uuid"]
    )
    .unwrap();
    pub static ref LOCAL_CLIENTS: GaugeVec = register_gauge_vec!(
        "ts_proxy_local_clients",
        "Clients currently streaming from this worker, per channel",
        &["channel_uuid"]
    )
    .unwrap();
    pub static ref GLOBAL_CLIENTS: GaugeVec = register_gauge_vec!(
        "ts_proxy_global_clients",
        "Clients currently streaming across all workers, per channel (advisory)",
        &["channel_uuid"]
    )
    .unwrap();
    pub static ref STREAM_HEALTHY: GaugeVec = register_gauge_vec!(
        "ts_proxy_stream_healthy",
        "1 if the owning worker's upstream fetch loop is healthy, 0 otherwise",
        &["channel_uuid"]
    )
    .unwrap();
    pub static ref RETRY_COUNT: GaugeVec = register_gauge_vec!(
        "ts_proxy_retry_count",
        "Consecutive reconnect attempts since the upstream last reported healthy",
        &["channel_uuid"]
    )
    .unwrap();
    pub static ref KV_ERRORS: CounterVec = register_counter_vec!(
        "ts_proxy_kv_errors_total",
        "KV store operations that returned an error, by operation",
        &["operation"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_metrics_includes_registered_gauges() {
        BUFFER_INDEX.with_label_values(&["chan-1"]).set(42.0);
        let text = gather_metrics();
        assert!(text.contains("ts_proxy_buffer_index"));
    }
}
