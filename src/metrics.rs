//! Prometheus Metrics for cai-mcp
//!
//! Tracks tool calls, upstream requests, platform sessions and bindings, and
//! the optional HTTP/WebSocket transports.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    // Tool metrics
    pub static ref TOOL_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "cai_mcp_tool_calls_total",
        "Total number of tool calls",
        &["tool", "status"]
    )
    .unwrap();

    pub static ref TOOL_CALL_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "cai_mcp_tool_call_duration_seconds",
        "Tool call latency in seconds",
        &["tool"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap();

    // Upstream platform metrics
    pub static ref UPSTREAM_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "cai_mcp_upstream_requests_total",
        "Total number of requests sent to Character.AI",
        &["host", "status"]
    )
    .unwrap();

    pub static ref SESSIONS_CREATED_TOTAL: Counter = register_counter!(
        "cai_mcp_sessions_created_total",
        "Authenticated platform sessions created"
    )
    .unwrap();

    pub static ref AUTH_FAILURES_TOTAL: Counter = register_counter!(
        "cai_mcp_auth_failures_total",
        "Failed attempts to create a platform session"
    )
    .unwrap();

    pub static ref BINDINGS_RELEASED_TOTAL: CounterVec = register_counter_vec!(
        "cai_mcp_bindings_released_total",
        "Bindings released, by outcome of the release",
        &["outcome"]
    )
    .unwrap();

    // HTTP transport metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "cai_mcp_http_requests_total",
        "Total number of HTTP requests",
        &["method", "endpoint", "status"]
    )
    .unwrap();

    pub static ref ACTIVE_CLIENT_SESSIONS: Gauge = register_gauge!(
        "cai_mcp_active_client_sessions",
        "Number of active MCP client sessions on the HTTP transport"
    )
    .unwrap();

    pub static ref WEBSOCKET_CONNECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "cai_mcp_websocket_connections_total",
        "Total WebSocket connections",
        &["status"]
    )
    .unwrap();
}

/// Tool call timer for tracking latency and outcome
pub struct ToolCallTimer {
    start: Instant,
    tool: String,
}

impl ToolCallTimer {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            tool: tool.into(),
        }
    }

    pub fn observe_duration(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        TOOL_CALL_DURATION_SECONDS
            .with_label_values(&[&self.tool])
            .observe(duration);

        TOOL_CALLS_TOTAL
            .with_label_values(&[&self.tool, status])
            .inc();
    }
}

/// Export metrics in Prometheus text format
pub fn export_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a request to Character.AI
pub fn record_upstream_request(host: &str, status: &str) {
    UPSTREAM_REQUESTS_TOTAL
        .with_label_values(&[host, status])
        .inc();
}

pub fn record_session_created() {
    SESSIONS_CREATED_TOTAL.inc();
}

pub fn record_auth_failure() {
    AUTH_FAILURES_TOTAL.inc();
}

/// Record a binding release ("ok" or "error")
pub fn record_binding_released(outcome: &str) {
    BINDINGS_RELEASED_TOTAL
        .with_label_values(&[outcome])
        .inc();
}

/// Record HTTP request
pub fn record_http_request(method: &str, endpoint: &str, status: u16) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status.to_string()])
        .inc();
}

/// Update client session count
pub fn set_active_client_sessions(count: usize) {
    ACTIVE_CLIENT_SESSIONS.set(count as f64);
}

/// Record WebSocket connection
pub fn record_websocket_connection(status: &str) {
    WEBSOCKET_CONNECTIONS_TOTAL
        .with_label_values(&[status])
        .inc();
}
