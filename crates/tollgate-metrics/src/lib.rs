//! Metrics collection and Prometheus exporter for tollgate.
//!
//! Recording functions are cheap no-ops until a recorder is installed with
//! [`init_prometheus`].

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus exporter on `listen` (`host:port`).
pub fn init_prometheus(listen: &str) -> Result<(), String> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| format!("invalid metrics listen address: {e}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {e}"))?;

    Ok(())
}

// ============================================================================
// Metric Names
// ============================================================================

/// Client connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tollgate_connections_total";
/// Client connections currently open.
pub const CONNECTIONS_ACTIVE: &str = "tollgate_connections_active";
pub const AUTH_SUCCESS_TOTAL: &str = "tollgate_auth_success_total";
pub const AUTH_FAILURE_TOTAL: &str = "tollgate_auth_failure_total";
/// Requests refused before dispatch, labelled by `reason`.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tollgate_connections_rejected_total";
/// Bytes read from clients.
pub const BYTES_RECEIVED_TOTAL: &str = "tollgate_bytes_received_total";
/// Bytes written to clients.
pub const BYTES_SENT_TOTAL: &str = "tollgate_bytes_sent_total";
pub const CONNECT_REQUESTS_TOTAL: &str = "tollgate_connect_requests_total";
pub const FORWARD_REQUESTS_TOTAL: &str = "tollgate_forward_requests_total";
/// Upstream dials that failed (502 to the client).
pub const UPSTREAM_CONNECT_FAILURES_TOTAL: &str = "tollgate_upstream_connect_failures_total";
/// `UserConsumedTraffic` events handed to the bus.
pub const TRAFFIC_EVENTS_EMITTED_TOTAL: &str = "tollgate_traffic_events_emitted_total";
/// Traffic events lost to bus errors.
pub const TRAFFIC_EVENTS_DROPPED_TOTAL: &str = "tollgate_traffic_events_dropped_total";
/// Egress addresses in the dialer pool.
pub const EGRESS_POOL_SIZE: &str = "tollgate_egress_pool_size";
/// Events handled by the plan controller, labelled by `event_type`.
pub const CONTROLLER_EVENTS_TOTAL: &str = "tollgate_controller_events_total";
/// Controller signals that failed to publish, labelled by `event_type`.
pub const CONTROLLER_SIGNALS_DROPPED_TOTAL: &str = "tollgate_controller_signals_dropped_total";
pub const CONNECTION_DURATION_SECONDS: &str = "tollgate_connection_duration_seconds";
/// Errors labelled by `type`.
pub const ERRORS_TOTAL: &str = "tollgate_errors_total";

// ============================================================================
// Rejection reasons
// ============================================================================

pub const REJECT_UNAUTHORIZED: &str = "unauthorized";
pub const REJECT_RESTRICTED: &str = "restricted";
pub const REJECT_RATE_LIMIT: &str = "rate_limit";
pub const REJECT_MAX_CONNECTIONS: &str = "max_connections";

// ============================================================================
// Metric Recording Functions
// ============================================================================

#[inline]
pub fn record_connection_accepted() {
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

#[inline]
pub fn record_connection_closed(duration_secs: f64) {
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(CONNECTION_DURATION_SECONDS).record(duration_secs);
}

#[inline]
pub fn record_auth_success() {
    counter!(AUTH_SUCCESS_TOTAL).increment(1);
}

#[inline]
pub fn record_auth_failure() {
    counter!(AUTH_FAILURE_TOTAL).increment(1);
}

/// Record a refused request; `reason` is one of the `REJECT_*` labels.
#[inline]
pub fn record_connection_rejected(reason: &'static str) {
    counter!(CONNECTIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
}

#[inline]
pub fn record_bytes_received(bytes: u64) {
    counter!(BYTES_RECEIVED_TOTAL).increment(bytes);
}

#[inline]
pub fn record_bytes_sent(bytes: u64) {
    counter!(BYTES_SENT_TOTAL).increment(bytes);
}

#[inline]
pub fn record_connect_request() {
    counter!(CONNECT_REQUESTS_TOTAL).increment(1);
}

#[inline]
pub fn record_forward_request() {
    counter!(FORWARD_REQUESTS_TOTAL).increment(1);
}

#[inline]
pub fn record_upstream_connect_failure() {
    counter!(UPSTREAM_CONNECT_FAILURES_TOTAL).increment(1);
}

#[inline]
pub fn record_traffic_event_emitted() {
    counter!(TRAFFIC_EVENTS_EMITTED_TOTAL).increment(1);
}

#[inline]
pub fn record_traffic_event_dropped() {
    counter!(TRAFFIC_EVENTS_DROPPED_TOTAL).increment(1);
}

#[inline]
pub fn set_egress_pool_size(size: usize) {
    gauge!(EGRESS_POOL_SIZE).set(size as f64);
}

#[inline]
pub fn record_controller_event(event_type: &'static str) {
    counter!(CONTROLLER_EVENTS_TOTAL, "event_type" => event_type).increment(1);
}

#[inline]
pub fn record_controller_signal_dropped(event_type: &'static str) {
    counter!(CONTROLLER_SIGNALS_DROPPED_TOTAL, "event_type" => event_type).increment(1);
}

#[inline]
pub fn record_error(error_type: &'static str) {
    counter!(ERRORS_TOTAL, "type" => error_type).increment(1);
}

// ============================================================================
// Error Type Constants (re-exported from tollgate-core)
// ============================================================================

pub use tollgate_core::{
    ERROR_AUTH, ERROR_CONFIG, ERROR_IO, ERROR_PROTOCOL, ERROR_RATE_LIMIT, ERROR_RESOLVE,
    ERROR_TIMEOUT, ERROR_UPSTREAM,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_connection_accepted();
        record_connection_rejected(REJECT_RATE_LIMIT);
        record_bytes_sent(10);
        set_egress_pool_size(3);
        record_connection_closed(0.5);
        record_controller_signal_dropped("UserConsumedTrafficWithoutPlan");
    }

    #[test]
    fn rejects_bad_listen_address() {
        let err = init_prometheus("not-an-address").unwrap_err();
        assert!(err.contains("invalid metrics listen address"));
    }
}
