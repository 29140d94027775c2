/// Prometheus metrics for the bot
///
/// Covers:
/// - Scheduled job runs and durations
/// - Panel API request outcomes
/// - Snapshot capture and notification delivery
/// - Admin API traffic

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ========== Job Metrics ==========

    /// Scheduled job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();

    /// Scheduled job duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "background_job_duration_seconds",
        "Background job execution time in seconds",
        &["job_type"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    )
    .unwrap();

    // ========== Panel Metrics ==========

    /// Panel API requests by panel and outcome (ok, error, exhausted)
    pub static ref PANEL_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "panel_requests_total",
        "Total number of panel API requests",
        &["panel", "outcome"]
    )
    .unwrap();

    // ========== Usage Metrics ==========

    pub static ref USAGE_SNAPSHOTS_RECORDED_TOTAL: IntCounter = register_int_counter!(
        "usage_snapshots_recorded_total",
        "Total number of usage snapshot rows written"
    )
    .unwrap();

    /// Notifications by kind (report, admin_summary, warning) and status
    pub static ref NOTIFICATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "notifications_total",
        "Total number of notifications handed to the sink",
        &["kind", "status"]
    )
    .unwrap();

    pub static ref IDENTITY_MAP_ENTRIES: IntGauge = register_int_gauge!(
        "identity_map_entries",
        "Number of entries in the current identity map snapshot"
    )
    .unwrap();

    // ========== HTTP Metrics ==========

    /// Admin API requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_http_request(method: &str, path: &str, status: u16) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
}

/// Record a finished job run
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}

pub fn record_panel_request(panel: &str, outcome: &str) {
    PANEL_REQUESTS_TOTAL.with_label_values(&[panel, outcome]).inc();
}

pub fn record_notification(kind: &str, delivered: bool) {
    let status = if delivered { "sent" } else { "failed" };
    NOTIFICATIONS_TOTAL.with_label_values(&[kind, status]).inc();
}

pub fn set_identity_map_entries(entries: usize) {
    IDENTITY_MAP_ENTRIES.set(entries as i64);
}
