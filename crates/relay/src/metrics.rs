use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    outbound_dropped_total: Mutex<HashMap<String, u64>>,
    malformed_frames_total: AtomicU64,
    sessions_cycled_total: AtomicU64,
    stale_revisions_total: AtomicU64,
    linger_expired_total: AtomicU64,
    write_retries_exhausted_total: AtomicU64,
    active_sessions: AtomicI64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_request(frame_type: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(frame_type, is_error, latency_ms);
    }
}

pub fn increment_outbound_dropped(frame_type: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_outbound_dropped(frame_type);
    }
}

pub fn increment_malformed_frames() {
    if let Some(metrics) = global_metrics() {
        metrics.malformed_frames_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_sessions_cycled() {
    if let Some(metrics) = global_metrics() {
        metrics.sessions_cycled_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_stale_revisions() {
    if let Some(metrics) = global_metrics() {
        metrics.stale_revisions_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_linger_expired() {
    if let Some(metrics) = global_metrics() {
        metrics.linger_expired_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_write_retries_exhausted() {
    if let Some(metrics) = global_metrics() {
        metrics.write_retries_exhausted_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn session_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.active_sessions.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn session_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_request(&self, frame_type: &str, is_error: bool, latency_ms: u64) {
        let label = normalize_label(frame_type);
        increment_label_counter(&self.ws_rate_total, &label, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &label, latency_ms);
        increment_label_counter(&self.ws_duration_count, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn increment_outbound_dropped(&self, frame_type: &str) {
        increment_label_counter(&self.outbound_dropped_total, &normalize_label(frame_type), 1);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_rate_total Total websocket frames by type.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", "type", &self.ws_rate_total);

        output.push_str("# HELP relay_ws_errors_total Total websocket frames answered with an error by type.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_errors_total",
            "type",
            &self.ws_errors_total,
        );

        output.push_str("# HELP relay_ws_duration_ms_sum Sum of websocket frame handling latency in milliseconds by type.\n");
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_sum",
            "type",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP relay_ws_duration_ms_count Count of websocket latency samples by type.\n",
        );
        output.push_str("# TYPE relay_ws_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_count",
            "type",
            &self.ws_duration_count,
        );

        output.push_str("# HELP relay_outbound_dropped_total Best-effort frames dropped on full session queues by type.\n");
        output.push_str("# TYPE relay_outbound_dropped_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_outbound_dropped_total",
            "type",
            &self.outbound_dropped_total,
        );

        append_scalar(
            &mut output,
            "relay_malformed_frames_total",
            "counter",
            "Inbound frames that failed to decode.",
            self.malformed_frames_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "relay_sessions_cycled_total",
            "counter",
            "Sessions dropped because a reliable frame did not fit their queue.",
            self.sessions_cycled_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "relay_stale_revisions_total",
            "counter",
            "Document edits rejected for a stale base revision.",
            self.stale_revisions_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "relay_linger_expired_total",
            "counter",
            "Presence holds released because no reconnect arrived in time.",
            self.linger_expired_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "relay_write_retries_exhausted_total",
            "counter",
            "Store writes that failed after all retries.",
            self.write_retries_exhausted_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "relay_active_sessions",
            "gauge",
            "Currently admitted websocket sessions.",
            self.active_sessions.load(Ordering::SeqCst).max(0),
        );

        output
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn append_scalar(output: &mut String, name: &str, kind: &str, help: &str, value: i64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
    output.push_str(&format!("{name} {value}\n"));
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
