use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::metrics::MetricSnapshot;
use crate::error::TasError;

/// The external telemetry source consumed by the cache's refresh loop
/// (§6): a single operation, `get_node_metric`, returning the latest
/// per-node snapshot for one metric name. This crate does not implement a
/// concrete metrics-collection agent; callers supply whatever adapter talks
/// to their custom-metrics API.
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    async fn get_node_metric(&self, metric_name: &str) -> Result<MetricSnapshot, TasError>;
}

#[async_trait]
impl<T: TelemetrySource + ?Sized> TelemetrySource for Arc<T> {
    async fn get_node_metric(&self, metric_name: &str) -> Result<MetricSnapshot, TasError> {
        (**self).get_node_metric(metric_name).await
    }
}

/// An in-memory source, driven entirely by `set_metric`. Used by this
/// module's own tests and by other components' test suites that need a
/// telemetry source without a reachable custom-metrics API; not wired into
/// `taspctl run`, which always talks to the cluster through
/// `CustomMetricsSource`.
#[derive(Clone, Default)]
pub struct StaticTelemetrySource {
    snapshots: Arc<Mutex<HashMap<String, MetricSnapshot>>>,
}

impl StaticTelemetrySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_metric(&self, name: impl Into<String>, snapshot: MetricSnapshot) {
        self.snapshots.lock().await.insert(name.into(), snapshot);
    }
}

#[async_trait]
impl TelemetrySource for StaticTelemetrySource {
    async fn get_node_metric(&self, metric_name: &str) -> Result<MetricSnapshot, TasError> {
        self.snapshots
            .lock()
            .await
            .get(metric_name)
            .cloned()
            .ok_or_else(|| TasError::NotFound(format!("metric '{metric_name}' at telemetry source")))
    }
}

/// Polls a custom-metrics-style HTTP endpoint of the shape
/// `GET {base_url}/apis/custom.metrics.k8s.io/v1beta2/nodes/*/{metric_name}`.
/// Left generic over the HTTP client so tests can swap in a stub; the
/// production binary wires this against the orchestrator's aggregated API
/// server via the same `kube::Client` used everywhere else.
pub struct CustomMetricsSource {
    client: kube::Client,
    request_timeout: Duration,
}

impl CustomMetricsSource {
    pub fn new(client: kube::Client) -> Self {
        CustomMetricsSource {
            client,
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl TelemetrySource for CustomMetricsSource {
    async fn get_node_metric(&self, metric_name: &str) -> Result<MetricSnapshot, TasError> {
        let path = format!("/apis/custom.metrics.k8s.io/v1beta2/nodes/*/{metric_name}");
        let request = http::Request::builder()
            .method("GET")
            .uri(path)
            .body(Vec::new())
            .map_err(|e| TasError::Internal(e.to_string()))?;

        let response: serde_json::Value = tokio::time::timeout(
            self.request_timeout,
            self.client.request(request),
        )
        .await
        .map_err(|_| TasError::TransportError(format!("custom metrics request for '{metric_name}' timed out")))?
        .map_err(|e| TasError::TransportError(e.to_string()))?;

        parse_custom_metrics_response(&response)
    }
}

fn parse_custom_metrics_response(value: &serde_json::Value) -> Result<MetricSnapshot, TasError> {
    let items = value
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| TasError::ProtocolError("custom metrics response missing 'items'".to_string()))?;

    let mut snapshot = MetricSnapshot::new();
    for item in items {
        let node = item
            .get("describedObject")
            .and_then(|d| d.get("name"))
            .and_then(|n| n.as_str());
        let quantity = item.get("value").and_then(|v| v.as_str());
        let timestamp = item.get("timestamp").and_then(|t| t.as_str());

        let (Some(node), Some(quantity)) = (node, quantity) else {
            continue;
        };

        let value: rust_decimal::Decimal = quantity
            .trim_end_matches('m')
            .parse()
            .map_err(|_| TasError::ProtocolError(format!("unparseable metric quantity '{quantity}'")))?;

        let timestamp = timestamp
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let window = item
            .get("window")
            .and_then(|w| w.as_str())
            .and_then(parse_window_duration)
            .unwrap_or(Duration::from_secs(60));

        snapshot.insert(
            node.to_string(),
            crate::domain::metrics::MetricSample::new(timestamp, window, value),
        );
    }
    Ok(snapshot)
}

/// Parses a Kubernetes-style duration string like `"30s"` into a
/// `Duration`. Only seconds/minutes suffixes appear in custom-metrics
/// responses in practice.
fn parse_window_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(secs) = raw.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = raw.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        None
    }
}
