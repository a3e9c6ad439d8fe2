use crate::settings::TelemetrySettings;
use std::sync::Arc;

/// Narrow analytics capability. Implementations must complete in O(1)
/// from the caller's perspective: a fire is never awaited and never
/// affects the request outcome.
pub trait Telemetry: Send + Sync {
    fn fire(&self, category: &str, action: &str, label: &str);
}

/// Discards every event. Default for tests and unconfigured nodes.
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn fire(&self, _category: &str, _action: &str, _label: &str) {}
}

/// Posts events to the configured collector endpoint, fire-and-forget.
pub struct HttpTelemetry {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTelemetry {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, endpoint }
    }
}

impl Telemetry for HttpTelemetry {
    fn fire(&self, category: &str, action: &str, label: &str) {
        // Spawn and forget; outside a runtime (plain unit tests) the
        // event is dropped rather than panicking.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let payload = serde_json::json!({
            "category": category,
            "action": action,
            "label": label,
            "hostname": crate::net::local::node_hostname(),
        });

        handle.spawn(async move {
            if let Err(e) = client.post(&endpoint).json(&payload).send().await {
                tracing::debug!("telemetry: fire failed, error={}", e);
            }
        });
    }
}

pub fn from_settings(settings: &TelemetrySettings) -> Arc<dyn Telemetry> {
    let endpoint = settings.telemetry_endpoint();
    if endpoint.is_empty() {
        Arc::new(NoopTelemetry)
    } else {
        Arc::new(HttpTelemetry::new(endpoint))
    }
}
