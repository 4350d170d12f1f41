use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct WatchMetrics {
    events: Family<EventLabels, Counter>,
    last_event_timestamp: Gauge<f64, AtomicU64>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    resource: String,
    action: Action,
    result: Outcome,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Action {
    Create,
    Update,
    Delete,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum Outcome {
    Success,
    Failed,
}

// === impl WatchMetrics ===

impl WatchMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let events = Family::default();
        prom.register(
            "k8s_events",
            "Count of Kubernetes events handled, by resource, action and result",
            events.clone(),
        );

        let last_event_timestamp = Gauge::<f64, AtomicU64>::default();
        prom.register(
            "k8s_last_event_timestamp_seconds",
            "Timestamp of the most recently received Kubernetes event",
            last_event_timestamp.clone(),
        );

        Self {
            events,
            last_event_timestamp,
        }
    }

    /// Stamps the time an event was received, before it is handled.
    pub fn observe_event(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.last_event_timestamp.set(now);
    }

    pub fn record(&self, resource: &str, action: Action, ok: bool) {
        let result = if ok { Outcome::Success } else { Outcome::Failed };
        self.events
            .get_or_create(&EventLabels {
                resource: resource.to_string(),
                action,
                result,
            })
            .inc();
    }
}
