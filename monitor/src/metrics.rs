use microseg_core::Event;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Monitor instrumentation. A default instance records without being
/// exported, so monitors work unchanged when no registry is wired up.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    events: Family<EventLabels, Counter>,
    event_errors: Family<EventLabels, Counter>,
    cache_size: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    event: String,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "monitor_events",
            "Lifecycle events processed by the monitor",
            metrics.events.clone(),
        );
        registry.register(
            "monitor_event_errors",
            "Lifecycle events that failed processing",
            metrics.event_errors.clone(),
        );
        registry.register(
            "identity_cache_size",
            "Workloads tracked by the identity cache",
            metrics.cache_size.clone(),
        );
        metrics
    }

    pub(crate) fn event(&self, event: Event) {
        self.events
            .get_or_create(&EventLabels {
                event: event.to_string(),
            })
            .inc();
    }

    pub(crate) fn event_error(&self, event: Event) {
        self.event_errors
            .get_or_create(&EventLabels {
                event: event.to_string(),
            })
            .inc();
    }

    pub(crate) fn cache_size(&self, size: usize) {
        self.cache_size.set(size as i64);
    }
}
