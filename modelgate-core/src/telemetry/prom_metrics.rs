//! Gateway-owned Prometheus metrics.
//!
//! [`GatewayMetrics`] registers every family the gateway itself records.
//! Component-emitted records are exported separately by
//! [`super::custom::CustomMetrics`]. Both are scraped from the admin
//! server's `/metrics` endpoint in OpenMetrics text format.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use super::cardinality::CardinalityLimiter;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Labels for request counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Transport that received the request: "rest", "rpc", "columnar", "event"
    pub surface: String,
    /// Verb, e.g. "predict", "route", "send_feedback"
    pub method: String,
    /// "success" or the error type name
    pub outcome: String,
}

/// Labels for request duration histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DurationLabels {
    pub surface: String,
    pub method: String,
}

/// Labels for outbound delivery counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeliveryLabels {
    /// "delivered", "retried" or "dropped"
    pub outcome: String,
}

/// Labels keyed by detector instance.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceLabels {
    pub instance: String,
}

/// Labels for rejected metric records.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectLabels {
    pub method: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Buckets
// ─────────────────────────────────────────────────────────────────────────────

const REQUEST_DURATION_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

const DELIVERY_BUCKETS: &[f64] = &[5.0, 25.0, 100.0, 250.0, 1000.0, 5000.0, 30000.0];

/// Maximum distinct detector instances tracked per family.
const MAX_INSTANCE_CARDINALITY: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

pub struct GatewayMetrics {
    requests_total: Family<RequestLabels, Counter>,
    request_duration_ms: Family<DurationLabels, Histogram>,
    deliveries_total: Family<DeliveryLabels, Counter>,
    delivery_duration_ms: Family<DeliveryLabels, Histogram>,
    events_deferred_total: Family<InstanceLabels, Counter>,
    buffered_rows: Family<InstanceLabels, Gauge>,
    metric_records_rejected_total: Family<RejectLabels, Counter>,
    component_loaded: Gauge,
    instance_limiter: CardinalityLimiter,
}

impl GatewayMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        // ─────────────────────────────────────────────────────────────────────
        // Counters
        // ─────────────────────────────────────────────────────────────────────

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "modelgate_requests",
            "Requests handled by surface, method and outcome",
            requests_total.clone(),
        );

        let deliveries_total = Family::<DeliveryLabels, Counter>::default();
        registry.register(
            "modelgate_deliveries",
            "Outbound event delivery attempts by outcome",
            deliveries_total.clone(),
        );

        let events_deferred_total = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "modelgate_events_deferred",
            "Events accumulated without producing a reply",
            events_deferred_total.clone(),
        );

        let metric_records_rejected_total = Family::<RejectLabels, Counter>::default();
        registry.register(
            "modelgate_metric_records_rejected",
            "Responses whose metric sidecar failed validation",
            metric_records_rejected_total.clone(),
        );

        // ─────────────────────────────────────────────────────────────────────
        // Histograms
        // ─────────────────────────────────────────────────────────────────────

        let request_duration_ms = Family::<DurationLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(REQUEST_DURATION_BUCKETS.iter().copied())
        });
        registry.register(
            "modelgate_request_duration_ms",
            "Request latency in milliseconds",
            request_duration_ms.clone(),
        );

        let delivery_duration_ms = Family::<DeliveryLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(DELIVERY_BUCKETS.iter().copied())
        });
        registry.register(
            "modelgate_delivery_duration_ms",
            "Outbound delivery latency in milliseconds, retries included",
            delivery_duration_ms.clone(),
        );

        // ─────────────────────────────────────────────────────────────────────
        // Gauges
        // ─────────────────────────────────────────────────────────────────────

        let buffered_rows = Family::<InstanceLabels, Gauge>::default();
        registry.register(
            "modelgate_buffered_rows",
            "Rows waiting in each accumulation buffer",
            buffered_rows.clone(),
        );

        let component_loaded = Gauge::default();
        registry.register(
            "modelgate_component_loaded",
            "1 once the component has loaded",
            component_loaded.clone(),
        );

        Self {
            requests_total,
            request_duration_ms,
            deliveries_total,
            delivery_duration_ms,
            events_deferred_total,
            buffered_rows,
            metric_records_rejected_total,
            component_loaded,
            instance_limiter: CardinalityLimiter::new(MAX_INSTANCE_CARDINALITY),
        }
    }

    pub fn record_request(&self, surface: &str, method: &str, outcome: &str, duration_ms: f64) {
        self.requests_total
            .get_or_create(&RequestLabels {
                surface: surface.to_string(),
                method: method.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.request_duration_ms
            .get_or_create(&DurationLabels {
                surface: surface.to_string(),
                method: method.to_string(),
            })
            .observe(duration_ms);
    }

    pub fn record_delivery(&self, outcome: &str, duration_ms: f64) {
        let labels = DeliveryLabels {
            outcome: outcome.to_string(),
        };
        self.deliveries_total.get_or_create(&labels).inc();
        self.delivery_duration_ms
            .get_or_create(&labels)
            .observe(duration_ms);
    }

    pub fn record_delivery_retry(&self) {
        self.deliveries_total
            .get_or_create(&DeliveryLabels {
                outcome: "retried".to_string(),
            })
            .inc();
    }

    pub fn record_deferred(&self, instance: &str, buffered_rows: usize) {
        let labels = InstanceLabels {
            instance: self.instance_limiter.resolve(instance).to_string(),
        };
        self.events_deferred_total.get_or_create(&labels).inc();
        self.buffered_rows
            .get_or_create(&labels)
            .set(i64::try_from(buffered_rows).unwrap_or(i64::MAX));
    }

    pub fn record_flush(&self, instance: &str) {
        let labels = InstanceLabels {
            instance: self.instance_limiter.resolve(instance).to_string(),
        };
        self.buffered_rows.get_or_create(&labels).set(0);
    }

    pub fn record_rejected_metrics(&self, method: &str) {
        self.metric_records_rejected_total
            .get_or_create(&RejectLabels {
                method: method.to_string(),
            })
            .inc();
    }

    pub fn set_component_loaded(&self, loaded: bool) {
        self.component_loaded.set(i64::from(loaded));
    }
}
