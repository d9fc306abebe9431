//! Export of component-emitted metric records.
//!
//! Each record key becomes its own metric family, created on first sight
//! with the record's type. Labels are the deployment defaults, the
//! record's tags, and the `method` that produced it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use prometheus_client::collector::Collector;
use prometheus_client::encoding::{DescriptorEncoder, EncodeMetric};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::{Family, MetricConstructor};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use tracing::warn;

use super::cardinality::CardinalityLimiter;
use crate::metrics::{MetricRecord, MetricType};

type Labels = Vec<(String, String)>;

/// Buckets for TIMER records, in seconds.
const TIMER_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Builds histograms with a record's own bins.
#[derive(Clone, Debug)]
pub struct Bins(Vec<f64>);

impl MetricConstructor<Histogram> for Bins {
    fn new_metric(&self) -> Histogram {
        Histogram::new(self.0.iter().copied())
    }
}

#[derive(Clone, Debug)]
enum CustomFamily {
    Counter(Family<Labels, Counter<f64, AtomicU64>>),
    Gauge(Family<Labels, Gauge<f64, AtomicU64>>),
    Timer(Family<Labels, Histogram>),
    Histogram(Family<Labels, Histogram, Bins>),
}

impl CustomFamily {
    fn create(record: &MetricRecord) -> Self {
        match record.metric_type {
            MetricType::Counter => Self::Counter(Family::default()),
            MetricType::Gauge => Self::Gauge(Family::default()),
            MetricType::Timer => Self::Timer(Family::new_with_constructor(|| {
                Histogram::new(TIMER_BUCKETS.iter().copied())
            })),
            MetricType::Histogram => {
                Self::Histogram(Family::new_with_constructor(Bins(record.bins.clone())))
            }
        }
    }

    fn metric_type(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Gauge(_) => MetricType::Gauge,
            Self::Timer(_) => MetricType::Timer,
            Self::Histogram(_) => MetricType::Histogram,
        }
    }

    fn observe(&self, labels: &Labels, value: f64) {
        match self {
            Self::Counter(f) => {
                f.get_or_create(labels).inc_by(value);
            }
            Self::Gauge(f) => {
                f.get_or_create(labels).set(value);
            }
            Self::Timer(f) => f.get_or_create(labels).observe(value / 1000.0),
            Self::Histogram(f) => f.get_or_create(labels).observe(value),
        }
    }
}

struct Inner {
    default_labels: BTreeMap<String, String>,
    families: DashMap<String, CustomFamily>,
    keys: CardinalityLimiter,
}

/// Registry collector for component metrics. Clones share state.
#[derive(Clone)]
pub struct CustomMetrics {
    inner: Arc<Inner>,
}

impl fmt::Debug for CustomMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomMetrics")
            .field("families", &self.inner.families.len())
            .finish()
    }
}

/// Replaces characters Prometheus does not allow in names.
fn sanitize_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

fn sanitize_label(raw: &str) -> String {
    sanitize_name(raw).replace(':', "_")
}

impl CustomMetrics {
    pub fn new(default_labels: BTreeMap<String, String>, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_labels,
                families: DashMap::new(),
                keys: CardinalityLimiter::new(max_keys),
            }),
        }
    }

    /// Records one validated record. Returns `false` when the record was
    /// skipped because its key already exists with another type.
    pub fn record(&self, record: &MetricRecord, method: &str) -> bool {
        let key = sanitize_name(&record.key);
        let key = self.inner.keys.resolve(&key).to_string();

        let mut labels: BTreeMap<String, String> = self.inner.default_labels.clone();
        for (k, v) in &record.tags {
            labels.insert(sanitize_label(k), v.clone());
        }
        labels.insert("method".to_string(), method.to_string());
        let labels: Labels = labels.into_iter().collect();

        let family = match self.inner.families.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(CustomFamily::create(record)).clone(),
        };
        if family.metric_type() != record.metric_type {
            warn!(
                key = %key,
                existing = %family.metric_type(),
                received = %record.metric_type,
                "Skipping metric record with conflicting type"
            );
            return false;
        }
        family.observe(&labels, record.value);
        true
    }

    pub fn record_all(&self, records: &[MetricRecord], method: &str) {
        for record in records {
            self.record(record, method);
        }
    }
}

impl Collector for CustomMetrics {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), fmt::Error> {
        for entry in self.inner.families.iter() {
            let name = entry.key();
            let help = format!("Component metric {name}");
            match entry.value() {
                CustomFamily::Counter(f) => {
                    let metric = encoder.encode_descriptor(name, &help, None, f.metric_type())?;
                    f.encode(metric)?;
                }
                CustomFamily::Gauge(f) => {
                    let metric = encoder.encode_descriptor(name, &help, None, f.metric_type())?;
                    f.encode(metric)?;
                }
                CustomFamily::Timer(f) => {
                    let metric = encoder.encode_descriptor(name, &help, None, f.metric_type())?;
                    f.encode(metric)?;
                }
                CustomFamily::Histogram(f) => {
                    let metric = encoder.encode_descriptor(name, &help, None, f.metric_type())?;
                    f.encode(metric)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::registry::Registry;

    fn setup() -> (Registry, CustomMetrics) {
        let mut registry = Registry::default();
        let labels = BTreeMap::from([
            ("deployment_name".to_string(), "dep".to_string()),
            ("model_name".to_string(), "m".to_string()),
        ]);
        let custom = CustomMetrics::new(labels, 10);
        registry.register_collector(Box::new(custom.clone()));
        (registry, custom)
    }

    fn encode(registry: &Registry) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, registry)
            .expect("encoding should succeed");
        buffer
    }

    #[test]
    fn test_counter_and_gauge_exported_under_own_key() {
        let (registry, custom) = setup();
        assert!(custom.record(&MetricRecord::counter("is_drift", 1.0), "predict"));
        assert!(custom.record(&MetricRecord::gauge("p_val", 0.25).with_tag("index", "0"), "predict"));

        let buffer = encode(&registry);
        assert!(buffer.contains("is_drift_total{"));
        assert!(buffer.contains("deployment_name=\"dep\""));
        assert!(buffer.contains("method=\"predict\""));
        assert!(buffer.contains("index=\"0\""));
        assert!(buffer.contains("0.25"));
    }

    #[test]
    fn test_timer_is_exported_in_seconds() {
        let (registry, custom) = setup();
        custom.record(&MetricRecord::timer("latency", 20.0), "predict");
        let buffer = encode(&registry);
        assert!(buffer.contains("latency_sum{"));
        assert!(buffer.contains("0.02"));
    }

    #[test]
    fn test_histogram_uses_record_bins() {
        let (registry, custom) = setup();
        custom.record(&MetricRecord::histogram("size", 3.0, vec![1.0, 5.0]), "predict");
        let buffer = encode(&registry);
        assert!(buffer.contains("size_bucket{"));
        assert!(buffer.contains("le=\"5.0\""));
    }

    #[test]
    fn test_conflicting_type_skipped() {
        let (_registry, custom) = setup();
        assert!(custom.record(&MetricRecord::counter("k", 1.0), "predict"));
        assert!(!custom.record(&MetricRecord::gauge("k", 1.0), "predict"));
    }

    #[test]
    fn test_key_sanitized() {
        assert_eq!(sanitize_name("my-metric.x"), "my_metric_x");
        assert_eq!(sanitize_name("1abc"), "_1abc");
        assert_eq!(sanitize_label("a:b"), "a_b");
    }
}
