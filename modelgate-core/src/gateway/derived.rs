//! Metrics derived from detector outputs.

use serde_json::Value;

use crate::metrics::MetricRecord;

const DRIFT_GAUGES: [&str; 3] = ["distance", "p_val", "threshold"];

/// Detector outputs are either the bare result object or `{"data": ...}`.
pub fn detector_payload(output: &Value) -> &Value {
    match output.get("data") {
        Some(inner) if inner.is_object() => inner,
        _ => output,
    }
}

fn truthy(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        Value::Number(n) => n.as_f64().map(|v| if v != 0.0 { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// `(index, value)` for a scalar or a list of numbers.
fn indexed(value: &Value) -> Vec<(usize, f64)> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_f64().map(|f| (i, f)))
            .collect(),
        other => other.as_f64().map(|f| vec![(0, f)]).unwrap_or_default(),
    }
}

/// Records for a drift result: `is_drift` as COUNTER and GAUGE, then one
/// GAUGE per index for each of distance, p_val and threshold.
///
/// Empty when the output has no `is_drift` flag.
pub fn drift_metrics(output: &Value) -> Vec<MetricRecord> {
    let payload = detector_payload(output);
    let Some(is_drift) = payload.get("is_drift").and_then(truthy) else {
        return Vec::new();
    };

    let mut records = vec![
        MetricRecord::counter("is_drift", is_drift),
        MetricRecord::gauge("is_drift", is_drift),
    ];
    for key in DRIFT_GAUGES {
        if let Some(value) = payload.get(key) {
            records.extend(
                indexed(value)
                    .into_iter()
                    .map(|(i, v)| MetricRecord::gauge(key, v).with_tag("index", i.to_string())),
            );
        }
    }
    records
}

/// Records for an outlier result: `is_outlier` COUNTER with the number of
/// flagged instances, and one `instance_score` GAUGE per instance.
pub fn outlier_metrics(output: &Value) -> Vec<MetricRecord> {
    let payload = detector_payload(output);
    let mut records = Vec::new();

    if let Some(flags) = payload.get("is_outlier") {
        let flagged: f64 = match flags {
            Value::Array(items) => items.iter().filter_map(truthy).sum(),
            other => truthy(other).unwrap_or(0.0),
        };
        records.push(MetricRecord::counter("is_outlier", flagged));
    }
    if let Some(scores) = payload.get("instance_score") {
        records.extend(indexed(scores).into_iter().map(|(i, v)| {
            MetricRecord::gauge("instance_score", v).with_tag("index", i.to_string())
        }));
    }
    records
}
