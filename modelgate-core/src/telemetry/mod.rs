//! Prometheus telemetry.
//!
//! - [`prom_metrics`] - families owned by the gateway
//! - [`custom`] - collector exporting component-emitted records
//! - [`cardinality`] - bounds distinct label values and metric keys

pub mod cardinality;
pub mod custom;
pub mod prom_metrics;

pub use cardinality::CardinalityLimiter;
pub use custom::CustomMetrics;
pub use prom_metrics::GatewayMetrics;
