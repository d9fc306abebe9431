//! modelgate core: a model-agnostic inference protocol gateway.
//!
//! Requests in any supported dialect decode into a [`array::CanonicalArray`],
//! are dispatched to a pluggable [`dispatch::Component`], and are encoded
//! back in the caller's dialect with a merged metrics and tags sidecar.
//! Event-push requests take the same path, optionally through a per-instance
//! accumulation buffer, and their replies are delivered to a reply target.
//!
//! The server crate (`modelgate-server`) puts the HTTP, RPC and columnar
//! transports in front of this library.

pub mod array;
pub mod codec;
pub mod components;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod metrics;
pub mod telemetry;
