//! Network surfaces for the modelgate inference gateway.
//!
//! The REST, RPC and columnar listeners all drive the same
//! [`GatewayService`](modelgate_core::gateway::GatewayService); the admin
//! server exposes health and metrics on its own port.

pub mod admin;
pub mod app;
pub mod columnar;
pub mod error;
pub mod logging;
pub mod ports;
pub mod rest;
pub mod rpc;
