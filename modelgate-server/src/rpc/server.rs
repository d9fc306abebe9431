use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use modelgate_core::error::GatewayError;
use modelgate_core::gateway::GatewayService;
use modelgate_core::lifecycle::LifecycleManager;
use modelgate_core::telemetry::GatewayMetrics;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RpcRequest, RpcResponse, dispatch, frame_codec};
use crate::app::Gateway;
use crate::error::TransportResult;
use crate::rest::blocking;

const SURFACE: &str = "rpc";

/// Serves [`RpcRequest`] frames, one response per request, in order, on
/// each connection.
#[derive(Clone)]
pub struct RpcServer {
    service: Arc<GatewayService>,
    lifecycle: Arc<LifecycleManager>,
    metrics: Arc<GatewayMetrics>,
    max_message_bytes: usize,
}

impl RpcServer {
    pub fn new(gateway: &Gateway) -> Self {
        Self {
            service: gateway.service.clone(),
            lifecycle: gateway.lifecycle.clone(),
            metrics: gateway.metrics.clone(),
            max_message_bytes: gateway.config.limits.max_message_bytes,
        }
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> TransportResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, max_message_bytes = self.max_message_bytes, "RPC server listening");
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, conn_shutdown).await {
                                debug!(peer = %peer, error = %e, "RPC connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept RPC connection"),
                },
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, shutdown: CancellationToken) -> TransportResult<()> {
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, frame_codec(self.max_message_bytes));
        loop {
            let frame = tokio::select! {
                frame = framed.next() => frame,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            let response = self.handle_frame(frame?.freeze()).await;
            let mut bytes = bincode::serialize(&response)?;
            if bytes.len() > self.max_message_bytes {
                let err = GatewayError::InternalError {
                    details: format!(
                        "response of {} bytes exceeds message limit of {} bytes",
                        bytes.len(),
                        self.max_message_bytes
                    ),
                };
                bytes = bincode::serialize(&RpcResponse::failure(&err))?;
            }
            framed.send(Bytes::from(bytes)).await?;
        }
    }

    /// Decodes and answers one frame. Failures become failure responses.
    pub async fn handle_frame(&self, frame: Bytes) -> RpcResponse {
        let request: RpcRequest = match bincode::deserialize(&frame) {
            Ok(request) => request,
            Err(e) => {
                return RpcResponse::failure(&GatewayError::malformed(format!("invalid RPC request: {e}")));
            }
        };
        let method = request.method.as_str();

        let Some(_guard) = self.lifecycle.track_request() else {
            return RpcResponse::failure(&GatewayError::ServiceUnavailable {
                reason: "shutting down".to_string(),
            });
        };
        let start = Instant::now();
        let service = self.service.clone();
        let result = blocking(move || dispatch(&service, &request)).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.error_type_name(),
        };
        self.metrics
            .record_request(SURFACE, method, outcome, start.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(value) => RpcResponse::success(&value),
            Err(e) => RpcResponse::failure(&e),
        }
    }
}
