//! Columnar socket surface.
//!
//! Clients write size-prefixed columnar data frames (little-endian `u32`
//! prefix) and read one data or status frame back per request. Per-request
//! failures come back as status frames; only a broken or oversized frame
//! closes the connection.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use modelgate_core::codec::columnar;
use modelgate_core::error::GatewayError;
use modelgate_core::gateway::GatewayService;
use modelgate_core::lifecycle::LifecycleManager;
use modelgate_core::telemetry::GatewayMetrics;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::Gateway;
use crate::error::TransportResult;

const SURFACE: &str = "columnar";
const PREFIX_LEN: usize = 4;

/// Splits the stream into whole frames, prefix included.
pub fn frame_codec(max_message_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(PREFIX_LEN)
        .num_skip(0)
        .max_frame_length(max_message_bytes)
        .new_codec()
}

#[derive(Clone)]
pub struct ColumnarServer {
    service: Arc<GatewayService>,
    lifecycle: Arc<LifecycleManager>,
    metrics: Arc<GatewayMetrics>,
    max_message_bytes: usize,
}

impl ColumnarServer {
    pub fn new(gateway: &Gateway) -> Self {
        Self {
            service: gateway.service.clone(),
            lifecycle: gateway.lifecycle.clone(),
            metrics: gateway.metrics.clone(),
            max_message_bytes: gateway.config.limits.max_message_bytes,
        }
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> TransportResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Columnar server listening");
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, conn_shutdown).await {
                                debug!(peer = %peer, error = %e, "Columnar connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept columnar connection"),
                },
                _ = shutdown.cancelled() => {
                    info!("Columnar server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, shutdown: CancellationToken) -> TransportResult<()> {
        stream.set_nodelay(true)?;
        let (read, mut write) = stream.into_split();
        let mut frames = FramedRead::new(read, frame_codec(self.max_message_bytes));
        loop {
            let frame = tokio::select! {
                frame = frames.next() => frame,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            let reply = match frame {
                Ok(frame) => self.handle_frame(frame).await,
                Err(e) => {
                    let err = GatewayError::malformed(format!("unreadable frame: {e}"));
                    write.write_all(&columnar::encode_error(&err)).await?;
                    return Err(e.into());
                }
            };
            write.write_all(&reply).await?;
        }
    }

    /// Answers one frame (prefix included).
    pub async fn handle_frame(&self, frame: BytesMut) -> Bytes {
        let Some(_guard) = self.lifecycle.track_request() else {
            return columnar::encode_error(&GatewayError::ServiceUnavailable {
                reason: "shutting down".to_string(),
            });
        };
        let start = Instant::now();
        let service = self.service.clone();
        let reply = tokio::task::spawn_blocking(move || service.predict_frame(&frame))
            .await
            .unwrap_or_else(|e| {
                columnar::encode_error(&GatewayError::InternalError {
                    details: format!("request task failed: {e}"),
                })
            });

        let outcome = match columnar::decode(&reply) {
            Ok(columnar::ColumnarMessage::Data { .. }) => "success",
            _ => "failure",
        };
        self.metrics
            .record_request(SURFACE, "predict", outcome, start.elapsed().as_secs_f64() * 1000.0);
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::Decoder;

    #[test]
    fn test_codec_keeps_prefix() {
        let frame = columnar::encode_status(0, true, "ok");
        let mut buf = BytesMut::from(&frame[..]);
        buf.extend_from_slice(&[9, 9]);

        let mut codec = frame_codec(1024);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], &frame[..]);
        assert_eq!(&buf[..], &[9, 9]);
    }

    #[test]
    fn test_codec_waits_for_whole_frame() {
        let frame = columnar::encode_status(0, true, "ok");
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        let mut codec = frame_codec(1024);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized() {
        let mut buf = BytesMut::from(&[0xff, 0xff, 0, 0, 1][..]);
        let mut codec = frame_codec(16);
        assert!(codec.decode(&mut buf).is_err());
    }
}
