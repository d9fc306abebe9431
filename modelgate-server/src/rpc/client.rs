use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{RpcMethod, RpcRequest, RpcResponse, frame_codec};
use crate::error::{TransportError, TransportResult};

/// Client for the RPC surface. Calls on one client are sequential.
pub struct RpcClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    max_message_bytes: usize,
}

impl RpcClient {
    pub async fn connect(addr: impl ToSocketAddrs, max_message_bytes: usize) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, frame_codec(max_message_bytes)),
            max_message_bytes,
        })
    }

    pub async fn call(&mut self, method: RpcMethod, body: &Value) -> TransportResult<RpcResponse> {
        self.send(&RpcRequest::new(method, body)).await
    }

    pub async fn send(&mut self, request: &RpcRequest) -> TransportResult<RpcResponse> {
        let bytes = bincode::serialize(request)?;
        if bytes.len() > self.max_message_bytes {
            return Err(TransportError::FrameTooLarge {
                size: bytes.len(),
                limit: self.max_message_bytes,
            });
        }
        self.framed.send(Bytes::from(bytes)).await?;
        match self.framed.next().await {
            Some(frame) => Ok(bincode::deserialize(&frame?)?),
            None => Err(TransportError::Closed),
        }
    }
}
