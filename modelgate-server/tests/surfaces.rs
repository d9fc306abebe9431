//! End-to-end checks of every listener on ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use modelgate_core::array::CanonicalArray;
use modelgate_core::codec::columnar::{self, ColumnarMessage};
use modelgate_core::components::InMemoryStateStore;
use modelgate_core::config::GatewayConfig;
use modelgate_core::lifecycle::{LifecycleConfig, LifecycleManager};
use modelgate_server::app::Gateway;
use modelgate_server::columnar::ColumnarServer;
use modelgate_server::rest::{self, RestState};
use modelgate_server::rpc::{RpcClient, RpcMethod, RpcServer};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Running {
    rest: SocketAddr,
    rpc: SocketAddr,
    columnar: SocketAddr,
    lifecycle: Arc<LifecycleManager>,
    shutdown: CancellationToken,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start(config: GatewayConfig) -> Running {
    let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
    let shutdown = lifecycle.shutdown_token();
    let max_body_bytes = config.limits.max_body_bytes;
    let gateway = Gateway::build(config, lifecycle.clone(), Arc::new(InMemoryStateStore::new())).unwrap();
    gateway.load_component().await.unwrap();
    lifecycle.mark_config_loaded();
    lifecycle.mark_ready();

    let rest_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let rpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let columnar_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let running = Running {
        rest: rest_listener.local_addr().unwrap(),
        rpc: rpc_listener.local_addr().unwrap(),
        columnar: columnar_listener.local_addr().unwrap(),
        lifecycle,
        shutdown: shutdown.clone(),
    };

    let router = rest::router(RestState::from_gateway(&gateway), max_body_bytes);
    tokio::spawn(rest::serve(rest_listener, router, shutdown.clone()));
    tokio::spawn(RpcServer::new(&gateway).serve(rpc_listener, shutdown.clone()));
    tokio::spawn(ColumnarServer::new(&gateway).serve(columnar_listener, shutdown));
    running
}

#[tokio::test]
async fn test_rest_predict() {
    let running = start(GatewayConfig::default()).await;
    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", running.rest))
        .json(&json!({"data": {"names": ["a", "b"], "ndarray": [[1, 2], [3, 4]]}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["ndarray"], json!([[1, 2], [3, 4]]));
    assert_eq!(body["data"]["names"], json!(["a", "b"]));
}

#[tokio::test]
async fn test_rest_failure_envelope() {
    let running = start(GatewayConfig::default()).await;
    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", running.rest))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"]["status"], "FAILURE");
}

#[tokio::test]
async fn test_event_reply_posted_to_sink() {
    let sink = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/reply"))
        .and(header("ce-id", "evt-9"))
        .and(header("ce-source", "test.gateway"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&sink)
        .await;

    let mut config = GatewayConfig::default();
    config.events.source = "test.gateway".to_string();
    config.delivery.reply_url = Some(format!("{}/reply", sink.uri()));
    let running = start(config).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/", running.rest))
        .header("ce-id", "evt-9")
        .header("ce-source", "client")
        .header("ce-type", "io.example.request")
        .header("ce-specversion", "1.0")
        .json(&json!({"data": {"ndarray": [[5]]}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["ce-source"], "test.gateway");

    for _ in 0..50 {
        if !sink.received_requests().await.unwrap_or_default().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let received = sink.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let delivered: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(delivered["data"]["ndarray"], json!([[5]]));
}

#[tokio::test]
async fn test_rpc_round_trip() {
    let running = start(GatewayConfig::default()).await;
    let mut client = RpcClient::connect(running.rpc, 1024 * 1024).await.unwrap();

    let response = client
        .call(RpcMethod::Predict, &json!({"data": {"tensor": {"shape": [1, 3], "values": [1, 2, 3]}}}))
        .await
        .unwrap();
    assert!(response.is_success());
    assert_eq!(response.json().unwrap()["data"]["tensor"]["values"], json!([1, 2, 3]));

    let response = client
        .call(RpcMethod::Route, &json!({"data": {"ndarray": [[1]]}}))
        .await
        .unwrap();
    assert_eq!(response.code, 501);
    assert_eq!(response.json().unwrap()["status"]["reason"], "MICROSERVICE_NOT_IMPLEMENTED");

    let response = client.call(RpcMethod::Metadata, &Value::Null).await.unwrap();
    assert!(response.is_success());
}

#[tokio::test]
async fn test_rpc_rejects_during_shutdown() {
    let running = start(GatewayConfig::default()).await;
    let mut client = RpcClient::connect(running.rpc, 1024 * 1024).await.unwrap();
    running.lifecycle.begin_shutdown();

    // The connection task stops on shutdown, so the call either gets a 503
    // or finds the connection closed.
    match client.call(RpcMethod::Predict, &json!({"data": {"ndarray": [[1]]}})).await {
        Ok(response) => assert_eq!(response.code, 503),
        Err(_) => {}
    }
}

async fn columnar_call(addr: SocketAddr, frame: &[u8]) -> ColumnarMessage {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(frame).await.unwrap();
    let size = stream.read_u32_le().await.unwrap();
    let mut reply = vec![0u8; 4 + size as usize];
    reply[..4].copy_from_slice(&size.to_le_bytes());
    stream.read_exact(&mut reply[4..]).await.unwrap();
    columnar::decode(&reply).unwrap()
}

#[tokio::test]
async fn test_columnar_predict() {
    let running = start(GatewayConfig::default()).await;
    let array = CanonicalArray::from_shape_vec(&[2, 2], vec![1.0f64, 2.0, 3.0, 4.0]).unwrap();
    let names = vec!["x".to_string(), "y".to_string()];

    match columnar_call(running.columnar, &columnar::encode_data(&array, &names).unwrap()).await {
        ColumnarMessage::Data { names: out_names, array: out } => {
            assert_eq!(out, array);
            assert_eq!(out_names, names);
        }
        other => panic!("expected data frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_columnar_status_frame_rejected() {
    let running = start(GatewayConfig::default()).await;
    let frame = columnar::encode_status(0, true, "hello");

    match columnar_call(running.columnar, &frame).await {
        ColumnarMessage::Status { success, info, .. } => {
            assert!(!success);
            assert!(info.contains("Message is not of type DefaultData"));
        }
        other => panic!("expected status frame, got {other:?}"),
    }
}
