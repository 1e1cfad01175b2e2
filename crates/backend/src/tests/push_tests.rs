use std::sync::Arc;

use super::*;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::json;
use shared::protocol::PushPriority;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct GatewayState {
    batches: Arc<Mutex<Vec<Vec<PushMessage>>>>,
}

async fn accept_batch(
    State(state): State<GatewayState>,
    Json(batch): Json<Vec<PushMessage>>,
) -> (StatusCode, Json<Value>) {
    let tickets: Vec<Value> = batch
        .iter()
        .map(|message| {
            if message.to.contains("Invalid") {
                json!({ "status": "error", "message": "not a registered push notification recipient", "details": { "error": "DeviceNotRegistered" } })
            } else {
                json!({ "status": "ok", "id": format!("ticket-{}", message.to) })
            }
        })
        .collect();
    state.batches.lock().await.push(batch);
    (StatusCode::OK, Json(json!({ "data": tickets })))
}

async fn reject_batch() -> (StatusCode, Json<Value>) {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "errors": [{ "code": "RATE_LIMIT", "message": "slow down" }] })),
    )
}

async fn spawn_gateway() -> (String, GatewayState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = GatewayState::default();
    let app = Router::new()
        .route("/--/api/v2/push/send", post(accept_batch))
        .route("/limited", post(reject_batch))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn message(to: &str) -> PushMessage {
    PushMessage {
        to: to.to_string(),
        title: "Ana".into(),
        body: "Hola".into(),
        data: json!({ "type": "new_message" }),
        priority: PushPriority::High,
        sound: Some("default".into()),
    }
}

#[tokio::test]
async fn submits_one_batch_and_returns_tickets_in_order() {
    let (url, state) = spawn_gateway().await;
    let gateway = ExpoPushGateway::new(format!("{url}/--/api/v2/push/send"));

    let tickets = gateway
        .send_batch(&[
            message("ExponentPushToken[a]"),
            message("ExponentPushToken[Invalid]"),
        ])
        .await
        .expect("send");

    assert_eq!(tickets.len(), 2);
    assert!(!tickets[0].is_error());
    assert!(tickets[1].is_error());
    let batches = state.batches.lock().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].priority, PushPriority::High);
}

#[tokio::test]
async fn empty_batch_is_not_sent() {
    let (url, state) = spawn_gateway().await;
    let gateway = ExpoPushGateway::new(format!("{url}/--/api/v2/push/send"));
    let tickets = gateway.send_batch(&[]).await.expect("send");
    assert!(tickets.is_empty());
    assert!(state.batches.lock().await.is_empty());
}

#[tokio::test]
async fn gateway_errors_surface_as_status() {
    let (url, _state) = spawn_gateway().await;
    let gateway = ExpoPushGateway::new(format!("{url}/limited"));
    let result = gateway.send_batch(&[message("ExponentPushToken[a]")]).await;
    assert!(matches!(result, Err(BackendError::Status { status: 429, .. })));
}
