use std::sync::Arc;

use super::*;
use crate::query::Filter;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        RawQuery, State,
    },
    response::Response,
    routing::get,
    Router,
};
use tokio::net::TcpListener;

#[derive(Clone)]
struct SocketServerState {
    observed: mpsc::UnboundedSender<PhoenixFrame>,
    query: Arc<Mutex<Option<String>>>,
}

async fn upgrade(
    State(state): State<SocketServerState>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    *state.query.lock().await = query;
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: SocketServerState) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<PhoenixFrame>(&text) else {
            continue;
        };
        let _ = state.observed.send(frame.clone());
        if frame.event != "phx_join" {
            continue;
        }

        let filter = frame.payload["config"]["postgres_changes"][0]["filter"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let status = if filter.contains("forbidden") { "error" } else { "ok" };
        let reply = json!({
            "topic": frame.topic,
            "event": "phx_reply",
            "payload": { "status": status, "response": {} },
            "ref": frame.reference,
        });
        if socket.send(Message::Text(reply.to_string())).await.is_err() {
            return;
        }
        if status != "ok" {
            continue;
        }

        let change = json!({
            "topic": frame.topic,
            "event": "postgres_changes",
            "payload": {
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": "messages",
                    "type": "INSERT",
                    "commit_timestamp": "2026-10-16T12:00:00Z",
                    "record": { "id": "m1", "conversation_id": "c1", "content": "Hola", "media_url": null },
                    "old_record": null
                }
            },
            "ref": null,
        });
        if socket.send(Message::Text(change.to_string())).await.is_err() {
            return;
        }
    }
}

async fn spawn_socket_server() -> (String, mpsc::UnboundedReceiver<PhoenixFrame>, Arc<Mutex<Option<String>>>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (observed, observed_rx) = mpsc::unbounded_channel();
    let query = Arc::new(Mutex::new(None));
    let state = SocketServerState {
        observed,
        query: Arc::clone(&query),
    };
    let app = Router::new()
        .route("/realtime/v1/websocket", get(upgrade))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), observed_rx, query)
}

async fn next_event(observed: &mut mpsc::UnboundedReceiver<PhoenixFrame>, event: &str) -> PhoenixFrame {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = observed.recv().await.expect("server alive");
            if frame.event == event {
                return frame;
            }
        }
    })
    .await
    .expect("frame within timeout")
}

#[test]
fn websocket_endpoint_swaps_scheme_and_carries_api_key() {
    assert_eq!(
        websocket_endpoint("https://project.example.co", "anon key").expect("url"),
        "wss://project.example.co/realtime/v1/websocket?apikey=anon+key&vsn=1.0.0"
    );
    assert_eq!(
        websocket_endpoint("http://127.0.0.1:54321/", "k").expect("url"),
        "ws://127.0.0.1:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0"
    );
    assert!(websocket_endpoint("ftp://example.com", "k").is_err());
}

#[test]
fn join_payload_binds_table_event_and_filter() {
    let filter = ChangeFilter::inserts("messages").with_filter(Filter::eq("conversation_id", "c1"));
    let payload = join_payload(&filter, Some("jwt")).expect("payload");
    let binding = &payload["config"]["postgres_changes"][0];
    assert_eq!(binding["event"], "INSERT");
    assert_eq!(binding["schema"], "public");
    assert_eq!(binding["table"], "messages");
    assert_eq!(binding["filter"], "conversation_id=eq.c1");
    assert_eq!(payload["access_token"], "jwt");
}

#[test]
fn parse_change_reads_postgres_change_data() {
    let change = parse_change(&json!({
        "data": {
            "type": "UPDATE",
            "table": "messages",
            "record": { "id": "m1" },
            "old_record": { "id": "m1", "read_at": null }
        }
    }))
    .expect("change");
    assert_eq!(change.event, ChangeEvent::Update);
    assert_eq!(change.table, "messages");
    assert!(change.old_record.is_some());
    assert!(parse_change(&json!({ "data": { "type": "TRUNCATE" } })).is_none());
}

#[tokio::test]
async fn subscribe_joins_receives_changes_and_leaves_on_close() {
    let (url, mut observed, query) = spawn_socket_server().await;
    let socket = RealtimeSocket::new(&url, "anon").expect("socket");

    let mut subscription = socket
        .subscribe(ChangeFilter::inserts("messages").with_filter(Filter::eq("conversation_id", "c1")))
        .await
        .expect("subscribe");

    let join = next_event(&mut observed, "phx_join").await;
    assert!(join.topic.starts_with("realtime:messages-"));
    let query = query.lock().await.clone().unwrap_or_default();
    assert!(query.contains("apikey=anon"));

    let change = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("change within timeout")
        .expect("change");
    assert_eq!(change.event, ChangeEvent::Insert);
    assert_eq!(change.record["content"], "Hola");

    subscription.close();
    let leave = next_event(&mut observed, "phx_leave").await;
    assert_eq!(leave.topic, join.topic);
    assert_eq!(leave.join_ref, join.join_ref);
}

#[tokio::test]
async fn rejected_join_is_reported_to_caller() {
    let (url, _observed, _query) = spawn_socket_server().await;
    let socket = RealtimeSocket::new(&url, "anon").expect("socket");

    let result = socket
        .subscribe(ChangeFilter::inserts("messages").with_filter(Filter::eq("conversation_id", "forbidden")))
        .await;
    assert!(matches!(result, Err(BackendError::Transport(_))));
}

#[tokio::test]
async fn topics_share_one_socket() {
    let (url, mut observed, _query) = spawn_socket_server().await;
    let socket = RealtimeSocket::new(&url, "anon").expect("socket");

    let _first = socket
        .subscribe(ChangeFilter::inserts("messages").with_filter(Filter::eq("conversation_id", "c1")))
        .await
        .expect("first");
    let _second = socket
        .subscribe(ChangeFilter::inserts("messages").with_filter(Filter::eq("conversation_id", "c2")))
        .await
        .expect("second");

    let first_join = next_event(&mut observed, "phx_join").await;
    let second_join = next_event(&mut observed, "phx_join").await;
    assert_ne!(first_join.topic, second_join.topic);
    assert_ne!(first_join.reference, second_join.reference);
}
