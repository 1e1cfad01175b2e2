//! Realtime row-change feed over the platform's Phoenix-channel websocket.
//!
//! One socket is opened lazily and multiplexes every subscription as its own
//! topic. Dropping the socket task ends every open subscription stream; the
//! next `subscribe` reconnects. Joins are not replayed after a reconnect.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{BackendError, BackendResult},
    ChangeEvent, ChangeFilter, ChangeSubscription, RealtimeTransport, RowChange,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const PHOENIX_TOPIC: &str = "phoenix";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

enum SocketCommand {
    Join {
        topic: String,
        payload: Value,
        events: mpsc::UnboundedSender<RowChange>,
        reply: oneshot::Sender<BackendResult<()>>,
    },
    Leave {
        topic: String,
    },
}

struct SocketLink {
    commands: mpsc::UnboundedSender<SocketCommand>,
    task: JoinHandle<()>,
}

impl SocketLink {
    fn is_alive(&self) -> bool {
        !self.task.is_finished() && !self.commands.is_closed()
    }
}

struct TopicState {
    events: mpsc::UnboundedSender<RowChange>,
    join_ref: String,
}

pub struct RealtimeSocket {
    endpoint: String,
    access_token: Option<String>,
    link: Mutex<Option<SocketLink>>,
    next_topic: AtomicU64,
}

impl RealtimeSocket {
    pub fn new(base_url: &str, api_key: &str) -> BackendResult<Self> {
        Ok(Self {
            endpoint: websocket_endpoint(base_url, api_key)?,
            access_token: None,
            link: Mutex::new(None),
            next_topic: AtomicU64::new(1),
        })
    }

    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    async fn commands(&self) -> BackendResult<mpsc::UnboundedSender<SocketCommand>> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref().filter(|link| link.is_alive()) {
            return Ok(link.commands.clone());
        }

        let (ws_stream, _) = connect_async(self.endpoint.as_str()).await?;
        info!("realtime: socket connected");
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(ws_stream, command_rx));
        *guard = Some(SocketLink {
            commands: commands.clone(),
            task,
        });
        Ok(commands)
    }
}

#[async_trait]
impl RealtimeTransport for RealtimeSocket {
    async fn subscribe(&self, filter: ChangeFilter) -> BackendResult<ChangeSubscription> {
        let payload = join_payload(&filter, self.access_token.as_deref())?;
        let commands = self.commands().await?;
        let topic = format!(
            "realtime:{}-{}",
            filter.table,
            self.next_topic.fetch_add(1, Ordering::Relaxed)
        );

        let (events, event_rx) = mpsc::unbounded_channel();
        let (reply, reply_rx) = oneshot::channel();
        commands
            .send(SocketCommand::Join {
                topic: topic.clone(),
                payload,
                events,
                reply,
            })
            .map_err(|_| BackendError::Closed)?;

        match tokio::time::timeout(JOIN_TIMEOUT, reply_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Err(_)) => return Err(BackendError::Closed),
            Err(_) => {
                let _ = commands.send(SocketCommand::Leave { topic });
                return Err(BackendError::Transport(
                    "timed out joining realtime topic".into(),
                ));
            }
        }
        debug!(%topic, table = %filter.table, "realtime: joined topic");

        Ok(ChangeSubscription::new(event_rx, move || {
            let _ = commands.send(SocketCommand::Leave { topic });
        }))
    }
}

pub fn websocket_endpoint(base_url: &str, api_key: &str) -> BackendResult<String> {
    let mut url = Url::parse(base_url)
        .map_err(|err| BackendError::InvalidQuery(format!("invalid backend url {base_url}: {err}")))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => {
            return Err(BackendError::InvalidQuery(
                "backend url must start with http:// or https://".into(),
            ))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| BackendError::InvalidQuery(format!("cannot derive websocket url from {base_url}")))?;
    let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url.to_string())
}

pub(crate) fn join_payload(filter: &ChangeFilter, access_token: Option<&str>) -> BackendResult<Value> {
    let mut binding = json!({
        "event": filter.event.as_str(),
        "schema": filter.schema,
        "table": filter.table,
    });
    if let Some(row_filter) = &filter.filter {
        binding["filter"] = Value::String(row_filter.to_realtime_filter()?);
    }
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false, "ack": false },
            "presence": { "key": "" },
            "postgres_changes": [binding],
            "private": false,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    Ok(payload)
}

pub(crate) fn parse_change(payload: &Value) -> Option<RowChange> {
    let data = payload.get("data")?;
    let event: ChangeEvent = serde_json::from_value(data.get("type")?.clone()).ok()?;
    let table = data.get("table")?.as_str()?.to_string();
    let record = data.get("record").cloned().unwrap_or(Value::Null);
    let old_record = data.get("old_record").cloned().filter(|v| !v.is_null());
    Some(RowChange {
        table,
        event,
        record,
        old_record,
    })
}

async fn send_frame(sink: &mut WsSink, frame: &PhoenixFrame) -> BackendResult<()> {
    let text = serde_json::to_string(frame)?;
    sink.send(WsMessage::Text(text)).await?;
    Ok(())
}

async fn run_socket(ws_stream: WsStream, mut commands: mpsc::UnboundedReceiver<SocketCommand>) {
    let (mut sink, mut stream) = ws_stream.split();
    let mut topics: HashMap<String, TopicState> = HashMap::new();
    let mut pending_joins: HashMap<String, (String, oneshot::Sender<BackendResult<()>>)> =
        HashMap::new();
    let mut next_ref: u64 = 1;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let reference = next_ref.to_string();
                next_ref += 1;
                match command {
                    SocketCommand::Join { topic, payload, events, reply } => {
                        let frame = PhoenixFrame {
                            topic: topic.clone(),
                            event: "phx_join".into(),
                            payload,
                            reference: Some(reference.clone()),
                            join_ref: Some(reference.clone()),
                        };
                        if let Err(err) = send_frame(&mut sink, &frame).await {
                            let _ = reply.send(Err(err));
                            break;
                        }
                        topics.insert(topic.clone(), TopicState { events, join_ref: reference.clone() });
                        pending_joins.insert(reference, (topic, reply));
                    }
                    SocketCommand::Leave { topic } => {
                        let Some(state) = topics.remove(&topic) else { continue };
                        let frame = PhoenixFrame {
                            topic: topic.clone(),
                            event: "phx_leave".into(),
                            payload: json!({}),
                            reference: Some(reference),
                            join_ref: Some(state.join_ref),
                        };
                        if let Err(err) = send_frame(&mut sink, &frame).await {
                            warn!(%topic, error = %err, "realtime: failed to leave topic");
                            break;
                        }
                        debug!(%topic, "realtime: left topic");
                    }
                }
            }
            _ = heartbeat.tick() => {
                let frame = PhoenixFrame {
                    topic: PHOENIX_TOPIC.into(),
                    event: "heartbeat".into(),
                    payload: json!({}),
                    reference: Some(next_ref.to_string()),
                    join_ref: None,
                };
                next_ref += 1;
                if let Err(err) = send_frame(&mut sink, &frame).await {
                    warn!(error = %err, "realtime: heartbeat failed");
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(&text, &mut topics, &mut pending_joins);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "realtime: websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    for (_, (_, reply)) in pending_joins.drain() {
        let _ = reply.send(Err(BackendError::Closed));
    }
    info!(open_topics = topics.len(), "realtime: socket closed");
}

fn handle_frame(
    text: &str,
    topics: &mut HashMap<String, TopicState>,
    pending_joins: &mut HashMap<String, (String, oneshot::Sender<BackendResult<()>>)>,
) {
    let frame: PhoenixFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "realtime: undecodable frame");
            return;
        }
    };

    match frame.event.as_str() {
        "phx_reply" => {
            let Some((topic, reply)) = frame
                .reference
                .as_ref()
                .and_then(|reference| pending_joins.remove(reference))
            else {
                return;
            };
            let status = frame
                .payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("error");
            if status == "ok" {
                let _ = reply.send(Ok(()));
            } else {
                topics.remove(&topic);
                let response = frame.payload.get("response").cloned().unwrap_or_default();
                let _ = reply.send(Err(BackendError::Transport(format!(
                    "realtime join rejected for {topic}: {response}"
                ))));
            }
        }
        "postgres_changes" => {
            let Some(state) = topics.get(&frame.topic) else {
                return;
            };
            match parse_change(&frame.payload) {
                Some(change) => {
                    if state.events.send(change).is_err() {
                        debug!(topic = %frame.topic, "realtime: subscriber gone");
                    }
                }
                None => warn!(topic = %frame.topic, "realtime: malformed change payload"),
            }
        }
        "phx_error" | "phx_close" => {
            if topics.remove(&frame.topic).is_some() {
                warn!(topic = %frame.topic, event = %frame.event, "realtime: topic closed by server");
            }
        }
        _ => {}
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
