//! Client-side seams onto the hosted backend: relational rows, object
//! storage, realtime row changes, the auth session and the push gateway.
//!
//! Every component receives a [`BackendHandle`] at construction instead of
//! reaching for a process-wide client.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::UserId,
    protocol::{PushMessage, PushTicket},
};
use tokio::sync::mpsc;
use tracing::warn;

pub mod error;
pub mod push;
pub mod query;
pub mod realtime;
pub mod rest;

pub use error::{BackendError, BackendResult};
pub use push::ExpoPushGateway;
pub use query::{Filter, Order, Query};
pub use realtime::RealtimeSocket;
pub use rest::RestBackend;

/// A row as the backend returns it: a JSON object keyed by column name.
pub type Row = Value;

pub fn decode_row<T: DeserializeOwned>(row: Row) -> BackendResult<T> {
    Ok(serde_json::from_value(row)?)
}

/// Decodes each row on its own. Rows that do not fit `T` are logged and
/// skipped so one malformed row cannot hide the rest of a list.
pub fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Row>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match decode_row(row) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(table, error = %err, "backend: skipping undecodable row");
                None
            }
        })
        .collect()
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn select(&self, query: &Query) -> BackendResult<Vec<Row>>;

    /// First row of the query in its own order. Zero matches is `Ok(None)`.
    async fn select_single(&self, query: &Query) -> BackendResult<Option<Row>> {
        let query = query.clone().limit(1);
        Ok(self.select(&query).await?.into_iter().next())
    }

    async fn insert(&self, table: &str, row: Row) -> BackendResult<Row>;
    async fn update(&self, query: &Query, patch: Row) -> BackendResult<Vec<Row>>;
    async fn delete(&self, query: &Query) -> BackendResult<u64>;
    async fn upsert(&self, table: &str, row: Row, on_conflict: &[&str]) -> BackendResult<Row>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under `bucket/key`. With `upsert == false` an existing
    /// object is reported as [`BackendError::Conflict`].
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> BackendResult<()>;
    fn public_url(&self, bucket: &str, key: &str) -> String;
    async fn remove(&self, bucket: &str, keys: &[String]) -> BackendResult<()>;
}

#[async_trait]
pub trait AuthSession: Send + Sync {
    async fn current_user(&self) -> BackendResult<Option<UserId>>;
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send_batch(&self, messages: &[PushMessage]) -> BackendResult<Vec<PushTicket>>;
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> BackendResult<ChangeSubscription>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl ChangeEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeEvent::Insert => "INSERT",
            ChangeEvent::Update => "UPDATE",
            ChangeEvent::Delete => "DELETE",
            ChangeEvent::All => "*",
        }
    }

    pub fn accepts(self, event: ChangeEvent) -> bool {
        self == ChangeEvent::All || self == event
    }
}

/// Which row changes a realtime subscription receives.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    pub event: ChangeEvent,
    pub filter: Option<Filter>,
}

impl ChangeFilter {
    pub fn new(table: impl Into<String>, event: ChangeEvent) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            event,
            filter: None,
        }
    }

    pub fn inserts(table: impl Into<String>) -> Self {
        Self::new(table, ChangeEvent::Insert)
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        if change.table != self.table || !self.event.accepts(change.event) {
            return false;
        }
        let row = if change.event == ChangeEvent::Delete {
            change.old_record.as_ref().unwrap_or(&change.record)
        } else {
            &change.record
        };
        self.filter.as_ref().map_or(true, |f| f.matches(row))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub event: ChangeEvent,
    pub record: Row,
    #[serde(default)]
    pub old_record: Option<Row>,
}

/// Live feed of row changes. Closing (or dropping) releases the
/// server-side binding; closing twice is a no-op.
pub struct ChangeSubscription {
    events: mpsc::UnboundedReceiver<RowChange>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ChangeSubscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<RowChange>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            events,
            release: Some(Box::new(release)),
        }
    }

    /// Next change, or `None` once the transport has gone away or the
    /// subscription was closed.
    pub async fn next(&mut self) -> Option<RowChange> {
        if self.release.is_none() {
            return None;
        }
        self.events.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.release.is_none()
    }

    pub fn close(&mut self) {
        if let Some(release) = self.release.take() {
            self.events.close();
            release();
        }
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct MissingPushGateway;

#[async_trait]
impl PushGateway for MissingPushGateway {
    async fn send_batch(&self, _messages: &[PushMessage]) -> BackendResult<Vec<PushTicket>> {
        Err(BackendError::Transport("push gateway is unavailable".into()))
    }
}

pub struct MissingRealtime;

#[async_trait]
impl RealtimeTransport for MissingRealtime {
    async fn subscribe(&self, filter: ChangeFilter) -> BackendResult<ChangeSubscription> {
        Err(BackendError::Transport(format!(
            "realtime transport is unavailable for table {}",
            filter.table
        )))
    }
}

/// Long-lived bundle of backend collaborators, created at startup and cloned
/// into every component.
#[derive(Clone)]
pub struct BackendHandle {
    pub database: Arc<dyn Database>,
    pub objects: Arc<dyn ObjectStorage>,
    pub realtime: Arc<dyn RealtimeTransport>,
    pub auth: Arc<dyn AuthSession>,
    pub push: Arc<dyn PushGateway>,
}

impl BackendHandle {
    pub fn new(
        database: Arc<dyn Database>,
        objects: Arc<dyn ObjectStorage>,
        realtime: Arc<dyn RealtimeTransport>,
        auth: Arc<dyn AuthSession>,
    ) -> Self {
        Self {
            database,
            objects,
            realtime,
            auth,
            push: Arc::new(MissingPushGateway),
        }
    }

    pub fn with_push_gateway(mut self, push: Arc<dyn PushGateway>) -> Self {
        self.push = push;
        self
    }

    pub fn with_database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = database;
        self
    }

    pub fn without_realtime(mut self) -> Self {
        self.realtime = Arc::new(MissingRealtime);
        self
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
