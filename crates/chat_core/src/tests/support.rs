use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use backend::{
    BackendError, BackendHandle, BackendResult, Database, PushGateway, Query, Row,
};
use serde_json::json;
use shared::{
    domain::UserId,
    protocol::{PushMessage, PushTicket},
};
use storage::{FixedSession, LocalObjectStore, Storage};
use tempfile::TempDir;
use tokio::sync::{Barrier, Mutex, Notify};

pub(crate) struct LocalBackend {
    pub storage: Storage,
    pub handle: BackendHandle,
    pub media_dir: TempDir,
}

pub(crate) async fn local_backend(session: Option<UserId>) -> LocalBackend {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let media_dir = tempfile::tempdir().expect("tempdir");
    let session = session.map_or_else(FixedSession::signed_out, FixedSession::signed_in);
    let handle = storage.backend_handle(LocalObjectStore::file_urls(media_dir.path()), session);
    LocalBackend {
        storage,
        handle,
        media_dir,
    }
}

pub(crate) async fn seed_profile(handle: &BackendHandle, user_id: UserId, full_name: Option<&str>) {
    handle
        .database
        .insert(
            "profiles",
            json!({ "id": user_id, "full_name": full_name, "email": format!("{user_id}@example.com") }),
        )
        .await
        .expect("profile");
}

pub(crate) async fn seed_push_token(handle: &BackendHandle, user_id: UserId, token: &str) {
    handle
        .database
        .upsert(
            "push_tokens",
            json!({ "user_id": user_id, "push_token": token, "device_type": "ios" }),
            &["user_id", "push_token"],
        )
        .await
        .expect("push token");
}

/// Push gateway that records batches instead of sending them.
#[derive(Default)]
pub(crate) struct RecordingPushGateway {
    batches: Mutex<Vec<Vec<PushMessage>>>,
    delivered: Notify,
    fail: bool,
    stall: bool,
}

impl RecordingPushGateway {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Never answers, like a gateway that hangs.
    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    pub async fn batches(&self) -> Vec<Vec<PushMessage>> {
        self.batches.lock().await.clone()
    }

    pub async fn wait_for_batches(&self, count: usize) -> Vec<Vec<PushMessage>> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.delivered.notified();
                {
                    let batches = self.batches.lock().await;
                    if batches.len() >= count {
                        return batches.clone();
                    }
                }
                notified.await;
            }
        })
        .await
        .expect("push batches within timeout")
    }
}

#[async_trait]
impl PushGateway for RecordingPushGateway {
    async fn send_batch(&self, messages: &[PushMessage]) -> BackendResult<Vec<PushTicket>> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        self.batches.lock().await.push(messages.to_vec());
        self.delivered.notify_waiters();
        if self.fail {
            return Err(BackendError::Transport("gateway offline".into()));
        }
        Ok(messages
            .iter()
            .map(|message| PushTicket {
                status: "ok".into(),
                id: Some(format!("ticket-{}", message.to)),
                message: None,
                details: None,
            })
            .collect())
    }
}

/// Holds the first `parties` selects on a table at a barrier until all of
/// them have read, so their follow-up writes race.
pub(crate) struct GatedDatabase {
    inner: Arc<dyn Database>,
    table: &'static str,
    parties: usize,
    passed: AtomicUsize,
    barrier: Barrier,
}

impl GatedDatabase {
    pub fn new(inner: Arc<dyn Database>, table: &'static str, parties: usize) -> Self {
        Self {
            inner,
            table,
            parties,
            passed: AtomicUsize::new(0),
            barrier: Barrier::new(parties),
        }
    }
}

#[async_trait]
impl Database for GatedDatabase {
    async fn select(&self, query: &Query) -> BackendResult<Vec<Row>> {
        let rows = self.inner.select(query).await?;
        if query.table == self.table && self.passed.fetch_add(1, Ordering::SeqCst) < self.parties {
            self.barrier.wait().await;
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Row) -> BackendResult<Row> {
        self.inner.insert(table, row).await
    }

    async fn update(&self, query: &Query, patch: Row) -> BackendResult<Vec<Row>> {
        self.inner.update(query, patch).await
    }

    async fn delete(&self, query: &Query) -> BackendResult<u64> {
        self.inner.delete(query).await
    }

    async fn upsert(&self, table: &str, row: Row, on_conflict: &[&str]) -> BackendResult<Row> {
        self.inner.upsert(table, row, on_conflict).await
    }
}

/// Database whose every call fails, for the never-raise read paths.
pub(crate) struct BrokenDatabase;

#[async_trait]
impl Database for BrokenDatabase {
    async fn select(&self, _query: &Query) -> BackendResult<Vec<Row>> {
        Err(BackendError::Transport("database offline".into()))
    }

    async fn insert(&self, _table: &str, _row: Row) -> BackendResult<Row> {
        Err(BackendError::Transport("database offline".into()))
    }

    async fn update(&self, _query: &Query, _patch: Row) -> BackendResult<Vec<Row>> {
        Err(BackendError::Transport("database offline".into()))
    }

    async fn delete(&self, _query: &Query) -> BackendResult<u64> {
        Err(BackendError::Transport("database offline".into()))
    }

    async fn upsert(&self, _table: &str, _row: Row, _on_conflict: &[&str]) -> BackendResult<Row> {
        Err(BackendError::Transport("database offline".into()))
    }
}

/// Database whose selects return the same rows whatever the query; writes fail.
pub(crate) struct CannedDatabase {
    rows: Vec<Row>,
}

impl CannedDatabase {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl Database for CannedDatabase {
    async fn select(&self, _query: &Query) -> BackendResult<Vec<Row>> {
        Ok(self.rows.clone())
    }

    async fn insert(&self, _table: &str, _row: Row) -> BackendResult<Row> {
        Err(BackendError::Transport("read-only rows".into()))
    }

    async fn update(&self, _query: &Query, _patch: Row) -> BackendResult<Vec<Row>> {
        Err(BackendError::Transport("read-only rows".into()))
    }

    async fn delete(&self, _query: &Query) -> BackendResult<u64> {
        Err(BackendError::Transport("read-only rows".into()))
    }

    async fn upsert(&self, _table: &str, _row: Row, _on_conflict: &[&str]) -> BackendResult<Row> {
        Err(BackendError::Transport("read-only rows".into()))
    }
}
