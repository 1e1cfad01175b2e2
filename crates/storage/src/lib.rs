//! Self-hosted stand-in for the hosted backend: SQLite rows through sqlx, an
//! in-process change bus for realtime, files on disk for media and a fixed
//! auth session.

use anyhow::{Context, Result};
use async_trait::async_trait;
use backend::{
    rest::validate_identifier, AuthSession, BackendError, BackendHandle, BackendResult,
    ChangeEvent, ChangeFilter, ChangeSubscription, Database, Filter, Query, RealtimeTransport,
    Row, RowChange,
};
use serde_json::{Map, Value};
use shared::domain::UserId;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Column, Pool, QueryBuilder, Row as _, Sqlite, TypeInfo, ValueRef,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{debug, warn};

mod objects;

pub use objects::LocalObjectStore;

const CHANGE_BUS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<RowChange>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        create_database_dir(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `:memory:` is its own database, so keep exactly one alive.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to apply chat schema migrations")?;

        let (changes, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Installs the unordered participant-pair uniqueness the hosted schema is
    /// expected to carry. Fails if duplicate pairs already exist.
    pub async fn enforce_unique_conversation_pairs(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS conversations_unordered_pair
            ON conversations (
                min(participant_1_id, participant_2_id),
                max(participant_1_id, participant_2_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create unique participant-pair index")?;
        Ok(())
    }

    /// Bundles this database (which also serves realtime), the given object
    /// store and a fixed session into one handle.
    pub fn backend_handle(&self, objects: LocalObjectStore, session: FixedSession) -> BackendHandle {
        let storage = Arc::new(self.clone());
        BackendHandle::new(
            storage.clone(),
            Arc::new(objects),
            storage,
            Arc::new(session),
        )
    }

    fn publish(&self, table: &str, event: ChangeEvent, record: Row, old_record: Option<Row>) {
        let _ = self.changes.send(RowChange {
            table: table.to_string(),
            event,
            record,
            old_record,
        });
    }
}

#[async_trait]
impl Database for Storage {
    async fn select(&self, query: &Query) -> BackendResult<Vec<Row>> {
        validate_identifier(&query.table)?;
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {}", query.table));
        push_where(&mut builder, &query.filters)?;
        push_order(&mut builder, query)?;
        if query.limit.is_some() || query.offset.is_some() {
            builder.push(" LIMIT ");
            builder.push_bind(query.limit.map_or(-1, clamp_i64));
            builder.push(" OFFSET ");
            builder.push_bind(clamp_i64(query.offset.unwrap_or(0)));
        }
        debug!(sql = builder.sql(), "storage: select");
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(row_to_json).collect()
    }

    async fn insert(&self, table: &str, row: Row) -> BackendResult<Row> {
        validate_identifier(table)?;
        let columns = row_columns(&row)?;
        let mut builder = QueryBuilder::<Sqlite>::new(format!("INSERT INTO {table}"));
        push_values(&mut builder, &columns);
        builder.push(" RETURNING *");
        let inserted = builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        let record = row_to_json(&inserted)?;
        self.publish(table, ChangeEvent::Insert, record.clone(), None);
        Ok(record)
    }

    async fn update(&self, query: &Query, patch: Row) -> BackendResult<Vec<Row>> {
        validate_identifier(&query.table)?;
        require_filters(query, "update")?;
        let columns = row_columns(&patch)?;
        if columns.is_empty() {
            return Err(BackendError::InvalidQuery("update patch has no columns".into()));
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", query.table));
        for (index, (column, value)) in columns.iter().enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            builder.push(format!("{column} = "));
            push_value(&mut builder, value);
        }
        push_where(&mut builder, &query.filters)?;
        builder.push(" RETURNING *");
        let updated = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        let records = updated.iter().map(row_to_json).collect::<BackendResult<Vec<_>>>()?;
        for record in &records {
            self.publish(&query.table, ChangeEvent::Update, record.clone(), None);
        }
        Ok(records)
    }

    async fn delete(&self, query: &Query) -> BackendResult<u64> {
        validate_identifier(&query.table)?;
        require_filters(query, "delete")?;
        let mut builder = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {}", query.table));
        push_where(&mut builder, &query.filters)?;
        builder.push(" RETURNING *");
        let deleted = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        for row in &deleted {
            let record = row_to_json(row)?;
            self.publish(&query.table, ChangeEvent::Delete, record.clone(), Some(record));
        }
        Ok(deleted.len() as u64)
    }

    async fn upsert(&self, table: &str, row: Row, on_conflict: &[&str]) -> BackendResult<Row> {
        validate_identifier(table)?;
        if on_conflict.is_empty() {
            return Err(BackendError::InvalidQuery(
                "upsert needs at least one conflict column".into(),
            ));
        }
        for column in on_conflict {
            validate_identifier(column)?;
        }
        let columns = row_columns(&row)?;
        let mut builder = QueryBuilder::<Sqlite>::new(format!("INSERT INTO {table}"));
        push_values(&mut builder, &columns);
        builder.push(format!(" ON CONFLICT ({}) DO UPDATE SET ", on_conflict.join(", ")));
        let mut assignments: Vec<String> = columns
            .iter()
            .filter(|(column, _)| !on_conflict.contains(&column.as_str()))
            .map(|(column, _)| format!("{column} = excluded.{column}"))
            .collect();
        if assignments.is_empty() {
            // Still touch the row so RETURNING yields it.
            assignments.push(format!("{0} = excluded.{0}", on_conflict[0]));
        }
        builder.push(assignments.join(", "));
        builder.push(" RETURNING *");
        let stored = builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        row_to_json(&stored)
    }
}

#[async_trait]
impl RealtimeTransport for Storage {
    async fn subscribe(&self, filter: ChangeFilter) -> BackendResult<ChangeSubscription> {
        validate_identifier(&filter.table)?;
        let mut changes = BroadcastStream::new(self.changes.subscribe());
        let (events, receiver) = mpsc::unbounded_channel();
        let table = filter.table.clone();
        let task = tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                match change {
                    Ok(change) if filter.matches(&change) => {
                        if events.send(change).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(table = %filter.table, skipped, "storage: realtime subscriber lagged");
                    }
                }
            }
        });
        debug!(%table, "storage: realtime subscription opened");
        Ok(ChangeSubscription::new(receiver, move || task.abort()))
    }
}

/// Auth session pinned to one user, or to nobody.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSession(Option<UserId>);

impl FixedSession {
    pub fn signed_in(user_id: UserId) -> Self {
        Self(Some(user_id))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

#[async_trait]
impl AuthSession for FixedSession {
    async fn current_user(&self) -> BackendResult<Option<UserId>> {
        Ok(self.0)
    }
}

fn require_filters(query: &Query, operation: &str) -> BackendResult<()> {
    if query.filters.is_empty() {
        return Err(BackendError::InvalidQuery(format!(
            "refusing unfiltered {operation} on {}",
            query.table
        )));
    }
    Ok(())
}

fn row_columns(row: &Row) -> BackendResult<Vec<(String, Value)>> {
    let Value::Object(object) = row else {
        return Err(BackendError::InvalidQuery("row must be a JSON object".into()));
    };
    object
        .iter()
        .map(|(column, value)| {
            validate_identifier(column)?;
            Ok((column.clone(), value.clone()))
        })
        .collect()
}

fn push_values(builder: &mut QueryBuilder<'_, Sqlite>, columns: &[(String, Value)]) {
    if columns.is_empty() {
        builder.push(" DEFAULT VALUES");
        return;
    }
    let names = columns
        .iter()
        .map(|(column, _)| column.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    builder.push(format!(" ({names}) VALUES ("));
    for (index, (_, value)) in columns.iter().enumerate() {
        if index > 0 {
            builder.push(", ");
        }
        push_value(builder, value);
    }
    builder.push(")");
}

fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => builder.push_bind(None::<String>),
        Value::Bool(flag) => builder.push_bind(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => builder.push_bind(integer),
            None => builder.push_bind(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => builder.push_bind(text.clone()),
        other => builder.push_bind(other.to_string()),
    };
}

fn push_where(builder: &mut QueryBuilder<'_, Sqlite>, filters: &[Filter]) -> BackendResult<()> {
    if filters.is_empty() {
        return Ok(());
    }
    builder.push(" WHERE ");
    push_group(builder, filters, " AND ")
}

fn push_group(
    builder: &mut QueryBuilder<'_, Sqlite>,
    filters: &[Filter],
    joiner: &str,
) -> BackendResult<()> {
    if filters.is_empty() {
        return Err(BackendError::InvalidQuery(
            "logical filter group must not be empty".into(),
        ));
    }
    builder.push("(");
    for (index, filter) in filters.iter().enumerate() {
        if index > 0 {
            builder.push(joiner);
        }
        push_filter(builder, filter)?;
    }
    builder.push(")");
    Ok(())
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) -> BackendResult<()> {
    match filter {
        Filter::Eq(column, Value::Null) | Filter::IsNull(column) => {
            validate_identifier(column)?;
            builder.push(format!("{column} IS NULL"));
        }
        Filter::Eq(column, value) => {
            validate_identifier(column)?;
            builder.push(format!("{column} = "));
            push_value(builder, value);
        }
        Filter::Neq(column, Value::Null) => {
            validate_identifier(column)?;
            builder.push(format!("{column} IS NOT NULL"));
        }
        Filter::Neq(column, value) => {
            validate_identifier(column)?;
            builder.push(format!("{column} <> "));
            push_value(builder, value);
        }
        Filter::Or(filters) => push_group(builder, filters, " OR ")?,
        Filter::And(filters) => push_group(builder, filters, " AND ")?,
    }
    Ok(())
}

/// Requested order followed by `rowid` so rows with equal keys keep insertion order.
fn push_order(builder: &mut QueryBuilder<'_, Sqlite>, query: &Query) -> BackendResult<()> {
    let mut terms = Vec::with_capacity(query.order.len() + 1);
    for order in &query.order {
        validate_identifier(&order.column)?;
        terms.push(format!(
            "{} {} NULLS LAST",
            order.column,
            if order.ascending { "ASC" } else { "DESC" }
        ));
    }
    let rowid_ascending = query.order.first().map_or(true, |order| order.ascending);
    terms.push(format!("rowid {}", if rowid_ascending { "ASC" } else { "DESC" }));
    builder.push(format!(" ORDER BY {}", terms.join(", ")));
    Ok(())
}

fn row_to_json(row: &SqliteRow) -> BackendResult<Row> {
    let mut object = Map::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index).map_err(db_error)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let kind = raw.type_info().name().to_string();
            match kind.as_str() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(index).map_err(db_error)?),
                "REAL" => Value::from(row.try_get::<f64, _>(index).map_err(db_error)?),
                "BLOB" => Value::from(
                    String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(index).map_err(db_error)?)
                        .into_owned(),
                ),
                _ => Value::from(row.try_get::<String, _>(index).map_err(db_error)?),
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(object))
}

fn db_error(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::RowNotFound => BackendError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            BackendError::Conflict(db.message().to_string())
        }
        other => BackendError::Database(other.to_string()),
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// URL sqlx can open for a plain file path, a `sqlite:path` shorthand or a
/// full URL. Paths get forward slashes; memory and full URLs pass through.
pub fn database_url_from(raw: &str) -> String {
    let raw = raw.trim();
    if is_memory_url(raw) || raw.contains("://") {
        return raw.to_string();
    }
    let path = raw.strip_prefix("sqlite:").unwrap_or(raw);
    format!("sqlite://{}", path.replace('\\', "/"))
}

/// File behind a SQLite URL. `None` for memory databases and other schemes.
pub fn database_file(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) {
        return None;
    }
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split_once('?').map_or(rest, |(path, _)| path);
    (!path.is_empty()).then(|| PathBuf::from(path))
}

fn create_database_dir(database_url: &str) -> Result<()> {
    let file = database_file(database_url);
    let Some(dir) = file
        .as_deref()
        .and_then(Path::parent)
        .filter(|dir| !dir.as_os_str().is_empty())
    else {
        return Ok(());
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory '{}' for the chat database", dir.display()))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
