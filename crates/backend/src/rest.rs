use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::domain::UserId;
use tracing::debug;
use url::Url;

use crate::{
    error::{BackendError, BackendResult},
    query::Query,
    AuthSession, Database, ObjectStorage, Row,
};

const RETURN_REPRESENTATION: &str = "return=representation";
const MERGE_DUPLICATES: &str = "resolution=merge-duplicates,return=representation";

/// Hosted backend reached over HTTP: PostgREST for rows, the storage API for
/// objects and the auth API for the session user.
#[derive(Clone)]
pub struct RestBackend {
    http: Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default, rename = "statusCode")]
    status_code: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: UserId,
}

impl RestBackend {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> BackendResult<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|err| BackendError::InvalidQuery(format!("invalid backend url {base_url}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BackendError::InvalidQuery(
                "backend url must start with http:// or https://".into(),
            ));
        }
        Ok(Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            access_token: None,
        })
    }

    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
        builder.header("apikey", &self.anon_key).bearer_auth(bearer)
    }

    fn table_url(&self, table: &str) -> BackendResult<String> {
        validate_identifier(table)?;
        Ok(format!("{}/rest/v1/{table}", self.base_url))
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{bucket}/{}",
            self.base_url,
            key.trim_start_matches('/')
        )
    }

    async fn rows(response: Response) -> BackendResult<Vec<Row>> {
        let response = expect_success(response).await?;
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&body)? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            single => Ok(vec![single]),
        }
    }
}

fn filter_params(query: &Query) -> BackendResult<Vec<(String, String)>> {
    if query.filters.is_empty() {
        return Err(BackendError::InvalidQuery(format!(
            "refusing to modify every row of {}",
            query.table
        )));
    }
    query
        .filters
        .iter()
        .map(|filter| filter.to_postgrest_param())
        .collect()
}

pub fn validate_identifier(identifier: &str) -> BackendResult<()> {
    let mut chars = identifier.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(BackendError::InvalidQuery(format!(
            "invalid identifier: {identifier:?}"
        )))
    }
}

pub(crate) async fn expect_success(response: Response) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &body))
}

pub(crate) fn classify_failure(status: StatusCode, body: &str) -> BackendError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed
        .code
        .or(parsed.status_code)
        .map(|code| match code {
            Value::String(code) => code,
            other => other.to_string(),
        })
        .unwrap_or_default();
    let message = parsed
        .message
        .or(parsed.error)
        .unwrap_or_else(|| body.trim().to_string());

    if status == StatusCode::CONFLICT || code == "23505" || code == "409" {
        BackendError::Conflict(message)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        BackendError::Unauthorized(message)
    } else if status == StatusCode::NOT_FOUND || code == "PGRST116" || code == "404" {
        BackendError::NotFound
    } else {
        BackendError::Status {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl Database for RestBackend {
    async fn select(&self, query: &Query) -> BackendResult<Vec<Row>> {
        let url = self.table_url(&query.table)?;
        let params = query.to_postgrest_params()?;
        debug!(table = %query.table, ?params, "rest: select");
        let response = self
            .authorized(self.http.get(url))
            .query(&params)
            .send()
            .await?;
        Self::rows(response).await
    }

    async fn insert(&self, table: &str, row: Row) -> BackendResult<Row> {
        let url = self.table_url(table)?;
        let response = self
            .authorized(self.http.post(url))
            .header("Prefer", RETURN_REPRESENTATION)
            .json(&row)
            .send()
            .await?;
        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or(BackendError::NotFound)
    }

    async fn update(&self, query: &Query, patch: Row) -> BackendResult<Vec<Row>> {
        let url = self.table_url(&query.table)?;
        let params = filter_params(query)?;
        let response = self
            .authorized(self.http.patch(url))
            .header("Prefer", RETURN_REPRESENTATION)
            .query(&params)
            .json(&patch)
            .send()
            .await?;
        Self::rows(response).await
    }

    async fn delete(&self, query: &Query) -> BackendResult<u64> {
        let url = self.table_url(&query.table)?;
        let params = filter_params(query)?;
        let response = self
            .authorized(self.http.delete(url))
            .header("Prefer", RETURN_REPRESENTATION)
            .query(&params)
            .send()
            .await?;
        Ok(Self::rows(response).await?.len() as u64)
    }

    async fn upsert(&self, table: &str, row: Row, on_conflict: &[&str]) -> BackendResult<Row> {
        let url = self.table_url(table)?;
        for column in on_conflict {
            validate_identifier(column)?;
        }
        let response = self
            .authorized(self.http.post(url))
            .header("Prefer", MERGE_DUPLICATES)
            .query(&[("on_conflict", on_conflict.join(","))])
            .json(&row)
            .send()
            .await?;
        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or(BackendError::NotFound)
    }
}

#[async_trait]
impl ObjectStorage for RestBackend {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> BackendResult<()> {
        let response = self
            .authorized(self.http.post(self.object_url(bucket, key)))
            .header("Content-Type", content_type)
            .header("x-upsert", if upsert { "true" } else { "false" })
            .header("Cache-Control", "max-age=3600")
            .body(bytes)
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{bucket}/{}",
            self.base_url,
            key.trim_start_matches('/')
        )
    }

    async fn remove(&self, bucket: &str, keys: &[String]) -> BackendResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let response = self
            .authorized(
                self.http
                    .delete(format!("{}/storage/v1/object/{bucket}", self.base_url)),
            )
            .json(&json!({ "prefixes": keys }))
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl AuthSession for RestBackend {
    async fn current_user(&self) -> BackendResult<Option<UserId>> {
        let Some(token) = self.access_token.as_deref() else {
            return Ok(None);
        };
        let response = self
            .http
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await?;
        match expect_success(response).await {
            Ok(response) => {
                let user: AuthUser = response.json().await?;
                Ok(Some(user.id))
            }
            Err(BackendError::Unauthorized(_)) | Err(BackendError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
