use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use shared::protocol::{PushMessage, PushTicket};
use tracing::debug;

use crate::{
    error::{BackendError, BackendResult},
    rest::expect_success,
    PushGateway,
};

pub const EXPO_PUSH_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send";

/// Batch client for the Expo push service.
#[derive(Clone)]
pub struct ExpoPushGateway {
    http: Client,
    endpoint: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    data: Vec<PushTicket>,
    #[serde(default)]
    errors: Option<Value>,
}

impl ExpoPushGateway {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }
}

impl Default for ExpoPushGateway {
    fn default() -> Self {
        Self::new(EXPO_PUSH_ENDPOINT)
    }
}

#[async_trait]
impl PushGateway for ExpoPushGateway {
    async fn send_batch(&self, messages: &[PushMessage]) -> BackendResult<Vec<PushTicket>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let mut request = self
            .http
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(messages);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = expect_success(request.send().await?).await?;
        let body: PushResponse = response.json().await?;
        debug!(sent = messages.len(), tickets = body.data.len(), "push: batch submitted");
        match body.errors {
            Some(errors) if body.data.is_empty() => Err(BackendError::Status {
                status: 200,
                message: errors.to_string(),
            }),
            _ => Ok(body.data),
        }
    }
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
