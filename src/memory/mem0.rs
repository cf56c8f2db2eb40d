//! Mem0-style REST backend for long-term memory.
//!
//! One client serves both slots; the scope decides whether requests carry a
//! `user_id` or an `agent_id`.

use super::backend::{BackendFactory, BackendId, MemoryBackend, MemoryRecord};
use super::ConversationTurn;
use crate::config::Mem0Config;
use crate::{Result, TurnkeeperError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const OUTPUT_FORMAT: &str = "v1.1";

/// Whose memories a backend reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryScope {
    User(String),
    Agent(String),
}

impl MemoryScope {
    fn backend_id(&self) -> BackendId {
        match self {
            Self::User(_) => BackendId::User,
            Self::Agent(_) => BackendId::Assistant,
        }
    }

    fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(id) => Some(id),
            Self::Agent(_) => None,
        }
    }

    fn agent_id(&self) -> Option<&str> {
        match self {
            Self::User(_) => None,
            Self::Agent(id) => Some(id),
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    org_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
    output_format: &'static str,
}

#[derive(Debug, Serialize)]
struct AddMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    messages: Vec<AddMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    org_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
    output_format: &'static str,
}

/// The service answers either `{"results": [...]}` or a bare list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Wrapped {
        #[serde(default)]
        results: Vec<MemoryRecord>,
    },
    Bare(Vec<MemoryRecord>),
}

impl SearchResponse {
    fn into_records(self) -> Vec<MemoryRecord> {
        let mut records = match self {
            Self::Wrapped { results } => results,
            Self::Bare(results) => results,
        };
        records.sort_by(|a, b| b.score.total_cmp(&a.score));
        records
    }
}

/// Long-term memory backed by a Mem0-compatible HTTP API
pub struct Mem0Backend {
    client: Client,
    config: Mem0Config,
    scope: MemoryScope,
    name: String,
}

impl Mem0Backend {
    pub fn new(client: Client, config: Mem0Config, scope: MemoryScope) -> Self {
        let name = match &scope {
            MemoryScope::User(id) => format!("mem0:user:{id}"),
            MemoryScope::Agent(id) => format!("mem0:agent:{id}"),
        };
        Self {
            client,
            config,
            scope,
            name,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn search_request<'a>(&'a self, query: &'a str) -> SearchRequest<'a> {
        SearchRequest {
            query,
            user_id: self.scope.user_id(),
            agent_id: self.scope.agent_id(),
            org_id: self.config.org_id.as_deref(),
            project_id: self.config.project_id.as_deref(),
            output_format: OUTPUT_FORMAT,
        }
    }

    fn add_request<'a>(&'a self, turn: &'a ConversationTurn) -> AddRequest<'a> {
        AddRequest {
            messages: vec![AddMessage {
                role: turn.role.as_str(),
                content: &turn.content,
            }],
            user_id: self.scope.user_id(),
            agent_id: self.scope.agent_id(),
            org_id: self.config.org_id.as_deref(),
            project_id: self.config.project_id.as_deref(),
            output_format: OUTPUT_FORMAT,
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> TurnkeeperError {
        TurnkeeperError::BackendUnavailable {
            backend: self.scope.backend_id(),
            reason: reason.into(),
        }
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> TurnkeeperError {
        if e.is_timeout() {
            self.unavailable(format!("timeout: {e}"))
        } else if e.is_connect() {
            self.unavailable(format!("network: {e}"))
        } else {
            self.unavailable(e.to_string())
        }
    }

    async fn check_response_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = extract_error_detail(&body);
        if detail.is_empty() {
            return Err(self.unavailable(format!("API error {status}")));
        }
        Err(self.unavailable(format!("API error {status}: {detail}")))
    }
}

#[async_trait]
impl MemoryBackend for Mem0Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str) -> Result<Vec<MemoryRecord>> {
        debug!(backend = %self.name, "Searching long-term memory");
        let response = self
            .client
            .post(self.endpoint("v1/memories/search/"))
            .header("Authorization", format!("Token {}", self.config.api_key))
            .json(&self.search_request(query))
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;
        let response = self.check_response_status(response).await?;
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| self.unavailable(format!("malformed search response: {e}")))?;
        let records = body.into_records();
        debug!(backend = %self.name, found = records.len(), "Long-term memory search done");
        Ok(records)
    }

    async fn store(&self, turn: &ConversationTurn) -> Result<()> {
        debug!(backend = %self.name, role = %turn.role, "Storing turn in long-term memory");
        let response = self
            .client
            .post(self.endpoint("v1/memories/"))
            .header("Authorization", format!("Token {}", self.config.api_key))
            .json(&self.add_request(turn))
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;
        self.check_response_status(response).await?;
        Ok(())
    }
}

/// Pull a human-readable message out of an error body
fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        for key in ["error", "detail", "message"] {
            if let Some(msg) = value.get(key).and_then(|m| m.as_str()) {
                return msg.to_string();
            }
        }
    }

    let mut detail: String = trimmed.chars().take(300).collect();
    if trimmed.chars().count() > 300 {
        detail.push_str("... [truncated]");
    }
    detail
}

/// Hands out Mem0 backends sharing one HTTP client
pub struct Mem0Factory {
    client: Client,
    config: Mem0Config,
    assistant_id: String,
}

impl Mem0Factory {
    pub fn new(config: Mem0Config, assistant_id: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("turnkeeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            config,
            assistant_id: assistant_id.into(),
        }
    }
}

impl BackendFactory for Mem0Factory {
    fn user_backend(&self, user_id: &str) -> Arc<dyn MemoryBackend> {
        Arc::new(Mem0Backend::new(
            self.client.clone(),
            self.config.clone(),
            MemoryScope::User(user_id.to_string()),
        ))
    }

    fn assistant_backend(&self) -> Arc<dyn MemoryBackend> {
        Arc::new(Mem0Backend::new(
            self.client.clone(),
            self.config.clone(),
            MemoryScope::Agent(self.assistant_id.clone()),
        ))
    }
}
