// REST-equivalent chat calls.
//
// The backend speaks a `{success, data}` JSON envelope; that is translated
// here into typed Results so no caller ever checks a success flag. Both
// calls carry the bearer credential from the stored session and fail with
// `ApiError::NoSession` before any network I/O when it is missing.

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ApiError;
use crate::models::{DeliveryState, Message};
use crate::session;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub recipient_id: String,
    pub property_id: String,
    pub content: String,
    /// Correlation id generated at send time; echoed back by the server so
    /// the optimistic entry can be matched without content heuristics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Ordered backlog for one conversation. An empty Vec means a genuinely
    /// empty conversation; failures are an Err, never an empty list.
    async fn fetch_messages(
        &self,
        remote_user_id: &str,
        property_id: &str,
    ) -> Result<Vec<Message>, ApiError>;

    /// Persist one outbound message; returns the authoritative entry.
    async fn send_message(&self, request: SendRequest) -> Result<Message, ApiError>;
}

// Wire shapes

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    // Explicit default path: the bare attribute would put a Default bound
    // on T, and the payload types do not implement it.
    #[serde(default = "Option::default")]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDto {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    sender_id: String,
    recipient_id: String,
    property_id: String,
    content: String,
    created_at: i64,
}

impl MessageDto {
    fn into_message(self) -> Message {
        Message {
            id: self.id,
            client_id: self.client_id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            property_id: self.property_id,
            content: self.content,
            created_at: self.created_at,
            delivery_state: DeliveryState::Confirmed,
        }
    }
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// The underlying HTTP client used to leave the timeout to library
    /// defaults; here it is explicit and configurable.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpChatApi {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn bearer(&self) -> Result<String, ApiError> {
        let session = session::load_session().map_err(|e| {
            warn!("Failed to read stored session: {}", e);
            ApiError::NoSession
        })?;
        session
            .and_then(|s| s.bearer_token())
            .ok_or(ApiError::NoSession)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_messages(
        &self,
        remote_user_id: &str,
        property_id: &str,
    ) -> Result<Vec<Message>, ApiError> {
        let token = self.bearer()?;
        let url = format!(
            "{}/messages/{}/{}",
            self.base_url, remote_user_id, property_id
        );
        debug!("Fetching message history from {}", url);

        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let envelope: Envelope<Vec<MessageDto>> = response.json().await?;
        if !envelope.success {
            return Err(ApiError::Rejected);
        }

        let mut messages: Vec<Message> = envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .map(MessageDto::into_message)
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn send_message(&self, request: SendRequest) -> Result<Message, ApiError> {
        let token = self.bearer()?;
        let url = format!("{}/messages", self.base_url);
        debug!(
            "Persisting message to {} for property {}",
            request.recipient_id, request.property_id
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;
        let envelope: Envelope<MessageDto> = response.json().await?;
        if !envelope.success {
            return Err(ApiError::Rejected);
        }

        envelope
            .data
            .map(MessageDto::into_message)
            .ok_or_else(|| ApiError::InvalidResponse("send succeeded without a message".to_string()))
    }
}
