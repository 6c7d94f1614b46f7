use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, UserId},
    error::ApiError,
    protocol::{
        ConversationListQuery, ConversationSummary, CreateConversationRequest, ItemResponse,
        ListResponse, MessagePageQuery, MessagePayload, SendMessageRequest,
    },
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{config::ClientSettings, error::ClientError};

/// Request/response side of the messaging backend.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn set_access_token(&self, token: Option<String>);
    async fn list_conversations(
        &self,
        query: &ConversationListQuery,
    ) -> Result<Vec<ConversationSummary>, ClientError>;
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: &MessagePageQuery,
    ) -> Result<Vec<MessagePayload>, ClientError>;
    async fn create_conversation(
        &self,
        participant_id: &UserId,
    ) -> Result<ConversationSummary, ClientError>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1 << attempt.min(16))
            .min(self.max_delay)
    }
}

pub struct HttpMessagingApi {
    http: Client,
    base_url: String,
    access_token: RwLock<Option<String>>,
    retry: RetryPolicy,
}

impl HttpMessagingApi {
    pub fn new(settings: &ClientSettings) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(settings.request_timeout).build()?;
        Ok(Self {
            http,
            base_url: settings.api_base().to_string(),
            access_token: RwLock::new(None),
            retry: RetryPolicy {
                max_retries: settings.query_retries,
                ..RetryPolicy::default()
            },
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.access_token.read().await.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_once<T, Q>(&self, path: &str, query: &Q) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let request = self
            .http
            .get(format!("{}{path}", self.base_url))
            .query(query);
        let response = self.authorized(request).await.send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// GETs retry on network failures and 5xx, never on 4xx.
    async fn get_json<T, Q>(&self, path: &str, query: &Q) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let mut attempt = 0;
        loop {
            match self.get_once(path, query).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retry.max_retries && err.is_retryable() => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(path, attempt, ?delay, "rest: retrying query: {err}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn post_json<B>(&self, path: &str, body: &B) -> Result<Response, ClientError>
    where
        B: Serialize + ?Sized,
    {
        let request = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body);
        let response = self.authorized(request).await.send().await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        error: ApiError::from_response(status.as_u16(), &body),
    })
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    async fn list_conversations(
        &self,
        query: &ConversationListQuery,
    ) -> Result<Vec<ConversationSummary>, ClientError> {
        let response: ListResponse<ConversationSummary> =
            self.get_json("/messaging/conversations", query).await?;
        Ok(response.into_items())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: &MessagePageQuery,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let path = format!("/messaging/conversations/{conversation_id}/messages");
        let response: ListResponse<MessagePayload> = self.get_json(&path, page).await?;
        let messages = response.into_items();
        debug!(conversation_id = %conversation_id, count = messages.len(), "rest: fetched messages");
        Ok(messages)
    }

    async fn create_conversation(
        &self,
        participant_id: &UserId,
    ) -> Result<ConversationSummary, ClientError> {
        let response = self
            .post_json(
                "/messaging/conversations",
                &CreateConversationRequest {
                    participant_id: participant_id.clone(),
                },
            )
            .await?;
        let created: ItemResponse<ConversationSummary> = response.json().await?;
        Ok(created.into_item())
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<(), ClientError> {
        self.post_json("/messaging/messages", request).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
