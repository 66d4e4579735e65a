//! Typed HTTP client for the hosted chat backend: thread endpoints plus the
//! streaming chat proxy.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::StatusCode;
use tracing::error;

use crate::errors::AppError;
use crate::models::{
    ChatPayload, CreatedThread, MessageRow, NewMessageBody, UpdateMessageBody,
};

/// Raw byte stream of a chat response, errors already mapped into [`AppError`].
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>>;

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// `POST /api/threads` — create a thread, returning its server-issued id.
    pub async fn create_thread(&self) -> Result<String, AppError> {
        let resp = self
            .authed(self.http.post(format!("{}/api/threads", self.base_url)))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::classify(resp).await);
        }
        let created: CreatedThread = resp.json().await?;
        Ok(created.id())
    }

    /// `GET /api/messages/:thread_id` — ordered message rows. A 404 signals a
    /// missing or deleted thread.
    pub async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<MessageRow>, AppError> {
        let resp = self
            .authed(
                self.http
                    .get(format!("{}/api/messages/{thread_id}", self.base_url)),
            )
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(AppError::ThreadNotFound { id: thread_id.to_string() });
        }
        if !resp.status().is_success() {
            return Err(Self::classify(resp).await);
        }
        Ok(resp.json().await?)
    }

    /// `POST /api/messages/:thread_id` — append a message, returning the
    /// durable id the backend assigned.
    pub async fn post_message(
        &self,
        thread_id: &str,
        body: &NewMessageBody,
    ) -> Result<String, AppError> {
        let resp = self
            .authed(
                self.http
                    .post(format!("{}/api/messages/{thread_id}", self.base_url)),
            )
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::classify(resp).await);
        }
        let created: CreatedThread = resp.json().await?;
        Ok(created.id())
    }

    /// `PUT /api/messages/:thread_id` — update an existing message by its
    /// durable id.
    pub async fn put_message(
        &self,
        thread_id: &str,
        body: &UpdateMessageBody,
    ) -> Result<(), AppError> {
        let resp = self
            .authed(
                self.http
                    .put(format!("{}/api/messages/{thread_id}", self.base_url)),
            )
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::classify(resp).await);
        }
        Ok(())
    }

    /// `POST /api/chat` with `stream: true` — open the SSE response stream.
    pub async fn open_chat_stream(&self, payload: &ChatPayload) -> Result<ByteStream, AppError> {
        let resp = self
            .authed(self.http.post(format!("{}/api/chat", self.base_url)))
            .json(payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::classify(resp).await);
        }

        let stream = resp.bytes_stream().map_err(|e| {
            error!("Chat stream transport error: {e}");
            AppError::StreamTransport { message: e.to_string() }
        });
        Ok(Box::pin(stream))
    }

    /// Maps a non-2xx response to the error taxonomy. Quota refusals (status
    /// or error text) become [`AppError::PlanLimitExceeded`] so the caller can
    /// route them to the upgrade path.
    async fn classify(resp: reqwest::Response) -> AppError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let lower = body.to_lowercase();

        if status == StatusCode::PAYMENT_REQUIRED
            || status == StatusCode::TOO_MANY_REQUESTS
            || lower.contains("daily limit")
            || lower.contains("limit exceeded")
        {
            let message = if body.is_empty() {
                "daily message limit exceeded".to_string()
            } else {
                body
            };
            return AppError::PlanLimitExceeded { message };
        }

        error!("Backend returned {status}: {body}");
        AppError::StreamTransport {
            message: format!("server returned {status}"),
        }
    }
}
