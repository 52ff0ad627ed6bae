//! Chat-completion client for the Messages endpoint.

use std::sync::Arc;

use conduit_types::util::preview;
use conduit_types::{ApiError, ChatRequest, ChatResponse, Credential, CredentialProvider};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::stream::DeltaStream;
use crate::wire::{WireRequest, WireResponse};

/// The `anthropic-version` header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for a chat-completion endpoint.
///
/// Holds no per-call state; clone freely. Failures are never retried.
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl ChatClient {
    /// Create a new client. `base_url` is the scheme and host, without
    /// `/v1/messages`.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One-shot call: wait for the whole reply.
    pub async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, ApiError> {
        let body = WireRequest::new(request, false)?;
        let response = self.post(&body).await?;

        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let wire: WireResponse = serde_json::from_str(&text)
            .map_err(|e| ApiError::Decode(format!("{e}: {}", preview(&text))))?;
        Ok(wire.into())
    }

    /// Streaming call: one fresh HTTP exchange, yielding deltas as they arrive.
    pub async fn send_streaming(&self, request: &ChatRequest) -> Result<DeltaStream, ApiError> {
        let body = WireRequest::new(request, true)?;
        let response = self.post(&body).await?;
        Ok(DeltaStream::new(response.bytes_stream()))
    }

    /// Like [`ChatClient::send_streaming`], ending the stream (and closing the
    /// connection) when `cancel` fires. Cancelled before the reply starts, the
    /// stream is empty.
    pub async fn send_streaming_with_cancel(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, ApiError> {
        let stop = cancel.clone();
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::debug!("Chat request cancelled before the reply started");
                Ok(DeltaStream::finished())
            }
            result = self.send_streaming(request) => Ok(result?.with_cancel(cancel)),
        }
    }

    async fn post(&self, body: &WireRequest<'_>) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}/v1/messages", self.base_url);
        let headers = self.headers().await?;
        let body = serde_json::to_string(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to serialize request: {e}")))?;

        tracing::debug!("POST {url}");
        let response = self
            .http
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Timeout
                } else {
                    ApiError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::debug!("POST {url} failed with {status}: {}", preview(&body));
        Err(ApiError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn headers(&self) -> Result<HeaderMap, ApiError> {
        let credential = self.credentials.current_credential().await?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        match credential {
            Credential::ApiKey(key) => {
                headers.insert("x-api-key", sensitive_header(&key)?);
            }
            Credential::Bearer(token) => {
                headers.insert(AUTHORIZATION, sensitive_header(&format!("Bearer {token}"))?);
            }
        }
        Ok(headers)
    }
}

fn sensitive_header(value: &str) -> Result<HeaderValue, ApiError> {
    let mut header = HeaderValue::from_str(value)
        .map_err(|_| ApiError::Credential("credential contains invalid header characters".into()))?;
    header.set_sensitive(true);
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::StaticCredential;

    #[tokio::test]
    async fn api_key_header() {
        let client = ChatClient::new(
            "https://api.example.com/",
            Arc::new(StaticCredential::api_key("sk-test")),
        )
        .unwrap();
        assert_eq!(client.base_url(), "https://api.example.com");
        let headers = client.headers().await.unwrap();
        assert_eq!(headers["x-api-key"], "sk-test");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
        assert!(headers.get(AUTHORIZATION).is_none());
        assert!(headers["x-api-key"].is_sensitive());
    }

    #[tokio::test]
    async fn bearer_header() {
        let client = ChatClient::new(
            "https://api.example.com",
            Arc::new(StaticCredential::bearer("tok")),
        )
        .unwrap();
        let headers = client.headers().await.unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer tok");
        assert!(headers.get("x-api-key").is_none());
    }

    #[tokio::test]
    async fn invalid_credential_characters() {
        let client = ChatClient::new(
            "https://api.example.com",
            Arc::new(StaticCredential::api_key("bad\nkey")),
        )
        .unwrap();
        assert!(matches!(
            client.headers().await,
            Err(ApiError::Credential(_))
        ));
    }
}
