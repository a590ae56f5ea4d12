//! Outbound HTTP transport.

use async_trait::async_trait;
use std::time::Duration;

use crate::attempt::ErrorClass;

/// A signed POST ready to be sent.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Target URL.
    pub url: String,
    /// Request headers, in send order.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Vec<u8>,
    /// Request timeout.
    pub timeout: Duration,
}

impl OutboundRequest {
    /// Looks up a header value (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response received from a receiver.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body, truncated.
    pub body: Option<String>,
}

/// A request that never produced a response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class}: {message}")]
pub struct TransportError {
    /// Failure classification.
    pub class: ErrorClass,
    /// Detail.
    pub message: String,
}

impl TransportError {
    /// Creates a transport error.
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

/// Sends outbound webhook requests.
///
/// Implementations report any received response, whatever its status, as
/// `Ok`; status handling belongs to the delivery engine.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Sends a POST request.
    async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;
}

/// Maximum number of response body characters kept.
pub const MAX_RESPONSE_BODY_CHARS: usize = 1024;

/// `reqwest`-backed transport.
#[cfg(feature = "http-client")]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http-client")]
impl HttpTransport {
    /// Creates a transport. Redirects are not followed.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Http`](crate::WebhookError::Http) if the client cannot be built.
    pub fn new(user_agent: &str) -> crate::WebhookResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http-client")]
#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header("Content-Type", "application/json")
            .timeout(request.timeout);

        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }

        match builder.body(request.body).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp
                    .text()
                    .await
                    .ok()
                    .map(|b| b.chars().take(MAX_RESPONSE_BODY_CHARS).collect());
                Ok(TransportResponse { status, body })
            }
            Err(e) => {
                let class = if e.is_timeout() {
                    ErrorClass::Timeout
                } else if e.is_connect() {
                    ErrorClass::ConnectionRefused
                } else {
                    ErrorClass::Network
                };
                Err(TransportError::new(class, e.to_string()))
            }
        }
    }
}
