use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

use crate::error::RATE_LIMIT_MESSAGE;
use crate::models::{ChatRequest, FieldErrors};

/// Text fragments of one assistant answer. Dropping it aborts the request.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChatError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String, details: FieldErrors },
    #[error("{0}")]
    Configuration(String),
    #[error("rate limited")]
    RateLimited,
    #[error("server error: {0}")]
    Server(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("no response for {0:?}")]
    Stalled(Duration),
}

impl ChatError {
    /// Text to show the person chatting.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidRequest { message, details } => {
                let fields: Vec<&str> = details.keys().map(String::as_str).collect();
                if fields.is_empty() {
                    format!("The request was rejected: {message}")
                } else {
                    format!("The request was rejected: {message} ({})", fields.join(", "))
                }
            }
            Self::Configuration(message) => message.clone(),
            Self::RateLimited => RATE_LIMIT_MESSAGE.to_string(),
            Self::Server(_) => "Something went wrong. Please try again.".to_string(),
            Self::Connection(_) => "Connection lost. Check that the server is reachable and try again.".to_string(),
            Self::Stalled(after) => format!(
                "The response stalled for {} seconds. Please try again.",
                after.as_secs()
            ),
        }
    }
}

/// Opens a chat turn against the gateway.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, request: &ChatRequest) -> Result<FragmentStream, ChatError>;
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    details: Option<FieldErrors>,
}

/// Posts to `{base}/api/chat` and reads the chunked plain-text answer.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, request: &ChatRequest) -> Result<FragmentStream, ChatError> {
        let url = format!("{}/api/chat", self.base_url);
        log::debug!("Sending chat turn with {} messages to {}", request.messages.len(), url);
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| ChatError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            log::warn!("Chat request failed with {}: {}", status, body.error);
            return Err(match (status, body.details) {
                (StatusCode::BAD_REQUEST, Some(details)) => ChatError::InvalidRequest {
                    message: body.error,
                    details,
                },
                (StatusCode::BAD_REQUEST, None) => ChatError::Configuration(body.error),
                (StatusCode::TOO_MANY_REQUESTS, _) => ChatError::RateLimited,
                _ => ChatError::Server(format!("{status}: {}", body.error)),
            });
        }

        let mut chunks = response.bytes_stream();
        let fragments = async_stream::stream! {
            let mut decoder = Utf8Decoder::default();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(bytes) => {
                        let text = decoder.push(&bytes);
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                    }
                    Err(e) => {
                        yield Err(ChatError::Connection(e.to_string()));
                        return;
                    }
                }
            }
            let rest = decoder.finish();
            if !rest.is_empty() {
                yield Ok(rest);
            }
        };
        Ok(Box::pin(fragments))
    }
}

/// Incremental UTF-8 decoding: a character split across chunks is held back
/// until its remaining bytes arrive. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete tail, wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flushes whatever is left; a truncated character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
