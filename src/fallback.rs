use crate::error::ErrorClass;
use crate::types::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// External auth collaborator. Supplies the opaque bearer credential both
/// transports authenticate with, and the acting user's id (which drives
/// conversation-key resolution).
pub trait AuthProvider: Send + Sync {
    fn bearer_token(&self) -> String;
    fn current_user_id(&self) -> String;
}

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server error: status {0}")]
    Server(u16),
    #[error("request rejected: status {0}")]
    Rejected(u16),
    #[error("invalid response body: {0}")]
    Body(String),
    #[error("request cancelled")]
    Cancelled,
}

impl FallbackError {
    /// One-shot boundary classification (never re-classified downstream).
    pub fn class(&self) -> ErrorClass {
        match self {
            FallbackError::Timeout | FallbackError::Transport(_) | FallbackError::Server(_) => {
                ErrorClass::Retriable
            }
            FallbackError::Rejected(_) | FallbackError::Body(_) => ErrorClass::Terminal,
            FallbackError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// REST fallback collaborator, used whenever the stream is not connected and
/// for the post-reconnect recovery fetch.
#[async_trait]
pub trait FallbackApi: Send + Sync {
    /// `POST /messages` — creates a message, returns the confirmed record.
    async fn post_message(&self, receiver_id: &str, content: &str)
    -> Result<Message, FallbackError>;

    /// `GET /messages/{otherUserId}?since=..` — ordered page of confirmed
    /// messages newer than `since`.
    async fn fetch_since(
        &self,
        other_user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, FallbackError>;

    /// `PUT /conversations/{otherUserId}/read` — acknowledges everything up
    /// to now as read server-side.
    async fn mark_read_upto(&self, other_user_id: &str) -> Result<(), FallbackError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageBody<'a> {
    receiver_id: &'a str,
    content: &'a str,
}

/// `FallbackApi` over a blocking HTTP client. Since `ureq` is blocking, every
/// request runs inside `tokio::task::spawn_blocking`.
pub struct HttpFallback {
    base_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpFallback {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            base_url: base_url.into(),
            auth,
        }
    }

    async fn execute(
        &self,
        method: &'static str,
        url: String,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, FallbackError> {
        let token = self.auth.bearer_token();
        debug!(target: "Engine/Fallback", "{method} {url}");

        let handle = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, FallbackError> {
            let auth_header = format!("Bearer {token}");
            let result = match method {
                "GET" => ureq::get(&url).header("authorization", &auth_header).call(),
                "POST" => ureq::post(&url)
                    .header("authorization", &auth_header)
                    .header("content-type", "application/json")
                    .send(&body.unwrap_or_default()[..]),
                "PUT" => ureq::put(&url)
                    .header("authorization", &auth_header)
                    .send(&[][..]),
                other => return Err(FallbackError::Transport(format!("unsupported method {other}"))),
            };

            let response = result.map_err(classify_ureq)?;
            response
                .into_body()
                .read_to_vec()
                .map_err(|e| FallbackError::Body(e.to_string()))
        });

        match handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_cancelled() => Err(FallbackError::Cancelled),
            Err(join_err) => Err(FallbackError::Transport(join_err.to_string())),
        }
    }
}

fn classify_ureq(e: ureq::Error) -> FallbackError {
    match e {
        ureq::Error::StatusCode(code) if (400..500).contains(&code) => {
            FallbackError::Rejected(code)
        }
        ureq::Error::StatusCode(code) => FallbackError::Server(code),
        ureq::Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => FallbackError::Timeout,
        other => FallbackError::Transport(other.to_string()),
    }
}

#[async_trait]
impl FallbackApi for HttpFallback {
    async fn post_message(
        &self,
        receiver_id: &str,
        content: &str,
    ) -> Result<Message, FallbackError> {
        let url = format!("{}/messages", self.base_url);
        let body = serde_json::to_vec(&PostMessageBody {
            receiver_id,
            content,
        })
        .map_err(|e| FallbackError::Body(e.to_string()))?;
        let raw = self.execute("POST", url, Some(body)).await?;
        serde_json::from_slice(&raw).map_err(|e| FallbackError::Body(e.to_string()))
    }

    async fn fetch_since(
        &self,
        other_user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, FallbackError> {
        let mut url = format!(
            "{}/messages/{}",
            self.base_url,
            urlencoding::encode(other_user_id)
        );
        if let Some(ts) = since {
            url.push_str("?since=");
            url.push_str(&urlencoding::encode(&ts.to_rfc3339()));
        }
        let raw = self.execute("GET", url, None).await?;
        serde_json::from_slice(&raw).map_err(|e| FallbackError::Body(e.to_string()))
    }

    async fn mark_read_upto(&self, other_user_id: &str) -> Result<(), FallbackError> {
        let url = format!(
            "{}/conversations/{}/read",
            self.base_url,
            urlencoding::encode(other_user_id)
        );
        self.execute("PUT", url, None).await?;
        Ok(())
    }
}
