/// Upload clients for the cloud telemetry feeds
use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::models::UploadOutcome;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const HTTP_TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid feed URL: {0}")]
    InvalidUrl(String),

    #[error("request failed with status {status}: {message}")]
    Request { status: u16, message: String },

    #[error("rate limited by telemetry service")]
    RateLimited,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("upload task failed: {0}")]
    Task(String),
}

/// Destination for one scalar value on the telemetry service
#[async_trait]
pub trait UploadClient: Send + Sync {
    /// Send a single value to the named channel.
    ///
    /// Implementations must report rate limiting as
    /// [`UploadOutcome::RateLimited`] and everything else that failed as
    /// [`UploadOutcome::Fatal`].
    async fn send(&self, channel_key: &str, value: f64) -> UploadOutcome;
}

/// Feed metadata returned by the service
#[derive(Debug, Clone, Deserialize)]
pub struct FeedInfo {
    pub key: String,
    #[serde(default)]
    pub name: String,
}

/// Map an HTTP status onto an upload outcome
pub fn classify_status(status: u16, message: &str) -> UploadOutcome {
    match status {
        200..=299 => UploadOutcome::Success,
        HTTP_TOO_MANY_REQUESTS => UploadOutcome::RateLimited,
        _ => UploadOutcome::Fatal(format!("HTTP {}: {}", status, message.trim())),
    }
}

/// Adafruit IO REST client
#[derive(Clone)]
pub struct AdafruitClient {
    agent: ureq::Agent,
    base_url: Url,
    username: String,
    key: String,
}

impl AdafruitClient {
    pub fn new(base_url: Url, username: &str, key: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(&format!("sensemon/{}", env!("CARGO_PKG_VERSION")))
            .build();

        Self {
            agent,
            base_url,
            username: username.to_string(),
            key: key.to_string(),
        }
    }

    /// `{base}/api/v2/{username}/feeds/{feed}[/data]`
    pub fn feed_url(&self, feed_key: &str, data: bool) -> Result<Url, UploadError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| UploadError::InvalidUrl(self.base_url.to_string()))?;
            segments
                .pop_if_empty()
                .extend(["api", "v2", self.username.as_str(), "feeds", feed_key]);
            if data {
                segments.push("data");
            }
        }
        Ok(url)
    }

    /// Look up a feed, failing if it does not exist or the key is rejected
    pub async fn verify_feed(&self, feed_key: &str) -> Result<FeedInfo, UploadError> {
        let url = self.feed_url(feed_key, false)?;
        let agent = self.agent.clone();
        let key = self.key.clone();

        let response = tokio::task::spawn_blocking(move || {
            agent
                .get(url.as_str())
                .set("X-AIO-Key", &key)
                .set("Accept", "application/json")
                .call()
        })
        .await
        .map_err(|e| UploadError::Task(e.to_string()))?;

        match response {
            Ok(resp) => {
                let body = resp
                    .into_string()
                    .map_err(|e| UploadError::Decode(e.to_string()))?;
                serde_json::from_str(&body).map_err(|e| UploadError::Decode(e.to_string()))
            }
            Err(ureq::Error::Status(HTTP_TOO_MANY_REQUESTS, _)) => Err(UploadError::RateLimited),
            Err(ureq::Error::Status(status, resp)) => Err(UploadError::Request {
                status,
                message: resp.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(e)) => Err(UploadError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl UploadClient for AdafruitClient {
    async fn send(&self, channel_key: &str, value: f64) -> UploadOutcome {
        let url = match self.feed_url(channel_key, true) {
            Ok(url) => url,
            Err(e) => return UploadOutcome::Fatal(e.to_string()),
        };
        let body = serde_json::json!({ "value": value }).to_string();
        let agent = self.agent.clone();
        let key = self.key.clone();

        debug!("POST {} {}", url, body);

        // ureq is blocking; keep it off the runtime threads
        let response = tokio::task::spawn_blocking(move || {
            agent
                .post(url.as_str())
                .set("X-AIO-Key", &key)
                .set("Content-Type", "application/json")
                .send_string(&body)
        })
        .await;

        match response {
            Ok(Ok(resp)) => classify_status(resp.status(), ""),
            Ok(Err(ureq::Error::Status(status, resp))) => {
                classify_status(status, &resp.into_string().unwrap_or_default())
            }
            Ok(Err(ureq::Error::Transport(e))) => {
                UploadOutcome::Fatal(UploadError::Transport(e.to_string()).to_string())
            }
            Err(e) => UploadOutcome::Fatal(UploadError::Task(e.to_string()).to_string()),
        }
    }
}

/// Logs values instead of sending them
#[derive(Debug, Default, Clone)]
pub struct DryRunClient;

#[async_trait]
impl UploadClient for DryRunClient {
    async fn send(&self, channel_key: &str, value: f64) -> UploadOutcome {
        info!("Dry run: {} <- {}", channel_key, value);
        UploadOutcome::Success
    }
}
