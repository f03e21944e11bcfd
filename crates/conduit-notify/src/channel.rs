//! Alert delivery.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};

use conduit_core::{BoxFuture, ChannelConfig};

use crate::error::ChannelError;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Upper bound on one delivery attempt, connect to last body byte.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Somewhere alerts and reports can be sent.
pub trait AlertChannel: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn send<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), ChannelError>>;
}

/// Writes messages to the log. Used when no channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn send<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), ChannelError>> {
        Box::pin(async move {
            info!(target: "conduit::notify", "{message}");
            Ok(())
        })
    }
}

/// Telegram bot `sendMessage`.
#[derive(Debug, Clone)]
pub struct TelegramChannel {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramChannel {
    pub fn new(bot_token: &str, chat_id: impl Into<String>) -> Result<Self, ChannelError> {
        Self::with_api_base(TELEGRAM_API, bot_token, chat_id)
    }

    /// Point at a different Bot API server.
    pub fn with_api_base(
        base: &str,
        bot_token: &str,
        chat_id: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            client: http_client(DEFAULT_SEND_TIMEOUT)?,
            endpoint: format!("{}/bot{}/sendMessage", base.trim_end_matches('/'), bot_token),
            chat_id: chat_id.into(),
        })
    }
}

impl AlertChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn send<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), ChannelError>> {
        Box::pin(async move {
            let body = json!({ "chat_id": self.chat_id, "text": message });
            post_json(&self.client, &self.endpoint, &body).await
        })
    }
}

/// Generic JSON webhook: POSTs `{"text": message}`.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Result<Self, ChannelError> {
        Self::with_timeout(url, DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), ChannelError>> {
        Box::pin(async move {
            let body = json!({ "text": message });
            post_json(&self.client, &self.url, &body).await
        })
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, ChannelError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ChannelError::Http(e.without_url()))
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
) -> Result<(), ChannelError> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| ChannelError::Http(e.without_url()))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ChannelError::Status {
            code: status.as_u16(),
            body,
        });
    }
    debug!(status = status.as_u16(), "message delivered");
    Ok(())
}

/// Build the channel described by `config`.
pub fn channel_from_config(config: &ChannelConfig) -> Result<Arc<dyn AlertChannel>, ChannelError> {
    Ok(match config {
        ChannelConfig::Log => Arc::new(LogChannel),
        ChannelConfig::Telegram { bot_token, chat_id } => {
            Arc::new(TelegramChannel::new(bot_token, chat_id.clone())?)
        }
        ChannelConfig::Webhook { url } => Arc::new(WebhookChannel::new(url.clone())?),
    })
}
