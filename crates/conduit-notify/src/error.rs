use thiserror::Error;

use conduit_state::StateError;

/// Delivery failure of an alert channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Carries no URL: a Telegram endpoint embeds the bot token.
    #[error("request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("channel rejected message with status {code}: {body}")]
    Status { code: u16, body: String },
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type NotifyResult<T> = Result<T, NotifyError>;
