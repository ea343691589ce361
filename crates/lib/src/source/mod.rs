//! Source platform: the Telegram side of the relay.
//!
//! [`SourcePlatform`] is the seam the lifecycle manager and the dispatcher talk to.
//! [`BotApiSource`] implements it over the Telegram Bot API (long-poll `getUpdates`).

mod bot_api;
mod session;

pub use bot_api::BotApiSource;
pub use session::{CredentialPrompt, SessionFile, StdinPrompt};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::format::{MediaDescriptor, MediaRef};
use crate::targets::Target;

/// A chat as the platform describes it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatEntity {
    pub id: i64,
    pub title: Option<String>,
    /// Public username, without `@`.
    pub username: Option<String>,
}

/// One observed message in a subscribed chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub chat: ChatEntity,
    pub message_id: Option<i64>,
    /// Message text, or the caption when the message carries media.
    pub text: Option<String>,
    pub media: MediaDescriptor,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("telegram request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telegram api error: {0}")]
    Api(String),
    /// The Bot API answered `ok: false`.
    #[error("telegram api rejected {method}: {code} {description}")]
    Rejected {
        method: String,
        code: i64,
        description: String,
    },
    #[error("no bot token available")]
    MissingCredentials,
    #[error("credential prompt failed: {0}")]
    Prompt(String),
    #[error("session file error: {0}")]
    Session(#[from] std::io::Error),
    #[error("not connected")]
    NotConnected,
}

/// Operations the relay needs from the source platform.
#[async_trait]
pub trait SourcePlatform: Send + Sync {
    /// Connect and authenticate in one step. May prompt for credentials; only used when attended.
    async fn start(&self) -> Result<(), SourceError>;

    /// Establish the transport only. Never prompts.
    async fn connect(&self) -> Result<(), SourceError>;

    /// Transport state as the client sees it now.
    fn is_connected(&self) -> Result<bool, SourceError>;

    /// Whether the current credentials are accepted by the platform.
    async fn is_authorized(&self) -> Result<bool, SourceError>;

    async fn get_entity(&self, target: &Target) -> Result<ChatEntity, SourceError>;

    /// Start delivering new messages from `targets`, in arrival order. The receiver
    /// closes when the session disconnects.
    async fn subscribe(&self, targets: &[Target]) -> Result<mpsc::Receiver<InboundEvent>, SourceError>;

    async fn fetch_media(&self, media: &MediaRef) -> Result<Vec<u8>, SourceError>;

    /// Best-effort; safe to call more than once.
    async fn disconnect(&self);
}
