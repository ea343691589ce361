//! Event dispatcher: turns each inbound message into at most one webhook delivery.
//!
//! Events are handled strictly one at a time, in arrival order. A slow delivery (rate
//! limit, retries) holds back the following events; that keeps the destination's
//! message order identical to the source's.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::delivery::{DeliveryClient, DeliveryOutcome};
use crate::format::{
    attachment_extension, build_link, classify_media, format_caption, with_too_large_notice, LinkStyle,
    MediaDescriptor, MediaKind, FALLBACK_TITLE,
};
use crate::source::{InboundEvent, SourcePlatform};

/// Formatting and size settings for dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub prefix: String,
    pub link_style: LinkStyle,
    pub max_upload_bytes: u64,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            link_style: LinkStyle::Bare,
            max_upload_bytes: 8 * 1024 * 1024,
        }
    }
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Neither text nor image media.
    Ignored,
    Text(DeliveryOutcome),
    Image { size: u64, delivery: DeliveryOutcome },
    /// Image over the ceiling; caption sent as text with a notice.
    TooLarge { size: u64, delivery: DeliveryOutcome },
    /// Image bytes could not be fetched; nothing was sent.
    FetchFailed(String),
}

pub struct Dispatcher {
    source: Arc<dyn SourcePlatform>,
    delivery: DeliveryClient,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(source: Arc<dyn SourcePlatform>, delivery: DeliveryClient, options: DispatchOptions) -> Self {
        Self {
            source,
            delivery,
            options,
        }
    }

    /// Handle events until the subscription closes. Returns the number of events seen.
    pub async fn run(&self, mut events: mpsc::Receiver<InboundEvent>) -> u64 {
        let mut seen = 0;
        while let Some(event) = events.recv().await {
            seen += 1;
            self.handle_event(event).await;
        }
        log::info!("dispatch: subscription closed after {} event(s)", seen);
        seen
    }

    /// Classify, format and deliver one event. Never fails; problems are logged.
    pub async fn handle_event(&self, event: InboundEvent) -> EventOutcome {
        let chat = &event.chat;
        let title = chat
            .title
            .as_deref()
            .or(chat.username.as_deref())
            .filter(|t| !t.is_empty())
            .unwrap_or(FALLBACK_TITLE)
            .to_string();
        let link = build_link(chat.username.as_deref(), event.message_id, self.options.link_style);
        let link_log = link.as_deref().unwrap_or("-");
        let text = event.text.as_deref().map(str::trim).unwrap_or("");
        let caption = format_caption(&self.options.prefix, &title, text, link.as_deref());

        let kind = classify_media(&event.media);
        let (media, mime) = match &event.media {
            MediaDescriptor::Photo(m) => (Some(m), None),
            MediaDescriptor::Document { mime_type, media } => (Some(media), mime_type.as_deref()),
            MediaDescriptor::None => (None, None),
        };

        if let (MediaKind::Photo | MediaKind::ImageDocument, Some(media)) = (kind, media) {
            // The platform may refuse to serve files it already reports as too large.
            if let Some(declared) = media.declared_size.filter(|s| *s > self.options.max_upload_bytes) {
                return self.too_large(&title, &caption, declared, link_log).await;
            }
            let bytes = match self.source.fetch_media(media).await {
                Ok(b) => b,
                Err(e) => {
                    log::error!(
                        "dispatch: image fetch failed channel='{}' link='{}': {}",
                        title,
                        link_log,
                        e
                    );
                    return EventOutcome::FetchFailed(e.to_string());
                }
            };
            let size = bytes.len() as u64;
            if size <= self.options.max_upload_bytes {
                let filename = format!(
                    "{}{}",
                    event.message_id.map(|id| id.to_string()).unwrap_or_else(|| "image".to_string()),
                    attachment_extension(kind, mime)
                );
                log::info!(
                    "dispatch: image to webhook channel='{}' size={} link='{}'",
                    title,
                    size,
                    link_log
                );
                // The buffer moves into the request and is dropped once the call returns.
                let delivery = self.delivery.post_attachment(bytes, &filename, &caption).await;
                return EventOutcome::Image { size, delivery };
            }
            drop(bytes);
            return self.too_large(&title, &caption, size, link_log).await;
        }

        if !text.is_empty() {
            log::info!("dispatch: text to webhook channel='{}' link='{}'", title, link_log);
            return EventOutcome::Text(self.delivery.post_text(&caption).await);
        }

        log::debug!(
            "dispatch: ignored non-text/non-image message id={:?} channel='{}'",
            event.message_id,
            title
        );
        EventOutcome::Ignored
    }

    async fn too_large(&self, title: &str, caption: &str, size: u64, link_log: &str) -> EventOutcome {
        log::warn!(
            "dispatch: skip image (too large) channel='{}' size={} > {} link='{}'",
            title,
            size,
            self.options.max_upload_bytes,
            link_log
        );
        let delivery = self.delivery.post_text(&with_too_large_notice(caption)).await;
        EventOutcome::TooLarge { size, delivery }
    }
}
