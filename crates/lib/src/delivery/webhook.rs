//! Discord-style webhook over HTTP: JSON `{content}` for text, multipart `content` + `file` for uploads.

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use std::time::Duration;

use super::{DeliveryError, OutboundPayload, WebhookResponse, WebhookTransport};

const TEXT_TIMEOUT: Duration = Duration::from_secs(10);
const FILE_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for one webhook URL.
#[derive(Clone)]
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl WebhookTransport for WebhookSink {
    async fn send(&self, payload: &OutboundPayload) -> Result<WebhookResponse, DeliveryError> {
        let request = match payload {
            OutboundPayload::Text { content } => self
                .client
                .post(&self.url)
                .timeout(TEXT_TIMEOUT)
                .json(&serde_json::json!({ "content": content })),
            OutboundPayload::Attachment {
                content,
                bytes,
                filename,
            } => {
                let part = reqwest::multipart::Part::bytes(bytes.clone()).file_name(filename.clone());
                let form = reqwest::multipart::Form::new()
                    .text("content", content.clone())
                    .part("file", part);
                self.client.post(&self.url).timeout(FILE_TIMEOUT).multipart(form)
            }
        };
        // The webhook URL embeds its token; keep it out of error messages.
        let res = request.send().await.map_err(|e| e.without_url())?;
        let status = res.status().as_u16();
        let header_wait = res
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = res.text().await.unwrap_or_default();
        let retry_after = if status == 429 {
            header_wait.or_else(|| retry_after_from_body(&body))
        } else {
            None
        };
        Ok(WebhookResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Seconds from a `Retry-After` value; fractional values are allowed ("2.5").
fn parse_retry_after(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|s| s.is_finite())
}

/// Discord also reports the wait as `{"retry_after": 1.234, ...}`.
fn retry_after_from_body(body: &str) -> Option<f64> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v.get("retry_after").and_then(|r| r.as_f64())
}
