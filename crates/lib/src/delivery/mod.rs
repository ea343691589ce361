//! Delivery to the destination webhook.
//!
//! [`DeliveryClient`] owns the retry policy: 429 answers are waited out using the
//! sink's `Retry-After`, other failures back off linearly, and after the last attempt
//! the failure is logged and reported as an outcome. Nothing here returns an error to
//! the caller, so one bad message never stops the relay.

mod webhook;

pub use webhook::WebhookSink;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::format::prepare_content;

/// One request body for the webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Text {
        content: String,
    },
    Attachment {
        content: String,
        bytes: Vec<u8>,
        filename: String,
    },
}

impl OutboundPayload {
    pub fn content(&self) -> &str {
        match self {
            OutboundPayload::Text { content } | OutboundPayload::Attachment { content, .. } => content,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            OutboundPayload::Text { .. } => "text",
            OutboundPayload::Attachment { .. } => "file",
        }
    }
}

/// What the sink answered.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    /// Seconds to wait, as announced on a 429 (header or body).
    pub retry_after: Option<f64>,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }
}

/// Transport-level failure (the request never produced a response).
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook request failed: {0}")]
    Other(String),
}

/// Sends one request to the sink. Retry logic lives in [`DeliveryClient`].
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, payload: &OutboundPayload) -> Result<WebhookResponse, DeliveryError>;
}

/// Result of one `post_*` call. Never persisted; logged by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    FailedExhaustedRetries { attempts: u32 },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Longest single 429 wait honoured.
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Requests per call, 429 answers included.
    pub max_attempts: u32,
    /// Sleep after the first failed attempt.
    pub backoff_base: Duration,
    /// Added per further attempt (linear backoff).
    pub backoff_step: Duration,
    /// Wait on a 429 that carries no usable Retry-After.
    pub default_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_step: Duration::from_secs(1),
            default_retry_after: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Sleep after failed attempt `attempt_index` (0-based): base + index * step.
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        self.backoff_base + self.backoff_step * attempt_index
    }

    /// Wait for a 429. The sink controls the value: out-of-range values fall back to
    /// the default and long ones are capped at [`MAX_RATE_LIMIT_WAIT`].
    fn rate_limit_wait(&self, retry_after: Option<f64>) -> Duration {
        retry_after
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .unwrap_or(self.default_retry_after)
            .min(MAX_RATE_LIMIT_WAIT)
    }
}

/// Posts captions and attachments to the webhook with rate-limit aware retries.
#[derive(Clone)]
pub struct DeliveryClient {
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
}

impl DeliveryClient {
    pub fn new(transport: Arc<dyn WebhookTransport>) -> Self {
        Self::with_policy(transport, RetryPolicy::default())
    }

    pub fn with_policy(transport: Arc<dyn WebhookTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Post a text message. Content is truncated to the sink limit and never empty.
    pub async fn post_text(&self, caption: &str) -> DeliveryOutcome {
        let payload = OutboundPayload::Text {
            content: prepare_content(caption),
        };
        self.deliver(payload).await
    }

    /// Post a file with a caption.
    pub async fn post_attachment(&self, bytes: Vec<u8>, filename: &str, caption: &str) -> DeliveryOutcome {
        let payload = OutboundPayload::Attachment {
            content: prepare_content(caption),
            bytes,
            filename: filename.to_string(),
        };
        self.deliver(payload).await
    }

    async fn deliver(&self, payload: OutboundPayload) -> DeliveryOutcome {
        let kind = payload.kind();
        let mut attempts = 0;
        for attempt in 0..self.policy.max_attempts {
            attempts = attempt + 1;
            match self.transport.send(&payload).await {
                Ok(res) if res.is_success() => {
                    log::debug!("delivery: {} posted status={} attempts={}", kind, res.status, attempts);
                    return DeliveryOutcome::Delivered { attempts };
                }
                Ok(res) if res.is_rate_limited() => {
                    if attempts < self.policy.max_attempts {
                        let wait = self.policy.rate_limit_wait(res.retry_after);
                        log::warn!(
                            "delivery: {} rate limited (429), retrying after {:.2}s",
                            kind,
                            wait.as_secs_f64()
                        );
                        tokio::time::sleep(wait).await;
                    } else {
                        log::warn!("delivery: {} rate limited (429) on the last attempt", kind);
                    }
                    continue;
                }
                Ok(res) => {
                    log::error!("delivery: {} post failed status={}: {}", kind, res.status, res.body);
                }
                Err(e) => {
                    log::warn!("delivery: {} post exception: {}", kind, e);
                }
            }
            if attempts < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }
        log::error!("delivery: giving up on {} after {} attempts", kind, attempts);
        DeliveryOutcome::FailedExhaustedRetries { attempts }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Reply, ScriptedSink};
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt() {
        let sink = ScriptedSink::new(vec![Reply::Status(204)]);
        let client = DeliveryClient::new(sink.clone());
        assert_eq!(client.post_text("hi").await, DeliveryOutcome::Delivered { attempts: 1 });
        assert_eq!(
            sink.requests(),
            vec![OutboundPayload::Text {
                content: "hi".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_retry_after_then_succeeds() {
        let sink = ScriptedSink::new(vec![Reply::RateLimited(Some(2.5)), Reply::Status(200)]);
        let client = DeliveryClient::new(sink.clone());
        let start = Instant::now();
        let outcome = client.post_text("hello").await;
        let elapsed = start.elapsed();
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });
        assert_eq!(sink.requests().len(), 2);
        assert!(elapsed >= Duration::from_millis(2500), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2600), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_retry_after_waits_one_second() {
        let sink = ScriptedSink::new(vec![Reply::RateLimited(None), Reply::Status(204)]);
        let client = DeliveryClient::new(sink.clone());
        let start = Instant::now();
        client.post_text("x").await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_retry_after_falls_back_to_default() {
        let sink = ScriptedSink::new(vec![Reply::RateLimited(Some(-3.0)), Reply::Status(204)]);
        let client = DeliveryClient::new(sink.clone());
        let start = Instant::now();
        client.post_text("x").await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn overflowing_retry_after_uses_default_wait() {
        let sink = ScriptedSink::new(vec![Reply::RateLimited(Some(1e30)), Reply::Status(204)]);
        let client = DeliveryClient::new(sink.clone());
        let start = Instant::now();
        let outcome = client.post_text("x").await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1100), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn long_retry_after_is_capped() {
        let sink = ScriptedSink::new(vec![Reply::RateLimited(Some(1e9)), Reply::Status(204)]);
        let client = DeliveryClient::new(sink.clone());
        let start = Instant::now();
        assert!(client.post_text("x").await.is_delivered());
        let elapsed = start.elapsed();
        assert!(elapsed >= MAX_RATE_LIMIT_WAIT && elapsed < MAX_RATE_LIMIT_WAIT + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_on_last_attempt_gives_up_without_waiting() {
        let sink = ScriptedSink::new((0..5).map(|_| Reply::RateLimited(Some(30.0))).collect());
        let client = DeliveryClient::new(sink.clone());
        let start = Instant::now();
        let outcome = client.post_text("x").await;
        assert_eq!(outcome, DeliveryOutcome::FailedExhaustedRetries { attempts: 5 });
        // Four waits between the five requests, none after the last.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(120) && elapsed < Duration::from_secs(121), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_exhaust_five_attempts_with_linear_backoff() {
        let sink = ScriptedSink::new((0..5).map(|_| Reply::Status(500)).collect());
        let client = DeliveryClient::new(sink.clone());
        let start = Instant::now();
        let outcome = client.post_text("x").await;
        assert_eq!(outcome, DeliveryOutcome::FailedExhaustedRetries { attempts: 5 });
        assert_eq!(sink.requests().len(), 5);
        // 1 + 2 + 3 + 4 seconds between the five attempts; none after the last.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_are_retried() {
        let sink = ScriptedSink::new(vec![Reply::TransportError, Reply::Status(204)]);
        let client = DeliveryClient::new(sink.clone());
        assert_eq!(client.post_text("x").await, DeliveryOutcome::Delivered { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn identical_payloads_are_not_deduplicated() {
        let sink = ScriptedSink::new(vec![]);
        let client = DeliveryClient::new(sink.clone());
        client.post_text("same").await;
        client.post_text("same").await;
        let reqs = sink.requests();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0], reqs[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn attachment_content_is_prepared() {
        let sink = ScriptedSink::new(vec![]);
        let client = DeliveryClient::new(sink.clone());
        let long = "a".repeat(2100);
        client.post_attachment(vec![1, 2, 3], "1.png", &long).await;
        client.post_attachment(vec![], "2.png", "").await;
        let reqs = sink.requests();
        match &reqs[0] {
            OutboundPayload::Attachment { content, bytes, filename } => {
                assert_eq!(content.chars().count(), 2000);
                assert_eq!(bytes, &vec![1, 2, 3]);
                assert_eq!(filename, "1.png");
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(reqs[1].content(), ".");
    }

    #[test]
    fn backoff_is_linear() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
    }
}
