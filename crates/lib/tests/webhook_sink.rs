//! Integration test: a local webhook endpoint answers from a script while the real
//! HTTP sink posts to it through the retry client. No Telegram or Discord access needed.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use relay::delivery::{DeliveryClient, DeliveryOutcome, RetryPolicy, WebhookSink};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy)]
enum Scripted {
    Status(u16),
    RateLimitHeader(&'static str),
    RateLimitBody(&'static str),
}

struct Seen {
    content_type: String,
    body: String,
}

#[derive(Clone, Default)]
struct Hook {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    /// Answer once the script is exhausted.
    fallback: Option<u16>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Hook {
    fn seen(&self) -> Vec<(String, String)> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.content_type.clone(), s.body.clone()))
            .collect()
    }
}

async fn webhook(State(hook): State<Hook>, headers: HeaderMap, body: Bytes) -> Response {
    hook.seen.lock().unwrap().push(Seen {
        content_type: headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        body: String::from_utf8_lossy(&body).into_owned(),
    });
    let next = hook
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Scripted::Status(hook.fallback.unwrap_or(204)));
    match next {
        Scripted::Status(code) => StatusCode::from_u16(code).unwrap().into_response(),
        Scripted::RateLimitHeader(wait) => (StatusCode::TOO_MANY_REQUESTS, [(RETRY_AFTER, wait)], "").into_response(),
        Scripted::RateLimitBody(json) => {
            (StatusCode::TOO_MANY_REQUESTS, [(CONTENT_TYPE, "application/json")], json).into_response()
        }
    }
}

async fn spawn_webhook(script: Vec<Scripted>, fallback: Option<u16>) -> (String, Hook) {
    let hook = Hook {
        script: Arc::new(Mutex::new(script.into())),
        fallback,
        ..Default::default()
    };
    let app = Router::new()
        .route("/api/webhooks/1/secret", post(webhook))
        .with_state(hook.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}/api/webhooks/1/secret", addr), hook)
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_base: Duration::from_millis(10),
        backoff_step: Duration::from_millis(10),
        default_retry_after: Duration::from_millis(10),
    }
}

fn client(url: String, policy: RetryPolicy) -> DeliveryClient {
    DeliveryClient::with_policy(Arc::new(WebhookSink::new(url)), policy)
}

#[tokio::test]
async fn text_post_waits_out_retry_after_header() {
    let (url, hook) = spawn_webhook(vec![Scripted::RateLimitHeader("0.05")], None).await;
    let delivery = client(url, fast_policy(5));

    let started = std::time::Instant::now();
    let outcome = delivery.post_text("Foo Channel\nhello\n<https://t.me/foo/7>").await;
    assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });
    assert!(started.elapsed() >= Duration::from_millis(50));

    let seen = hook.seen();
    assert_eq!(seen.len(), 2);
    for (content_type, body) in &seen {
        assert!(content_type.starts_with("application/json"), "{}", content_type);
        let json: serde_json::Value = serde_json::from_str(body).expect("json body");
        assert_eq!(json["content"], "Foo Channel\nhello\n<https://t.me/foo/7>");
    }
}

#[tokio::test]
async fn retry_after_from_json_body_is_honored() {
    let body = r#"{"message":"You are being rate limited.","retry_after":0.02,"global":false}"#;
    let (url, hook) = spawn_webhook(vec![Scripted::RateLimitBody(body)], None).await;
    let delivery = client(url, fast_policy(5));

    let outcome = delivery.post_text("x").await;
    assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });
    assert_eq!(hook.seen().len(), 2);
}

#[tokio::test]
async fn huge_retry_after_header_does_not_crash_delivery() {
    let (url, hook) = spawn_webhook(vec![Scripted::RateLimitHeader("1e30")], None).await;
    let delivery = client(url, fast_policy(5));

    let outcome = delivery.post_text("still alive").await;
    assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });
    assert_eq!(hook.seen().len(), 2);
}

#[tokio::test]
async fn attachment_is_multipart_with_content_and_file() {
    let (url, hook) = spawn_webhook(vec![], None).await;
    let delivery = client(url, fast_policy(5));

    let outcome = delivery
        .post_attachment(b"\xFF\xD8\xFFjpeg-bytes".to_vec(), "42.jpg", "Pics\ncaption")
        .await;
    assert!(outcome.is_delivered());

    let seen = hook.seen();
    assert_eq!(seen.len(), 1);
    let (content_type, body) = &seen[0];
    assert!(content_type.starts_with("multipart/form-data"), "{}", content_type);
    assert!(body.contains(r#"name="content""#));
    assert!(body.contains("Pics\ncaption") || body.contains("Pics\r\ncaption"));
    assert!(body.contains(r#"name="file"; filename="42.jpg""#));
    assert!(body.contains("jpeg-bytes"));
}

#[tokio::test]
async fn server_errors_exhaust_the_attempt_budget() {
    let (url, hook) = spawn_webhook(vec![], Some(500)).await;
    let delivery = client(url, fast_policy(3));

    let outcome = delivery.post_text("doomed").await;
    assert_eq!(outcome, DeliveryOutcome::FailedExhaustedRetries { attempts: 3 });
    assert_eq!(hook.seen().len(), 3);
}

#[tokio::test]
async fn unreachable_webhook_fails_without_panicking() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
        listener.local_addr().expect("local_addr").port()
    };
    let delivery = client(format!("http://127.0.0.1:{}/api/webhooks/1/secret", port), fast_policy(2));

    let outcome = delivery.post_text("nobody home").await;
    assert_eq!(outcome, DeliveryOutcome::FailedExhaustedRetries { attempts: 2 });
}
