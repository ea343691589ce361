//! Telegram Bot API source: long-poll getUpdates, getChat and file downloads.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ChatEntity, CredentialPrompt, InboundEvent, SessionFile, SourceError, SourcePlatform};
use crate::config::{ProxyScheme, SourceConfig};
use crate::format::{MediaDescriptor, MediaRef};
use crate::targets::Target;

const LONG_POLL_TIMEOUT: u64 = 30;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(2);
const EVENT_BUFFER: usize = 64;
const PROMPT_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    channel_post: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    document: Option<FileMeta>,
    #[serde(default)]
    video: Option<FileMeta>,
    #[serde(default)]
    animation: Option<FileMeta>,
    #[serde(default)]
    audio: Option<FileMeta>,
    #[serde(default)]
    voice: Option<FileMeta>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

#[derive(Debug, Deserialize)]
struct FileMeta {
    file_id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct File {
    #[serde(default)]
    file_path: Option<String>,
}

impl From<Chat> for ChatEntity {
    fn from(c: Chat) -> Self {
        ChatEntity {
            id: c.id,
            title: c.title.filter(|t| !t.is_empty()),
            username: c.username.filter(|u| !u.is_empty()),
        }
    }
}

/// Largest photo size wins; Telegram lists sizes smallest first.
fn media_from_message(msg: &Message) -> MediaDescriptor {
    if let Some(sizes) = msg.photo.as_ref() {
        let best = sizes
            .iter()
            .max_by_key(|p| (p.file_size.unwrap_or(0), u64::from(p.width) * u64::from(p.height)));
        if let Some(p) = best {
            return MediaDescriptor::Photo(MediaRef {
                file_id: p.file_id.clone(),
                declared_size: p.file_size,
            });
        }
    }
    let file = [&msg.document, &msg.video, &msg.animation, &msg.audio, &msg.voice]
        .into_iter()
        .find_map(|f| f.as_ref());
    match file {
        Some(f) => MediaDescriptor::Document {
            mime_type: f.mime_type.clone(),
            media: MediaRef {
                file_id: f.file_id.clone(),
                declared_size: f.file_size,
            },
        },
        None => MediaDescriptor::None,
    }
}

/// Event for an update from one of `targets`; None for other chats or update kinds.
fn event_from_update(update: Update, targets: &[Target]) -> Option<InboundEvent> {
    let msg = update.channel_post.or(update.message)?;
    if !targets
        .iter()
        .any(|t| t.matches(msg.chat.id, msg.chat.username.as_deref()))
    {
        return None;
    }
    let media = media_from_message(&msg);
    let text = msg.text.or(msg.caption);
    Some(InboundEvent {
        chat: msg.chat.into(),
        message_id: Some(msg.message_id),
        text,
        media,
    })
}

fn chat_id_param(target: &Target) -> serde_json::Value {
    match target {
        Target::Handle(h) => json!(h),
        Target::Id(id) => json!(id),
    }
}

/// Client-side deadline for a long poll: the request timeout plus the poll window.
fn long_poll_deadline(request_timeout: Duration, poll_secs: u64) -> Duration {
    request_timeout.saturating_add(Duration::from_secs(poll_secs))
}

/// File downloads get a more generous deadline than API calls.
fn download_timeout(request_timeout: Duration) -> Duration {
    request_timeout.saturating_mul(4)
}

/// reqwest errors carry the request URL, which contains the bot token.
fn redact(e: reqwest::Error) -> SourceError {
    SourceError::Request(e.without_url())
}

/// Thin Bot API caller shared by the source and its poll task.
#[derive(Clone)]
struct Api {
    base: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl Api {
    async fn call<T: DeserializeOwned>(
        &self,
        token: &str,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, SourceError> {
        let url = format!("{}/bot{}/{}", self.base, token, method);
        let res = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&params)
            .send()
            .await
            .map_err(redact)?;
        let status = res.status();
        let body: ApiResponse<T> = res.json().await.map_err(redact)?;
        if !body.ok {
            return Err(SourceError::Rejected {
                method: method.to_string(),
                code: body.error_code.unwrap_or_else(|| i64::from(status.as_u16())),
                description: body.description.unwrap_or_default(),
            });
        }
        body.result
            .ok_or_else(|| SourceError::Api(format!("{} returned no result", method)))
    }

    async fn get_updates(&self, token: &str, offset: Option<i64>, timeout: u64) -> Result<Vec<Update>, SourceError> {
        let mut params = json!({
            "timeout": timeout,
            "allowed_updates": ["message", "channel_post"],
        });
        if let Some(off) = offset {
            params["offset"] = json!(off);
        }
        let wait = long_poll_deadline(self.request_timeout, timeout);
        self.call(token, "getUpdates", params, wait).await
    }
}

/// Bot API implementation of [`SourcePlatform`].
pub struct BotApiSource {
    api: Api,
    poll_timeout: u64,
    retry_delay: Duration,
    token: RwLock<Option<String>>,
    session: SessionFile,
    prompt: Option<Arc<dyn CredentialPrompt>>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl BotApiSource {
    /// Build from config. The token comes from config/env, else from the session file.
    /// `prompt` is only consulted by [`SourcePlatform::start`].
    pub fn new(
        config: &SourceConfig,
        session: SessionFile,
        prompt: Option<Arc<dyn CredentialPrompt>>,
    ) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .timeout(config.request_timeout());
        if config.ipv4_only {
            builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        if let Some((scheme, ep)) = config.proxy.selected() {
            let url = match scheme {
                ProxyScheme::Socks5 => format!("socks5h://{}:{}", ep.host, ep.port),
                ProxyScheme::Http => format!("http://{}:{}", ep.host, ep.port),
            };
            let mut proxy = reqwest::Proxy::all(&url)?;
            if let Some(user) = ep.username.as_deref() {
                proxy = proxy.basic_auth(user, ep.password.as_deref().unwrap_or(""));
            }
            log::info!("telegram: using {:?} proxy {}:{}", scheme, ep.host, ep.port);
            builder = builder.proxy(proxy);
        }
        let client = builder.build()?;
        let token = config
            .bot_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .or_else(|| session.load());
        Ok(Self {
            api: Api {
                base: config.api_base.trim_end_matches('/').to_string(),
                client,
                request_timeout: config.request_timeout(),
            },
            poll_timeout: LONG_POLL_TIMEOUT,
            retry_delay: POLL_ERROR_BACKOFF,
            token: RwLock::new(token),
            session,
            prompt,
            connected: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
        })
    }

    /// Long-poll window in seconds (default 30).
    pub fn with_poll_timeout(mut self, secs: u64) -> Self {
        self.poll_timeout = secs;
        self
    }

    /// Pause between failed getUpdates calls (default 2s).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    fn require_token(&self) -> Result<String, SourceError> {
        self.token().ok_or(SourceError::MissingCredentials)
    }

    /// getMe with the current token. 401/404 mean the token is not valid.
    async fn check_token(&self) -> Result<bool, SourceError> {
        let Some(token) = self.token() else {
            return Ok(false);
        };
        match self
            .api
            .call::<serde_json::Value>(&token, "getMe", json!({}), self.api.request_timeout)
            .await
        {
            Ok(me) => {
                let name = me.get("username").and_then(|v| v.as_str()).unwrap_or("?");
                log::debug!("telegram: authorized as @{}", name);
                Ok(true)
            }
            Err(SourceError::Rejected { code: 401 | 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Skip updates queued while the relay was down; only new posts are forwarded.
    async fn backlog_offset(&self, token: &str) -> Result<Option<i64>, SourceError> {
        let pending = self
            .api
            .call::<Vec<Update>>(
                token,
                "getUpdates",
                json!({ "offset": -1, "timeout": 0 }),
                self.api.request_timeout,
            )
            .await?;
        Ok(pending.last().map(|u| u.update_id + 1))
    }
}

#[async_trait]
impl SourcePlatform for BotApiSource {
    async fn start(&self) -> Result<(), SourceError> {
        self.connect().await?;
        if self.check_token().await? {
            return Ok(());
        }
        let prompt = self.prompt.as_ref().ok_or(SourceError::MissingCredentials)?;
        for attempt in 1..=PROMPT_ATTEMPTS {
            let token = prompt.ask_bot_token().await.map_err(SourceError::Prompt)?;
            if token.is_empty() {
                continue;
            }
            self.set_token(Some(token.clone()));
            if self.check_token().await? {
                self.session.save(&token)?;
                return Ok(());
            }
            log::warn!("telegram: bot token rejected ({}/{})", attempt, PROMPT_ATTEMPTS);
        }
        self.set_token(None);
        Err(SourceError::Api("bot token rejected".to_string()))
    }

    async fn connect(&self) -> Result<(), SourceError> {
        // Any HTTP answer from the API host means the transport works.
        let res = self.api.client.get(&self.api.base).send().await.map_err(redact)?;
        log::debug!("telegram: api host reachable status={}", res.status());
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> Result<bool, SourceError> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn is_authorized(&self) -> Result<bool, SourceError> {
        self.check_token().await
    }

    async fn get_entity(&self, target: &Target) -> Result<ChatEntity, SourceError> {
        let token = self.require_token()?;
        let chat: Chat = self
            .api
            .call(
                &token,
                "getChat",
                json!({ "chat_id": chat_id_param(target) }),
                self.api.request_timeout,
            )
            .await?;
        Ok(chat.into())
    }

    async fn subscribe(&self, targets: &[Target]) -> Result<mpsc::Receiver<InboundEvent>, SourceError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SourceError::NotConnected);
        }
        let token = self.require_token()?;
        let mut offset = self.backlog_offset(&token).await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let api = self.api.clone();
        let targets = targets.to_vec();
        let poll_timeout = self.poll_timeout;
        let retry_delay = self.retry_delay;
        let running = self.running.clone();
        let connected = self.connected.clone();
        running.store(true, Ordering::SeqCst);
        log::info!("telegram: starting getUpdates long-poll loop");
        let handle = tokio::spawn(async move {
            let mut failures: u32 = 0;
            while running.load(Ordering::SeqCst) {
                match api.get_updates(&token, offset, poll_timeout).await {
                    Ok(updates) => {
                        if failures > 0 {
                            log::info!("telegram: getUpdates recovered after {} failed attempt(s)", failures);
                            failures = 0;
                        }
                        for u in updates {
                            offset = Some(u.update_id + 1);
                            if let Some(ev) = event_from_update(u, &targets) {
                                if tx.send(ev).await.is_err() {
                                    log::debug!("telegram: event receiver closed, stopping loop");
                                    running.store(false, Ordering::SeqCst);
                                    return;
                                }
                            }
                        }
                    }
                    Err(SourceError::Rejected {
                        code: code @ (401 | 409),
                        description,
                        ..
                    }) => {
                        log::error!("telegram: getUpdates rejected ({} {}), disconnecting", code, description);
                        break;
                    }
                    Err(e) => {
                        failures += 1;
                        if failures == 1 {
                            log::warn!(
                                "telegram: getUpdates failing, retrying every {:.1}s: {}",
                                retry_delay.as_secs_f64(),
                                e
                            );
                        } else {
                            log::debug!("telegram: getUpdates error (attempt {}): {}", failures, e);
                        }
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            connected.store(false, Ordering::SeqCst);
            log::info!("telegram: getUpdates loop stopped");
        });
        let previous = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(old) = previous {
            old.abort();
        }
        Ok(rx)
    }

    async fn fetch_media(&self, media: &MediaRef) -> Result<Vec<u8>, SourceError> {
        let token = self.require_token()?;
        let file: File = self
            .api
            .call(
                &token,
                "getFile",
                json!({ "file_id": media.file_id }),
                self.api.request_timeout,
            )
            .await?;
        let path = file
            .file_path
            .ok_or_else(|| SourceError::Api("getFile returned no file_path".to_string()))?;
        let url = format!("{}/file/bot{}/{}", self.api.base, token, path);
        let res = self
            .api
            .client
            .get(&url)
            .timeout(download_timeout(self.api.request_timeout))
            .send()
            .await
            .map_err(redact)?;
        if !res.status().is_success() {
            return Err(SourceError::Api(format!("file download failed: {}", res.status())));
        }
        let bytes = res.bytes().await.map_err(redact)?;
        Ok(bytes.to_vec())
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let handle = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(h) = handle {
            h.abort();
            log::info!("telegram: disconnected");
        }
    }
}
