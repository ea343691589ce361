//! Connection lifecycle: connect, verify, announce, then relay until disconnected.
//!
//! ```text
//! Idle -> Connecting -> Verifying -> Authorized -> Running
//!             \             \            \
//!              +-------------+------------+--> Failed(reason)
//! ```
//!
//! Attended runs (a terminal is attached) use the platform's combined start, which may
//! prompt for credentials. Unattended runs only connect and check; an unauthorized
//! session fails immediately instead of waiting for input nobody will type. Every
//! network wait is bounded, and every failure is posted once to the webhook.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::announce::{announcement, display_names};
use crate::delivery::DeliveryClient;
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::source::{SourceError, SourcePlatform};
use crate::targets::Target;

/// Whether credential prompting is possible. Decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Attended,
    Unattended,
}

impl Mode {
    /// Attended only with an interactive terminal and no headless override.
    pub fn detect(interactive_terminal: bool, force_headless: bool) -> Mode {
        if interactive_terminal && !force_headless {
            Mode::Attended
        } else {
            Mode::Unattended
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Connecting,
    Verifying,
    Authorized,
    Running,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Attended start, including any credential prompt.
    pub start: Duration,
    /// Unattended connect and each verification call.
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(120),
            connect: Duration::from_secs(15),
        }
    }
}

/// Startup failures. The message is what gets posted to the webhook.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(
        "Startup error: interactive start timed out after {}s (network blocked or login not completed). \
         Check connectivity and proxy settings, or raise TG_START_TIMEOUT.",
        .0.as_secs()
    )]
    StartTimeout(Duration),
    #[error("Startup error: interactive start failed: {0}")]
    Start(SourceError),
    #[error(
        "Startup error: connect timed out after {}s (network blocked/blackholed?). \
         Check connectivity and proxy settings, or raise TG_CONNECT_TIMEOUT.",
        .0.as_secs()
    )]
    ConnectTimeout(Duration),
    #[error("Startup error: failed to connect to Telegram: {0}")]
    Connect(SourceError),
    #[error("Startup error: client not connected after connect.")]
    NotConnected,
    #[error("Startup error: connection state check failed: {0}")]
    StateCheck(SourceError),
    #[error("Startup error: authorization check timed out after {}s.", .0.as_secs())]
    AuthorizationTimeout(Duration),
    #[error("Startup error: authorization check failed: {0}")]
    AuthorizationCheck(SourceError),
    #[error(
        "Startup error: session not authorized and no TTY available. \
         Run `tg-relay run` once in an interactive shell to log in, or set TG_BOT_TOKEN."
    )]
    Unauthorized,
    #[error("Startup error: session still not authorized after interactive start.")]
    NotAuthorizedAfterStart,
    #[error("Startup error: subscribing to channels failed: {0}")]
    Subscribe(SourceError),
}

/// Owns the session state machine. The dispatcher only borrows the source.
pub struct Lifecycle {
    source: Arc<dyn SourcePlatform>,
    delivery: DeliveryClient,
    targets: Vec<Target>,
    mode: Mode,
    timeouts: Timeouts,
    state: LifecycleState,
}

impl Lifecycle {
    pub fn new(
        source: Arc<dyn SourcePlatform>,
        delivery: DeliveryClient,
        targets: Vec<Target>,
        mode: Mode,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            source,
            delivery,
            targets,
            mode,
            timeouts,
            state: LifecycleState::Idle,
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn transition(&mut self, next: LifecycleState) {
        log::debug!("lifecycle: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Idle -> Authorized, or Failed with one diagnostic post and a disconnect.
    pub async fn establish(&mut self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Connecting);
        match self.connect_and_verify().await {
            Ok(()) => {
                self.transition(LifecycleState::Authorized);
                Ok(())
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn connect_and_verify(&mut self) -> Result<(), LifecycleError> {
        match self.mode {
            Mode::Attended => {
                log::info!("lifecycle: interactive terminal detected, using start");
                match timeout(self.timeouts.start, self.source.start()).await {
                    Err(_) => return Err(LifecycleError::StartTimeout(self.timeouts.start)),
                    Ok(Err(e)) => return Err(LifecycleError::Start(e)),
                    Ok(Ok(())) => {}
                }
            }
            Mode::Unattended => {
                log::info!(
                    "lifecycle: headless mode, connecting with {}s timeout",
                    self.timeouts.connect.as_secs()
                );
                match timeout(self.timeouts.connect, self.source.connect()).await {
                    Err(_) => return Err(LifecycleError::ConnectTimeout(self.timeouts.connect)),
                    Ok(Err(e)) => return Err(LifecycleError::Connect(e)),
                    Ok(Ok(())) => {}
                }
            }
        }

        self.transition(LifecycleState::Verifying);
        // connect()'s own success is not taken as proof of a live transport.
        match self.source.is_connected() {
            Ok(true) => {}
            Ok(false) => return Err(LifecycleError::NotConnected),
            Err(e) => return Err(LifecycleError::StateCheck(e)),
        }
        match timeout(self.timeouts.connect, self.source.is_authorized()).await {
            Err(_) => Err(LifecycleError::AuthorizationTimeout(self.timeouts.connect)),
            Ok(Err(e)) => Err(LifecycleError::AuthorizationCheck(e)),
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(match self.mode {
                Mode::Unattended => LifecycleError::Unauthorized,
                Mode::Attended => LifecycleError::NotAuthorizedAfterStart,
            }),
        }
    }

    async fn fail(&mut self, err: &LifecycleError) {
        let reason = err.to_string();
        log::error!("{}", reason);
        self.transition(LifecycleState::Failed(reason.clone()));
        if !self.delivery.post_text(&reason).await.is_delivered() {
            log::error!("lifecycle: failure report could not be delivered");
        }
        self.source.disconnect().await;
    }

    /// Establish the session, announce, then dispatch events until the session
    /// disconnects. Returns Ok on a clean disconnect.
    pub async fn run(mut self, options: DispatchOptions) -> Result<(), LifecycleError> {
        self.establish().await?;

        let events = match self.source.subscribe(&self.targets).await {
            Ok(rx) => rx,
            Err(e) => {
                let err = LifecycleError::Subscribe(e);
                self.fail(&err).await;
                return Err(err);
            }
        };

        let names = display_names(self.source.as_ref(), &self.targets).await;
        let text = announcement(&names);
        log::info!("{}", text);
        self.delivery.post_text(&text).await;

        self.transition(LifecycleState::Running);
        log::info!("running. listening to channels:");
        for n in &names {
            log::info!(" - {}", n);
        }

        let dispatcher = Dispatcher::new(self.source.clone(), self.delivery.clone(), options);
        dispatcher.run(events).await;

        self.source.disconnect().await;
        log::info!("lifecycle: session disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::{Reply, ScriptedSink};
    use crate::format::MediaDescriptor;
    use crate::source::testing::FakeSource;
    use crate::source::{ChatEntity, InboundEvent};
    use std::sync::atomic::Ordering;

    fn targets() -> Vec<Target> {
        vec![Target::Handle("@news".into())]
    }

    fn lifecycle(source: Arc<FakeSource>, sink: Arc<ScriptedSink>, mode: Mode) -> Lifecycle {
        Lifecycle::new(source, DeliveryClient::new(sink), targets(), mode, Timeouts::default())
    }

    fn contents(sink: &ScriptedSink) -> Vec<String> {
        sink.requests().iter().map(|r| r.content().to_string()).collect()
    }

    #[test]
    fn mode_detection() {
        assert_eq!(Mode::detect(true, false), Mode::Attended);
        assert_eq!(Mode::detect(true, true), Mode::Unattended);
        assert_eq!(Mode::detect(false, false), Mode::Unattended);
        assert_eq!(Mode::detect(false, true), Mode::Unattended);
    }

    #[tokio::test(start_paused = true)]
    async fn headless_unauthorized_fails_with_one_report() {
        let source = Arc::new(FakeSource {
            reports_connected: true,
            authorized: false,
            ..Default::default()
        });
        let sink = ScriptedSink::new(vec![]);
        let mut lc = lifecycle(source.clone(), sink.clone(), Mode::Unattended);
        let err = lc.establish().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Unauthorized));
        assert!(matches!(lc.state(), LifecycleState::Failed(r) if r.contains("not authorized")));
        let posted = contents(&sink);
        assert_eq!(posted.len(), 1);
        assert!(posted[0].starts_with("Startup error: session not authorized"));
        assert_eq!(source.start_calls.load(Ordering::SeqCst), 0);
        assert!(source.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn headless_run_never_reaches_running_when_unauthorized() {
        let source = Arc::new(FakeSource {
            reports_connected: true,
            authorized: false,
            ..Default::default()
        });
        let sink = ScriptedSink::new(vec![]);
        let lc = lifecycle(source.clone(), sink.clone(), Mode::Unattended);
        assert!(lc.run(DispatchOptions::default()).await.is_err());
        assert!(source.subscribed.lock().unwrap().is_empty());
        assert_eq!(sink.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attended_start_timeout_names_the_cause() {
        let source = Arc::new(FakeSource {
            start_delay: Some(Duration::from_secs(600)),
            ..FakeSource::healthy()
        });
        let sink = ScriptedSink::new(vec![]);
        let mut lc = lifecycle(source.clone(), sink.clone(), Mode::Attended);
        let started = tokio::time::Instant::now();
        let err = lc.establish().await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartTimeout(d) if d == Duration::from_secs(120)));
        assert!(started.elapsed() < Duration::from_secs(121));
        let posted = contents(&sink);
        assert_eq!(posted.len(), 1);
        assert!(posted[0].contains("timed out after 120s"));
        assert!(posted[0].contains("TG_START_TIMEOUT"));
        assert_eq!(source.start_calls.load(Ordering::SeqCst), 1);
        assert!(source.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn attended_start_error_is_reported() {
        let source = Arc::new(FakeSource {
            start_error: Some("PHONE_CODE_INVALID".into()),
            ..FakeSource::healthy()
        });
        let sink = ScriptedSink::new(vec![]);
        let mut lc = lifecycle(source, sink.clone(), Mode::Attended);
        assert!(matches!(lc.establish().await, Err(LifecycleError::Start(_))));
        assert!(contents(&sink)[0].contains("PHONE_CODE_INVALID"));
    }

    #[tokio::test(start_paused = true)]
    async fn attended_start_without_authorization_fails_once() {
        let source = Arc::new(FakeSource {
            reports_connected: true,
            authorized: false,
            ..Default::default()
        });
        let sink = ScriptedSink::new(vec![]);
        let mut lc = lifecycle(source.clone(), sink.clone(), Mode::Attended);
        assert!(matches!(lc.establish().await, Err(LifecycleError::NotAuthorizedAfterStart)));
        assert!(matches!(lc.state(), LifecycleState::Failed(_)));
        assert_eq!(
            contents(&sink),
            vec!["Startup error: session still not authorized after interactive start."]
        );
        assert_eq!(source.start_calls.load(Ordering::SeqCst), 1);
        assert!(source.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_failure_is_reported_before_announcing() {
        let source = Arc::new(FakeSource {
            subscribe_error: Some("CHANNEL_PRIVATE".into()),
            ..FakeSource::healthy()
        });
        let sink = ScriptedSink::new(vec![]);
        let lc = lifecycle(source.clone(), sink.clone(), Mode::Unattended);
        let err = lc.run(DispatchOptions::default()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Subscribe(_)));
        let posted = contents(&sink);
        assert_eq!(posted.len(), 1);
        assert!(posted[0].starts_with("Startup error: subscribing to channels failed"));
        assert!(posted[0].contains("CHANNEL_PRIVATE"));
        assert!(source.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn headless_connect_timeout() {
        let source = Arc::new(FakeSource {
            connect_delay: Some(Duration::from_secs(60)),
            ..FakeSource::healthy()
        });
        let sink = ScriptedSink::new(vec![]);
        let mut lc = lifecycle(source, sink.clone(), Mode::Unattended);
        assert!(matches!(
            lc.establish().await,
            Err(LifecycleError::ConnectTimeout(d)) if d == Duration::from_secs(15)
        ));
        assert_eq!(sink.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_success_is_reverified() {
        let source = Arc::new(FakeSource {
            reports_connected: false,
            authorized: true,
            ..Default::default()
        });
        let sink = ScriptedSink::new(vec![]);
        let mut lc = lifecycle(source, sink.clone(), Mode::Unattended);
        assert!(matches!(lc.establish().await, Err(LifecycleError::NotConnected)));
        assert_eq!(contents(&sink), vec!["Startup error: client not connected after connect."]);
    }

    #[tokio::test(start_paused = true)]
    async fn undeliverable_failure_report_is_not_fatal() {
        let source = Arc::new(FakeSource {
            connect_error: Some("dns".into()),
            ..FakeSource::healthy()
        });
        let sink = ScriptedSink::new((0..5).map(|_| Reply::Status(502)).collect());
        let mut lc = lifecycle(source, sink.clone(), Mode::Unattended);
        assert!(matches!(lc.establish().await, Err(LifecycleError::Connect(_))));
        assert_eq!(sink.requests().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_run_announces_then_relays_in_order() {
        let source = FakeSource::healthy();
        source.events.lock().unwrap().extend([
            InboundEvent {
                chat: ChatEntity {
                    id: -1,
                    title: Some("News".into()),
                    username: Some("news".into()),
                },
                message_id: Some(1),
                text: Some("one".into()),
                media: MediaDescriptor::None,
            },
            InboundEvent {
                chat: ChatEntity {
                    id: -1,
                    title: Some("News".into()),
                    username: Some("news".into()),
                },
                message_id: Some(2),
                text: Some("two".into()),
                media: MediaDescriptor::None,
            },
        ]);
        let source = Arc::new(source);
        let sink = ScriptedSink::new(vec![]);
        let mut lc = lifecycle(source.clone(), sink.clone(), Mode::Unattended);
        lc.establish().await.unwrap();
        assert_eq!(lc.state(), &LifecycleState::Authorized);

        let lc = lifecycle(source.clone(), sink.clone(), Mode::Attended);
        lc.run(DispatchOptions::default()).await.unwrap();
        assert_eq!(
            contents(&sink),
            vec![
                "Started listening to channels: @news".to_string(),
                "[News]\n\none\n\nhttps://t.me/news/1".to_string(),
                "[News]\n\ntwo\n\nhttps://t.me/news/2".to_string(),
            ]
        );
        assert_eq!(*source.subscribed.lock().unwrap(), targets());
        assert_eq!(source.start_calls.load(Ordering::SeqCst), 1);
        assert!(source.disconnected.load(Ordering::SeqCst));
    }
}
