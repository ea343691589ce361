mod logging;

use clap::{Parser, Subcommand};
use relay::config::{self, Config};
use relay::delivery::{DeliveryClient, WebhookSink};
use relay::dispatch::DispatchOptions;
use relay::lifecycle::{Lifecycle, Mode, Timeouts};
use relay::source::{BotApiSource, CredentialPrompt, SessionFile, SourcePlatform, StdinPrompt};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "tg-relay")]
#[command(about = "Forward Telegram channel posts to a webhook", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a template config file.
    Init {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.tg-relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Connect to Telegram and relay new posts until disconnected. Run once from a terminal to log in;
    /// afterwards it can run unattended (systemd, nohup).
    Run {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.tg-relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Never prompt for credentials, even when a terminal is attached.
        #[arg(long)]
        headless: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("tg-relay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            logging::init_default();
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config, headless }) => {
            let code = run_relay(config, headless).await;
            std::process::exit(code);
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = relay::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

/// Config from file + env. Logging is not set up yet when this runs.
fn load(config_path: Option<PathBuf>) -> anyhow::Result<(Config, PathBuf)> {
    let (mut config, path) = config::load_config(config_path)?;
    config.apply_env(|name| std::env::var(name).ok())?;
    Ok((config, path))
}

/// Returns the process exit code.
async fn run_relay(config_path: Option<PathBuf>, force_headless: bool) -> i32 {
    let (config, path) = match load(config_path) {
        Ok(v) => v,
        Err(e) => {
            logging::init_default();
            log::error!("configuration error: {:#}", e);
            return 1;
        }
    };
    logging::init(&config.logging);

    let (webhook_url, targets) = match config.validate() {
        Ok(v) => v,
        Err(e) => {
            log::error!("configuration error: {}", e);
            return 1;
        }
    };

    let mode = Mode::detect(std::io::stdin().is_terminal(), force_headless || config.headless);
    let proxy = config.source.proxy.selected().is_some();
    log::info!(
        "starting: targets={} mode={:?} session={} proxy={}",
        targets.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(","),
        mode,
        config.source.session,
        proxy
    );

    let session = SessionFile::new(&config::config_dir(&path), &config.source.session);
    let prompt: Option<Arc<dyn CredentialPrompt>> = match mode {
        Mode::Attended => Some(Arc::new(StdinPrompt)),
        Mode::Unattended => None,
    };
    let source: Arc<dyn SourcePlatform> = match BotApiSource::new(&config.source, session, prompt) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            log::error!("configuration error: cannot build telegram client: {}", e);
            return 1;
        }
    };

    let delivery = DeliveryClient::new(Arc::new(WebhookSink::new(webhook_url)));
    let timeouts = Timeouts {
        start: config.source.start_timeout(),
        connect: config.source.connect_timeout(),
    };
    let options = DispatchOptions {
        prefix: config.destination.prefix.clone(),
        link_style: config.destination.link_style(),
        max_upload_bytes: config.destination.max_upload_bytes,
    };
    let lifecycle = Lifecycle::new(source.clone(), delivery, targets, mode, timeouts);

    tokio::select! {
        result = lifecycle.run(options) => match result {
            Ok(()) => 0,
            // Already logged and reported by the lifecycle.
            Err(_) => 1,
        },
        _ = shutdown_signal() => {
            log::info!("shutdown signal received, disconnecting");
            source.disconnect().await;
            0
        }
    }
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
