//! Logger construction. Built once at startup from the `logging` config section;
//! library code only uses the `log` macros.

use log::LevelFilter;
use relay::config::LoggingConfig;
use std::fs::OpenOptions;

/// Module whose output `TELEGRAM_LOG` turns up to debug.
const PLATFORM_MODULE: &str = "relay::source";

/// Parse a level name; unknown names fall back to info.
pub fn level_filter(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}

/// Install the global logger. `RUST_LOG` still wins over the configured level.
pub fn init(config: &LoggingConfig) {
    let level = level_filter(&config.level).to_string().to_lowercase();
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if config.platform_debug {
        builder.filter_module(PLATFORM_MODULE, LevelFilter::Debug);
    }
    let mut file_error = None;
    if let Some(path) = config.file.as_ref() {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some((path.clone(), e)),
        }
    }
    builder.init();
    if let Some((path, e)) = file_error {
        log::warn!("cannot open log file {}: {}; logging to stderr", path.display(), e);
    }
}

/// Logger for failures that happen before the config is known.
pub fn init_default() {
    init(&LoggingConfig::default());
}
