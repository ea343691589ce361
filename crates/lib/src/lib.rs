//! Relay core library: Telegram channel posts to a single webhook.
//! Used by the `tg-relay` binary.

pub mod announce;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod format;
pub mod init;
pub mod lifecycle;
pub mod source;
pub mod targets;
