//! Startup announcement: one message listing the channels being relayed.

use futures_util::future::join_all;

use crate::source::SourcePlatform;
use crate::targets::Target;

/// Human-readable name for a target: `@handle`, else `@username`, else `[title]`, else the id.
/// Lookup failures fall back to the raw target.
pub async fn display_name(source: &dyn SourcePlatform, target: &Target) -> String {
    if let Target::Handle(h) = target {
        return h.clone();
    }
    match source.get_entity(target).await {
        Ok(chat) => {
            if let Some(u) = chat.username.filter(|u| !u.is_empty()) {
                format!("@{}", u)
            } else if let Some(t) = chat.title.filter(|t| !t.is_empty()) {
                format!("[{}]", t)
            } else {
                chat.id.to_string()
            }
        }
        Err(e) => {
            log::debug!("announce: could not resolve {}: {}", target, e);
            target.to_string()
        }
    }
}

/// Display names for all targets, resolved concurrently, in target order.
pub async fn display_names(source: &dyn SourcePlatform, targets: &[Target]) -> Vec<String> {
    join_all(targets.iter().map(|t| display_name(source, t))).await
}

pub fn announcement(names: &[String]) -> String {
    format!("Started listening to channels: {}", names.join(", "))
}
