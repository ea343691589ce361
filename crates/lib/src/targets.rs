//! Source channel targets: parsing, normalization and matching.

use std::fmt;

/// One configured source channel: a public `@handle` or a numeric chat id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Public username, always stored with its leading `@`.
    Handle(String),
    /// Numeric chat id (channels are usually `-100...`).
    Id(i64),
}

impl Target {
    /// Username without the leading `@` (None for numeric ids).
    pub fn username(&self) -> Option<&str> {
        match self {
            Target::Handle(h) => Some(h.trim_start_matches('@')),
            Target::Id(_) => None,
        }
    }

    /// True if a chat with this id / username is the one this target names.
    /// Usernames compare case-insensitively.
    pub fn matches(&self, chat_id: i64, chat_username: Option<&str>) -> bool {
        match self {
            Target::Id(id) => *id == chat_id,
            Target::Handle(_) => match (self.username(), chat_username) {
                (Some(want), Some(have)) => want.eq_ignore_ascii_case(have.trim_start_matches('@')),
                _ => false,
            },
        }
    }

    fn dedup_key(&self) -> String {
        match self {
            Target::Handle(h) => h.to_ascii_lowercase(),
            Target::Id(id) => id.to_string(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Handle(h) => f.write_str(h),
            Target::Id(id) => write!(f, "{}", id),
        }
    }
}

/// Parse one entry. Surrounding whitespace and quotes are stripped; empty entries yield None.
/// `@name`, bare `name` and `https://t.me/name` all become `Handle("@name")`; integers become `Id`.
pub fn parse_target(raw: &str) -> Option<Target> {
    let s = raw
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(id) = s.parse::<i64>() {
        return Some(Target::Id(id));
    }
    let name = strip_link_prefix(s).trim_start_matches('@').trim_end_matches('/');
    if name.is_empty() {
        return None;
    }
    Some(Target::Handle(format!("@{}", name)))
}

fn strip_link_prefix(s: &str) -> &str {
    for prefix in ["https://t.me/", "http://t.me/", "t.me/"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            return rest;
        }
    }
    s
}

/// Parse comma-separated target lists into an ordered, deduplicated sequence.
/// Each element of `lists` may itself hold several comma-separated entries. The first
/// occurrence of a target wins; later duplicates are dropped.
pub fn parse_targets<S: AsRef<str>>(lists: &[S]) -> Vec<Target> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for list in lists {
        for part in list.as_ref().split(',') {
            if let Some(t) = parse_target(part) {
                if seen.insert(t.dedup_key()) {
                    out.push(t);
                }
            }
        }
    }
    out
}
