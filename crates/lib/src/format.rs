//! Caption formatting and media classification. Pure functions, no I/O.

/// Maximum length (in characters) of a webhook `content` field.
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Sent instead of an empty content field.
pub const EMPTY_CONTENT_PLACEHOLDER: &str = ".";

/// Appended to the caption when an image is over the upload ceiling.
pub const TOO_LARGE_NOTICE: &str = "(Attachment too large to upload)";

/// Title used when the chat has neither a title nor a username.
pub const FALLBACK_TITLE: &str = "Telegram";

const DEFAULT_IMAGE_EXT: &str = ".img";
const PHOTO_EXT: &str = ".jpg";

/// Media attached to an inbound message, as far as forwarding cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaDescriptor {
    None,
    /// Native compressed photo.
    Photo(MediaRef),
    /// Generic file with its declared MIME type (if any).
    Document {
        mime_type: Option<String>,
        media: MediaRef,
    },
}

/// Opaque handle the source platform uses to fetch media bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub file_id: String,
    /// Size announced by the platform, when known.
    pub declared_size: Option<u64>,
}

/// How forwarding treats a message's media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    ImageDocument,
    None,
}

/// Classify media. Total: anything that is not a photo or an `image/*` document is `None`.
pub fn classify_media(media: &MediaDescriptor) -> MediaKind {
    match media {
        MediaDescriptor::Photo(_) => MediaKind::Photo,
        MediaDescriptor::Document { mime_type, .. } => {
            let is_image = mime_type
                .as_deref()
                .map(|m| m.trim().to_ascii_lowercase().starts_with("image/"))
                .unwrap_or(false);
            if is_image {
                MediaKind::ImageDocument
            } else {
                MediaKind::None
            }
        }
        MediaDescriptor::None => MediaKind::None,
    }
}

/// File extension (with dot) for an uploaded attachment. Photos are always `.jpg`;
/// image documents use their MIME subtype when the extension, dot included, is at most 6
/// characters (subtype of 1-5 alphanumerics), else `.img`.
pub fn attachment_extension(kind: MediaKind, mime_type: Option<&str>) -> String {
    if kind == MediaKind::Photo {
        return PHOTO_EXT.to_string();
    }
    let subtype = mime_type
        .and_then(|m| m.split(';').next())
        .and_then(|m| m.split_once('/'))
        .map(|(_, sub)| sub.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let valid = (1..=5).contains(&subtype.len()) && subtype.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        format!(".{}", subtype)
    } else {
        DEFAULT_IMAGE_EXT.to_string()
    }
}

/// How deep links are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStyle {
    #[default]
    Bare,
    /// Wrapped in `<...>` so the destination does not unfurl a preview.
    NoPreview,
}

/// Public `t.me` link for a message. None unless both username and message id are known.
pub fn build_link(username: Option<&str>, message_id: Option<i64>, style: LinkStyle) -> Option<String> {
    let username = username.map(|u| u.trim_start_matches('@')).filter(|u| !u.is_empty())?;
    let id = message_id.filter(|id| *id != 0)?;
    let raw = format!("https://t.me/{}/{}", username, id);
    Some(match style {
        LinkStyle::Bare => raw,
        LinkStyle::NoPreview => format!("<{}>", raw),
    })
}

/// Compose the caption:
///
/// ```text
/// <prefix>[title]
///
/// text
///
/// link
/// ```
///
/// The text and link blocks (with their blank line) are left out when empty.
/// The result is not truncated; see [`prepare_content`].
pub fn format_caption(prefix: &str, title: &str, text: &str, link: Option<&str>) -> String {
    let mut out = format!("{}[{}]", prefix, title);
    if !text.is_empty() {
        out.push_str("\n\n");
        out.push_str(text);
    }
    if let Some(link) = link.filter(|l| !l.is_empty()) {
        out.push_str("\n\n");
        out.push_str(link);
    }
    out
}

/// Caption with the oversize notice on its own line.
pub fn with_too_large_notice(caption: &str) -> String {
    format!("{}\n{}", caption, TOO_LARGE_NOTICE)
}

/// Final form of a content field: at most [`MAX_CONTENT_CHARS`] characters, never empty.
pub fn prepare_content(content: &str) -> String {
    let truncated: String = content.chars().take(MAX_CONTENT_CHARS).collect();
    if truncated.is_empty() {
        EMPTY_CONTENT_PLACEHOLDER.to_string()
    } else {
        truncated
    }
}
