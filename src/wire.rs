//! Transport-facing shapes
//!
//! The chat transport normalizes whatever it receives into an
//! [`InboundEvent`] and renders whatever [`ResponseDescriptor`] comes back.

use crate::session::Role;
use serde::{Deserialize, Serialize};

/// A normalized message from the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_hint: Option<Role>,
    #[serde(flatten)]
    pub body: InboundBody,
}

impl InboundEvent {
    pub fn new(user_id: impl Into<String>, body: InboundBody) -> Self {
        Self {
            user_id: user_id.into(),
            role_hint: None,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum InboundBody {
    /// Slash command line, e.g. `/search revenue`
    Command(String),
    Text(String),
    File(FileRef),
    /// Opaque data attached to a quick action
    Callback(String),
}

/// A file the transport has already stored somewhere the backend can fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_name: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// URL or storage handle the backend downloads the content from
    pub location: String,
}

impl FileRef {
    /// Lowercased extension without the dot
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }

    /// Declared mime type, or a guess from the file name
    pub fn content_type(&self) -> String {
        self.mime_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(&self.file_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickAction {
    pub label: String,
    /// Callback data delivered back as `InboundBody::Callback` when tapped
    pub event: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub title: String,
    pub url: String,
}

/// What the renderer should show the user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseDescriptor {
    pub reply_text: String,
    #[serde(default)]
    pub quick_actions: Vec<QuickAction>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl ResponseDescriptor {
    pub fn text(reply_text: impl Into<String>) -> Self {
        Self {
            reply_text: reply_text.into(),
            ..Self::default()
        }
    }

    pub fn with_action(mut self, label: impl Into<String>, event: impl Into<String>) -> Self {
        self.quick_actions.push(QuickAction {
            label: label.into(),
            event: event.into(),
        });
        self
    }

    pub fn with_attachment(mut self, title: impl Into<String>, url: impl Into<String>) -> Self {
        self.attachments.push(Attachment {
            title: title.into(),
            url: url.into(),
        });
        self
    }

    /// Fold several replies produced while handling one event into one.
    pub fn merge(parts: impl IntoIterator<Item = ResponseDescriptor>) -> Self {
        let mut merged = Self::default();
        for part in parts {
            if !part.reply_text.is_empty() {
                if !merged.reply_text.is_empty() {
                    merged.reply_text.push_str("\n\n");
                }
                merged.reply_text.push_str(&part.reply_text);
            }
            merged.quick_actions.extend(part.quick_actions);
            merged.attachments.extend(part.attachments);
        }
        merged
    }
}
