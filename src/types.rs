use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub const REPLY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    ChatChannel,
    Feed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Discord,
    Slack,
    Telegram,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Discord => "discord",
            DestinationKind::Slack => "slack",
            DestinationKind::Telegram => "telegram",
        }
    }
}

impl std::fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// "photo", "document", "video", ...
    pub kind: String,
    /// Remote location; `telegram://file/<id>` for bot API files.
    pub source_url: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    /// Set once the file has been downloaded. Not guaranteed to exist before that.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

impl Attachment {
    /// Lowercased extension taken from the file name, the local path, or the source URL.
    pub fn extension(&self) -> Option<String> {
        let from_name = self
            .file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_string()));
        let from_path = || {
            self.local_path
                .as_ref()
                .and_then(|p| p.extension())
                .map(|ext| ext.to_string_lossy().to_string())
        };
        let from_url = || {
            self.source_url.as_deref().and_then(|raw| {
                let path = url::Url::parse(raw).ok()?.path().to_string();
                let last = path.rsplit('/').next()?.to_string();
                last.rsplit_once('.').map(|(_, ext)| ext.to_string())
            })
        };
        from_name
            .or_else(from_path)
            .or_else(from_url)
            .filter(|ext| !ext.is_empty())
            .map(|ext| ext.to_lowercase())
    }

    pub fn is_image(&self) -> bool {
        if let Some(mime) = self.mime_type.as_deref() {
            return mime.starts_with("image/");
        }
        matches!(
            self.extension().as_deref(),
            Some("jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "tiff")
        ) || self.kind == "photo"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyContext {
    pub author: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
    pub has_attachment: bool,
}

impl ReplyContext {
    pub fn new(
        author: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
        text: &str,
        has_attachment: bool,
    ) -> Self {
        let text = if text.chars().count() > REPLY_PREVIEW_CHARS {
            let cut: String = text.chars().take(REPLY_PREVIEW_CHARS).collect();
            format!("{}...", cut.trim_end())
        } else {
            text.to_string()
        };
        Self {
            author: author.into(),
            timestamp,
            text,
            has_attachment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub origin: OriginKind,
    pub channel_id: String,
    pub channel_name: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub reply_to: Option<ReplyContext>,
    #[serde(default)]
    pub ocr_enabled: bool,
    #[serde(default)]
    pub ocr_text: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    pub fn new(
        origin: OriginKind,
        channel_id: impl Into<String>,
        channel_name: impl Into<String>,
        sender: impl Into<String>,
        timestamp: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            origin,
            channel_id: channel_id.into(),
            channel_name: channel_name.into(),
            message_id: None,
            sender: sender.into(),
            timestamp,
            text: text.into(),
            attachment: None,
            reply_to: None,
            ocr_enabled: false,
            ocr_text: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn attachment_path(&self) -> Option<&PathBuf> {
        self.attachment.as_ref().and_then(|a| a.local_path.as_ref())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub trim_front_lines: i64,
    #[serde(default)]
    pub trim_back_lines: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationDescriptor {
    pub name: String,
    pub kind: DestinationKind,
    pub address: String,
    pub matched_keywords: Vec<String>,
    pub restricted_mode: bool,
    pub ocr_enabled: bool,
    pub transform: Option<TransformConfig>,
}

/// Unit handed from an origin to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub message: InboundMessage,
    /// First message fetched from an origin, used only to confirm connectivity.
    #[serde(default)]
    pub connection_proof: bool,
}

impl InboundEnvelope {
    pub fn new(message: InboundMessage) -> Self {
        Self {
            message,
            connection_proof: false,
        }
    }

    pub fn connection_proof(message: InboundMessage) -> Self {
        Self {
            message,
            connection_proof: true,
        }
    }
}

/// Appended in place of an attachment a destination did not receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentNote {
    Restricted,
    Unsupported,
    Unavailable,
}

impl std::fmt::Display for AttachmentNote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AttachmentNote::Restricted => {
                "[attachment withheld: restricted mode allows only approved file types]"
            }
            AttachmentNote::Unsupported => {
                "[attachment not forwarded: destination does not support files]"
            }
            AttachmentNote::Unavailable => "[attachment could not be retrieved]",
        };
        f.write_str(text)
    }
}
