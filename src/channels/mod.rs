pub mod discord;
pub mod format;
pub mod rate_limit;
pub mod slack;
pub mod telegram;

pub use rate_limit::RateLimiter;

use crate::error::DeliveryError;
use crate::types::{DestinationDescriptor, DestinationKind, InboundMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

/// One destination kind's transport: formatting, chunking, rate-limit state and sending.
///
/// Rate-limit state lives inside the implementation and is reached only through
/// these methods, so the live path and the retry path share one view of it.
#[async_trait]
pub trait DestinationClient: Send + Sync {
    fn kind(&self) -> DestinationKind;

    fn message_limit(&self) -> usize;

    /// Longest text that can ride along with an attachment, if the kind has such a limit.
    fn caption_limit(&self) -> Option<usize> {
        None
    }

    fn supports_attachments(&self) -> bool {
        true
    }

    fn rate_limiter(&self) -> &RateLimiter;

    fn format_message(&self, message: &InboundMessage, destination: &DestinationDescriptor)
        -> String;

    /// Sends `text` (chunked as needed) and an optional attachment to `address`.
    async fn send(
        &self,
        text: &str,
        address: &str,
        attachment: Option<&Path>,
    ) -> Result<(), DeliveryError>;

    /// A failure part-way through leaves earlier chunks delivered; a retry
    /// resends every chunk.
    fn chunk(&self, text: &str) -> Vec<String> {
        chunk_text(text, self.message_limit())
    }

    fn is_rate_limited(&self, address: &str) -> bool {
        self.rate_limiter().is_rate_limited(address, Utc::now())
    }

    fn rate_limited_until(&self, address: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.rate_limiter().limited_until(address, now)
    }

    fn record_rate_limit(&self, address: &str, retry_after_seconds: f64) -> DateTime<Utc> {
        self.rate_limiter()
            .record(address, retry_after_seconds, Utc::now())
    }
}

/// One client per destination kind; dispatch is a plain match on the kind.
#[derive(Clone)]
pub struct ClientRegistry {
    pub discord: Arc<dyn DestinationClient>,
    pub slack: Arc<dyn DestinationClient>,
    pub telegram: Arc<dyn DestinationClient>,
}

impl ClientRegistry {
    pub fn new(
        discord: Arc<dyn DestinationClient>,
        slack: Arc<dyn DestinationClient>,
        telegram: Arc<dyn DestinationClient>,
    ) -> Self {
        Self {
            discord,
            slack,
            telegram,
        }
    }

    pub fn get(&self, kind: DestinationKind) -> &Arc<dyn DestinationClient> {
        match kind {
            DestinationKind::Discord => &self.discord,
            DestinationKind::Slack => &self.slack,
            DestinationKind::Telegram => &self.telegram,
        }
    }
}

/// Splits `text` into pieces of at most `max_len` chars.
///
/// Cuts land just after the last newline inside the window when there is one;
/// newlines directly following a cut are kept on the earlier chunk while it has
/// room. Concatenating the result always yields `text`.
pub fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    split_chunks(text, max_len, |window| {
        window
            .iter()
            .rposition(|c| *c == '\n')
            .map(|pos| pos + 1)
            .unwrap_or(window.len())
    })
}

/// `chunk_text` for escaped HTML or mrkdwn. A cut never lands inside an
/// `&...;` entity or a `<...>` tag, and prefers points where no element is open.
pub fn chunk_markup(text: &str, max_len: usize) -> Vec<String> {
    split_chunks(text, max_len, markup_cut)
}

fn split_chunks(text: &str, max_len: usize, pick: impl Fn(&[char]) -> usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= max_len {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        let window = &chars[start..start + max_len];
        let mut cut = pick(window).clamp(1, max_len);
        while cut < max_len && window[cut] == '\n' {
            cut += 1;
        }

        chunks.push(chars[start..start + cut].iter().collect());
        start += cut;
    }
    chunks
}

const MAX_ENTITY_LEN: usize = 10;

/// Best cut in `window`: after a newline with no open element, else anywhere
/// with no open element, else anywhere outside a tag or entity.
fn markup_cut(window: &[char]) -> usize {
    let mut in_tag = false;
    let mut closing = false;
    let mut tag_len = 0;
    let mut entity_len: Option<usize> = None;
    let mut depth = 0usize;

    let mut after_newline = None;
    let mut balanced = None;
    let mut lexical = None;

    for (i, &c) in window.iter().enumerate() {
        if in_tag {
            tag_len += 1;
            if tag_len == 1 && c == '/' {
                closing = true;
            }
            if c == '>' {
                in_tag = false;
                if closing {
                    depth = depth.saturating_sub(1);
                } else {
                    depth += 1;
                }
            }
        } else if let Some(len) = entity_len {
            if c == ';' || c.is_whitespace() || len >= MAX_ENTITY_LEN {
                entity_len = None;
            } else {
                entity_len = Some(len + 1);
            }
        } else if c == '<' {
            in_tag = true;
            closing = false;
            tag_len = 0;
        } else if c == '&' {
            entity_len = Some(0);
        }

        if in_tag || entity_len.is_some() {
            continue;
        }
        let boundary = i + 1;
        lexical = Some(boundary);
        if depth == 0 {
            balanced = Some(boundary);
            if c == '\n' {
                after_newline = Some(boundary);
            }
        }
    }

    after_newline
        .or(balanced)
        .or(lexical)
        .unwrap_or(window.len())
}
