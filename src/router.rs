use crate::config::{ChannelEntry, DestinationConfig};
use crate::types::{DestinationDescriptor, InboundMessage, OriginKind, TransformConfig};
use std::borrow::Cow;
use tracing::{debug, warn};

const SUPERGROUP_PREFIX: &str = "-100";

/// Decides which configured destinations receive a message.
#[derive(Debug, Clone, Default)]
pub struct Router {
    destinations: Vec<DestinationConfig>,
}

impl Router {
    pub fn new(destinations: Vec<DestinationConfig>) -> Self {
        Self { destinations }
    }

    pub fn destinations(&self) -> &[DestinationConfig] {
        &self.destinations
    }

    /// First channel entry of each destination that matches the message's origin,
    /// in configuration order.
    fn candidates<'a>(
        &'a self,
        message: &'a InboundMessage,
    ) -> impl Iterator<Item = (&'a DestinationConfig, &'a ChannelEntry)> + 'a {
        self.destinations.iter().filter_map(move |dest| {
            dest.channels
                .iter()
                .find(|entry| channel_matches(&entry.id, message))
                .map(|entry| (dest, entry))
        })
    }

    pub fn is_configured(&self, message: &InboundMessage) -> bool {
        self.candidates(message).next().is_some()
    }

    /// True when any matching channel entry asks for OCR.
    pub fn ocr_requested(&self, message: &InboundMessage) -> bool {
        self.candidates(message).any(|(_, entry)| entry.ocr)
    }

    pub fn route(&self, message: &InboundMessage) -> Vec<DestinationDescriptor> {
        let mut configured = false;
        let mut routed = Vec::new();

        for (dest, entry) in self.candidates(message) {
            configured = true;
            let Some(matched_keywords) = match_keywords(entry, message) else {
                debug!(
                    destination = %dest.name,
                    channel = %message.channel_name,
                    "message filtered by keywords"
                );
                continue;
            };
            routed.push(DestinationDescriptor {
                name: dest.name.clone(),
                kind: dest.kind,
                address: dest.address.clone(),
                matched_keywords,
                restricted_mode: entry.restricted_mode,
                ocr_enabled: entry.ocr,
                transform: entry.parser,
            });
        }

        if !configured {
            debug!(
                channel_id = %message.channel_id,
                channel = %message.channel_name,
                "no destination configured for channel"
            );
        } else if routed.is_empty() {
            debug!(channel = %message.channel_name, "configured channel, all destinations filtered");
        }
        routed
    }

    /// Applies a destination's line-trim rules to a copy of the message.
    /// `None` hands back the original untouched.
    pub fn parse_msg<'a>(
        message: &'a InboundMessage,
        transform: Option<&TransformConfig>,
    ) -> Cow<'a, InboundMessage> {
        let Some(cfg) = transform else {
            return Cow::Borrowed(message);
        };
        if cfg.trim_front_lines < 0 || cfg.trim_back_lines < 0 {
            warn!(
                trim_front_lines = cfg.trim_front_lines,
                trim_back_lines = cfg.trim_back_lines,
                "negative trim bounds, leaving message unchanged"
            );
            return Cow::Borrowed(message);
        }
        if cfg.trim_front_lines == 0 && cfg.trim_back_lines == 0 {
            return Cow::Borrowed(message);
        }

        let front = cfg.trim_front_lines as usize;
        let back = cfg.trim_back_lines as usize;
        // `lines()` drops the empty tail after a final newline so it is not counted.
        let lines: Vec<&str> = message.text.lines().collect();
        let kept = if front + back >= lines.len() {
            String::new()
        } else {
            lines[front..lines.len() - back].join("\n")
        };

        let mut parsed = message.clone();
        parsed.text = if kept.trim().is_empty() {
            format!(
                "[Message content removed: {} leading and {} trailing lines stripped]",
                front, back
            )
        } else {
            kept
        };
        Cow::Owned(parsed)
    }
}

/// `Some(matches)` when the destination should get the message; an empty list
/// means the entry forwards unconditionally.
fn match_keywords(entry: &ChannelEntry, message: &InboundMessage) -> Option<Vec<String>> {
    if entry.keywords.is_empty() {
        return Some(Vec::new());
    }

    let mut searchable = message.text.clone();
    if entry.ocr {
        if let Some(ocr) = message.ocr_text.as_deref().filter(|t| !t.is_empty()) {
            searchable.push('\n');
            searchable.push_str(ocr);
        }
    }
    let haystack = searchable.to_lowercase();

    let matched: Vec<String> = entry
        .keywords
        .iter()
        .filter(|kw| !kw.is_empty() && haystack.contains(&kw.to_lowercase()))
        .cloned()
        .collect();
    if matched.is_empty() {
        None
    } else {
        Some(matched)
    }
}

/// Exact id or display-name match. Chat origins also accept a bare numeric id
/// against its `-100` supergroup form and the reverse; feed URLs match exactly.
pub fn channel_matches(config_id: &str, message: &InboundMessage) -> bool {
    if config_id == message.channel_id || config_id == message.channel_name {
        return true;
    }
    if message.origin != OriginKind::ChatChannel {
        return false;
    }
    let incoming = message.channel_id.as_str();
    if is_numeric(config_id) {
        if let Some(stripped) = incoming.strip_prefix(SUPERGROUP_PREFIX) {
            if stripped == config_id {
                return true;
            }
        }
    }
    if is_numeric(incoming) {
        if let Some(stripped) = config_id.strip_prefix(SUPERGROUP_PREFIX) {
            if stripped == incoming {
                return true;
            }
        }
    }
    false
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}
