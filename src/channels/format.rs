use crate::types::{DestinationDescriptor, InboundMessage};
use chrono::{DateTime, Utc};

/// Markup rules of one destination kind.
pub struct Markup {
    pub bold: fn(&str) -> String,
    pub quote: fn(&str) -> String,
    pub escape: fn(&str) -> String,
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Renders the common message layout with the given markup.
pub fn render(markup: &Markup, message: &InboundMessage, destination: &DestinationDescriptor) -> String {
    let esc = markup.escape;
    let mut sections = Vec::new();

    sections.push(format!(
        "{} | {}\n{}",
        (markup.bold)(&esc(&message.channel_name)),
        esc(&message.sender),
        format_timestamp(&message.timestamp)
    ));

    if let Some(reply) = &message.reply_to {
        let mut line = format!("Reply to {}", esc(&reply.author));
        if let Some(ts) = &reply.timestamp {
            line.push_str(&format!(" ({})", format_timestamp(ts)));
        }
        line.push_str(": ");
        line.push_str(&esc(&reply.text));
        if reply.has_attachment {
            line.push_str(" [attachment]");
        }
        sections.push((markup.quote)(&line));
    }

    if !message.text.trim().is_empty() {
        sections.push(esc(&message.text));
    }

    if destination.ocr_enabled {
        if let Some(ocr) = message.ocr_text.as_deref().filter(|t| !t.trim().is_empty()) {
            sections.push(format!("{}\n{}", (markup.bold)("OCR:"), esc(ocr.trim())));
        }
    }

    if !destination.matched_keywords.is_empty() {
        sections.push(format!(
            "{} {}",
            (markup.bold)("Keywords:"),
            esc(&destination.matched_keywords.join(", "))
        ));
    }

    if let Some(src) = message.metadata.get("src") {
        sections.push(format!("{} {}", (markup.bold)("Source:"), esc(src)));
    }

    sections.join("\n\n")
}

/// Escapes `&`, `<` and `>`; shared by Slack mrkdwn and Telegram HTML.
pub fn escape_angle(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn quote_lines(prefix: &str, text: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
