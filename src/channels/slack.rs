use super::format::{self, Markup};
use super::{chunk_markup, DestinationClient, RateLimiter};
use crate::error::DeliveryError;
use crate::types::{AttachmentNote, DestinationDescriptor, DestinationKind, InboundMessage};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use std::path::Path;
use tracing::{debug, warn};

pub const SLACK_MESSAGE_LIMIT: usize = 4000;

const MARKUP: Markup = Markup {
    bold,
    quote,
    escape: format::escape_angle,
};

fn bold(text: &str) -> String {
    format!("*{text}*")
}

fn quote(text: &str) -> String {
    format::quote_lines(">", text)
}

/// Slack incoming-webhook destination. The transport has no file upload, so
/// attachments are replaced by an inline note.
pub struct SlackClient {
    http: Client,
    limiter: RateLimiter,
}

impl SlackClient {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            limiter: RateLimiter::new(),
        }
    }

    async fn post_text(&self, address: &str, text: &str) -> Result<(), DeliveryError> {
        let payload = serde_json::json!({
            "text": text,
            "unfurl_links": false,
        });
        let resp = self.http.post(address).json(&payload).send().await?;

        let status = resp.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .unwrap_or(1.0);
            let until = self.limiter.record(address, retry_after, Utc::now());
            warn!(kind = "slack", retry_after, %until, "webhook rate limited");
            return Err(DeliveryError::RateLimited { retry_after, until });
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl DestinationClient for SlackClient {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Slack
    }

    fn message_limit(&self) -> usize {
        SLACK_MESSAGE_LIMIT
    }

    fn supports_attachments(&self) -> bool {
        false
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn format_message(&self, message: &InboundMessage, destination: &DestinationDescriptor) -> String {
        format::render(&MARKUP, message, destination)
    }

    fn chunk(&self, text: &str) -> Vec<String> {
        chunk_markup(text, SLACK_MESSAGE_LIMIT)
    }

    async fn send(
        &self,
        text: &str,
        address: &str,
        attachment: Option<&Path>,
    ) -> Result<(), DeliveryError> {
        if let Some(until) = self.limiter.limited_until(address, Utc::now()) {
            debug!(kind = "slack", %until, "skipping send while rate limited");
            return Err(DeliveryError::RateLimitActive { until });
        }

        let body = match attachment {
            Some(_) => format!("{text}\n\n{}", AttachmentNote::Unsupported),
            None => text.to_string(),
        };
        for chunk in self.chunk(&body) {
            self.post_text(address, &chunk).await?;
        }
        Ok(())
    }
}
