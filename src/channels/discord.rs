use super::format::{self, Markup};
use super::{DestinationClient, RateLimiter};
use crate::error::DeliveryError;
use crate::types::{DestinationDescriptor, DestinationKind, InboundMessage};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::path::Path;
use tracing::{debug, warn};

pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

const MARKUP: Markup = Markup {
    bold,
    quote,
    escape: plain,
};

fn plain(text: &str) -> String {
    text.to_string()
}

fn bold(text: &str) -> String {
    format!("**{text}**")
}

fn quote(text: &str) -> String {
    format::quote_lines("> ", text)
}

/// Discord webhook destination. Rate-limited addresses are refused up front and
/// left to the retry queue.
pub struct DiscordClient {
    http: Client,
    limiter: RateLimiter,
}

impl DiscordClient {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            limiter: RateLimiter::new(),
        }
    }

    fn payload(content: Option<&str>) -> Value {
        let mut payload = json!({ "allowed_mentions": { "parse": [] } });
        if let Some(content) = content {
            payload["content"] = Value::String(content.to_string());
        }
        payload
    }

    async fn post_text(&self, address: &str, content: &str) -> Result<(), DeliveryError> {
        let resp = self
            .http
            .post(address)
            .json(&Self::payload(Some(content)))
            .send()
            .await?;
        self.check_response(address, resp).await
    }

    async fn post_file(
        &self,
        address: &str,
        path: &Path,
        content: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let form = reqwest::multipart::Form::new()
            .text("payload_json", Self::payload(content).to_string())
            .part(
                "files[0]",
                reqwest::multipart::Part::bytes(bytes).file_name(filename),
            );
        let resp = self.http.post(address).multipart(form).send().await?;
        self.check_response(address, resp).await
    }

    async fn check_response(&self, address: &str, resp: Response) -> Result<(), DeliveryError> {
        let status = resp.status();
        if status == StatusCode::OK || status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(&headers, &body);
            let until = self.limiter.record(address, retry_after, Utc::now());
            warn!(kind = "discord", retry_after, %until, "webhook rate limited");
            return Err(DeliveryError::RateLimited { retry_after, until });
        }
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Reads the wait time from a 429 response: JSON `retry_after` first, then the
/// `Retry-After` header, then one second.
pub fn parse_retry_after(headers: &HeaderMap, body: &str) -> f64 {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("retry_after").and_then(|r| r.as_f64()))
        .or_else(|| {
            headers
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<f64>().ok())
        })
        .unwrap_or(1.0)
}

#[async_trait]
impl DestinationClient for DiscordClient {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Discord
    }

    fn message_limit(&self) -> usize {
        DISCORD_MESSAGE_LIMIT
    }

    fn caption_limit(&self) -> Option<usize> {
        Some(DISCORD_MESSAGE_LIMIT)
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn format_message(&self, message: &InboundMessage, destination: &DestinationDescriptor) -> String {
        format::render(&MARKUP, message, destination)
    }

    async fn send(
        &self,
        text: &str,
        address: &str,
        attachment: Option<&Path>,
    ) -> Result<(), DeliveryError> {
        if let Some(until) = self.limiter.limited_until(address, Utc::now()) {
            debug!(kind = "discord", %until, "skipping send while rate limited");
            return Err(DeliveryError::RateLimitActive { until });
        }

        match attachment {
            Some(path) if text.chars().count() <= DISCORD_MESSAGE_LIMIT => {
                self.post_file(address, path, Some(text)).await
            }
            Some(path) => {
                self.post_file(address, path, None).await?;
                for chunk in self.chunk(text) {
                    self.post_text(address, &chunk).await?;
                }
                Ok(())
            }
            None => {
                for chunk in self.chunk(text) {
                    self.post_text(address, &chunk).await?;
                }
                Ok(())
            }
        }
    }
}
