use super::format::{self, Markup};
use super::{chunk_markup, DestinationClient, RateLimiter};
use crate::error::DeliveryError;
use crate::types::{
    Attachment, DestinationDescriptor, DestinationKind, InboundEnvelope, InboundMessage,
    OriginKind, ReplyContext,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Response};
use serde_json::Value;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;
pub const TELEGRAM_CAPTION_LIMIT: usize = 1024;
pub const TELEGRAM_FILE_SCHEME: &str = "telegram://file/";

const MARKUP: Markup = Markup {
    bold,
    quote,
    escape: format::escape_angle,
};

fn bold(text: &str) -> String {
    format!("<b>{text}</b>")
}

fn quote(text: &str) -> String {
    format!("<blockquote>{text}</blockquote>")
}

/// Telegram Bot API destination. Sends wait out an active rate limit before
/// touching the network.
pub struct TelegramClient {
    http: Client,
    api_base: String,
    token: Option<String>,
    limiter: RateLimiter,
}

impl TelegramClient {
    pub fn new(http: Client, api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
            limiter: RateLimiter::new(),
        }
    }

    fn method_url(&self, method: &str) -> Result<String, DeliveryError> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| DeliveryError::Api("telegram bot token missing".to_string()))?;
        Ok(format!("{}/bot{}/{}", self.api_base, token, method))
    }

    async fn wait_for_rate_limit(&self, address: &str) {
        if let Some(until) = self.limiter.limited_until(address, Utc::now()) {
            let wait = (until - Utc::now()).to_std().unwrap_or_default();
            debug!(kind = "telegram", wait_ms = wait.as_millis() as u64, "waiting out rate limit");
            sleep(wait).await;
        }
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
        let url = self.method_url("sendMessage")?;
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let resp = self.http.post(&url).json(&payload).send().await?;
        self.check_response(chat_id, resp).await
    }

    async fn send_media(
        &self,
        chat_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let is_photo = matches!(
            path.extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .as_deref(),
            Some("jpg" | "jpeg" | "png" | "webp")
        );
        let (method, field) = if is_photo {
            ("sendPhoto", "photo")
        } else {
            ("sendDocument", "document")
        };
        let url = self.method_url(method)?;
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field, reqwest::multipart::Part::bytes(bytes).file_name(filename));
        if let Some(caption) = caption {
            form = form
                .text("caption", caption.to_string())
                .text("parse_mode", "HTML");
        }
        let resp = self.http.post(&url).multipart(form).send().await?;
        self.check_response(chat_id, resp).await
    }

    async fn check_response(&self, chat_id: &str, resp: Response) -> Result<(), DeliveryError> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let value: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

        let error_code = value.get("error_code").and_then(|v| v.as_u64());
        if status.as_u16() == 429 || error_code == Some(429) {
            let retry_after = value
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0);
            let until = self.limiter.record(chat_id, retry_after, Utc::now());
            warn!(kind = "telegram", retry_after, %until, "bot api rate limited");
            return Err(DeliveryError::RateLimited { retry_after, until });
        }
        if status.is_success() && value.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(());
        }
        if let Some(description) = value.get("description").and_then(|v| v.as_str()) {
            return Err(DeliveryError::Api(description.to_string()));
        }
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl DestinationClient for TelegramClient {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Telegram
    }

    fn message_limit(&self) -> usize {
        TELEGRAM_MESSAGE_LIMIT
    }

    fn caption_limit(&self) -> Option<usize> {
        Some(TELEGRAM_CAPTION_LIMIT)
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn format_message(&self, message: &InboundMessage, destination: &DestinationDescriptor) -> String {
        format::render(&MARKUP, message, destination)
    }

    fn chunk(&self, text: &str) -> Vec<String> {
        chunk_markup(text, TELEGRAM_MESSAGE_LIMIT)
    }

    async fn send(
        &self,
        text: &str,
        address: &str,
        attachment: Option<&Path>,
    ) -> Result<(), DeliveryError> {
        self.wait_for_rate_limit(address).await;

        if let Some(path) = attachment {
            if text.chars().count() <= TELEGRAM_CAPTION_LIMIT {
                return self.send_media(address, path, Some(text)).await;
            }
            self.send_media(address, path, None).await?;
        }
        for chunk in self.chunk(text) {
            self.send_text(address, &chunk).await?;
        }
        Ok(())
    }
}

/// Long-polls `getUpdates` and forwards channel posts into the pipeline.
pub async fn start_telegram_poller(
    http: Client,
    api_base: String,
    token: String,
    tx: mpsc::Sender<InboundEnvelope>,
    interval_seconds: u64,
) {
    let mut offset: i64 = 0;
    let url = format!("{}/bot{}/getUpdates", api_base.trim_end_matches('/'), token);
    info!("telegram poller started");
    loop {
        let resp = http
            .get(&url)
            .query(&[("timeout", "25"), ("offset", &offset.to_string())])
            .send()
            .await;
        match resp {
            Ok(resp) => {
                if let Ok(value) = resp.json::<Value>().await {
                    if value.get("ok").and_then(|v| v.as_bool()) == Some(true) {
                        if let Some(results) = value.get("result").and_then(|v| v.as_array()) {
                            for update in results {
                                if let Some(update_id) =
                                    update.get("update_id").and_then(|v| v.as_i64())
                                {
                                    offset = update_id + 1;
                                }
                                if let Some(msg) = parse_telegram_update(update) {
                                    if tx.send(InboundEnvelope::new(msg)).await.is_err() {
                                        info!("inbound channel closed, stopping telegram poller");
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "telegram getUpdates failed"),
        }
        sleep(std::time::Duration::from_secs(interval_seconds)).await;
    }
}

fn unix_to_utc(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|v| Utc.timestamp_opt(v, 0).single())
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn chat_display_name(chat: &Value) -> Option<String> {
    str_field(chat, "username")
        .map(|u| format!("@{u}"))
        .or_else(|| str_field(chat, "title"))
}

fn parse_attachment(msg: &Value) -> Option<Attachment> {
    if let Some(photo) = msg
        .get("photo")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.last())
    {
        let file_id = photo.get("file_id")?.as_str()?;
        return Some(Attachment {
            kind: "photo".to_string(),
            source_url: Some(format!("{TELEGRAM_FILE_SCHEME}{file_id}")),
            file_name: Some(format!("{file_id}.jpg")),
            mime_type: Some("image/jpeg".to_string()),
            size: photo.get("file_size").and_then(|v| v.as_i64()),
            local_path: None,
        });
    }
    for kind in ["document", "video", "audio"] {
        if let Some(doc) = msg.get(kind) {
            let file_id = doc.get("file_id")?.as_str()?;
            return Some(Attachment {
                kind: kind.to_string(),
                source_url: Some(format!("{TELEGRAM_FILE_SCHEME}{file_id}")),
                file_name: str_field(doc, "file_name"),
                mime_type: str_field(doc, "mime_type"),
                size: doc.get("file_size").and_then(|v| v.as_i64()),
                local_path: None,
            });
        }
    }
    None
}

fn message_author(msg: &Value) -> Option<String> {
    str_field(msg, "author_signature")
        .or_else(|| {
            msg.get("from")
                .and_then(|f| str_field(f, "username").map(|u| format!("@{u}")))
        })
        .or_else(|| msg.get("from").and_then(|f| str_field(f, "first_name")))
        .or_else(|| msg.get("sender_chat").and_then(chat_display_name))
}

fn message_text(msg: &Value) -> String {
    str_field(msg, "text")
        .or_else(|| str_field(msg, "caption"))
        .unwrap_or_default()
}

pub fn parse_telegram_update(update: &Value) -> Option<InboundMessage> {
    let msg = update
        .get("channel_post")
        .or_else(|| update.get("message"))?;
    let chat = msg.get("chat")?;
    let chat_id = chat.get("id")?.as_i64()?.to_string();
    let msg_id = msg.get("message_id")?.as_i64()?.to_string();
    let channel_name = chat_display_name(chat).unwrap_or_else(|| chat_id.clone());
    let timestamp = unix_to_utc(msg.get("date").and_then(|v| v.as_i64())).unwrap_or_else(Utc::now);

    let mut inbound = InboundMessage::new(
        OriginKind::ChatChannel,
        chat_id,
        channel_name.clone(),
        message_author(msg).unwrap_or(channel_name),
        timestamp,
        message_text(msg),
    )
    .with_message_id(msg_id);
    inbound.attachment = parse_attachment(msg);

    if let Some(reply) = msg.get("reply_to_message") {
        inbound.reply_to = Some(ReplyContext::new(
            message_author(reply).unwrap_or_else(|| "unknown".to_string()),
            unix_to_utc(reply.get("date").and_then(|v| v.as_i64())),
            &message_text(reply),
            parse_attachment(reply).is_some(),
        ));
    }

    Some(inbound)
}

pub async fn resolve_telegram_file_url(
    client: &Client,
    api_base: &str,
    token: &str,
    file_id: &str,
) -> Result<Option<String>> {
    let api_base = api_base.trim_end_matches('/');
    let url = format!("{}/bot{}/getFile", api_base, token);
    let resp = client
        .post(&url)
        .json(&serde_json::json!({"file_id": file_id}))
        .send()
        .await?;
    let value: Value = resp.json().await?;
    if value.get("ok").and_then(|v| v.as_bool()) != Some(true) {
        return Ok(None);
    }
    let file_path = value
        .get("result")
        .and_then(|v| v.get("file_path"))
        .and_then(|v| v.as_str());
    Ok(file_path.map(|p| format!("{}/file/bot{}/{}", api_base, token, p)))
}
