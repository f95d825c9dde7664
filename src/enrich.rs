//! Collaborators that run before routing: attachment download, OCR, and
//! provenance links, plus the restricted-mode allow-list.

use crate::channels::telegram::{resolve_telegram_file_url, TELEGRAM_FILE_SCHEME};
use crate::config::{AttachmentConfig, OcrConfig};
use crate::types::{Attachment, InboundMessage, OriginKind};
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use reqwest::Client;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// OCR engine boundary. `None` means "no enrichment", never an error.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    fn is_available(&self) -> bool;
    async fn extract_text(&self, path: &Path) -> Option<String>;
}

/// Fetches a message's attachment to local disk. `None` means nothing could be retrieved.
#[async_trait]
pub trait AttachmentDownloader: Send + Sync {
    async fn download(&self, message: &InboundMessage) -> Option<PathBuf>;
}

/// Runs the `tesseract` CLI.
pub struct TesseractExtractor {
    command: String,
    language: String,
    available: bool,
}

impl TesseractExtractor {
    pub fn new(cfg: &OcrConfig) -> Self {
        let available = cfg.enabled && command_on_path(&cfg.command);
        if cfg.enabled && !available {
            warn!(command = %cfg.command, "ocr enabled but command not found on PATH");
        }
        Self {
            command: cfg.command.clone(),
            language: cfg.language.clone(),
            available,
        }
    }
}

fn command_on_path(command: &str) -> bool {
    let candidate = Path::new(command);
    if candidate.is_absolute() {
        return candidate.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
        .unwrap_or(false)
}

#[async_trait]
impl TextExtractor for TesseractExtractor {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn extract_text(&self, path: &Path) -> Option<String> {
        let output = Command::new(&self.command)
            .arg(path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            Ok(out) => {
                warn!(
                    status = ?out.status.code(),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "ocr failed"
                );
                None
            }
            Err(err) => {
                warn!(error = %err, "ocr command could not run");
                None
            }
        }
    }
}

/// Used when OCR is switched off entirely.
pub struct NoopExtractor;

#[async_trait]
impl TextExtractor for NoopExtractor {
    fn is_available(&self) -> bool {
        false
    }

    async fn extract_text(&self, _path: &Path) -> Option<String> {
        None
    }
}

/// Downloads attachments over HTTP, resolving bot API file ids first.
pub struct HttpDownloader {
    http: Client,
    download_dir: PathBuf,
    telegram_api_base: String,
    telegram_token: Option<String>,
}

impl HttpDownloader {
    pub fn new(
        http: Client,
        download_dir: PathBuf,
        telegram_api_base: String,
        telegram_token: Option<String>,
    ) -> Self {
        Self {
            http,
            download_dir,
            telegram_api_base,
            telegram_token,
        }
    }

    async fn resolve_url(&self, source: &str) -> Option<String> {
        let Some(file_id) = source.strip_prefix(TELEGRAM_FILE_SCHEME) else {
            return Some(source.to_string());
        };
        let token = self.telegram_token.as_ref()?;
        match resolve_telegram_file_url(&self.http, &self.telegram_api_base, token, file_id).await {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "telegram getFile failed");
                None
            }
        }
    }

    async fn fetch(&self, attachment: &Attachment) -> anyhow::Result<Option<PathBuf>> {
        let Some(source) = attachment.source_url.as_deref() else {
            return Ok(None);
        };
        let Some(url) = self.resolve_url(source).await else {
            return Ok(None);
        };
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        let bytes = resp.bytes().await?;

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let ext = attachment
            .extension()
            .or_else(|| extension_from_url(&url))
            .unwrap_or_else(|| "bin".to_string());
        let path = self
            .download_dir
            .join(format!("{}.{}", uuid::Uuid::new_v4(), ext));
        tokio::fs::write(&path, &bytes).await?;
        Ok(Some(path))
    }
}

fn extension_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let last = parsed.path_segments()?.last()?.to_string();
    let decoded = percent_decode_str(&last).decode_utf8_lossy().to_string();
    decoded
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8)
}

#[async_trait]
impl AttachmentDownloader for HttpDownloader {
    async fn download(&self, message: &InboundMessage) -> Option<PathBuf> {
        let attachment = message.attachment.as_ref()?;
        if let Some(existing) = attachment.local_path.as_ref().filter(|p| p.exists()) {
            return Some(existing.clone());
        }
        match self.fetch(attachment).await {
            Ok(path) => {
                debug!(path = ?path, "attachment downloaded");
                path
            }
            Err(err) => {
                warn!(channel = %message.channel_name, error = %err, "attachment download failed");
                None
            }
        }
    }
}

/// Restricted-mode admission: both the extension and the MIME type must be listed.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    extensions: HashSet<String>,
    mime_types: HashSet<String>,
}

impl AllowList {
    pub fn new<E, M>(extensions: E, mime_types: M) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        M: IntoIterator,
        M::Item: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
            mime_types: mime_types
                .into_iter()
                .map(|m| m.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn from_config(cfg: &AttachmentConfig) -> Self {
        Self::new(&cfg.allowed_extensions, &cfg.allowed_mime_types)
    }

    pub fn permits(&self, attachment: &Attachment) -> bool {
        let ext_ok = attachment
            .extension()
            .map(|ext| self.extensions.contains(&ext))
            .unwrap_or(false);
        let mime_ok = attachment
            .mime_type
            .as_deref()
            .map(|mime| {
                let base = mime.split(';').next().unwrap_or(mime).trim().to_lowercase();
                self.mime_types.contains(&base)
            })
            .unwrap_or(false);
        ext_ok && mime_ok
    }
}

/// Public link to the message at its origin, if one can be built.
pub fn canonical_link(message: &InboundMessage) -> Option<String> {
    match message.origin {
        OriginKind::ChatChannel => {
            let username = message.channel_name.strip_prefix('@')?;
            let id = message.message_id.as_deref()?;
            Some(format!("https://t.me/{}/{}", username, id))
        }
        OriginKind::Feed => message
            .metadata
            .get("link")
            .cloned()
            .or_else(|| {
                message
                    .channel_id
                    .starts_with("http")
                    .then(|| message.channel_id.clone())
            }),
    }
}

/// Makes a URL non-clickable: `http` becomes `hxxp` and dots in the host become `[.]`.
pub fn defang(link: &str) -> String {
    let (scheme, rest) = match link.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, link),
    };
    let (host, tail) = match rest.find(['/', '?', '#']) {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    let host = host.replace('.', "[.]");
    match scheme {
        Some(scheme) => format!("{}://{}{}", scheme.replacen("http", "hxxp", 1), host, tail),
        None => format!("{}{}", host, tail),
    }
}
