//! Per-message orchestration: enrichment, routing, attachment policy and
//! per-destination dispatch.
//!
//! OCR and the attachment download happen at most once per message. Everything
//! destination-specific happens inside `dispatch_one`, run under `catch_unwind`.

use crate::channels::ClientRegistry;
use crate::db::{DeliveryOutcome, MetricsRecorder};
use crate::enrich::{canonical_link, defang, AllowList, AttachmentDownloader, TextExtractor};
use crate::retry::RetryQueue;
use crate::router::Router;
use crate::types::{DestinationDescriptor, InboundEnvelope, InboundMessage};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub use crate::types::AttachmentNote;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub queued: Vec<String>,
    pub failed: Vec<String>,
}

enum Dispatch {
    Sent,
    Queued,
}

pub struct Pipeline {
    router: Router,
    clients: ClientRegistry,
    retry: Arc<RetryQueue>,
    downloader: Arc<dyn AttachmentDownloader>,
    extractor: Arc<dyn TextExtractor>,
    allow_list: AllowList,
    metrics: Option<MetricsRecorder>,
}

impl Pipeline {
    pub fn new(
        router: Router,
        clients: ClientRegistry,
        retry: Arc<RetryQueue>,
        downloader: Arc<dyn AttachmentDownloader>,
        extractor: Arc<dyn TextExtractor>,
        allow_list: AllowList,
    ) -> Self {
        Self {
            router,
            clients,
            retry,
            downloader,
            extractor,
            allow_list,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Processes one inbound message to completion. Failed sends are queued
    /// for retry; a panic is logged and yields an empty report.
    pub async fn handle(&self, message: InboundMessage, is_connection_proof: bool) -> DeliveryReport {
        let mut message = message;
        if is_connection_proof {
            info!(
                channel = %message.channel_name,
                channel_id = %message.channel_id,
                "connection confirmed for origin"
            );
            self.cleanup(&message).await;
            return DeliveryReport::default();
        }

        let outcome = AssertUnwindSafe(self.process(&mut message))
            .catch_unwind()
            .await;
        let report = match outcome {
            Ok(report) => report,
            Err(_) => {
                error!(
                    channel = %message.channel_name,
                    sender = %message.sender,
                    "message processing panicked"
                );
                DeliveryReport::default()
            }
        };

        self.cleanup(&message).await;
        report
    }

    async fn process(&self, message: &mut InboundMessage) -> DeliveryReport {
        self.enrich(message).await;

        let destinations = self.router.route(message);
        if destinations.is_empty() {
            return DeliveryReport::default();
        }

        let attachment_ok = message
            .attachment
            .as_ref()
            .map(|a| self.allow_list.permits(a))
            .unwrap_or(false);
        let accepts = |dest: &DestinationDescriptor| !dest.restricted_mode || attachment_ok;

        if message.attachment.is_some() && message.attachment_path().is_none() {
            let wanted = destinations
                .iter()
                .any(|d| accepts(d) && self.clients.get(d.kind).supports_attachments());
            if wanted {
                self.ensure_downloaded(message).await;
            }
        }

        let message = &*message;
        let mut report = DeliveryReport::default();
        for dest in &destinations {
            let client = self.clients.get(dest.kind);
            let (attachment, note) = match message.attachment.as_ref() {
                None => (None, None),
                Some(_) if !accepts(dest) => (None, Some(AttachmentNote::Restricted)),
                Some(_) if !client.supports_attachments() => {
                    (None, Some(AttachmentNote::Unsupported))
                }
                Some(_) => match message.attachment_path() {
                    Some(path) => (Some(path.clone()), None),
                    None => (None, Some(AttachmentNote::Unavailable)),
                },
            };

            let result = AssertUnwindSafe(self.dispatch_one(message, dest, attachment, note))
                .catch_unwind()
                .await;
            match result {
                Ok(Dispatch::Sent) => report.delivered.push(dest.name.clone()),
                Ok(Dispatch::Queued) => report.queued.push(dest.name.clone()),
                Err(_) => {
                    error!(
                        destination = %dest.name,
                        channel = %message.channel_name,
                        sender = %message.sender,
                        "destination dispatch panicked"
                    );
                    report.failed.push(dest.name.clone());
                }
            }
        }
        report
    }

    /// OCR (at most once per message) and the provenance link.
    async fn enrich(&self, message: &mut InboundMessage) {
        let wants_ocr = message
            .attachment
            .as_ref()
            .map(|a| a.is_image())
            .unwrap_or(false)
            && self.router.ocr_requested(message)
            && self.extractor.is_available();

        if wants_ocr {
            message.ocr_enabled = true;
            if let Some(path) = self.ensure_downloaded(message).await {
                match self.extractor.extract_text(&path).await {
                    Some(text) => {
                        debug!(chars = text.len(), "ocr text extracted");
                        message.ocr_text = Some(text);
                    }
                    None => debug!("ocr produced no text"),
                }
            }
        }

        if let Some(link) = canonical_link(message) {
            message.metadata.insert("src".to_string(), defang(&link));
        }
    }

    /// Downloads the attachment unless that already happened for this message.
    async fn ensure_downloaded(&self, message: &mut InboundMessage) -> Option<PathBuf> {
        if let Some(path) = message.attachment_path() {
            return Some(path.clone());
        }
        let path = self.downloader.download(message).await;
        match (path, message.attachment.as_mut()) {
            (Some(path), Some(attachment)) => {
                attachment.local_path = Some(path.clone());
                Some(path)
            }
            (None, _) => {
                warn!(channel = %message.channel_name, "attachment unavailable, continuing text-only");
                None
            }
            (Some(_), None) => None,
        }
    }

    async fn dispatch_one(
        &self,
        message: &InboundMessage,
        dest: &DestinationDescriptor,
        attachment: Option<PathBuf>,
        note: Option<AttachmentNote>,
    ) -> Dispatch {
        let client = self.clients.get(dest.kind);
        let parsed = Router::parse_msg(message, dest.transform.as_ref());
        let mut text = client.format_message(&parsed, dest);
        if let Some(note) = note {
            text.push_str("\n\n");
            text.push_str(&note.to_string());
        }

        match client.send(&text, &dest.address, attachment.as_deref()).await {
            Ok(()) => {
                info!(
                    destination = %dest.name,
                    kind = %dest.kind,
                    channel = %message.channel_name,
                    keywords = ?dest.matched_keywords,
                    "message delivered"
                );
                self.record(&dest.name, DeliveryOutcome::Sent).await;
                Dispatch::Sent
            }
            Err(err) => {
                warn!(
                    destination = %dest.name,
                    kind = %dest.kind,
                    error = %err,
                    "delivery failed, handing to retry queue"
                );
                self.retry
                    .enqueue(dest.clone(), text, attachment.as_deref(), &err.to_string())
                    .await;
                Dispatch::Queued
            }
        }
    }

    async fn cleanup(&self, message: &InboundMessage) {
        if let Some(path) = message.attachment_path() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "attachment removed"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "attachment cleanup failed"),
            }
        }
    }

    async fn record(&self, destination: &str, outcome: DeliveryOutcome) {
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.record(destination, outcome).await;
        }
    }
}

/// Drains the inbound channel, one message at a time.
pub async fn run_pipeline(pipeline: Arc<Pipeline>, mut rx: mpsc::Receiver<InboundEnvelope>) {
    while let Some(envelope) = rx.recv().await {
        pipeline
            .handle(envelope.message, envelope.connection_proof)
            .await;
    }
    info!("inbound channel closed, pipeline stopped");
}
