#[path = "../common/mod.rs"]
mod common;

use channel_relay::config::{AttachmentConfig, ChannelEntry, DestinationConfig, RetryConfig};
use channel_relay::enrich::{AllowList, AttachmentDownloader, TextExtractor};
use channel_relay::pipeline::{run_pipeline, AttachmentNote, Pipeline};
use channel_relay::retry::RetryQueue;
use channel_relay::router::Router;
use channel_relay::types::{
    Attachment, DestinationKind, InboundEnvelope, InboundMessage, OriginKind, TransformConfig,
};
use chrono::Utc;
use common::{
    destination, entry, CountingExtractor, Fakes, PanickingExtractor, Scripted, TempDownloader,
};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Harness {
    pipeline: Pipeline,
    retry: Arc<RetryQueue>,
}

fn harness(
    fakes: &Fakes,
    destinations: Vec<DestinationConfig>,
    downloader: Arc<dyn AttachmentDownloader>,
    extractor: Arc<dyn TextExtractor>,
) -> Harness {
    let retry = Arc::new(RetryQueue::new(fakes.registry(), &RetryConfig::default(), None));
    let pipeline = Pipeline::new(
        Router::new(destinations),
        fakes.registry(),
        retry.clone(),
        downloader,
        extractor,
        AllowList::from_config(&AttachmentConfig::default()),
    );
    Harness { pipeline, retry }
}

fn chat(text: &str) -> InboundMessage {
    InboundMessage::new(OriginKind::ChatChannel, "-1001", "@alerts", "analyst", Utc::now(), text)
        .with_message_id("42")
}

fn attachment(name: &str, mime: &str) -> Attachment {
    Attachment {
        kind: "document".to_string(),
        source_url: Some(format!("https://cdn.test/{name}")),
        file_name: Some(name.to_string()),
        mime_type: Some(mime.to_string()),
        size: None,
        local_path: None,
    }
}

fn ocr_entry(keywords: &[&str]) -> ChannelEntry {
    ChannelEntry {
        ocr: true,
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        ..entry("@alerts")
    }
}

#[tokio::test]
async fn test_text_message_fans_out() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let downloader = TempDownloader::new(dir.path());
    let h = harness(
        &fakes,
        vec![
            destination("A", DestinationKind::Discord, entry("@alerts")),
            destination("B", DestinationKind::Slack, entry("@alerts")),
        ],
        downloader.clone(),
        CountingExtractor::new(None),
    );

    let report = h.pipeline.handle(chat("hello"), false).await;
    assert_eq!(report.delivered, vec!["A", "B"]);
    assert!(report.queued.is_empty());
    assert_eq!(downloader.calls(), 0);

    let sent = fakes.discord.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "[A] hello");
    assert!(sent[0].attachment.is_none());
    assert_eq!(fakes.slack.sent().len(), 1);
}

#[tokio::test]
async fn test_ocr_and_download_happen_once_for_many_destinations() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let downloader = TempDownloader::new(dir.path());
    let extractor = CountingExtractor::new(Some("INVOICE 2024"));
    let h = harness(
        &fakes,
        vec![
            destination("A", DestinationKind::Discord, ocr_entry(&["invoice"])),
            destination("B", DestinationKind::Telegram, ocr_entry(&["invoice"])),
        ],
        downloader.clone(),
        extractor.clone(),
    );

    let mut photo = attachment("scan.png", "image/png");
    photo.kind = "photo".to_string();
    let report = h
        .pipeline
        .handle(chat("see image").with_attachment(photo), false)
        .await;

    assert_eq!(report.delivered, vec!["A", "B"]);
    assert_eq!(extractor.calls(), 1);
    assert_eq!(downloader.calls(), 1);

    let discord = fakes.discord.sent();
    let telegram = fakes.telegram.sent();
    assert!(discord[0].attachment_existed);
    assert!(telegram[0].attachment_existed);
    assert_eq!(discord[0].attachment, telegram[0].attachment);

    // the shared download is removed once every destination has been handled
    let path = discord[0].attachment.clone().unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_restricted_destination_gets_note_instead_of_file() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let downloader = TempDownloader::new(dir.path());
    let restricted = ChannelEntry {
        restricted_mode: true,
        ..entry("@alerts")
    };
    let h = harness(
        &fakes,
        vec![
            destination("strict", DestinationKind::Discord, restricted),
            destination("open", DestinationKind::Telegram, entry("@alerts")),
        ],
        downloader.clone(),
        CountingExtractor::new(None),
    );

    let msg = chat("payload attached").with_attachment(attachment("dropper.exe", "application/x-msdownload"));
    let report = h.pipeline.handle(msg, false).await;
    assert_eq!(report.delivered, vec!["strict", "open"]);
    assert_eq!(downloader.calls(), 1);

    let strict = &fakes.discord.sent()[0];
    assert!(strict.attachment.is_none());
    assert!(strict.text.ends_with(&AttachmentNote::Restricted.to_string()));

    let open = &fakes.telegram.sent()[0];
    assert!(open.attachment_existed);
    assert!(!open.text.contains("attachment"));
}

#[tokio::test]
async fn test_restricted_destination_accepts_allowed_file() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let restricted = ChannelEntry {
        restricted_mode: true,
        ..entry("@alerts")
    };
    let h = harness(
        &fakes,
        vec![destination("strict", DestinationKind::Discord, restricted)],
        TempDownloader::new(dir.path()),
        CountingExtractor::new(None),
    );

    let msg = chat("report").with_attachment(attachment("report.pdf", "application/pdf"));
    h.pipeline.handle(msg, false).await;
    assert!(fakes.discord.sent()[0].attachment_existed);
}

#[tokio::test]
async fn test_webhook_without_file_support_skips_download() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let downloader = TempDownloader::new(dir.path());
    let h = harness(
        &fakes,
        vec![destination("ops", DestinationKind::Slack, entry("@alerts"))],
        downloader.clone(),
        CountingExtractor::new(None),
    );

    let msg = chat("file inside").with_attachment(attachment("report.pdf", "application/pdf"));
    h.pipeline.handle(msg, false).await;
    assert_eq!(downloader.calls(), 0);
    let sent = &fakes.slack.sent()[0];
    assert!(sent.text.ends_with(&AttachmentNote::Unsupported.to_string()));
}

#[tokio::test]
async fn test_failed_download_falls_back_to_text() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &fakes,
        vec![destination("A", DestinationKind::Discord, entry("@alerts"))],
        TempDownloader::failing(dir.path()),
        CountingExtractor::new(None),
    );

    let msg = chat("with file").with_attachment(attachment("report.pdf", "application/pdf"));
    let report = h.pipeline.handle(msg, false).await;
    assert_eq!(report.delivered, vec!["A"]);
    let sent = &fakes.discord.sent()[0];
    assert!(sent.attachment.is_none());
    assert!(sent.text.ends_with(&AttachmentNote::Unavailable.to_string()));
}

#[tokio::test]
async fn test_failed_send_is_queued_with_formatted_text() {
    let fakes = Fakes::new();
    fakes.discord.push(Scripted::Fail);
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &fakes,
        vec![
            destination("A", DestinationKind::Discord, entry("@alerts")),
            destination("B", DestinationKind::Slack, entry("@alerts")),
        ],
        TempDownloader::new(dir.path()),
        CountingExtractor::new(None),
    );

    let report = h.pipeline.handle(chat("hello"), false).await;
    assert_eq!(report.queued, vec!["A"]);
    assert_eq!(report.delivered, vec!["B"]);

    let pending = h.retry.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].destination.name, "A");
    assert_eq!(pending[0].text, "[A] hello");
    assert_eq!(pending[0].attempt, 0);
}

#[tokio::test]
async fn test_queued_attachment_survives_cleanup() {
    let fakes = Fakes::new();
    fakes.discord.push(Scripted::RateLimit(30.0));
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &fakes,
        vec![destination("A", DestinationKind::Discord, entry("@alerts"))],
        TempDownloader::new(dir.path()),
        CountingExtractor::new(None),
    );

    let msg = chat("file").with_attachment(attachment("report.pdf", "application/pdf"));
    h.pipeline.handle(msg, false).await;

    let pending = h.retry.pending();
    let copy = pending[0].attachment.clone().unwrap();
    assert!(copy.exists());
    assert!(!dir.path().join("download-0.pdf").exists());
}

#[tokio::test]
async fn test_panicking_destination_is_isolated() {
    let fakes = Fakes::new();
    fakes.discord.push(Scripted::Panic);
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &fakes,
        vec![
            destination("A", DestinationKind::Discord, entry("@alerts")),
            destination("B", DestinationKind::Telegram, entry("@alerts")),
        ],
        TempDownloader::new(dir.path()),
        CountingExtractor::new(None),
    );

    let msg = chat("file").with_attachment(attachment("report.pdf", "application/pdf"));
    let report = h.pipeline.handle(msg, false).await;
    assert_eq!(report.failed, vec!["A"]);
    assert_eq!(report.delivered, vec!["B"]);
    assert!(!dir.path().join("download-0.pdf").exists());
}

#[tokio::test]
async fn test_transform_applies_per_destination() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let trimmed = ChannelEntry {
        parser: Some(TransformConfig {
            trim_front_lines: 1,
            trim_back_lines: 1,
        }),
        ..entry("@alerts")
    };
    let h = harness(
        &fakes,
        vec![
            destination("A", DestinationKind::Discord, trimmed),
            destination("B", DestinationKind::Slack, entry("@alerts")),
        ],
        TempDownloader::new(dir.path()),
        CountingExtractor::new(None),
    );

    h.pipeline
        .handle(chat("header\nbody line\nfooter"), false)
        .await;
    assert_eq!(fakes.discord.sent()[0].text, "[A] body line");
    assert_eq!(fakes.slack.sent()[0].text, "[B] header\nbody line\nfooter");
}

#[tokio::test]
async fn test_connection_proof_is_not_delivered() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &fakes,
        vec![destination("A", DestinationKind::Discord, entry("@alerts"))],
        TempDownloader::new(dir.path()),
        CountingExtractor::new(None),
    );

    let report = h.pipeline.handle(chat("first entry"), true).await;
    assert!(report.delivered.is_empty());
    assert_eq!(fakes.discord.calls(), 0);
}

#[tokio::test]
async fn test_unrouted_message_is_dropped_quietly() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &fakes,
        vec![destination("A", DestinationKind::Discord, entry("@elsewhere"))],
        TempDownloader::new(dir.path()),
        CountingExtractor::new(None),
    );

    let report = h.pipeline.handle(chat("hello"), false).await;
    assert_eq!(report, Default::default());
    assert_eq!(fakes.discord.calls(), 0);
}

#[tokio::test]
async fn test_enrichment_reaches_formatter() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &fakes,
        vec![destination("A", DestinationKind::Discord, ocr_entry(&[]))],
        TempDownloader::new(dir.path()),
        CountingExtractor::new(Some("login panel")),
    );

    let mut photo = attachment("shot.jpg", "image/jpeg");
    photo.kind = "photo".to_string();
    h.pipeline
        .handle(chat("hello").with_attachment(photo), false)
        .await;

    let formatted = fakes.discord.formatted();
    assert_eq!(formatted.len(), 1);
    let msg = &formatted[0];
    assert!(msg.ocr_enabled);
    assert_eq!(msg.ocr_text.as_deref(), Some("login panel"));
    assert_eq!(
        msg.metadata.get("src").map(String::as_str),
        Some("hxxps://t[.]me/alerts/42")
    );
}

#[tokio::test]
async fn test_non_image_attachment_skips_ocr() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let extractor = CountingExtractor::new(Some("never"));
    let h = harness(
        &fakes,
        vec![destination("A", DestinationKind::Discord, ocr_entry(&[]))],
        TempDownloader::new(dir.path()),
        extractor.clone(),
    );

    let msg = chat("doc").with_attachment(attachment("report.pdf", "application/pdf"));
    h.pipeline.handle(msg, false).await;
    assert_eq!(extractor.calls(), 0);
    assert!(fakes.discord.formatted()[0].ocr_text.is_none());
}

#[tokio::test]
async fn test_run_pipeline_drains_channel() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &fakes,
        vec![destination("A", DestinationKind::Discord, entry("@alerts"))],
        TempDownloader::new(dir.path()),
        CountingExtractor::new(None),
    );

    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(run_pipeline(Arc::new(h.pipeline), rx));
    tx.send(InboundEnvelope::connection_proof(chat("proof"))).await.unwrap();
    tx.send(InboundEnvelope::new(chat("one"))).await.unwrap();
    tx.send(InboundEnvelope::new(chat("two"))).await.unwrap();
    drop(tx);
    task.await.unwrap();

    let texts: Vec<String> = fakes.discord.sent().into_iter().map(|s| s.text).collect();
    assert_eq!(texts, vec!["[A] one", "[A] two"]);
}

#[tokio::test]
async fn test_panic_during_enrichment_still_cleans_up() {
    let fakes = Fakes::new();
    let dir = tempfile::tempdir().unwrap();
    let downloader = TempDownloader::new(dir.path());
    let h = harness(
        &fakes,
        vec![destination("A", DestinationKind::Discord, ocr_entry(&[]))],
        downloader.clone(),
        Arc::new(PanickingExtractor),
    );

    let mut photo = attachment("scan.png", "image/png");
    photo.kind = "photo".to_string();
    let report = h
        .pipeline
        .handle(chat("see image").with_attachment(photo), false)
        .await;

    assert!(report.delivered.is_empty());
    assert!(report.queued.is_empty());
    assert_eq!(downloader.calls(), 1);
    assert!(fakes.discord.sent().is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
