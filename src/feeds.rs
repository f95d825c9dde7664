use crate::types::{InboundEnvelope, InboundMessage, OriginKind};
use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

fn tag_pattern() -> &'static Regex {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("valid html tag regex"))
}

pub fn strip_html(input: &str) -> String {
    let text = tag_pattern().replace_all(input, "");
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .trim()
        .to_string()
}

/// Converts a parsed feed into messages, oldest first.
pub fn feed_messages(feed_url: &str, feed: &feed_rs::model::Feed) -> Vec<(String, InboundMessage)> {
    let feed_title = feed
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_else(|| feed_url.to_string());

    let mut out: Vec<(String, InboundMessage)> = feed
        .entries
        .iter()
        .map(|entry| {
            let title = entry.title.as_ref().map(|t| t.content.clone()).unwrap_or_default();
            let summary = entry
                .summary
                .as_ref()
                .map(|s| strip_html(&s.content))
                .unwrap_or_default();
            let text = match (title.is_empty(), summary.is_empty()) {
                (false, false) => format!("{title}\n{summary}"),
                (false, true) => title,
                (true, _) => summary,
            };
            let sender = entry
                .authors
                .first()
                .map(|a| a.name.clone())
                .unwrap_or_else(|| feed_title.clone());
            let timestamp = entry
                .published
                .or(entry.updated)
                .unwrap_or_else(Utc::now);

            let mut message = InboundMessage::new(
                OriginKind::Feed,
                feed_url,
                feed_title.clone(),
                sender,
                timestamp,
                text,
            )
            .with_message_id(entry.id.clone());
            if let Some(link) = entry.links.first() {
                message.metadata.insert("link".to_string(), link.href.clone());
            }
            (entry.id.clone(), message)
        })
        .collect();

    out.sort_by_key(|(_, m)| m.timestamp);
    out
}

/// Seen-entry bookkeeping for every polled feed.
#[derive(Debug, Default)]
pub struct FeedState {
    seen: HashMap<String, HashSet<String>>,
}

impl FeedState {
    /// Envelopes to emit for one poll. The first poll of a feed only marks its
    /// entries as seen and emits the newest one as a connection proof.
    pub fn fresh_envelopes(
        &mut self,
        feed_url: &str,
        entries: Vec<(String, InboundMessage)>,
    ) -> Vec<InboundEnvelope> {
        if let Some(seen) = self.seen.get_mut(feed_url) {
            if entries.is_empty() {
                return Vec::new();
            }
            let mut current = HashSet::with_capacity(entries.len());
            let fresh = entries
                .into_iter()
                .filter(|(id, _)| current.insert(id.clone()) && !seen.contains(id))
                .map(|(_, m)| InboundEnvelope::new(m))
                .collect();
            // only ids the feed still lists can come back
            *seen = current;
            return fresh;
        }

        let seen: HashSet<String> = entries.iter().map(|(id, _)| id.clone()).collect();
        self.seen.insert(feed_url.to_string(), seen);
        entries
            .into_iter()
            .last()
            .map(|(_, m)| vec![InboundEnvelope::connection_proof(m)])
            .unwrap_or_default()
    }

    pub fn seen_count(&self, feed_url: &str) -> usize {
        self.seen.get(feed_url).map(HashSet::len).unwrap_or(0)
    }
}

async fn fetch_feed(http: &Client, feed_url: &str) -> Result<feed_rs::model::Feed> {
    let resp = http
        .get(feed_url)
        .header("User-Agent", "channel-relay/0.1")
        .send()
        .await
        .context("feed fetch failed")?
        .error_for_status()
        .context("feed returned error status")?;
    let bytes = resp.bytes().await.context("failed to read feed body")?;
    feed_rs::parser::parse(&bytes[..]).context("failed to parse feed")
}

pub async fn start_feed_poller(
    http: Client,
    feeds: Vec<String>,
    tx: mpsc::Sender<InboundEnvelope>,
    interval_seconds: u64,
) {
    let mut state = FeedState::default();
    info!(feeds = feeds.len(), "feed poller started");
    loop {
        for feed_url in &feeds {
            match fetch_feed(&http, feed_url).await {
                Ok(feed) => {
                    let entries = feed_messages(feed_url, &feed);
                    let envelopes = state.fresh_envelopes(feed_url, entries);
                    debug!(feed = %feed_url, new = envelopes.len(), "feed polled");
                    for envelope in envelopes {
                        if tx.send(envelope).await.is_err() {
                            info!("inbound channel closed, stopping feed poller");
                            return;
                        }
                    }
                }
                Err(err) => warn!(feed = %feed_url, error = ?err, "feed poll failed"),
            }
        }
        sleep(Duration::from_secs(interval_seconds.max(1))).await;
    }
}
