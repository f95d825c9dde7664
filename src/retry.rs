use crate::channels::ClientRegistry;
use crate::config::RetryConfig;
use crate::db::{DeliveryOutcome, MetricsRecorder};
use crate::types::DestinationDescriptor;
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_BACKOFF_EXPONENT: u32 = 16;

/// `initial * 2^attempt`.
pub fn compute_backoff(initial: Duration, attempt: u32) -> Duration {
    let factor = 2_i32.pow(attempt.min(MAX_BACKOFF_EXPONENT));
    initial * factor
}

#[derive(Debug, Clone)]
pub struct RetryItem {
    pub id: Uuid,
    pub destination: DestinationDescriptor,
    /// Already formatted for the destination; never re-derived.
    pub text: String,
    /// Queue-owned copy, removed together with the item.
    pub attachment: Option<PathBuf>,
    pub attempt: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub deferred: usize,
    pub dropped: usize,
}

/// In-memory queue of deliveries that failed their first attempt.
pub struct RetryQueue {
    items: Mutex<Vec<RetryItem>>,
    clients: ClientRegistry,
    max_retries: u32,
    initial_backoff: Duration,
    metrics: Option<MetricsRecorder>,
}

impl RetryQueue {
    pub fn new(clients: ClientRegistry, cfg: &RetryConfig, metrics: Option<MetricsRecorder>) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            clients,
            max_retries: cfg.max_retries,
            initial_backoff: Duration::seconds(cfg.initial_backoff_seconds.max(0)),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RetryItem>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn pending(&self) -> Vec<RetryItem> {
        self.lock().clone()
    }

    pub async fn enqueue(
        &self,
        destination: DestinationDescriptor,
        text: String,
        attachment: Option<&Path>,
        reason: &str,
    ) -> Option<Uuid> {
        self.enqueue_at(destination, text, attachment, reason, Utc::now())
            .await
    }

    /// Queues a failed delivery; the first retry is due at `now + initial_backoff`.
    pub async fn enqueue_at(
        &self,
        destination: DestinationDescriptor,
        text: String,
        attachment: Option<&Path>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<Uuid> {
        if self.max_retries == 0 {
            warn!(destination = %destination.name, reason, "retries disabled, dropping message");
            self.record(&destination.name, DeliveryOutcome::Dropped).await;
            return None;
        }

        let attachment = match attachment {
            Some(path) => adopt_attachment(path).await,
            None => None,
        };
        let item = RetryItem {
            id: Uuid::new_v4(),
            destination,
            text,
            attachment,
            attempt: 0,
            next_retry_at: now + self.initial_backoff,
            last_error: reason.to_string(),
        };
        let id = item.id;
        info!(
            destination = %item.destination.name,
            next_retry_at = %item.next_retry_at,
            reason,
            "queued for retry"
        );
        let name = item.destination.name.clone();
        self.lock().push(item);
        self.record(&name, DeliveryOutcome::Queued).await;
        Some(id)
    }

    /// Attempts every item due at `now`. The lock is released while sending.
    pub async fn process_tick(&self, now: DateTime<Utc>) -> TickReport {
        let due: Vec<RetryItem> = {
            let mut items = self.lock();
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut *items)
                .into_iter()
                .partition(|item| item.next_retry_at <= now);
            *items = waiting;
            due
        };

        let mut report = TickReport::default();
        let mut survivors = Vec::new();
        for mut item in due {
            let client = self.clients.get(item.destination.kind);
            let address = item.destination.address.clone();

            if let Some(until) = client.rate_limited_until(&address, now) {
                debug!(destination = %item.destination.name, %until, "retry deferred by rate limit");
                item.next_retry_at = until;
                report.deferred += 1;
                survivors.push(item);
                continue;
            }

            match client
                .send(&item.text, &address, item.attachment.as_deref())
                .await
            {
                Ok(()) => {
                    info!(
                        destination = %item.destination.name,
                        attempt = item.attempt + 1,
                        "retry delivered"
                    );
                    report.delivered += 1;
                    self.record(&item.destination.name, DeliveryOutcome::Retried)
                        .await;
                    discard_attachment(&item).await;
                }
                Err(err) if item.attempt + 1 >= self.max_retries => {
                    error!(
                        destination = %item.destination.name,
                        attempts = item.attempt + 1,
                        error = %err,
                        "retry budget exhausted, dropping message"
                    );
                    report.dropped += 1;
                    self.record(&item.destination.name, DeliveryOutcome::Dropped)
                        .await;
                    discard_attachment(&item).await;
                }
                Err(err) => {
                    item.attempt += 1;
                    let mut next = now + compute_backoff(self.initial_backoff, item.attempt);
                    let limit = err
                        .retry_at()
                        .or_else(|| client.rate_limited_until(&address, now));
                    if let Some(until) = limit {
                        if until > next {
                            next = until;
                        }
                    }
                    warn!(
                        destination = %item.destination.name,
                        attempt = item.attempt,
                        next_retry_at = %next,
                        error = %err,
                        "retry failed"
                    );
                    item.next_retry_at = next;
                    item.last_error = err.to_string();
                    report.rescheduled += 1;
                    survivors.push(item);
                }
            }
        }

        if !survivors.is_empty() {
            self.lock().extend(survivors);
        }
        report
    }

    /// Empties the queue at shutdown. Returns how many deliveries were lost.
    pub async fn abandon(&self) -> usize {
        let items = std::mem::take(&mut *self.lock());
        for item in &items {
            discard_attachment(item).await;
        }
        if !items.is_empty() {
            warn!(count = items.len(), "abandoning queued retries");
        }
        items.len()
    }

    async fn record(&self, destination: &str, outcome: DeliveryOutcome) {
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.record(destination, outcome).await;
        }
    }
}

async fn adopt_attachment(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy().to_string();
    let copy = path.with_file_name(format!("retry-{}-{}", Uuid::new_v4(), name));
    match tokio::fs::copy(path, &copy).await {
        Ok(_) => Some(copy),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not keep attachment for retry, queuing text only");
            None
        }
    }
}

async fn discard_attachment(item: &RetryItem) {
    if let Some(path) = item.attachment.as_ref() {
        if let Err(err) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), error = %err, "retry attachment already gone");
        }
    }
}

pub async fn start_retry_worker(queue: Arc<RetryQueue>, tick: std::time::Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if queue.size() == 0 {
            continue;
        }
        let report = queue.process_tick(Utc::now()).await;
        if report != TickReport::default() {
            debug!(
                delivered = report.delivered,
                rescheduled = report.rescheduled,
                deferred = report.deferred,
                dropped = report.dropped,
                remaining = queue.size(),
                "retry tick"
            );
        }
    }
}
