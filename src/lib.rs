pub mod channels;
pub mod config;
pub mod db;
pub mod enrich;
pub mod error;
pub mod feeds;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod types;

pub use config::Config;

use self::channels::discord::DiscordClient;
use self::channels::slack::SlackClient;
use self::channels::telegram::{self as telegram_channel, TelegramClient};
use self::channels::ClientRegistry;
use self::config::{resolve_database_url, resolve_download_dir};
use self::db::{MetricRecord, MetricsRecorder};
use self::enrich::{AllowList, HttpDownloader, NoopExtractor, TesseractExtractor, TextExtractor};
use self::pipeline::Pipeline;
use self::retry::RetryQueue;
use self::types::{InboundEnvelope, InboundMessage};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router as HttpRouter,
};
use serde::Serialize;
use serde_json::json;
use sqlx::AnyPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

pub const TOKEN_HEADER: &str = "X-Channel-Relay-Token";
const INBOUND_BUFFER: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pipeline: Arc<Pipeline>,
    pub retry: Arc<RetryQueue>,
    pub metrics: Option<MetricsRecorder>,
    pub inbound_tx: mpsc::Sender<InboundEnvelope>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub retry_queue: usize,
    pub destinations: usize,
    pub metrics: Vec<MetricRecord>,
}

pub fn build_clients(config: &Config, http: &reqwest::Client) -> ClientRegistry {
    let telegram = &config.origins.telegram;
    ClientRegistry::new(
        Arc::new(DiscordClient::new(http.clone())),
        Arc::new(SlackClient::new(http.clone())),
        Arc::new(TelegramClient::new(
            http.clone(),
            telegram.api_base_url.clone(),
            telegram.bot_token.clone(),
        )),
    )
}

pub fn build_pipeline(
    config: &Config,
    http: &reqwest::Client,
    metrics: Option<MetricsRecorder>,
) -> (Arc<Pipeline>, Arc<RetryQueue>) {
    let clients = build_clients(config, http);
    let retry = Arc::new(RetryQueue::new(clients.clone(), &config.retry, metrics.clone()));
    let extractor: Arc<dyn TextExtractor> = if config.ocr.enabled {
        Arc::new(TesseractExtractor::new(&config.ocr))
    } else {
        Arc::new(NoopExtractor)
    };
    let downloader = Arc::new(HttpDownloader::new(
        http.clone(),
        resolve_download_dir(config),
        config.origins.telegram.api_base_url.clone(),
        config.origins.telegram.bot_token.clone(),
    ));

    let mut pipeline = Pipeline::new(
        router::Router::new(config.destinations.clone()),
        clients,
        retry.clone(),
        downloader,
        extractor,
        AllowList::from_config(&config.attachments),
    );
    if let Some(metrics) = metrics {
        pipeline = pipeline.with_metrics(metrics);
    }
    (Arc::new(pipeline), retry)
}

/// Connects storage, spawns the retry worker, the pipeline consumer and the
/// enabled origins, and returns the HTTP surface.
pub async fn create_app(config: Config) -> anyhow::Result<(AppState, HttpRouter)> {
    sqlx::any::install_default_drivers();
    config.validate();

    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;
    let metrics = MetricsRecorder::new(pool, db_kind);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let (pipeline, retry) = build_pipeline(&config, &http, Some(metrics.clone()));

    let (tx, rx) = mpsc::channel::<InboundEnvelope>(INBOUND_BUFFER);
    tokio::spawn(pipeline::run_pipeline(pipeline.clone(), rx));
    tokio::spawn(retry::start_retry_worker(
        retry.clone(),
        Duration::from_millis(config.retry.tick_interval_ms.max(1)),
    ));

    let telegram = &config.origins.telegram;
    if telegram.enabled {
        match telegram.bot_token.clone() {
            Some(token) => {
                tokio::spawn(telegram_channel::start_telegram_poller(
                    http.clone(),
                    telegram.api_base_url.clone(),
                    token,
                    tx.clone(),
                    telegram.poll_interval_seconds,
                ));
            }
            None => error!("telegram origin enabled without a bot token"),
        }
    }

    let rss = &config.origins.rss;
    if rss.enabled && !rss.feeds.is_empty() {
        tokio::spawn(feeds::start_feed_poller(
            http.clone(),
            rss.feeds.clone(),
            tx.clone(),
            rss.poll_interval_seconds,
        ));
    }

    info!(
        destinations = config.destinations.len(),
        db = ?db_kind,
        "channel relay started"
    );

    let state = AppState {
        config,
        pipeline,
        retry,
        metrics: Some(metrics),
        inbound_tx: tx,
    };
    let app = build_router(state.clone());
    Ok((state, app))
}

pub fn build_router(state: AppState) -> HttpRouter {
    let authed_routes = HttpRouter::new()
        .route("/v1/inbound", post(inbound))
        .route("/v1/route", post(route_preview))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = HttpRouter::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status));

    HttpRouter::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.auth.token.as_ref() {
        let header = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = match state.metrics.as_ref() {
        Some(recorder) => recorder.snapshot().await.unwrap_or_else(|err| {
            error!(error = %err, "failed to read metrics");
            Vec::new()
        }),
        None => Vec::new(),
    };
    Json(StatusResponse {
        retry_queue: state.retry.size(),
        destinations: state.config.destinations.len(),
        metrics,
    })
}

async fn inbound(
    State(state): State<AppState>,
    Json(envelope): Json<InboundEnvelope>,
) -> impl IntoResponse {
    match state.inbound_tx.send(envelope).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "pipeline is not accepting messages"})),
        )
            .into_response(),
    }
}

async fn route_preview(
    State(state): State<AppState>,
    Json(message): Json<InboundMessage>,
) -> impl IntoResponse {
    Json(state.pipeline.router().route(&message))
}
