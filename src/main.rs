mod catalog;
mod config;
mod credentials;
mod dimensions;
mod harvest;
mod http;
mod images;
mod jobs;
mod marketplace;
mod metrics;
mod models;
mod normalize;
mod pipeline;
mod queue;
mod resolver;
mod store;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use catalog::{PlatformReference, ReferenceData};
use config::HarvesterConfig;
use credentials::CredentialPool;
use eyre::WrapErr;
use harvest::{Harvest, Harvester};
use images::HttpImageHasher;
use jobs::{JobError, JobInfo, JobQueue};
use marketplace::{
    RakutenClient, YahooClient, rakuten::RakutenConfig, yahoo::YahooConfig,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, Platform};
use pipeline::IngestPipeline;
use queue::{MessageBus, Publisher, RedisStreams};
use resolver::Resolver;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use store::{DualSinkWriter, HttpSearchIndex, RowStore, SearchIndex, SupabaseRowStore};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "harvester.api", "harvester crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = HarvesterConfig::from_env()?;
    let reference = match &config.reference_path {
        Some(path) => config::load_reference(path)?,
        None => {
            warn!(target = "harvester.api", "REFERENCE_DATA_PATH not set; category and tag tables are empty");
            ReferenceData::default()
        }
    };
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;
    let http = http::build_client(config.http_timeout, config.http_connect_timeout);
    let shutdown = CancellationToken::new();

    let redis = redis::Client::open(config.redis_url.as_str()).wrap_err("parsing REDIS_URL")?;
    let bus: Arc<dyn MessageBus> = Arc::new(
        RedisStreams::connect(&redis, config.streams.clone())
            .await
            .wrap_err("connecting to redis streams")?,
    );
    let (publisher, publisher_task) = Publisher::spawn(bus.clone(), config.publisher.clone());

    let rows: Arc<dyn RowStore> = Arc::new(SupabaseRowStore::new(http.clone(), config.rows.clone()));
    let search: Arc<dyn SearchIndex> =
        Arc::new(HttpSearchIndex::new(http.clone(), config.search.clone()));
    let hasher = Arc::new(HttpImageHasher::new(
        http.clone(),
        config.image_max_bytes,
        config.image_cache_capacity,
    ));
    let resolver = Arc::new(Resolver::new(rows.clone(), search.clone(), hasher, config.resolver));
    let writer = Arc::new(DualSinkWriter::new(rows, search, resolver));
    let ingest = Arc::new(IngestPipeline::new(bus.clone(), writer, config.ingest.clone()));
    let mut consumers = ingest.spawn_consumers(&shutdown);

    let harvesters = build_harvesters(&config, &reference, &http, &publisher);
    drop(publisher);
    let (queue, job_worker) =
        JobQueue::spawn(harvesters, shutdown.clone(), config.job_queue_capacity);
    if config.auto_harvest {
        for platform in queue.platforms().to_vec() {
            let id = queue
                .enqueue_harvest(platform, config.start_category_id)
                .await?;
            info!(target = "harvester.api", job_id = %id, platform = platform.as_str(), "auto_harvest_enqueued");
        }
    }

    let state = AppState {
        queue,
        prometheus_handle,
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/harvests", post(start_harvest))
        .route("/harvests/{id}", get(harvest_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!(target = "harvester.api", "shutdown_requested");
                signal.cancel();
            }
            Err(err) => warn!(target = "harvester.api", error = %err, "signal_handler_unavailable"),
        }
    });

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "harvester.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_stop = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { server_stop.cancelled().await })
        .await?;

    // Router and job queue are gone; running harvests see the cancelled token.
    if let Err(err) = job_worker.await {
        warn!(target = "harvester.jobs", error = %err, "job_worker_panicked");
    }
    while let Some(joined) = consumers.join_next().await {
        if let Err(err) = joined {
            warn!(target = "harvester.consume", error = %err, "consumer_panicked");
        }
    }
    let stats = publisher_task.await?;
    info!(
        target = "harvester.publish",
        published = stats.published,
        failed = stats.failed,
        "shutdown_complete"
    );
    Ok(())
}

/// One harvester per platform that has at least one credential.
fn build_harvesters(
    config: &HarvesterConfig,
    reference: &ReferenceData,
    http: &reqwest::Client,
    publisher: &Publisher,
) -> HashMap<Platform, Arc<dyn Harvest>> {
    let mut harvesters: HashMap<Platform, Arc<dyn Harvest>> = HashMap::new();
    let pool = |keys: &[String]| Arc::new(CredentialPool::new(keys.to_vec(), config.request_interval));
    let reference_for = |platform| Arc::new(PlatformReference::from_reference(reference, platform));

    if config.rakuten.keys.is_empty() {
        warn!(target = "harvester.api", platform = "rakuten", "platform_disabled");
    } else {
        let client = RakutenClient::new(
            http.clone(),
            RakutenConfig {
                endpoint: config.rakuten.endpoint.clone(),
                affiliate_id: config.rakuten.affiliate_id.clone(),
                retry: config.retry,
            },
            pool(&config.rakuten.keys),
            reference_for(Platform::Rakuten),
        );
        harvesters.insert(
            Platform::Rakuten,
            Arc::new(Harvester::new(Arc::new(client), publisher.clone(), config.price_bounds)),
        );
    }

    if config.yahoo.keys.is_empty() {
        warn!(target = "harvester.api", platform = "yahoo", "platform_disabled");
    } else {
        let client = YahooClient::new(
            http.clone(),
            YahooConfig {
                endpoint: config.yahoo.endpoint.clone(),
                affiliate_id: config.yahoo.affiliate_id.clone(),
                retry: config.retry,
            },
            pool(&config.yahoo.keys),
            reference_for(Platform::Yahoo),
        );
        harvesters.insert(
            Platform::Yahoo,
            Arc::new(Harvester::new(Arc::new(client), publisher.clone(), config.price_bounds)),
        );
    }
    harvesters
}

#[derive(Clone)]
struct AppState {
    queue: JobQueue,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
///
/// Returns `status`, `service` and the platforms that can be harvested.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let platforms: Vec<&str> = state.queue.platforms().iter().map(Platform::as_str).collect();
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "platforms": platforms,
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
}

#[derive(Debug, Deserialize)]
struct HarvestRequest {
    platform: String,
    #[serde(default)]
    start_category_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

/// Queue a harvest of one platform.
///
/// - Method: `POST`
/// - Path: `/harvests`
/// - Body: `{"platform": "rakuten" | "yahoo", "start_category_id"?: number}`
/// - Response: `202 {"job_id": ...}`
async fn start_harvest(
    State(state): State<AppState>,
    Json(payload): Json<HarvestRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    let platform = Platform::from_str(&payload.platform)
        .ok_or_else(|| AppError::BadRequest("unknown_platform", payload.platform.clone()))?;
    let id = state
        .queue
        .enqueue_harvest(platform, payload.start_category_id)
        .await?;
    info!(
        target = "harvester.api",
        job_id = %id,
        platform = platform.as_str(),
        start_category_id = ?payload.start_category_id,
        "harvest_enqueued"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn harvest_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest("invalid_job_id", id));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or(AppError::NotFound(id))
}

#[derive(Debug)]
enum AppError {
    BadRequest(&'static str, String),
    NotFound(String),
    Jobs(JobError),
}

impl From<JobError> for AppError {
    fn from(value: JobError) -> Self {
        Self::Jobs(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::BadRequest(code, detail) => (StatusCode::BAD_REQUEST, code, detail),
            AppError::NotFound(id) => (StatusCode::NOT_FOUND, "not_found", id),
            AppError::Jobs(err @ JobError::PlatformNotConfigured(_)) => {
                (StatusCode::CONFLICT, "platform_not_configured", err.to_string())
            }
            AppError::Jobs(err @ JobError::QueueClosed) => {
                (StatusCode::SERVICE_UNAVAILABLE, "queue_closed", err.to_string())
            }
        };
        let payload = ApiError {
            error: error.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
