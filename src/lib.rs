pub mod backfill;
pub mod channels;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod media;
pub mod pipeline;
pub mod reconcile;
pub mod types;

pub use config::Config;

use self::channels::whatsapp::{normalize_gateway_event, RouteHints};
use self::config::{expand_tilde, load_config, resolve_database_url};
use self::db::ConversationStore;
use self::identity::{IdentityResolver, PhoneFormat};
use self::media::storage::{build_object_store, content_type_for_extension};
use self::media::transform::sniff_content_type;
use self::media::{
    AuthContext, FsObjectStore, HttpMediaFetcher, MediaFetcher, MediaStabilizer, ObjectStore,
    StabilizerSettings,
};
use self::pipeline::Pipeline;
use self::reconcile::Reconciler;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ConversationStore>,
    pub pipeline: Arc<Pipeline>,
    /// Set when media is written to the local filesystem and served from here.
    pub media: Option<FsObjectStore>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub conversations: i64,
    pub messages: i64,
    pub pending_media: i64,
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    let config = load_config();
    let db_url = resolve_database_url(&config);
    let store: Arc<dyn ConversationStore> = Arc::new(db::connect(&db_url).await?);

    let http = reqwest::Client::new();
    let objects = build_object_store(&config.storage, http.clone())?;
    let fetcher = Arc::new(HttpMediaFetcher::new(http, config.gateway.base_url.clone()));
    let state = build_state(config, store, fetcher, objects);

    if let Some(stabilizer) = state.pipeline.stabilizer() {
        tokio::spawn(backfill::start_backfill_worker(
            state.store.clone(),
            stabilizer.clone(),
            state.config.backfill.clone(),
        ));
    }

    let app = build_router(state.clone());
    Ok((state, app))
}

/// Wires the pipeline from its collaborators. Media stabilization is skipped entirely
/// when `media.enabled` is false.
pub fn build_state(
    config: Config,
    store: Arc<dyn ConversationStore>,
    fetcher: Arc<dyn MediaFetcher>,
    objects: Arc<dyn ObjectStore>,
) -> AppState {
    let resolver = IdentityResolver::new(store.clone(), PhoneFormat::from(&config.phone));
    let reconciler = Arc::new(Reconciler::new(store.clone(), resolver));
    let stabilizer = config.media.enabled.then(|| {
        Arc::new(MediaStabilizer::new(
            store.clone(),
            fetcher,
            objects,
            AuthContext {
                api_key: config.gateway.api_key.clone(),
            },
            StabilizerSettings::from(&config.media),
        ))
    });
    let media = (config.storage.backend == "fs").then(|| {
        FsObjectStore::new(
            expand_tilde(&config.storage.root_dir),
            config.storage.public_base_url.clone(),
        )
    });

    AppState {
        config,
        store,
        pipeline: Arc::new(Pipeline::new(reconciler, stabilizer)),
        media,
    }
}

pub fn build_router(state: AppState) -> Router {
    let webhook_path = state.config.gateway.webhook_path.clone();
    let webhook_by_event_path = format!("{}/:event", webhook_path.trim_end_matches('/'));

    let admin_routes = Router::new()
        .route("/v1/backfill/:instance", post(run_backfill))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/media/*key", get(serve_media))
        .route(&webhook_path, post(gateway_webhook))
        .route(&webhook_by_event_path, post(gateway_webhook_by_event));

    Router::new()
        .merge(admin_routes)
        .merge(public_routes)
        .with_state(state)
}

async fn require_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.server.admin_token.as_ref() {
        let header = headers
            .get("X-Wa-Inbox-Token")
            .and_then(|v| v.to_str().ok());
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
    match state.store.counts().await {
        Ok(counts) => Json(StatusResponse {
            conversations: counts.conversations,
            messages: counts.messages,
            pending_media: counts.pending_media,
        })
        .into_response(),
        Err(err) => {
            error!("status query failed: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn gateway_webhook(
    State(state): State<AppState>,
    Path(instance): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    accept_delivery(
        &state,
        RouteHints {
            instance: Some(&instance),
            event: None,
        },
        &body,
    )
}

async fn gateway_webhook_by_event(
    State(state): State<AppState>,
    Path((instance, event)): Path<(String, String)>,
    body: Bytes,
) -> impl IntoResponse {
    accept_delivery(
        &state,
        RouteHints {
            instance: Some(&instance),
            event: Some(&event),
        },
        &body,
    )
}

/// Always acknowledges. Processing runs detached so the gateway never waits on storage
/// and never redelivers because of a downstream failure.
fn accept_delivery(state: &AppState, hints: RouteHints<'_>, body: &[u8]) -> Json<serde_json::Value> {
    let payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(err) => {
            debug!("dropping unparseable delivery: {err}");
            return Json(json!({"status": "ignored", "reason": "invalid json"}));
        }
    };

    let event = match normalize_gateway_event(&payload, hints) {
        Ok(event) => event,
        Err(err) => {
            debug!("dropping delivery: {err}");
            return Json(json!({"status": "ignored", "reason": err.to_string()}));
        }
    };

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let instance = event.instance.clone();
        if let Err(err) = pipeline.ingest(event).await {
            error!(instance = %instance, "inbound event failed: {err}");
        }
    });
    Json(json!({"status": "accepted"}))
}

async fn run_backfill(State(state): State<AppState>, Path(instance): Path<String>) -> Response {
    let folded = match state.pipeline.reconciler().backfill_aliases(&instance).await {
        Ok(folded) => folded,
        Err(err) => {
            error!(instance = %instance, "alias backfill failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response();
        }
    };

    let media = match state.pipeline.stabilizer() {
        Some(stabilizer) => {
            let batch = state.config.backfill.batch;
            match backfill::run_media_backfill(&state.store, stabilizer, batch, Duration::ZERO).await {
                Ok(report) => Some(report),
                Err(err) => {
                    error!(instance = %instance, "media backfill failed: {err}");
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"error": err.to_string()})),
                    )
                        .into_response();
                }
            }
        }
        None => None,
    };

    info!(instance = %instance, folded, "manual backfill finished");
    Json(json!({"aliases_folded": folded, "media": media})).into_response()
}

async fn serve_media(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let Some(path) = state.media.as_ref().and_then(|media| media.path_for(&key)) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            let content_type =
                sniff_content_type(&bytes).unwrap_or_else(|| content_type_for_extension(ext));
            (
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                    (header::CACHE_CONTROL, "public, max-age=31536000, immutable"),
                ],
                bytes,
            )
                .into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
