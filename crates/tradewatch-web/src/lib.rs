//! JSON API over alerts, the trader blacklist and notifications.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tradewatch_core::{
    AlertFilter, AttributeFilter, ItemCategory, Marketplace, OfferDirection, PriceRange, Trader,
    ValidationError,
};
use tradewatch_storage::{AlertStore, BlacklistStore, StoreError};
use tradewatch_sync::Pipeline;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tradewatch-web";

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Store(StoreError::NotFound { .. }) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Store(StoreError::Conflict(_)) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Store(StoreError::Validation(_)) | ApiError::Validation(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_INPUT")
            }
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn any_value() -> AttributeFilter {
    AttributeFilter::Any
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertRequest {
    pub direction: OfferDirection,
    pub item_name: String,
    #[serde(default)]
    pub price_from: Option<i64>,
    pub price_to: i64,
    #[serde(default)]
    pub category: Option<ItemCategory>,
    #[serde(default = "any_value")]
    pub color: AttributeFilter,
    #[serde(default = "any_value")]
    pub certification: AttributeFilter,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl AlertRequest {
    fn into_filter(self) -> Result<(AlertFilter, bool), ValidationError> {
        let price = PriceRange::new(self.price_from, self.price_to)?;
        let filter = AlertFilter::new(
            self.direction,
            self.item_name,
            price,
            self.category,
            self.color,
            self.certification,
        )?;
        Ok((filter, self.enabled))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraderRequest {
    pub marketplace: Marketplace,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsQuery {
    pub limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/alerts", get(list_alerts_handler).post(create_alert_handler))
        .route(
            "/alerts/{id}",
            get(get_alert_handler)
                .put(update_alert_handler)
                .delete(delete_alert_handler),
        )
        .route("/alerts/{id}/enabled", put(set_alert_enabled_handler))
        .route("/blacklist", get(list_blacklist_handler).post(add_blacklist_handler))
        .route(
            "/blacklist/{id}",
            put(update_blacklist_handler).delete(delete_blacklist_handler),
        )
        .route("/notifications", get(list_notifications_handler))
        .route("/notifications/seen", post(mark_all_seen_handler))
        .route("/notifications/{id}/seen", post(mark_seen_handler))
        .with_state(Arc::new(state))
}

/// Serves the API until `shutdown` fires.
pub async fn serve(
    pipeline: Pipeline,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(AppState::new(pipeline)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_alerts_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> ApiResult<Response> {
    let alerts = if query.enabled {
        state.pipeline.stores.alerts.enabled().await?
    } else {
        state.pipeline.stores.alerts.list().await?
    };
    Ok(Json(alerts).into_response())
}

async fn create_alert_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AlertRequest>,
) -> ApiResult<Response> {
    let (filter, enabled) = req.into_filter()?;
    let now = state.pipeline.clock.now();
    let alert = state.pipeline.stores.alerts.create(filter, enabled, now).await?;
    info!(alert_id = %alert.id, item = %alert.filter.item_name, "alert created");
    Ok((StatusCode::CREATED, Json(alert)).into_response())
}

async fn get_alert_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let alert = state.pipeline.stores.alerts.get(id).await?;
    Ok(Json(alert).into_response())
}

async fn update_alert_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AlertRequest>,
) -> ApiResult<Response> {
    let (filter, enabled) = req.into_filter()?;
    let alert = state.pipeline.stores.alerts.update(id, filter, enabled).await?;
    Ok(Json(alert).into_response())
}

async fn set_alert_enabled_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<EnabledRequest>,
) -> ApiResult<Response> {
    let alert = state.pipeline.stores.alerts.set_enabled(id, req.enabled).await?;
    Ok(Json(alert).into_response())
}

async fn delete_alert_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.pipeline.stores.alerts.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_blacklist_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let entries = state.pipeline.stores.blacklist.list().await?;
    Ok(Json(entries).into_response())
}

async fn add_blacklist_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TraderRequest>,
) -> ApiResult<Response> {
    let trader = Trader::new(req.marketplace, req.name)?;
    let entry = state.pipeline.stores.blacklist.add(trader).await?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

async fn update_blacklist_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<TraderRequest>,
) -> ApiResult<Response> {
    let trader = Trader::new(req.marketplace, req.name)?;
    let entry = state.pipeline.stores.blacklist.update(id, trader).await?;
    Ok(Json(entry).into_response())
}

async fn delete_blacklist_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.pipeline.stores.blacklist.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_notifications_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NotificationsQuery>,
) -> ApiResult<Response> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let notifications = state.pipeline.notifications.recent(limit).await?;
    Ok(Json(notifications).into_response())
}

async fn mark_seen_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let notification = state.pipeline.notifications.mark_seen(id).await?;
    Ok(Json(notification).into_response())
}

async fn mark_all_seen_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let marked = state.pipeline.notifications.mark_all_seen().await?;
    Ok(Json(json!({ "marked": marked })).into_response())
}
