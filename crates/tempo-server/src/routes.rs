use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tempo_core::models::{ScrapeKind, ScrapeResult};

use crate::dto::{ErrorResponse, HealthResponse, MonthlyListenersResponse, PlayCountResponse};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/scrape/monthly-listeners/{artistId}", get(monthly_listeners))
        .route("/scrape/playcount/{trackId}", get(play_count))
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .fallback(not_found)
        .with_state(state)
}

async fn lookup(
    state: &AppState,
    kind: ScrapeKind,
    raw_id: &str,
) -> Result<(ScrapeResult, u64), ApiError> {
    let started = Instant::now();
    let result = state
        .gateway
        .lookup(kind, raw_id)
        .await
        .map_err(|e| ApiError::scrape(kind, e))?;
    Ok((result, started.elapsed().as_millis() as u64))
}

// ---------------------------------------------------------------------------
// Scrape
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/scrape/monthly-listeners/{artistId}",
    params(("artistId" = String, Path, description = "22-character artist identifier")),
    responses(
        (status = 200, description = "Monthly listeners", body = MonthlyListenersResponse),
        (status = 400, description = "Malformed identifier", body = ErrorResponse),
        (status = 500, description = "Scrape failed", body = ErrorResponse),
        (status = 503, description = "Too many pending scrapes", body = ErrorResponse),
    ),
    tag = "scrape"
)]
pub async fn monthly_listeners(
    State(state): State<Arc<AppState>>,
    Path(artist_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (result, response_time_ms) =
        lookup(&state, ScrapeKind::ArtistListeners, &artist_id).await?;

    Ok(axum::Json(MonthlyListenersResponse {
        artist_id: result.subject_id.to_string(),
        monthly_listeners: result.value,
        response_time_ms,
        timestamp: result.timestamp,
    }))
}

#[utoipa::path(
    get,
    path = "/scrape/playcount/{trackId}",
    params(("trackId" = String, Path, description = "22-character track identifier")),
    responses(
        (status = 200, description = "Play count", body = PlayCountResponse),
        (status = 400, description = "Malformed identifier", body = ErrorResponse),
        (status = 500, description = "Scrape failed", body = ErrorResponse),
        (status = 503, description = "Too many pending scrapes", body = ErrorResponse),
    ),
    tag = "scrape"
)]
pub async fn play_count(
    State(state): State<Arc<AppState>>,
    Path(track_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (result, response_time_ms) = lookup(&state, ScrapeKind::TrackPlaycount, &track_id).await?;

    Ok(axum::Json(PlayCountResponse {
        track_id: result.subject_id.to_string(),
        play_count: result.value,
        response_time_ms,
        timestamp: result.timestamp,
    }))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Server, browser, and queue status", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.gateway.health().await;
    axum::Json(HealthResponse::from(health))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        axum::Json(ErrorResponse {
            error: "not_found".to_string(),
            message: "No such route".to_string(),
        }),
    )
}
