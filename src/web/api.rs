use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::batching::{AddOutcome, IngestError};
use crate::cache::{driver_location_key, LocationCache};
use crate::location::LocationUpdate;
use crate::pipeline::{LocationPipeline, MetricsSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: LocationPipeline,
    pub cache: Arc<dyn LocationCache>,
}

/// Body of `POST /api/locations`: one update or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LocationSubmission {
    Many(Vec<LocationUpdate>),
    One(LocationUpdate),
}

#[derive(Debug, Serialize)]
pub struct RejectedUpdate {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct SubmissionResponse {
    pub accepted: Vec<AddOutcome>,
    pub rejected: Vec<RejectedUpdate>,
}

/// GET /health
pub async fn health_check() -> &'static str {
    "OK"
}

/// GET /api/metrics
pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.pipeline.metrics())
}

/// POST /api/locations
///
/// A single invalid update is answered with 422. In a list, invalid
/// entries are reported individually and the rest are still accepted.
pub async fn submit_locations(
    State(state): State<AppState>,
    Json(submission): Json<LocationSubmission>,
) -> Result<(StatusCode, Json<SubmissionResponse>), ApiError> {
    let updates = match submission {
        LocationSubmission::One(update) => vec![update],
        LocationSubmission::Many(updates) => updates,
    };
    if updates.is_empty() {
        return Err(ApiError::BadRequest("no location updates submitted".to_string()));
    }
    let single = updates.len() == 1;

    let mut response = SubmissionResponse {
        accepted: Vec::with_capacity(updates.len()),
        rejected: Vec::new(),
    };

    for (index, update) in updates.into_iter().enumerate() {
        match state.pipeline.add_update(update) {
            Ok(outcome) => response.accepted.push(outcome),
            Err(IngestError::ShuttingDown) => {
                return Err(ApiError::Unavailable("pipeline is shutting down".to_string()));
            }
            Err(e @ IngestError::Validation(_)) if single => {
                return Err(ApiError::Unprocessable(e.to_string()));
            }
            Err(e) => response.rejected.push(RejectedUpdate {
                index,
                error: e.to_string(),
            }),
        }
    }

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /api/drivers/:id/location
pub async fn get_driver_location(
    State(state): State<AppState>,
    Path(driver_id): Path<String>,
) -> Result<Json<LocationUpdate>, ApiError> {
    let cached = state
        .cache
        .get(&driver_location_key(&driver_id))
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("no recent location for driver {}", driver_id)))?;

    let update = serde_json::from_str(&cached)
        .map_err(|e| ApiError::InternalError(format!("corrupt cache entry: {}", e)))?;
    Ok(Json(update))
}

// Error handling
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unprocessable(String),
    NotFound(String),
    Unavailable(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
