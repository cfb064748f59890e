//! Read-only views of the session registry.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use uuid::Uuid;

/// `GET /api/v1/sessions`: every live session, oldest first.
pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.registry.snapshot();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

/// `GET /api/v1/sessions/{id}`
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let raw = path.into_inner();
    let id = Uuid::parse_str(&raw)
        .map_err(|_| AppError::BadRequest(format!("invalid session id: {}", raw)))?;

    let session = state
        .registry
        .find(id)
        .ok_or_else(|| AppError::NotFound(format!("session {} not found", id)))?;

    Ok(HttpResponse::Ok().json(session.snapshot()))
}
