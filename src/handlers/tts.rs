//! # Text-to-Speech Relay
//!
//! Stateless pass-through to the ElevenLabs REST API. Each request is forwarded
//! once with the server's credential; nothing is cached or retried.
//!
//! ## Error mapping:
//! - Empty `text` → 400 before anything is sent upstream
//! - No TTS key configured → 503 (speech recognition keeps working)
//! - Vendor answers non-2xx → same status, `detail` from the vendor's JSON body
//!   (or its raw body when that isn't JSON)
//! - Vendor unreachable → 503

use crate::{error::AppError, state::AppState};
use actix_web::http::header::{self, ContentType};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Body of `POST /text-to-speech/{voice_id}`. Accepts both the snake_case
/// field names of the vendor API and the camelCase ones mobile clients send.
#[derive(Debug, Deserialize, Serialize)]
pub struct TtsRequest {
    pub text: String,

    #[serde(alias = "modelId", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    #[serde(alias = "voiceSettings", default, skip_serializing_if = "Option::is_none")]
    pub voice_settings: Option<serde_json::Value>,
}

/// Credential and base URL for one forwarded request.
fn vendor(state: &AppState) -> Result<(String, String), AppError> {
    let config = state.get_config();
    let key = config
        .tts
        .api_key
        .filter(|key| !key.is_empty())
        .ok_or_else(|| AppError::ServiceUnavailable("ELEVENLABS_API_KEY is not configured".to_string()))?;
    Ok((config.tts.base_url.trim_end_matches('/').to_string(), key))
}

/// Turn a vendor error response into an `AppError::Upstream` with the same status.
async fn upstream_error(response: reqwest::Response) -> AppError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|json| json.get("detail").cloned())
        .map(|detail| match detail {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        })
        .unwrap_or(body);

    error!(status, detail = %detail, "text-to-speech vendor returned an error");
    AppError::Upstream { status, detail }
}

/// `POST /text-to-speech/{voice_id}`: synthesize speech and return MP3 bytes.
pub async fn text_to_speech(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<TtsRequest>,
) -> Result<HttpResponse, AppError> {
    let voice_id = path.into_inner();
    let request = body.into_inner();

    if request.text.trim().is_empty() {
        return Err(AppError::ValidationError("text must not be empty".to_string()));
    }

    let (base_url, key) = vendor(&state)?;
    info!(voice_id = %voice_id, text_len = request.text.len(), "Processing TTS request");

    let response = state
        .http
        .post(format!("{}/text-to-speech/{}", base_url, voice_id))
        .header("xi-api-key", key)
        .header(header::ACCEPT.as_str(), "audio/mpeg")
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(upstream_error(response).await);
    }

    let audio = response.bytes().await?;
    Ok(HttpResponse::Ok()
        .content_type("audio/mpeg")
        .body(audio))
}

/// `GET /voices`: the vendor's voice listing, unchanged.
pub async fn list_voices(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let (base_url, key) = vendor(&state)?;
    info!("Fetching voices from text-to-speech vendor");

    let response = state
        .http
        .get(format!("{}/voices", base_url))
        .header("xi-api-key", key)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(upstream_error(response).await);
    }

    let voices = response.bytes().await?;
    Ok(HttpResponse::Ok().insert_header(ContentType::json()).body(voices))
}
