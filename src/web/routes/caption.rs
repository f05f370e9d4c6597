// Caption upload route handler

use std::convert::Infallible;
use std::time::Instant;

use hyper::{Body, Request, Response, StatusCode};
use log::{info, warn};
use serde_json::json;

use crate::web::admission::Admission;
use crate::web::error::CaptionError;
use crate::web::image_input::decode_rgb;
use crate::web::request_parsing::parse_caption_form;
use crate::web::response_helpers::json_response;
use crate::web::server::AppState;

pub async fn handle(req: Request<Body>, state: AppState) -> Result<Response<Body>, Infallible> {
    let started = Instant::now();
    let response = match caption(req, &state).await {
        Ok(text) => {
            info!(
                "[CAPTION] 200 in {} ms ({} chars)",
                started.elapsed().as_millis(),
                text.len()
            );
            json_response(StatusCode::OK, &json!({ "text": text }))
        }
        Err(e) => {
            warn!("[CAPTION] {} in {} ms: {}", e.status().as_u16(), started.elapsed().as_millis(), e);
            e.into_response()
        }
    };
    Ok(response)
}

/// Validate the upload, then run one generation under an admission slot.
async fn caption(req: Request<Body>, state: &AppState) -> Result<String, CaptionError> {
    let form = parse_caption_form(req, state.max_upload_bytes).await?;
    let (bytes, params) = form.into_parts(&state.default_prompt)?;

    // Decode before touching the gate so bad uploads never hold a slot.
    let image = tokio::task::spawn_blocking(move || decode_rgb(&bytes))
        .await
        .map_err(|e| CaptionError::GenerationFault(format!("image decoding task failed: {e}")))??;

    let slot = match state.gate.acquire().await {
        Admission::Granted(slot) => slot,
        Admission::TimedOut => {
            return Err(CaptionError::Busy {
                retry_after_s: state.gate.retry_after_s(),
            })
        }
    };

    // The slot moves into the blocking task: it is held until the accelerator
    // work ends even if this request future is dropped.
    let engine = state.engine.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let _slot = slot;
        engine.generate(&image, &params)
    })
    .await;

    match outcome {
        Ok(Ok(text)) => Ok(text.trim().to_string()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) if e.is_panic() => Err(CaptionError::GenerationFault("inference engine panicked".to_string())),
        Err(e) => Err(CaptionError::GenerationFault(e.to_string())),
    }
}
