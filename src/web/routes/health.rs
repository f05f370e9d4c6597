// Health check route handler

use std::convert::Infallible;

use hyper::{Body, Response, StatusCode};
use serde_json::json;

use crate::web::response_helpers::json_response;
use crate::web::server::AppState;

/// Reports model, accelerator, and gate state. Never acquires a slot.
pub async fn handle(state: AppState) -> Result<Response<Body>, Infallible> {
    let info = state.engine.info();
    let gate = &state.gate;
    let body = json!({
        "status": "ok",
        "model_id": state.artifacts.model_id,
        "weights_dir": state.artifacts.path.display().to_string(),
        "num_safetensors": state.artifacts.weight_shard_count,
        "device": info.device,
        "dtype": info.dtype,
        "backend": info.backend,
        "offline": if state.offline { "1" } else { "0" },
        "concurrency": {
            "max_concurrent": gate.capacity(),
            "acquire_timeout_s": gate.acquire_timeout().as_secs_f64(),
            "retry_after_s": gate.retry_after_s(),
            "slots_available_hint": gate.available(),
            "in_flight": gate.in_flight(),
        },
    });
    Ok(json_response(StatusCode::OK, &body))
}
