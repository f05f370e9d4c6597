// Per-request error taxonomy and its HTTP mapping.

use hyper::{Body, Response, StatusCode};
use thiserror::Error;

use super::engine::GenerationError;
use super::image_input::ImageInputError;
use super::response_helpers::{busy_response, json_error};

#[derive(Debug, Error)]
pub enum CaptionError {
    /// Malformed upload, undecodable image, or bad parameter.
    #[error("{0}")]
    InvalidInput(String),
    #[error("Busy: the captioner is processing another image.")]
    Busy { retry_after_s: u64 },
    #[error(
        "Accelerator out of memory ({0}). Reduce max_new_tokens, stop other GPU processes, or use a smaller model."
    )]
    AcceleratorExhausted(String),
    #[error("Generation failed: {0}")]
    GenerationFault(String),
}

impl CaptionError {
    pub fn status(&self) -> StatusCode {
        match self {
            CaptionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CaptionError::Busy { .. } => StatusCode::TOO_MANY_REQUESTS,
            CaptionError::AcceleratorExhausted(_) | CaptionError::GenerationFault(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn into_response(self) -> Response<Body> {
        match self {
            CaptionError::Busy { retry_after_s } => {
                busy_response(&self.to_string(), retry_after_s)
            }
            other => json_error(other.status(), &other.to_string()),
        }
    }
}

impl From<GenerationError> for CaptionError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::OutOfMemory(msg) => CaptionError::AcceleratorExhausted(msg),
            GenerationError::Fault(msg) => CaptionError::GenerationFault(msg),
        }
    }
}

impl From<ImageInputError> for CaptionError {
    fn from(e: ImageInputError) -> Self {
        CaptionError::InvalidInput(e.to_string())
    }
}
