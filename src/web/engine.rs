//! Inference engine seam.
//!
//! The caption model itself lives outside this crate. Handlers only see
//! [`CaptionEngine`]. Production wires in the runtime bridge from
//! [`crate::web::worker`]; tests and the `mock` feature use `MockEngine`.

use std::sync::Arc;

use caption_types::GenerationParams;
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

/// Identity of the accelerator and model precision, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineInfo {
    pub device: String,
    pub dtype: String,
    pub backend: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// Accelerator memory exhausted for this job.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("{0}")]
    Fault(String),
}

/// A captioning backend. `generate` blocks for the full accelerator job and is
/// always called from the blocking pool while an admission slot is held.
pub trait CaptionEngine: Send + Sync {
    fn info(&self) -> EngineInfo;

    fn generate(&self, image: &RgbImage, params: &GenerationParams) -> Result<String, GenerationError>;
}

pub type SharedEngine = Arc<dyn CaptionEngine>;
