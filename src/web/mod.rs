// Caption web service modules

pub mod admission;
pub mod artifacts;
pub mod config;
pub mod engine;
#[cfg(any(test, feature = "mock"))]
pub mod engine_mock;
pub mod error;
pub mod hub;
pub mod image_input;
pub mod logger;
pub mod request_parsing;
pub mod response_helpers;
pub mod routes;
pub mod server;
pub mod worker;

// Re-export commonly used types
pub use admission::{Admission, AdmissionGate, SlotGuard};
pub use artifacts::{acquire, AcquisitionError, ArtifactSpec, ResolvedArtifacts};
pub use config::{ConfigError, ServiceConfig};
pub use engine::{CaptionEngine, EngineInfo, GenerationError, SharedEngine};
pub use error::CaptionError;
pub use server::{AppState, ServerError};
