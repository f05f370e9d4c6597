//! Out-of-process inference runtime.
//!
//! The caption model runs in a separate child process:
//! - Crash isolation: a runtime crash fails requests, not the web server
//! - Any runtime speaking the JSON Lines protocol of `caption-types` can be plugged in

pub mod process_manager;
pub mod runtime_bridge;

use thiserror::Error;

pub use runtime_bridge::RuntimeEngine;

/// Failure to bring the runtime up. Fatal at startup.
#[derive(Debug, Error)]
pub enum RuntimeStartError {
    #[error("failed to spawn runtime {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("runtime pipes unavailable")]
    Pipes,
    #[error("runtime exited before reporting ready")]
    Exited,
    #[error("runtime not ready after {0:?}")]
    Timeout(std::time::Duration),
    #[error("runtime failed to load the model: {0}")]
    Rejected(String),
    #[error("unexpected runtime reply: {0}")]
    Protocol(String),
}
