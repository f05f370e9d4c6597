//! Types shared between the caption web server and the external inference runtime.
//!
//! The runtime protocol is JSON Lines (one JSON object per line) over the runtime
//! process's stdin/stdout pipes.

use serde::{Deserialize, Serialize};

/// Prompt used when the client does not supply one.
pub const DEFAULT_PROMPT: &str = "Describe this image in accurate, concise detail.";

/// Default cap on generated tokens.
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 128;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Upper bound applied to the requested temperature.
pub const MAX_TEMPERATURE: f32 = 1.5;

/// Generation settings after defaults and clamping have been applied.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub max_new_tokens: u32,
    /// Always within `[0, MAX_TEMPERATURE]`.
    pub temperature: f32,
    /// Sampling is enabled iff the clamped temperature is positive.
    pub do_sample: bool,
}

impl GenerationParams {
    /// Build params from raw request values.
    ///
    /// An empty or missing prompt falls back to `default_prompt`.
    pub fn resolve(
        prompt: Option<String>,
        max_new_tokens: Option<u32>,
        temperature: Option<f32>,
        default_prompt: &str,
    ) -> Self {
        let prompt = prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| default_prompt.to_string());
        let temperature = clamp_temperature(temperature.unwrap_or(DEFAULT_TEMPERATURE));

        Self {
            prompt,
            max_new_tokens: max_new_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS),
            temperature,
            do_sample: temperature > 0.0,
        }
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::resolve(None, None, None, DEFAULT_PROMPT)
    }
}

/// Clamp a requested temperature into `[0, MAX_TEMPERATURE]`.
pub fn clamp_temperature(value: f32) -> f32 {
    value.clamp(0.0, MAX_TEMPERATURE)
}

/// Request sent from server to runtime via stdin.
#[derive(Serialize, Deserialize, Debug)]
pub struct RuntimeRequest {
    /// Monotonic request ID for correlating responses.
    pub id: u64,
    pub command: RuntimeCommand,
}

/// Commands the server can send to the runtime.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum RuntimeCommand {
    /// Ask the runtime to report readiness and accelerator identity.
    Describe,
    /// Caption one image.
    Generate {
        /// PNG-encoded RGB image, base64 (standard alphabet).
        image_png_b64: String,
        params: GenerationParams,
    },
    /// Graceful shutdown.
    Shutdown,
}

/// Response sent from runtime to server via stdout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RuntimeResponse {
    /// Matches the request ID. 0 for unsolicited messages.
    pub id: u64,
    pub payload: RuntimePayload,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorKind {
    /// The accelerator ran out of memory during generation.
    OutOfMemory,
    Other,
}

/// Response payloads from the runtime.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum RuntimePayload {
    /// Model loaded from the local weights directory.
    Ready {
        device: String,
        #[serde(default)]
        dtype: Option<String>,
    },
    /// Generation finished.
    Caption { text: String },
    /// An error occurred.
    Error {
        kind: RuntimeErrorKind,
        message: String,
    },
}

impl RuntimeResponse {
    pub fn ok(id: u64, payload: RuntimePayload) -> Self {
        Self { id, payload }
    }

    pub fn error(id: u64, kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: RuntimePayload::Error {
                kind,
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        let params = GenerationParams::resolve(None, None, None, DEFAULT_PROMPT);
        assert_eq!(params.prompt, DEFAULT_PROMPT);
        assert_eq!(params.max_new_tokens, 128);
        assert!((params.temperature - 0.2).abs() < f32::EPSILON);
        assert!(params.do_sample);
    }

    #[test]
    fn test_temperature_clamped_before_sampling_decision() {
        let hot = GenerationParams::resolve(None, None, Some(9.0), DEFAULT_PROMPT);
        assert!((hot.temperature - MAX_TEMPERATURE).abs() < f32::EPSILON);
        assert!(hot.do_sample);

        let cold = GenerationParams::resolve(None, None, Some(-3.0), DEFAULT_PROMPT);
        assert_eq!(cold.temperature, 0.0);
        assert!(!cold.do_sample);
    }

    #[test]
    fn test_blank_prompt_uses_default() {
        let params = GenerationParams::resolve(Some("   ".into()), None, None, "fallback");
        assert_eq!(params.prompt, "fallback");

        let params = GenerationParams::resolve(Some(" a cat? ".into()), Some(16), None, "fallback");
        assert_eq!(params.prompt, "a cat?");
        assert_eq!(params.max_new_tokens, 16);
    }

    #[test]
    fn test_runtime_wire_format() {
        let req = RuntimeRequest {
            id: 7,
            command: RuntimeCommand::Describe,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"id":7,"command":{"type":"Describe"}}"#);

        let line = r#"{"id":3,"payload":{"type":"Error","kind":"out_of_memory","message":"CUDA OOM"}}"#;
        let resp: RuntimeResponse = serde_json::from_str(line).unwrap();
        assert_eq!(resp.id, 3);
        match resp.payload {
            RuntimePayload::Error { kind, message } => {
                assert_eq!(kind, RuntimeErrorKind::OutOfMemory);
                assert_eq!(message, "CUDA OOM");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_ready_without_dtype() {
        let line = r#"{"id":1,"payload":{"type":"Ready","device":"cuda:0"}}"#;
        let resp: RuntimeResponse = serde_json::from_str(line).unwrap();
        assert!(matches!(
            resp.payload,
            RuntimePayload::Ready { ref device, dtype: None } if device == "cuda:0"
        ));
    }
}
