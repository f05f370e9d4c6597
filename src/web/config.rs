// Service configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use caption_types::DEFAULT_PROMPT;
use thiserror::Error;
use tokio::sync::Semaphore;

pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen2-VL-2B-Instruct";
pub const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Whether the artifact fetch may use the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Online,
    /// Local-only verification, no network access.
    Offline,
}

/// Admission gate settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyConfig {
    pub max_concurrent: usize,
    pub acquire_timeout: Duration,
    pub retry_after_s: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            acquire_timeout: Duration::ZERO,
            retry_after_s: 1,
        }
    }
}

/// Where the model weights come from and where they land.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactConfig {
    pub model_id: String,
    pub revision: String,
    pub weights_dir: PathBuf,
    pub fetch_mode: FetchMode,
    pub hf_endpoint: String,
    pub hf_token: Option<String>,
}

/// External inference runtime process.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub start_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub artifacts: ArtifactConfig,
    pub concurrency: ConcurrencyConfig,
    pub runtime: RuntimeConfig,
    pub default_prompt: String,
    pub max_upload_bytes: u64,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl ServiceConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = match get("BIND_ADDR") {
            Some(raw) => raw.parse::<SocketAddr>().map_err(|e| invalid("BIND_ADDR", &raw, e))?,
            None => SocketAddr::from(([0, 0, 0, 0], 8089)),
        };

        let model_id = get("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());
        let weights_dir = get("WEIGHTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_weights_dir(&model_id));
        let fetch_mode = match get("HF_HUB_OFFLINE").as_deref() {
            None | Some("0") | Some("false") => FetchMode::Online,
            Some("1") | Some("true") => FetchMode::Offline,
            Some(other) => return Err(invalid("HF_HUB_OFFLINE", other, "expected 0 or 1")),
        };

        let artifacts = ArtifactConfig {
            revision: get("MODEL_REVISION").unwrap_or_else(|| "main".to_string()),
            weights_dir,
            fetch_mode,
            hf_endpoint: get("HF_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_HF_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            hf_token: get("HF_TOKEN"),
            model_id,
        };

        let max_concurrent = parse_or("MAX_CONCURRENT", get("MAX_CONCURRENT"), 1usize)?;
        if max_concurrent == 0 {
            return Err(invalid("MAX_CONCURRENT", "0", "must be at least 1"));
        }
        if max_concurrent > Semaphore::MAX_PERMITS {
            return Err(invalid(
                "MAX_CONCURRENT",
                &max_concurrent.to_string(),
                format!("must be at most {}", Semaphore::MAX_PERMITS),
            ));
        }
        let concurrency = ConcurrencyConfig {
            max_concurrent,
            acquire_timeout: parse_seconds("ACQUIRE_TIMEOUT_S", get("ACQUIRE_TIMEOUT_S"), 0.0)?,
            retry_after_s: parse_or("RETRY_AFTER_S", get("RETRY_AFTER_S"), 1u64)?,
        };

        let runtime = RuntimeConfig {
            command: get("RUNTIME_CMD").unwrap_or_else(|| "caption-runtime".to_string()),
            args: get("RUNTIME_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            start_timeout: parse_seconds(
                "RUNTIME_START_TIMEOUT_S",
                get("RUNTIME_START_TIMEOUT_S"),
                600.0,
            )?,
        };

        Ok(Self {
            bind_addr,
            artifacts,
            concurrency,
            runtime,
            default_prompt: get("DEFAULT_PROMPT").unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", get("MAX_UPLOAD_BYTES"), 20 * 1024 * 1024)?,
            log_dir: get("LOG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("logs")),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// `./weights/<repo name>` for a hub id like `org/repo`.
fn default_weights_dir(model_id: &str) -> PathBuf {
    let name = model_id.rsplit('/').next().unwrap_or(model_id);
    PathBuf::from("weights").join(name)
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse::<T>().map_err(|e| invalid(key, &raw, e)),
        None => Ok(default),
    }
}

/// Parse fractional seconds; must be finite and non-negative.
fn parse_seconds(key: &'static str, raw: Option<String>, default: f64) -> Result<Duration, ConfigError> {
    let secs = parse_or(key, raw, default)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(invalid(key, &secs.to_string(), "must be a finite number >= 0"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(key, &secs.to_string(), e))
}
