//! Model artifact acquisition.
//!
//! Runs once at startup, before the server binds. Guarantees that a complete
//! ModelArtifactSet (descriptor files plus at least one weight shard) sits in the
//! weights directory, fetching it only when the local copy is incomplete.
//!
//! The fetch outcome is captured as data (`FetchAttempt`) and combined with a fresh
//! local inspection by [`decide`], so the fallback policy after a failed fetch lives
//! in one match instead of nested error handling.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use super::config::{ArtifactConfig, FetchMode};
use super::hub::{FetchError, FetchReport, SnapshotFetcher};

/// Descriptor files every complete set must contain, at any depth.
pub const REQUIRED_DESCRIPTORS: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer.json",
];

/// Extension of weight shard files.
pub const WEIGHT_EXTENSION: &str = "safetensors";

/// Optional shard index. Shards it names but that are absent are reported, not required.
pub const SHARD_INDEX: &str = "model.safetensors.index.json";

/// Which model to acquire and what a complete copy looks like.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    pub model_id: String,
    pub revision: String,
    pub required_descriptors: Vec<String>,
}

impl ArtifactSpec {
    pub fn new(model_id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: revision.into(),
            required_descriptors: REQUIRED_DESCRIPTORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_config(config: &ArtifactConfig) -> Self {
        Self::new(config.model_id.clone(), config.revision.clone())
    }
}

/// Result of inspecting the weights directory.
#[derive(Debug, Clone, Default)]
pub struct Completeness {
    pub missing_descriptors: Vec<String>,
    pub weight_shards: Vec<PathBuf>,
    /// Shards named by the shard index that are not on disk. Diagnostic only.
    pub missing_indexed_shards: Vec<String>,
}

impl Completeness {
    /// Descriptors present and at least one weight shard.
    pub fn is_complete(&self) -> bool {
        self.missing_descriptors.is_empty() && !self.weight_shards.is_empty()
    }

    /// Human readable list of what is missing, for error messages.
    pub fn missing_summary(&self) -> Vec<String> {
        let mut missing = self.missing_descriptors.clone();
        if self.weight_shards.is_empty() {
            missing.push(format!("*.{WEIGHT_EXTENSION}"));
        }
        missing
    }
}

#[derive(Deserialize)]
struct ShardIndex {
    #[serde(default)]
    weight_map: std::collections::HashMap<String, String>,
}

/// Inspect `dir` for a complete artifact set. Never touches the network.
pub fn inspect(dir: &Path, spec: &ArtifactSpec) -> io::Result<Completeness> {
    let mut file_names = BTreeSet::new();
    let mut weight_shards = Vec::new();
    let mut index_files = Vec::new();

    if dir.is_dir() {
        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(io::Error::from)?;
            let path = entry.path();
            // Directory links are not descended; file links (cache blobs) still count.
            let is_file = entry.file_type().is_file() || (entry.path_is_symlink() && path.is_file());
            if !is_file {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            // In-progress downloads end in `.part` and never count.
            let is_shard = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == WEIGHT_EXTENSION);
            if is_shard {
                weight_shards.push(path.to_path_buf());
            }
            if name == SHARD_INDEX {
                index_files.push(path.to_path_buf());
            }
            file_names.insert(name.to_string());
        }
    }

    let missing_descriptors = spec
        .required_descriptors
        .iter()
        .filter(|name| !file_names.contains(name.as_str()))
        .cloned()
        .collect();

    let mut missing_indexed_shards = Vec::new();
    for index_path in &index_files {
        let base = index_path.parent().unwrap_or(dir);
        for shard in indexed_shards(index_path)? {
            if !base.join(&shard).is_file() {
                missing_indexed_shards.push(shard);
            }
        }
    }

    weight_shards.sort();
    Ok(Completeness {
        missing_descriptors,
        weight_shards,
        missing_indexed_shards,
    })
}

/// Shard file names listed in a safetensors index. An unreadable index yields none.
fn indexed_shards(index_path: &Path) -> io::Result<BTreeSet<String>> {
    let raw = fs::read_to_string(index_path)?;
    match serde_json::from_str::<ShardIndex>(&raw) {
        Ok(index) => Ok(index.weight_map.into_values().collect()),
        Err(e) => {
            warn!(
                "[ARTIFACTS] Ignoring unparseable shard index {}: {}",
                index_path.display(),
                e
            );
            Ok(BTreeSet::new())
        }
    }
}

/// How the artifact set became available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactSource {
    /// Already complete on disk; no fetch attempted.
    AlreadyComplete,
    /// Fetch succeeded.
    Fetched,
    /// Fetch failed but the directory turned out complete anyway.
    RecoveredAfterFetchError,
}

/// A usable, immutable artifact set on local storage.
#[derive(Debug, Clone)]
pub struct ResolvedArtifacts {
    pub model_id: String,
    pub path: PathBuf,
    pub weight_shard_count: usize,
    pub source: ArtifactSource,
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("cannot prepare weights directory {path} for {model_id}: {source}")]
    Storage {
        model_id: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to fetch weights for {model_id} into {path} and no complete local copy exists: {source}")]
    Unavailable {
        model_id: String,
        path: PathBuf,
        #[source]
        source: FetchError,
    },
    #[error("weights for {model_id} in {path} are incomplete after fetch, missing: {}", missing.join(", "))]
    Incomplete {
        model_id: String,
        path: PathBuf,
        missing: Vec<String>,
    },
}

/// What the fetch step produced.
#[derive(Debug)]
pub enum FetchAttempt {
    Succeeded(FetchReport),
    Failed(FetchError),
}

/// Policy outcome of a fetch attempt combined with a fresh inspection.
#[derive(Debug)]
pub enum AcquisitionDecision {
    Use(ArtifactSource),
    FailUnavailable(FetchError),
    FailIncomplete(Vec<String>),
}

/// Decide what a fetch attempt means given the directory state afterwards.
pub fn decide(attempt: FetchAttempt, after: &Completeness) -> AcquisitionDecision {
    match (attempt, after.is_complete()) {
        (FetchAttempt::Succeeded(_), true) => AcquisitionDecision::Use(ArtifactSource::Fetched),
        (FetchAttempt::Succeeded(_), false) => {
            AcquisitionDecision::FailIncomplete(after.missing_summary())
        }
        (FetchAttempt::Failed(_), true) => {
            AcquisitionDecision::Use(ArtifactSource::RecoveredAfterFetchError)
        }
        (FetchAttempt::Failed(e), false) => AcquisitionDecision::FailUnavailable(e),
    }
}

/// Ensure a complete artifact set exists at `dest`.
pub fn acquire(
    spec: &ArtifactSpec,
    dest: &Path,
    mode: FetchMode,
    fetcher: &dyn SnapshotFetcher,
) -> Result<ResolvedArtifacts, AcquisitionError> {
    let storage_err = |source: io::Error| AcquisitionError::Storage {
        model_id: spec.model_id.clone(),
        path: dest.to_path_buf(),
        source,
    };

    fs::create_dir_all(dest).map_err(storage_err)?;

    let before = inspect(dest, spec).map_err(storage_err)?;
    if before.is_complete() {
        warn_missing_indexed(spec, &before);
        info!(
            "[ARTIFACTS] Weights for {} found locally in {} ({} shard(s))",
            spec.model_id,
            dest.display(),
            before.weight_shards.len()
        );
        return Ok(resolved(spec, dest, &before, ArtifactSource::AlreadyComplete));
    }

    info!(
        "[ARTIFACTS] Weights for {} incomplete in {} (missing: {}), fetching",
        spec.model_id,
        dest.display(),
        before.missing_summary().join(", ")
    );

    let attempt = match mode {
        FetchMode::Online => match fetcher.fetch(spec, dest) {
            Ok(report) => FetchAttempt::Succeeded(report),
            Err(e) => FetchAttempt::Failed(e),
        },
        FetchMode::Offline => FetchAttempt::Failed(FetchError::Offline),
    };

    let after = inspect(dest, spec).map_err(storage_err)?;
    match decide(attempt, &after) {
        AcquisitionDecision::Use(source) => {
            if source == ArtifactSource::RecoveredAfterFetchError {
                warn!(
                    "[ARTIFACTS] Fetch for {} failed but {} holds a complete set; using local files",
                    spec.model_id,
                    dest.display()
                );
            } else {
                info!("[ARTIFACTS] Fetch for {} complete", spec.model_id);
            }
            warn_missing_indexed(spec, &after);
            Ok(resolved(spec, dest, &after, source))
        }
        AcquisitionDecision::FailUnavailable(source) => Err(AcquisitionError::Unavailable {
            model_id: spec.model_id.clone(),
            path: dest.to_path_buf(),
            source,
        }),
        AcquisitionDecision::FailIncomplete(missing) => Err(AcquisitionError::Incomplete {
            model_id: spec.model_id.clone(),
            path: dest.to_path_buf(),
            missing,
        }),
    }
}

fn warn_missing_indexed(spec: &ArtifactSpec, state: &Completeness) {
    if !state.missing_indexed_shards.is_empty() {
        warn!(
            "[ARTIFACTS] Shard index for {} names shards not on disk: {}",
            spec.model_id,
            state.missing_indexed_shards.join(", ")
        );
    }
}

fn resolved(
    spec: &ArtifactSpec,
    dest: &Path,
    state: &Completeness,
    source: ArtifactSource,
) -> ResolvedArtifacts {
    let path = fs::canonicalize(dest).unwrap_or_else(|_| dest.to_path_buf());
    ResolvedArtifacts {
        model_id: spec.model_id.clone(),
        path,
        weight_shard_count: state.weight_shards.len(),
        source,
    }
}
