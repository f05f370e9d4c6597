//! Hugging Face hub snapshot fetcher with resume support.
//!
//! Lists every file of a model revision, then downloads each one into the weights
//! directory as a real file. Transfers go through `<file>.part` and resume with an
//! HTTP `Range` request after an interruption; the ETag seen when the part was
//! started is kept in `<file>.part.etag` so an upstream change restarts the file.
//! Files already present in final form are skipped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Deserialize;
use thiserror::Error;

use super::artifacts::ArtifactSpec;
use super::config::ArtifactConfig;

/// Progress is logged every this many bytes.
const PROGRESS_INTERVAL: u64 = 64 * 1024 * 1024;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("offline mode, network fetch disabled (HF_HUB_OFFLINE=1)")]
    Offline,
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid repository listing: {0}")]
    Listing(String),
    #[error("refusing unsafe repository path {0:?}")]
    UnsafePath(String),
}

impl From<ureq::Error> for FetchError {
    fn from(e: ureq::Error) -> Self {
        FetchError::Http(e.to_string())
    }
}

/// Summary of one fetch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub files_listed: usize,
    pub files_downloaded: usize,
    pub files_skipped: usize,
    pub bytes_downloaded: u64,
}

/// Materializes a model snapshot into a local directory.
pub trait SnapshotFetcher: Send + Sync {
    fn fetch(&self, spec: &ArtifactSpec, dest: &Path) -> Result<FetchReport, FetchError>;
}

#[derive(Deserialize)]
struct HfSibling {
    rfilename: String,
}

#[derive(Deserialize)]
struct HfModelInfo {
    #[serde(default)]
    siblings: Vec<HfSibling>,
}

/// Fetches snapshots over HTTP from a hub endpoint.
pub struct HubFetcher {
    agent: ureq::Agent,
    endpoint: String,
    token: Option<String>,
}

impl HubFetcher {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(120))
            .user_agent(concat!("caption-server/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_config(config: &ArtifactConfig) -> Self {
        Self::new(config.hf_endpoint.clone(), config.hf_token.clone())
    }

    fn get(&self, url: &str) -> ureq::Request {
        let request = self.agent.get(url);
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }

    /// Repository-relative paths of every file in the revision.
    fn list_files(&self, spec: &ArtifactSpec) -> Result<Vec<String>, FetchError> {
        let url = format!(
            "{}/api/models/{}/revision/{}",
            self.endpoint,
            spec.model_id,
            urlencoding::encode(&spec.revision),
        );
        let body = self.get(&url).call()?.into_string()?;
        let info: HfModelInfo = serde_json::from_str(&body)
            .map_err(|e| FetchError::Listing(format!("{e}")))?;
        if info.siblings.is_empty() {
            return Err(FetchError::Listing(format!(
                "{} has no files at revision {}",
                spec.model_id, spec.revision
            )));
        }
        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }

    fn file_url(&self, spec: &ArtifactSpec, rfilename: &str) -> String {
        let encoded: Vec<String> = rfilename
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint,
            spec.model_id,
            urlencoding::encode(&spec.revision),
            encoded.join("/"),
        )
    }

    /// Download one file through its `.part` sibling, resuming when possible.
    /// Returns the number of bytes transferred in this call.
    fn download_file(&self, url: &str, dest_file: &Path) -> Result<u64, FetchError> {
        let part_file = with_suffix(dest_file, ".part");
        let etag_file = with_suffix(dest_file, ".part.etag");

        let resume_offset = fs::metadata(&part_file).map(|m| m.len()).unwrap_or(0);
        let stored_etag = fs::read_to_string(&etag_file).ok().map(|s| s.trim().to_string());

        let mut request = self.get(url);
        if resume_offset > 0 {
            request = request.set("Range", &format!("bytes={resume_offset}-"));
        }

        let resp = match request.call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(416, _)) if resume_offset > 0 => {
                // Range not satisfiable: the part no longer matches upstream.
                warn!("[HUB] Discarding stale partial file {}", part_file.display());
                discard_part(&part_file, &etag_file);
                return self.download_file(url, dest_file);
            }
            Err(e) => return Err(e.into()),
        };

        let is_range_response = resp.status() == 206;
        let server_etag = resp.header("etag").map(|s| s.to_string());

        if is_range_response {
            if let (Some(stored), Some(server)) = (&stored_etag, &server_etag) {
                if stored != server {
                    warn!(
                        "[HUB] {} changed upstream since the partial download began, restarting",
                        dest_file.display()
                    );
                    drop(resp);
                    discard_part(&part_file, &etag_file);
                    return self.download_file(url, dest_file);
                }
            }
        }

        // A 200 answer to a ranged request means the server ignored the range.
        let offset = if is_range_response { resume_offset } else { 0 };
        let total: Option<u64> = resp
            .header("content-length")
            .and_then(|v| v.parse::<u64>().ok())
            .map(|len| len + offset);

        let mut file = if offset > 0 {
            info!("[HUB] Resuming {} at {} bytes", dest_file.display(), offset);
            OpenOptions::new().append(true).open(&part_file)?
        } else {
            File::create(&part_file)?
        };
        match &server_etag {
            Some(tag) => fs::write(&etag_file, tag)?,
            None => {
                let _ = fs::remove_file(&etag_file);
            }
        }

        let mut reader = resp.into_reader();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut downloaded = offset;
        let mut last_report = offset;
        let start = Instant::now();

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Keep the .part file for the next attempt.
                Err(e) => return Err(FetchError::Io(e)),
            };
            file.write_all(&buf[..n])?;
            downloaded += n as u64;

            if downloaded - last_report >= PROGRESS_INTERVAL {
                let elapsed = start.elapsed().as_secs_f64();
                let speed_kbps = if elapsed > 0.0 {
                    ((downloaded - offset) as f64 / 1024.0) / elapsed
                } else {
                    0.0
                };
                info!(
                    "[HUB] {}: {} / {} bytes ({} KB/s)",
                    dest_file.display(),
                    downloaded,
                    total.map(|t| t.to_string()).unwrap_or_else(|| "?".into()),
                    speed_kbps as u64
                );
                last_report = downloaded;
            }
        }

        if let Some(expected) = total {
            if downloaded < expected {
                return Err(FetchError::Http(format!(
                    "transfer of {} ended early at {} of {} bytes",
                    dest_file.display(),
                    downloaded,
                    expected
                )));
            }
        }

        file.flush()?;
        drop(file);
        fs::rename(&part_file, dest_file)?;
        let _ = fs::remove_file(&etag_file);

        Ok(downloaded - offset)
    }
}

impl SnapshotFetcher for HubFetcher {
    fn fetch(&self, spec: &ArtifactSpec, dest: &Path) -> Result<FetchReport, FetchError> {
        let files = self.list_files(spec)?;
        let mut report = FetchReport {
            files_listed: files.len(),
            ..Default::default()
        };
        info!(
            "[HUB] {}@{}: {} file(s) listed, destination {}",
            spec.model_id,
            spec.revision,
            files.len(),
            dest.display()
        );

        for rfilename in &files {
            let relative = safe_relative_path(rfilename)?;
            let dest_file = dest.join(&relative);

            if dest_file.is_file() {
                report.files_skipped += 1;
                continue;
            }
            if let Some(parent) = dest_file.parent() {
                fs::create_dir_all(parent)?;
            }

            let url = self.file_url(spec, rfilename);
            let bytes = self.download_file(&url, &dest_file)?;
            info!("[HUB] Downloaded {} ({} bytes)", rfilename, bytes);
            report.files_downloaded += 1;
            report.bytes_downloaded += bytes;
        }

        info!(
            "[HUB] {}: {} downloaded, {} already present, {} bytes transferred",
            spec.model_id, report.files_downloaded, report.files_skipped, report.bytes_downloaded
        );
        Ok(report)
    }
}

/// Reject listing entries that would escape the destination directory.
fn safe_relative_path(rfilename: &str) -> Result<PathBuf, FetchError> {
    let path = Path::new(rfilename);
    let safe = !rfilename.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path.to_path_buf())
    } else {
        Err(FetchError::UnsafePath(rfilename.to_string()))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn discard_part(part_file: &Path, etag_file: &Path) {
    let _ = fs::remove_file(part_file);
    let _ = fs::remove_file(etag_file);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::artifacts::tests::mk_temp_dir;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    const SHARD: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    /// Range headers seen by the fake hub, per path.
    type Seen = Arc<Mutex<Vec<(String, Option<String>)>>>;

    async fn fake_hub(req: Request<Body>, seen: Seen) -> Result<Response<Body>, Infallible> {
        let path = req.uri().path().to_string();
        let range = req
            .headers()
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.lock().unwrap().push((path.clone(), range.clone()));

        let body: &[u8] = match path.as_str() {
            "/api/models/acme/tiny-vl/revision/main" => br#"{"siblings":[
                {"rfilename":"config.json"},
                {"rfilename":"generation_config.json"},
                {"rfilename":"tokenizer.json"},
                {"rfilename":"model.safetensors"}]}"#,
            "/acme/tiny-vl/resolve/main/config.json" => b"{\"model_type\":\"qwen2_vl\"}",
            "/acme/tiny-vl/resolve/main/generation_config.json" => b"{}",
            "/acme/tiny-vl/resolve/main/tokenizer.json" => b"{}",
            "/acme/tiny-vl/resolve/main/model.safetensors" => SHARD,
            "/api/models/acme/escape/revision/main" => {
                br#"{"siblings":[{"rfilename":"../outside.json"}]}"#
            }
            "/api/models/acme/strict/revision/main" | "/api/models/acme/no-range/revision/main" => {
                br#"{"siblings":[{"rfilename":"model.safetensors"}]}"#
            }
            "/acme/strict/resolve/main/model.safetensors" => {
                if range.is_some() {
                    return Ok(Response::builder()
                        .status(StatusCode::RANGE_NOT_SATISFIABLE)
                        .body(Body::empty())
                        .unwrap());
                }
                SHARD
            }
            "/acme/no-range/resolve/main/model.safetensors" => {
                return Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("etag", "\"v1\"")
                    .header("content-length", SHARD.len())
                    .body(Body::from(SHARD.to_vec()))
                    .unwrap());
            }
            _ => {
                return Ok(Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::empty())
                    .unwrap())
            }
        };

        let start = range
            .as_deref()
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok());
        let response = match start {
            Some(start) => Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header("etag", "\"v1\"")
                .header("content-length", body.len() - start)
                .body(Body::from(body[start..].to_vec())),
            None => Response::builder()
                .status(StatusCode::OK)
                .header("etag", "\"v1\"")
                .header("content-length", body.len())
                .body(Body::from(body.to_vec())),
        };
        Ok(response.unwrap())
    }

    fn start_fake_hub(rt: &tokio::runtime::Runtime) -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let _guard = rt.enter();
        let make_svc = make_service_fn({
            let seen = seen.clone();
            move |_conn| {
                let seen = seen.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| fake_hub(req, seen.clone())))
                }
            }
        });
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let server = Server::try_bind(&addr).unwrap().serve(make_svc);
        let endpoint = format!("http://{}", server.local_addr());
        rt.spawn(server);
        (endpoint, seen)
    }

    #[test]
    fn test_fetches_snapshot_and_skips_existing() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (endpoint, seen) = start_fake_hub(&rt);
        let dir = mk_temp_dir("caption_hub_snapshot");
        let spec = ArtifactSpec::new("acme/tiny-vl", "main");
        let fetcher = HubFetcher::new(endpoint, None);

        let report = fetcher.fetch(&spec, &dir).unwrap();
        assert_eq!(report.files_listed, 4);
        assert_eq!(report.files_downloaded, 4);
        assert_eq!(fs::read(dir.join("model.safetensors")).unwrap(), SHARD);
        assert!(!dir.join("model.safetensors.part").exists());
        assert!(!fs::symlink_metadata(dir.join("config.json")).unwrap().file_type().is_symlink());

        let again = fetcher.fetch(&spec, &dir).unwrap();
        assert_eq!(again.files_downloaded, 0);
        assert_eq!(again.files_skipped, 4);

        let downloads = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.contains("/resolve/"))
            .count();
        assert_eq!(downloads, 4);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_resumes_partial_download_with_range() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (endpoint, seen) = start_fake_hub(&rt);
        let dir = mk_temp_dir("caption_hub_resume");
        fs::write(dir.join("model.safetensors.part"), &SHARD[..10]).unwrap();
        fs::write(dir.join("model.safetensors.part.etag"), "\"v1\"").unwrap();

        let spec = ArtifactSpec::new("acme/tiny-vl", "main");
        let fetcher = HubFetcher::new(endpoint, None);
        fetcher.fetch(&spec, &dir).unwrap();

        assert_eq!(fs::read(dir.join("model.safetensors")).unwrap(), SHARD);
        assert!(!dir.join("model.safetensors.part.etag").exists());
        let shard_range = seen
            .lock()
            .unwrap()
            .iter()
            .find(|(path, _)| path.ends_with("model.safetensors"))
            .and_then(|(_, range)| range.clone());
        assert_eq!(shard_range.as_deref(), Some("bytes=10-"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_restarts_when_etag_changed() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (endpoint, _seen) = start_fake_hub(&rt);
        let dir = mk_temp_dir("caption_hub_etag");
        fs::write(dir.join("model.safetensors.part"), b"stale-bytes").unwrap();
        fs::write(dir.join("model.safetensors.part.etag"), "\"v0\"").unwrap();

        let spec = ArtifactSpec::new("acme/tiny-vl", "main");
        HubFetcher::new(endpoint, None).fetch(&spec, &dir).unwrap();

        assert_eq!(fs::read(dir.join("model.safetensors")).unwrap(), SHARD);

        let _ = fs::remove_dir_all(dir);
    }

    fn shard_ranges(seen: &Seen) -> Vec<Option<String>> {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.ends_with("model.safetensors"))
            .map(|(_, range)| range.clone())
            .collect()
    }

    #[test]
    fn test_unsatisfiable_range_discards_part_and_restarts() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (endpoint, seen) = start_fake_hub(&rt);
        let dir = mk_temp_dir("caption_hub_416");
        fs::write(dir.join("model.safetensors.part"), &SHARD[..10]).unwrap();
        fs::write(dir.join("model.safetensors.part.etag"), "\"v1\"").unwrap();

        let spec = ArtifactSpec::new("acme/strict", "main");
        let report = HubFetcher::new(endpoint, None).fetch(&spec, &dir).unwrap();

        assert_eq!(report.bytes_downloaded, SHARD.len() as u64);
        assert_eq!(fs::read(dir.join("model.safetensors")).unwrap(), SHARD);
        assert!(!dir.join("model.safetensors.part").exists());
        assert!(!dir.join("model.safetensors.part.etag").exists());
        assert_eq!(shard_ranges(&seen), vec![Some("bytes=10-".to_string()), None]);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_ignored_range_restarts_from_zero() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (endpoint, seen) = start_fake_hub(&rt);
        let dir = mk_temp_dir("caption_hub_200");
        fs::write(dir.join("model.safetensors.part"), b"garbage!!!").unwrap();
        fs::write(dir.join("model.safetensors.part.etag"), "\"v1\"").unwrap();

        let spec = ArtifactSpec::new("acme/no-range", "main");
        let report = HubFetcher::new(endpoint, None).fetch(&spec, &dir).unwrap();

        assert_eq!(report.bytes_downloaded, SHARD.len() as u64);
        assert_eq!(fs::read(dir.join("model.safetensors")).unwrap(), SHARD);
        assert!(!dir.join("model.safetensors.part").exists());
        assert!(!dir.join("model.safetensors.part.etag").exists());
        assert_eq!(shard_ranges(&seen), vec![Some("bytes=10-".to_string())]);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_rejects_path_escape() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (endpoint, _seen) = start_fake_hub(&rt);
        let dir = mk_temp_dir("caption_hub_escape");

        let spec = ArtifactSpec::new("acme/escape", "main");
        let err = HubFetcher::new(endpoint, None).fetch(&spec, &dir).unwrap_err();
        assert!(matches!(err, FetchError::UnsafePath(_)));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_unreachable_hub_is_http_error() {
        let dir = mk_temp_dir("caption_hub_down");
        let spec = ArtifactSpec::new("acme/tiny-vl", "main");
        // Port 9 (discard) is not listening on loopback in test environments.
        let err = HubFetcher::new("http://127.0.0.1:9", None)
            .fetch(&spec, &dir)
            .unwrap_err();
        assert!(matches!(err, FetchError::Http(_)));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_safe_relative_path() {
        assert!(safe_relative_path("vision/preprocessor_config.json").is_ok());
        assert!(safe_relative_path("../x").is_err());
        assert!(safe_relative_path("/etc/passwd").is_err());
        assert!(safe_relative_path("").is_err());
    }
}
