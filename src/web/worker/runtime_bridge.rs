//! Server-side handle to the runtime process.
//!
//! Owns the stdin/stdout pipes and correlates responses with requests by id, so
//! several generations can be outstanding when the gate admits more than one.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use caption_types::{
    GenerationParams, RuntimeCommand, RuntimeErrorKind, RuntimePayload, RuntimeRequest, RuntimeResponse,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use image::RgbImage;
use log::{debug, error, info, warn};

use super::process_manager::ProcessManager;
use super::RuntimeStartError;
use crate::web::artifacts::ResolvedArtifacts;
use crate::web::config::RuntimeConfig;
use crate::web::engine::{CaptionEngine, EngineInfo, GenerationError};
use crate::web::image_input::encode_png_base64;

/// How long a generation may run before each "still waiting" warning.
const STALL_WARN_INTERVAL: Duration = Duration::from_secs(120);

/// Requests awaiting a response. `None` once the runtime's stdout has closed.
type Pending = Arc<Mutex<Option<HashMap<u64, Sender<RuntimePayload>>>>>;

/// [`CaptionEngine`] backed by the external runtime process.
pub struct RuntimeEngine {
    cmd_tx: Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    info: EngineInfo,
    process: Arc<ProcessManager>,
    stall_warn_interval: Duration,
}

impl RuntimeEngine {
    /// Spawn the runtime on the resolved weights and wait for it to report ready.
    pub fn start(config: &RuntimeConfig, artifacts: &ResolvedArtifacts) -> Result<Self, RuntimeStartError> {
        let process = Arc::new(ProcessManager::spawn(config, &artifacts.path, &artifacts.model_id)?);
        let stdin = process.take_stdin().ok_or(RuntimeStartError::Pipes)?;
        let stdout = process.take_stdout().ok_or(RuntimeStartError::Pipes)?;

        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<String>();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));

        std::thread::Builder::new()
            .name("runtime-stdin".into())
            .spawn(move || stdin_writer(cmd_rx, stdin))
            .map_err(|_| RuntimeStartError::Pipes)?;
        let reader_pending = pending.clone();
        std::thread::Builder::new()
            .name("runtime-stdout".into())
            .spawn(move || stdout_reader(stdout, reader_pending))
            .map_err(|_| RuntimeStartError::Pipes)?;

        let mut engine = Self {
            cmd_tx,
            pending,
            next_id: AtomicU64::new(1),
            info: EngineInfo {
                device: "unknown".into(),
                dtype: "unknown".into(),
                backend: config.command.clone(),
            },
            process,
            stall_warn_interval: STALL_WARN_INTERVAL,
        };

        let reply = engine
            .send(RuntimeCommand::Describe)
            .map_err(|_| RuntimeStartError::Exited)?;
        match reply.recv_timeout(config.start_timeout) {
            Ok(RuntimePayload::Ready { device, dtype }) => {
                info!(
                    "[BRIDGE] Runtime ready on {} (dtype {})",
                    device,
                    dtype.as_deref().unwrap_or("unknown")
                );
                engine.info.device = device;
                engine.info.dtype = dtype.unwrap_or_else(|| "unknown".into());
                Ok(engine)
            }
            Ok(RuntimePayload::Error { message, .. }) => Err(RuntimeStartError::Rejected(message)),
            Ok(other) => Err(RuntimeStartError::Protocol(format!("{other:?}"))),
            Err(RecvTimeoutError::Timeout) => Err(RuntimeStartError::Timeout(config.start_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(RuntimeStartError::Exited),
        }
    }

    /// Register a pending request and write it to the runtime.
    fn send(&self, command: RuntimeCommand) -> Result<Receiver<RuntimePayload>, GenerationError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let json = serde_json::to_string(&RuntimeRequest { id, command })
            .map_err(|e| GenerationError::Fault(format!("serialize error: {e}")))?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        {
            let mut guard = self
                .pending
                .lock()
                .map_err(|_| GenerationError::Fault("runtime bridge poisoned".into()))?;
            match guard.as_mut() {
                Some(map) => map.insert(id, tx),
                None => return Err(runtime_gone()),
            };
        }

        if self.cmd_tx.send(json).is_err() {
            if let Ok(mut guard) = self.pending.lock() {
                if let Some(map) = guard.as_mut() {
                    map.remove(&id);
                }
            }
            return Err(runtime_gone());
        }
        Ok(rx)
    }

    /// Override how often a long-running generation is reported as stalled.
    pub fn with_stall_warning(mut self, interval: Duration) -> Self {
        self.stall_warn_interval = interval;
        self
    }

    /// Wait for a generation reply, warning periodically while the runtime is silent.
    /// The admission slot stays held for the whole wait.
    fn await_reply(&self, reply: &Receiver<RuntimePayload>) -> Result<RuntimePayload, GenerationError> {
        let mut waited = Duration::ZERO;
        loop {
            match reply.recv_timeout(self.stall_warn_interval) {
                Ok(payload) => return Ok(payload),
                Err(RecvTimeoutError::Timeout) => {
                    waited += self.stall_warn_interval;
                    warn!(
                        "[BRIDGE] Generation has been waiting {:.1}s for the runtime (alive: {})",
                        waited.as_secs_f64(),
                        self.process.is_alive()
                    );
                }
                Err(RecvTimeoutError::Disconnected) => return Err(runtime_gone()),
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }
}

impl CaptionEngine for RuntimeEngine {
    fn info(&self) -> EngineInfo {
        self.info.clone()
    }

    fn generate(&self, image: &RgbImage, params: &GenerationParams) -> Result<String, GenerationError> {
        let image_png_b64 =
            encode_png_base64(image).map_err(|e| GenerationError::Fault(format!("image encoding: {e}")))?;
        let reply = self.send(RuntimeCommand::Generate {
            image_png_b64,
            params: params.clone(),
        })?;

        match self.await_reply(&reply)? {
            RuntimePayload::Caption { text } => Ok(text),
            RuntimePayload::Error {
                kind: RuntimeErrorKind::OutOfMemory,
                message,
            } => Err(GenerationError::OutOfMemory(message)),
            RuntimePayload::Error { message, .. } => Err(GenerationError::Fault(message)),
            other => Err(GenerationError::Fault(format!("unexpected runtime reply: {other:?}"))),
        }
    }
}

impl Drop for RuntimeEngine {
    fn drop(&mut self) {
        if let Ok(json) = serde_json::to_string(&RuntimeRequest {
            id: 0,
            command: RuntimeCommand::Shutdown,
        }) {
            let _ = self.cmd_tx.send(json);
        }
        self.process.shutdown(Duration::from_secs(2));
    }
}

fn runtime_gone() -> GenerationError {
    GenerationError::Fault("inference runtime is not running".into())
}

/// Writes queued JSON lines to the runtime's stdin.
fn stdin_writer(cmd_rx: Receiver<String>, mut stdin: ChildStdin) {
    for json_line in cmd_rx {
        if writeln!(stdin, "{json_line}").and_then(|_| stdin.flush()).is_err() {
            warn!("[BRIDGE] Failed to write to runtime stdin");
            break;
        }
    }
    debug!("[BRIDGE] Stdin writer exiting");
}

/// Reads runtime responses and hands each to the request waiting on its id.
fn stdout_reader(stdout: ChildStdout, pending: Pending) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(l) if l.trim().is_empty() => continue,
            Ok(l) => l,
            Err(e) => {
                error!("[BRIDGE] Runtime stdout read error: {e}");
                break;
            }
        };
        let response: RuntimeResponse = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!("[BRIDGE] Ignoring unparseable runtime line ({e}): {line}");
                continue;
            }
        };

        let waiter = pending
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|map| map.remove(&response.id)));
        match waiter {
            Some(tx) => {
                let _ = tx.send(response.payload);
            }
            None if response.id != 0 => warn!("[BRIDGE] No pending request for response id={}", response.id),
            None => {}
        }
    }

    error!("[BRIDGE] Runtime stdout closed; failing outstanding requests");
    // Dropping the senders wakes every waiter with a disconnect.
    if let Ok(mut guard) = pending.lock() {
        guard.take();
    }
}
