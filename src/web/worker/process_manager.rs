//! Runtime process lifecycle management.
//!
//! Spawns the external inference runtime as a child process with pipes for the
//! JSON Lines protocol. The runtime only ever sees the resolved local weights
//! directory and runs with `HF_HUB_OFFLINE=1`.

use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};

use super::RuntimeStartError;
use crate::web::config::RuntimeConfig;

/// Owns the runtime child process.
#[derive(Debug)]
pub struct ProcessManager {
    child: Mutex<Option<Child>>,
    command: String,
}

impl ProcessManager {
    /// Spawn the runtime against a local weights directory.
    pub fn spawn(config: &RuntimeConfig, weights: &Path, model_id: &str) -> Result<Self, RuntimeStartError> {
        info!(
            "[PROCESS_MGR] Spawning runtime: {} {} --weights {} --model-id {}",
            config.command,
            config.args.join(" "),
            weights.display(),
            model_id
        );

        let child = Command::new(&config.command)
            .args(&config.args)
            .arg("--weights")
            .arg(weights)
            .arg("--model-id")
            .arg(model_id)
            .env("HF_HUB_OFFLINE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // runtime logs go to our stderr
            .spawn()
            .map_err(|source| RuntimeStartError::Spawn {
                command: config.command.clone(),
                source,
            })?;

        Ok(Self {
            child: Mutex::new(Some(child)),
            command: config.command.clone(),
        })
    }

    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stdin.take()))
    }

    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stdout.take()))
    }

    pub fn id(&self) -> Option<u32> {
        self.child
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(Child::id))
    }

    /// True while the child has not exited.
    pub fn is_alive(&self) -> bool {
        match self.child.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Wait up to `grace` for the child to exit on its own, then kill it.
    pub fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.is_alive() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        self.kill();
    }

    /// Kill the runtime immediately and reap it.
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(ref mut child) = *guard {
                if matches!(child.try_wait(), Ok(None)) {
                    warn!("[PROCESS_MGR] Killing runtime process {}", self.command);
                    let _ = child.kill();
                }
                let _ = child.wait(); // Reap
            }
            *guard = None;
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.kill();
    }
}
