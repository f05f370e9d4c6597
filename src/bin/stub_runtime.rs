//! Stub inference runtime.
//!
//! Speaks the caption runtime protocol (JSON Lines on stdin/stdout) without a real
//! model, for local development and integration tests. Captions describe the image
//! size and mean color. All log output goes to stderr.
//!
//! Flags (besides the `--weights`/`--model-id` pair every runtime receives):
//! - `--delay-ms N`: sleep N ms per generation
//! - `--oom-above N`: report out-of-memory when `max_new_tokens` exceeds N

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use caption_server::web::image_input::decode_png_base64;
use caption_types::{GenerationParams, RuntimeCommand, RuntimeErrorKind, RuntimePayload, RuntimeRequest, RuntimeResponse};
use crossbeam_channel::{Receiver, Sender};

#[derive(Debug, Default)]
struct StubArgs {
    weights: Option<PathBuf>,
    model_id: String,
    delay: Duration,
    oom_above: Option<u32>,
}

fn parse_args() -> StubArgs {
    let mut parsed = StubArgs::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--weights" => parsed.weights = args.next().map(PathBuf::from),
            "--model-id" => parsed.model_id = args.next().unwrap_or_default(),
            "--delay-ms" => {
                let ms = args.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                parsed.delay = Duration::from_millis(ms);
            }
            "--oom-above" => parsed.oom_above = args.next().and_then(|v| v.parse().ok()),
            other => eprintln!("[STUB] Ignoring argument {other:?}"),
        }
    }
    parsed
}

/// The weights directory must hold a `config.json` somewhere below it.
fn check_weights(weights: &Option<PathBuf>) -> Result<(), String> {
    let dir = weights.as_ref().ok_or("missing --weights")?;
    let found = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .any(|e| e.file_type().is_file() && e.file_name() == "config.json");
    if found {
        Ok(())
    } else {
        Err(format!("no config.json under {}", dir.display()))
    }
}

fn caption(image_png_b64: &str, params: &GenerationParams, args: &StubArgs) -> RuntimePayload {
    if !args.delay.is_zero() {
        thread::sleep(args.delay);
    }
    if args.oom_above.is_some_and(|limit| params.max_new_tokens > limit) {
        return RuntimePayload::Error {
            kind: RuntimeErrorKind::OutOfMemory,
            message: format!("stub OOM at max_new_tokens={}", params.max_new_tokens),
        };
    }

    let image = match decode_png_base64(image_png_b64) {
        Ok(image) => image,
        Err(e) => {
            return RuntimePayload::Error {
                kind: RuntimeErrorKind::Other,
                message: e.to_string(),
            }
        }
    };
    let (w, h) = image.dimensions();
    let count = u64::from(w) * u64::from(h);
    let mut sum = [0u64; 3];
    for pixel in image.pixels() {
        for (acc, channel) in sum.iter_mut().zip(pixel.0) {
            *acc += u64::from(channel);
        }
    }
    let mean = sum.map(|s| s.checked_div(count).unwrap_or(0));
    RuntimePayload::Caption {
        text: format!(
            "A {w}x{h} image with mean color rgb({}, {}, {}).",
            mean[0], mean[1], mean[2]
        ),
    }
}

fn stdout_writer(rx: Receiver<RuntimeResponse>) {
    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    for response in rx {
        match serde_json::to_string(&response) {
            Ok(json) => {
                if writeln!(stdout, "{json}").and_then(|_| stdout.flush()).is_err() {
                    break;
                }
            }
            Err(e) => eprintln!("[STUB] Failed to serialize response: {e}"),
        }
    }
}

fn main() {
    let args = std::sync::Arc::new(parse_args());
    eprintln!(
        "[STUB] Runtime for {} starting (pid={})",
        args.model_id,
        std::process::id()
    );

    let (out_tx, out_rx): (Sender<RuntimeResponse>, Receiver<RuntimeResponse>) = crossbeam_channel::unbounded();
    let writer = thread::spawn(move || stdout_writer(out_rx));

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let request: RuntimeRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("[STUB] Failed to parse command: {e}");
                let _ = out_tx.send(RuntimeResponse::error(0, RuntimeErrorKind::Other, format!("Parse error: {e}")));
                continue;
            }
        };

        match request.command {
            RuntimeCommand::Describe => {
                let response = match check_weights(&args.weights) {
                    Ok(()) => RuntimeResponse::ok(
                        request.id,
                        RuntimePayload::Ready {
                            device: "cpu".to_string(),
                            dtype: Some("none".to_string()),
                        },
                    ),
                    Err(message) => RuntimeResponse::error(request.id, RuntimeErrorKind::Other, message),
                };
                let _ = out_tx.send(response);
            }
            RuntimeCommand::Generate { image_png_b64, params } => {
                let out_tx = out_tx.clone();
                let args = args.clone();
                thread::spawn(move || {
                    let payload = caption(&image_png_b64, &params, &args);
                    let _ = out_tx.send(RuntimeResponse::ok(request.id, payload));
                });
            }
            RuntimeCommand::Shutdown => {
                eprintln!("[STUB] Shutdown requested");
                break;
            }
        }
    }

    drop(out_tx);
    let _ = writer.join();
}
