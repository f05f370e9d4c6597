// Mock caption engine for E2E tests and the `mock` feature build.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use caption_types::GenerationParams;
use image::RgbImage;

use super::engine::{CaptionEngine, EngineInfo, GenerationError};

/// What every call to the mock returns.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Echo the image size and prompt.
    Describe,
    Fail(GenerationError),
    Panic,
}

/// Engine double that sleeps, then answers according to its outcome.
/// Records how many calls ran and the highest number that overlapped.
#[derive(Debug)]
pub struct MockEngine {
    delay: Duration,
    outcome: Mutex<MockOutcome>,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockEngine {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            outcome: Mutex::new(MockOutcome::Describe),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_outcome(self, outcome: MockOutcome) -> Self {
        self.set_outcome(outcome);
        self
    }

    pub fn set_outcome(&self, outcome: MockOutcome) {
        if let Ok(mut current) = self.outcome.lock() {
            *current = outcome;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the active counter on every exit path, including panics.
struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CaptionEngine for MockEngine {
    fn info(&self) -> EngineInfo {
        EngineInfo {
            device: "mock:0".to_string(),
            dtype: "float32".to_string(),
            backend: "mock".to_string(),
        }
    }

    fn generate(&self, image: &RgbImage, params: &GenerationParams) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveCall(&self.active);
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let outcome = self
            .outcome
            .lock()
            .map(|o| o.clone())
            .unwrap_or(MockOutcome::Describe);
        match outcome {
            MockOutcome::Describe => {
                let (w, h) = image.dimensions();
                Ok(format!("A {w}x{h} test image. Prompt: {}", params.prompt))
            }
            MockOutcome::Fail(e) => Err(e),
            MockOutcome::Panic => panic!("mock engine panic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_describe_mentions_prompt() {
        let engine = MockEngine::new(Duration::ZERO);
        let image = RgbImage::new(5, 2);
        let text = engine.generate(&image, &GenerationParams::default()).unwrap();
        assert!(text.starts_with("A 5x2 test image"));
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn test_tracks_peak_concurrency() {
        let engine = Arc::new(MockEngine::new(Duration::from_millis(100)));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    engine.generate(&RgbImage::new(1, 1), &GenerationParams::default()).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(engine.calls(), 3);
        assert!(engine.peak_concurrency() >= 2);
    }

    #[test]
    fn test_failure_outcome() {
        let engine = MockEngine::new(Duration::ZERO)
            .with_outcome(MockOutcome::Fail(GenerationError::OutOfMemory("vram".into())));
        let err = engine
            .generate(&RgbImage::new(1, 1), &GenerationParams::default())
            .unwrap_err();
        assert_eq!(err, GenerationError::OutOfMemory("vram".into()));
    }
}
