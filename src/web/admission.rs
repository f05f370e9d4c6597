//! Admission gate guarding the accelerator.
//!
//! A fixed pool of slots (`MAX_CONCURRENT`) backed by a tokio semaphore. Callers
//! either get a slot within their wait budget or are told to come back later; there
//! is no unbounded queue. A granted slot is returned when its `SlotGuard` drops, so
//! every exit path of the guarded work (return, error, panic unwinding) releases it
//! exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use super::config::ConcurrencyConfig;

/// Outcome of one acquisition attempt.
#[derive(Debug)]
pub enum Admission {
    Granted(SlotGuard),
    TimedOut,
}

/// Exclusive hold on one accelerator slot.
#[derive(Debug)]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    /// Give the slot back now. Equivalent to dropping the guard.
    pub fn release(self) {}
}

/// Bounded-concurrency limiter. Cheap to clone; clones share the same slots.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
    retry_after_s: u64,
}

impl AdmissionGate {
    pub fn new(capacity: usize, acquire_timeout: Duration, retry_after_s: u64) -> Self {
        assert!(capacity > 0, "admission gate needs at least one slot");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
            retry_after_s,
        }
    }

    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        Self::new(
            config.max_concurrent,
            config.acquire_timeout,
            config.retry_after_s,
        )
    }

    /// Try to obtain a slot within the configured wait budget.
    pub async fn acquire(&self) -> Admission {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Try to obtain a slot, waiting at most `timeout`.
    ///
    /// A zero timeout never waits: the slot is granted only if one is free right now.
    pub async fn acquire_within(&self, timeout: Duration) -> Admission {
        if timeout.is_zero() {
            return match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => Admission::Granted(SlotGuard { _permit: permit }),
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                    Admission::TimedOut
                }
            };
        }

        match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Admission::Granted(SlotGuard { _permit: permit }),
            // Elapsed, or the semaphore was closed (it never is).
            Ok(Err(_)) | Err(_) => Admission::TimedOut,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free at this instant. Advisory only; may change immediately.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Seconds a rejected caller is advised to wait before retrying.
    pub fn retry_after_s(&self) -> u64 {
        self.retry_after_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_zero_timeout_rejects_when_full() {
        let gate = AdmissionGate::new(1, Duration::ZERO, 1);

        let first = gate.acquire().await;
        assert!(matches!(first, Admission::Granted(_)));
        assert_eq!(gate.in_flight(), 1);

        let started = Instant::now();
        let second = gate.acquire().await;
        assert!(matches!(second, Admission::TimedOut));
        assert!(started.elapsed() < Duration::from_millis(50));

        drop(first);
        assert_eq!(gate.in_flight(), 0);
        assert!(matches!(gate.acquire().await, Admission::Granted(_)));
    }

    #[tokio::test]
    async fn test_capacity_n_admits_exactly_n() {
        let gate = AdmissionGate::new(3, Duration::ZERO, 2);
        let mut held = Vec::new();
        for _ in 0..3 {
            match gate.acquire().await {
                Admission::Granted(guard) => held.push(guard),
                Admission::TimedOut => panic!("slot should be free"),
            }
        }
        assert!(matches!(gate.acquire().await, Admission::TimedOut));
        assert_eq!(gate.available(), 0);

        held.pop().unwrap().release();
        assert_eq!(gate.available(), 1);
        assert!(matches!(gate.acquire().await, Admission::Granted(_)));
    }

    #[tokio::test]
    async fn test_waits_for_slot_freed_within_budget() {
        let gate = AdmissionGate::new(1, Duration::from_millis(500), 1);
        let Admission::Granted(guard) = gate.acquire().await else {
            panic!("first acquire must succeed");
        };

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(matches!(gate.acquire().await, Admission::Granted(_)));
    }

    #[tokio::test]
    async fn test_times_out_after_budget() {
        let gate = AdmissionGate::new(1, Duration::from_millis(60), 1);
        let _held = gate.acquire().await;

        let started = Instant::now();
        assert!(matches!(gate.acquire().await, Admission::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_slot_leak_under_load() {
        let gate = AdmissionGate::new(2, Duration::from_millis(5), 1);
        let mut tasks = Vec::new();
        for i in 0..64u64 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                if let Admission::Granted(guard) = gate.acquire().await {
                    tokio::time::sleep(Duration::from_millis(i % 3)).await;
                    if i % 5 == 0 {
                        // early explicit release path
                        guard.release();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(gate.in_flight(), 0);
        assert!(matches!(gate.acquire_within(Duration::ZERO).await, Admission::Granted(_)));
    }

    #[test]
    fn test_slot_released_on_panic() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let gate = AdmissionGate::new(1, Duration::ZERO, 1);
        let guard = match rt.block_on(gate.acquire()) {
            Admission::Granted(guard) => guard,
            Admission::TimedOut => panic!("slot should be free"),
        };

        let outcome = std::thread::spawn(move || {
            let _slot = guard;
            panic!("engine blew up");
        })
        .join();
        assert!(outcome.is_err());
        assert_eq!(gate.in_flight(), 0);
    }
}
