//! Per-connection bookkeeping shared by both listeners: request ids,
//! access logging, and panic recovery.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Monotonic request id generator. Replaces the original's unguarded
/// `requestId++` global counter, which could assign the same id to two
/// requests racing on the increment.
#[derive(Default)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Log a single access-log line in the same shape as the original
/// `Logger.Access` call: request id, method, peer address, host, path,
/// and elapsed time.
pub fn log_access(request_id: u64, method: &str, peer: &str, host: &str, path: &str, elapsed: Duration) {
    info!(
        request_id,
        method,
        peer,
        host,
        path,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "access"
    );
}

/// Run `fut` to completion, logging and recovering from any panic the
/// way the original `PanicMiddleware` does: log the panic and an access
/// line with zero duration, and let the caller substitute a 500 response.
pub async fn catch_panic<F, T>(request_id: u64, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Some(value),
        Err(payload) => {
            let message = panic_message(&payload);
            error!(request_id, "panic recovered: {message}");
            log_access(request_id, "", "", "", "", started.elapsed());
            None
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_monotonic_and_unique() {
        let gen = std::sync::Arc::new(RequestIdGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gen = gen.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| gen.next_id()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000);
    }

    #[tokio::test]
    async fn test_catch_panic_returns_none_on_panic() {
        let result = catch_panic(1, async { panic!("boom") }).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_catch_panic_returns_value_on_success() {
        let result = catch_panic(1, async { 42 }).await;
        assert_eq!(result, Some(42));
    }
}
