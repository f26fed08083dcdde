//! Shared run context
//!
//! One `RunContext` is created per CLI invocation and threaded through the
//! runner, crawlers, and writer. It carries the immutable run identity plus
//! the two run-wide soft stops (product budget and deadline) and the
//! cancellation signal raised by Ctrl-C.

use crate::config::{DelayRange, GlobalStopConfig};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Immutable run identity plus the synchronized global product counter
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub resume: bool,
    pub dry_run: bool,
    stop: GlobalStopConfig,
    started_instant: Instant,
    products_committed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(run_id: String, resume: bool, dry_run: bool, stop: GlobalStopConfig) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            resume,
            dry_run,
            stop,
            started_instant: Instant::now(),
            products_committed: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// The cancellation token wired to the OS interrupt handler
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Records one committed product and returns the new run-wide total
    pub fn register_product(&self) -> u64 {
        self.products_committed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn products_committed(&self) -> u64 {
        self.products_committed.load(Ordering::SeqCst)
    }

    /// True when a global stop threshold has been breached or the run was
    /// cancelled; checked at product and category boundaries
    pub fn should_stop(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        if let Some(limit) = self.stop.stop_after_products {
            if self.products_committed() >= limit {
                return true;
            }
        }
        if let Some(minutes) = self.stop.stop_after_minutes {
            if self.started_instant.elapsed() >= Duration::from_secs(minutes * 60) {
                return true;
            }
        }
        false
    }
}

/// Sleeps for a uniformly random duration inside the range.
///
/// A range with `max_sec <= 0` is a no-op, so delays can be disabled from
/// config (and in tests) without special-casing call sites.
pub async fn jitter_sleep(range: &DelayRange) {
    if range.is_zero() {
        return;
    }
    let secs = rand::thread_rng().gen_range(range.min_sec..=range.max_sec.max(range.min_sec));
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with(stop: GlobalStopConfig) -> RunContext {
        RunContext::new("run-1".to_string(), true, false, stop)
    }

    #[test]
    fn test_product_counter_increments() {
        let context = context_with(GlobalStopConfig::default());
        assert_eq!(context.register_product(), 1);
        assert_eq!(context.register_product(), 2);
        assert_eq!(context.products_committed(), 2);
    }

    #[test]
    fn test_stop_after_products_threshold() {
        let context = context_with(GlobalStopConfig {
            stop_after_products: Some(2),
            stop_after_minutes: None,
        });
        assert!(!context.should_stop());
        context.register_product();
        context.register_product();
        assert!(context.should_stop());
    }

    #[test]
    fn test_cancellation_stops_the_run() {
        let context = context_with(GlobalStopConfig::default());
        assert!(!context.should_stop());
        context.cancellation().cancel();
        assert!(context.should_stop());
    }

    #[tokio::test]
    async fn test_zero_range_sleep_returns_immediately() {
        let started = Instant::now();
        jitter_sleep(&DelayRange::new(0.0, 0.0)).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
