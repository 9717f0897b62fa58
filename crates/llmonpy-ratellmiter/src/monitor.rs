//! Drives every registered limiter's per-second grid advance from a single ticker.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use crate::limiter::RateLimiter;

/// One ticker shared by every provider's [`RateLimiter`], so all grids advance on
/// the same wall-clock second rather than drifting against independent timers.
pub struct RateLimiterMonitor {
    limiters: Mutex<Vec<Arc<RateLimiter>>>,
}

impl RateLimiterMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { limiters: Mutex::new(Vec::new()) })
    }

    pub fn register(&self, limiter: Arc<RateLimiter>) {
        self.limiters.lock().push(limiter);
    }

    /// Spawns the once-per-second ticker. The caller holds the returned handle and
    /// aborts it on shutdown.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let limiters = monitor.limiters.lock().clone();
                for limiter in limiters {
                    limiter.advance_second();
                }
            }
        })
    }
}

impl Default for RateLimiterMonitor {
    fn default() -> Self {
        // `new` returns an Arc because callers always need shared ownership to
        // register limiters from multiple clients; `default` still has to return
        // a bare value, so unwrap the Arc here rather than exposing two constructors.
        Arc::into_inner(RateLimiterMonitor::new()).expect("no other references yet")
    }
}
