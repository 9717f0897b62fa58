//! Per-provider sliding-minute ticket grid: ramp-up, 429 pause, and probe recovery.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bucket::{SecondBucket, Waiter};
use crate::ticket::{BucketId, RateLimitEvent, Ticket};

/// Floor of the exponential probe backoff used while a limiter is paused.
pub const MIN_PROBE_INTERVAL: Duration = Duration::from_secs(10);
/// Ceiling of the exponential probe backoff.
pub const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(65);
/// Growth factor applied to the probe interval after each failed probe.
pub const PROBE_BACKOFF_FACTOR: f64 = 1.5;

fn div_ceil(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// A provider's requests-per-minute budget and the ramp parameters derived from it.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub rpm: u32,
}

impl RateLimiterConfig {
    pub fn new(rpm: u32) -> Self {
        Self { rpm }
    }

    pub fn max_tickets_per_second(&self) -> u32 {
        self.rpm / 60
    }

    pub fn start_ramp_count(&self) -> u32 {
        div_ceil(self.rpm, 240).max(1)
    }

    pub fn ramp_delta(&self) -> u32 {
        div_ceil(self.rpm, 600).max(1)
    }
}

/// Checks whether a provider is still refusing requests. Implemented per-provider
/// (typically a cheap unauthenticated HEAD or a tiny completion) and handed to the
/// limiter so it can probe its way out of a pause without depending on the client.
#[async_trait::async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_blocked(&self) -> bool;
}

struct LimiterState {
    current: SecondBucket,
    paused: bool,
    issued_this_minute: u32,
}

/// A single provider's admission grid.
///
/// All bucket mutation happens under `state`'s lock; waiters are always resumed
/// after the lock is released, so delivering a ticket to a slow consumer never
/// blocks the next admission decision.
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
    probe: Arc<dyn LivenessProbe>,
}

impl RateLimiter {
    pub fn new(
        name: impl Into<String>,
        config: RateLimiterConfig,
        probe: Arc<dyn LivenessProbe>,
    ) -> Arc<Self> {
        let start = config.start_ramp_count();
        Arc::new(Self {
            name: name.into(),
            config,
            state: Mutex::new(LimiterState {
                current: SecondBucket::new(BucketId::first(), start),
                paused: false,
                issued_this_minute: 0,
            }),
            probe,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> RateLimiterConfig {
        self.config
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Blocks until an admission ticket is available for this provider.
    pub async fn get_ticket(self: &Arc<Self>) -> Ticket {
        let rx = {
            let mut state = self.state.lock();
            let bucket_id = state.current.id;
            if state.current.has_capacity() {
                let ticket = state.current.issue(Ticket::new(bucket_id));
                state.issued_this_minute += 1;
                debug!(provider = %self.name, bucket = ?bucket_id, "ticket issued");
                return ticket;
            }
            let (tx, rx) = oneshot::channel();
            let ticket = Ticket::new(bucket_id);
            state.current.overflow.push_back(Waiter { ticket, sender: tx });
            debug!(provider = %self.name, bucket = ?bucket_id, "ticket queued (overflow)");
            rx
        };
        rx.await.expect("rate limiter dropped without resolving waiter")
    }

    /// Called after a provider returns 429 for a request holding `ticket`. Burns the
    /// rest of the current second's capacity, pauses the limiter if it isn't already,
    /// and blocks until the ticket is reissued once the limiter unpauses.
    pub async fn wait_for_ticket_after_rate_limit_exceeded(self: &Arc<Self>, mut ticket: Ticket) -> Ticket {
        let rx = {
            let mut state = self.state.lock();
            state.current.finished.push(ticket.request_id);
            state.current.ticket_count = 0;

            let limited_bucket = state.current.id;
            let issued_bucket = ticket.issued_bucket.unwrap_or(limited_bucket);
            ticket.rate_limit_events.push(RateLimitEvent {
                issued_bucket,
                limited_bucket,
                reissued_bucket: None,
            });

            let already_paused = state.paused;
            state.paused = true;

            let (tx, rx) = oneshot::channel();
            state.current.rate_limited.push_back(Waiter { ticket, sender: tx });

            if !already_paused {
                warn!(provider = %self.name, "rate limited, pausing admission and starting recovery probe");
                let limiter = Arc::clone(self);
                tokio::spawn(async move { limiter.run_probe().await });
            }
            rx
        };
        rx.await.expect("rate limiter dropped without resolving waiter")
    }

    async fn run_probe(self: Arc<Self>) {
        let mut interval = MIN_PROBE_INTERVAL;
        loop {
            tokio::time::sleep(interval).await;
            if !self.probe.is_blocked().await {
                info!(provider = %self.name, "provider unblocked, resuming admission");
                self.state.lock().paused = false;
                return;
            }
            interval = Duration::from_secs_f64(
                (interval.as_secs_f64() * PROBE_BACKOFF_FACTOR).min(MAX_PROBE_INTERVAL.as_secs_f64()),
            );
            debug!(provider = %self.name, next_probe_secs = interval.as_secs_f64(), "still blocked");
        }
    }

    /// Advances the grid by one wall-clock second. Invoked by the shared monitor tick.
    pub(crate) fn advance_second(&self) {
        let mut to_release: Vec<Waiter> = Vec::new();
        {
            let mut state = self.state.lock();
            let prev_issued = state.current.issued;
            let next_id = state.current.id.next();
            if next_id.minute != state.current.id.minute {
                state.issued_this_minute = 0;
            }

            let next_ticket_count = if state.paused {
                0
            } else {
                (prev_issued + self.config.ramp_delta())
                    .clamp(self.config.start_ramp_count(), self.config.max_tickets_per_second())
            };

            let mut next_bucket = SecondBucket::new(next_id, next_ticket_count);

            if state.paused {
                // No capacity is granted while paused, but waiters already queued
                // on the old bucket must not be dropped along with it — carry
                // both queues forward untouched so they're still here (and their
                // `oneshot::Sender`s still alive) once the limiter unpauses.
                next_bucket.rate_limited = std::mem::take(&mut state.current.rate_limited);
                next_bucket.overflow = std::mem::take(&mut state.current.overflow);
            } else {
                // Rate-limited requests are drained ahead of plain overflow: a request
                // already bounced once gets priority over one that simply arrived late.
                let prev_rate_limited = std::mem::take(&mut state.current.rate_limited);
                let prev_overflow = std::mem::take(&mut state.current.overflow);

                for mut waiter in prev_rate_limited {
                    if next_bucket.has_capacity() {
                        waiter.ticket = next_bucket.issue(waiter.ticket);
                        if let Some(last) = waiter.ticket.rate_limit_events.last_mut() {
                            if last.reissued_bucket.is_none() {
                                last.reissued_bucket = Some(next_id);
                            }
                        }
                        state.issued_this_minute += 1;
                        to_release.push(waiter);
                    } else {
                        next_bucket.rate_limited.push_back(waiter);
                    }
                }
                for mut waiter in prev_overflow {
                    if next_bucket.has_capacity() {
                        waiter.ticket = next_bucket.issue(waiter.ticket);
                        state.issued_this_minute += 1;
                        to_release.push(waiter);
                    } else {
                        next_bucket.overflow.push_back(waiter);
                    }
                }
            }

            state.current = next_bucket;
        }

        for waiter in to_release {
            let _ = waiter.sender.send(waiter.ticket);
        }
    }

    #[cfg(test)]
    pub(crate) fn issued_this_minute(&self) -> u32 {
        self.state.lock().issued_this_minute
    }

    #[cfg(test)]
    pub(crate) fn current_ticket_count(&self) -> u32 {
        self.state.lock().current.ticket_count
    }

    /// Test-only escape hatch: flips `paused` off directly instead of waiting
    /// on the real `MIN_PROBE_INTERVAL`-scheduled probe, so tests can exercise
    /// what a tick does around the pause/unpause boundary without a real
    /// multi-second sleep.
    #[cfg(test)]
    pub(crate) fn force_unpause(&self) {
        self.state.lock().paused = false;
    }
}
