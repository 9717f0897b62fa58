//! Ticket and rate-limit-event bookkeeping for a single request's admission lifecycle.

use std::time::Instant;
use uuid::Uuid;

/// Identifies one second-wide slice of a limiter's sliding minute grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketId {
    pub minute: u64,
    pub second: u8,
}

impl BucketId {
    pub fn first() -> Self {
        Self { minute: 0, second: 0 }
    }

    /// The bucket one second after this one, rolling the minute counter at :60.
    pub fn next(self) -> Self {
        if self.second == 59 {
            Self { minute: self.minute + 1, second: 0 }
        } else {
            Self { minute: self.minute, second: self.second + 1 }
        }
    }
}

/// One 429 recovery episode for a ticket: issued, then rejected, then (eventually) reissued.
#[derive(Debug, Clone)]
pub struct RateLimitEvent {
    pub issued_bucket: BucketId,
    pub limited_bucket: BucketId,
    pub reissued_bucket: Option<BucketId>,
}

/// A one-shot admission permit.
///
/// Survives 429 responses: the same ticket is reissued rather than replaced, so
/// its `rate_limit_events` accumulate the full recovery history for a request.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub request_id: Uuid,
    pub initial_bucket: BucketId,
    pub issued_bucket: Option<BucketId>,
    pub rate_limit_events: Vec<RateLimitEvent>,
    pub(crate) created_at: Instant,
}

impl Ticket {
    pub(crate) fn new(initial_bucket: BucketId) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            initial_bucket,
            issued_bucket: None,
            rate_limit_events: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn was_rate_limited(&self) -> bool {
        !self.rate_limit_events.is_empty()
    }
}
