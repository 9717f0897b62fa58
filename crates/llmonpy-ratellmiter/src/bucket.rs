//! A single second's worth of admission capacity and the requests queued against it.

use std::collections::VecDeque;
use tokio::sync::oneshot;

use crate::ticket::{BucketId, Ticket};

/// A request parked against a bucket, waiting either for fresh capacity (overflow)
/// or for reissue after a 429 (rate_limited).
pub(crate) struct Waiter {
    pub ticket: Ticket,
    pub sender: oneshot::Sender<Ticket>,
}

pub(crate) struct SecondBucket {
    pub id: BucketId,
    pub ticket_count: u32,
    pub issued: u32,
    pub overflow: VecDeque<Waiter>,
    pub rate_limited: VecDeque<Waiter>,
    pub finished: Vec<uuid::Uuid>,
}

impl SecondBucket {
    pub fn new(id: BucketId, ticket_count: u32) -> Self {
        Self {
            id,
            ticket_count,
            issued: 0,
            overflow: VecDeque::new(),
            rate_limited: VecDeque::new(),
            finished: Vec::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.issued < self.ticket_count
    }

    /// Issues a ticket out of this bucket's remaining capacity.
    pub fn issue(&mut self, mut ticket: Ticket) -> Ticket {
        ticket.issued_bucket = Some(self.id);
        self.issued += 1;
        ticket
    }
}
