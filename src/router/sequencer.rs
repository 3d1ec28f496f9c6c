//! Sequencer Implementation
//!
//! The sequencer owns the three cursors of the ring:
//!
//! - the claim cursor, the highest sequence any producer has reserved
//! - the published cursor, the highest sequence visible to the consumer
//! - the consumed cursor, the highest sequence the consumer has finished with
//!
//! `consumed <= published <= claim` always holds, and a claim of `sequence` does not
//! return until `sequence - consumed <= buffer_size`, which keeps producers from
//! overwriting a slot the consumer has not released yet.
//!
//! Publication is strictly ordered: a producer that claimed `n` waits until `n - 1`
//! has been published before it advances the published cursor, so the consumer
//! never observes a hole even when producers finish populating out of order.

use crate::router::{is_power_of_two, Result, RouterError, Sequence, WaitStrategy};
use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Coordinates claim, publish and consumption of ring sequences
#[derive(Debug)]
pub struct Sequencer {
    buffer_size: usize,
    claim: Sequence,
    published: Sequence,
    consumed: Sequence,
    wait_strategy: Arc<WaitStrategy>,
    /// Set once the router stops accepting claims
    closed: AtomicBool,
    /// Producers between their closed-check and their claim increment
    claims_in_flight: CachePadded<AtomicUsize>,
}

impl Sequencer {
    /// Create a new sequencer
    ///
    /// # Errors
    /// Returns `RouterError::InvalidRingSize` if `buffer_size` is not a power of 2
    pub fn new(buffer_size: usize, wait_strategy: Arc<WaitStrategy>) -> Result<Self> {
        if !is_power_of_two(buffer_size) {
            return Err(RouterError::InvalidRingSize(buffer_size));
        }

        Ok(Self {
            buffer_size,
            claim: Sequence::default(),
            published: Sequence::default(),
            consumed: Sequence::default(),
            wait_strategy,
            closed: AtomicBool::new(false),
            claims_in_flight: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn wait_strategy(&self) -> &Arc<WaitStrategy> {
        &self.wait_strategy
    }

    /// Claim the next sequence, blocking while the ring is full
    ///
    /// # Errors
    /// Returns `RouterError::ShutdownInProgress` once [`Sequencer::close`] has been called
    pub fn claim_next(&self) -> Result<i64> {
        self.enter_claim()?;
        let sequence = self.claim.increment_and_get();
        self.claims_in_flight.fetch_sub(1, Ordering::Release);

        self.wait_for_capacity(sequence);
        Ok(sequence)
    }

    /// Claim the next sequence only if a slot is free right now
    ///
    /// # Returns
    /// `Ok(None)` when the ring is full
    ///
    /// # Errors
    /// Returns `RouterError::ShutdownInProgress` once [`Sequencer::close`] has been called
    pub fn try_claim_next(&self) -> Result<Option<i64>> {
        self.enter_claim()?;
        let claimed = loop {
            let current = self.claim.get();
            let next = current + 1;
            if next - self.buffer_size as i64 > self.consumed.get() {
                break None;
            }
            if self.claim.compare_and_set(current, next) {
                break Some(next);
            }
        };
        self.claims_in_flight.fetch_sub(1, Ordering::Release);
        Ok(claimed)
    }

    /// Make `sequence` visible to the consumer
    ///
    /// Waits for every lower sequence to be published first.
    pub fn publish(&self, sequence: i64) {
        let backoff = Backoff::new();
        while self.published.get() != sequence - 1 {
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
        self.published.set(sequence);
        self.wait_strategy.signal_all_when_blocking();
    }

    /// The published cursor, for waiting on
    pub fn published_cursor(&self) -> &Sequence {
        &self.published
    }

    pub fn highest_published(&self) -> i64 {
        self.published.get()
    }

    pub fn highest_claimed(&self) -> i64 {
        self.claim.get()
    }

    pub fn consumed(&self) -> i64 {
        self.consumed.get()
    }

    /// Release every slot up to and including `sequence` for reuse
    pub fn mark_consumed(&self, sequence: i64) {
        self.consumed.set(sequence);
    }

    /// Slots that can be claimed without blocking
    ///
    /// Producers blocked in [`Sequencer::claim_next`] have already advanced the claim
    /// cursor past the ring, so the raw difference can go negative; it is clamped to 0.
    pub fn remaining_capacity(&self) -> i64 {
        (self.buffer_size as i64 - (self.claim.get() - self.consumed.get())).max(0)
    }

    /// Stop accepting claims
    ///
    /// # Returns
    /// The final claimed sequence: every claim that succeeded is at or below it
    pub fn close(&self) -> i64 {
        self.closed.store(true, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.claims_in_flight.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
        self.claim.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn enter_claim(&self) -> Result<()> {
        // Pairs with the SeqCst store in close(): either close() sees this producer
        // in flight, or this producer sees the closed flag
        self.claims_in_flight.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.claims_in_flight.fetch_sub(1, Ordering::Release);
            return Err(RouterError::ShutdownInProgress);
        }
        Ok(())
    }

    fn wait_for_capacity(&self, sequence: i64) {
        let wrap_point = sequence - self.buffer_size as i64;
        if wrap_point <= self.consumed.get() {
            return;
        }

        tracing::trace!(sequence, wrap_point, "ring full, producer waiting for consumer");
        let backoff = Backoff::new();
        while wrap_point > self.consumed.get() {
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }
}
