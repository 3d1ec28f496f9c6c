//! Ring Buffer Implementation
//!
//! The ring buffer is a pre-allocated circular array of [`EventEntry`] slots plus the
//! [`Sequencer`] that hands those slots out. Every entry is created when the ring is
//! built and reused for the lifetime of the ring; slot `sequence & (size - 1)` holds
//! sequence `sequence`.

use crate::router::{EventEntry, Result, RouterError, Sequencer, WaitStrategy};
use std::cell::UnsafeCell;
use std::sync::Arc;

/// Fixed-capacity circular array of event entries
#[derive(Debug)]
pub struct RingBuffer {
    /// Using `Box<[UnsafeCell<_>]>` so slots can be handed out mutably through `&self`
    slots: Box<[UnsafeCell<EventEntry>]>,
    /// Mask for fast modulo operations (buffer_size - 1)
    index_mask: i64,
    sequencer: Sequencer,
}

impl RingBuffer {
    /// Create a ring buffer and pre-allocate every entry
    ///
    /// # Arguments
    /// * `buffer_size` - Number of slots (must be a power of 2)
    /// * `max_parameters` - Parameter slots per entry
    /// * `payload_capacity` - Payload bytes per entry
    /// * `wait_strategy` - Strategy signalled on every publish
    ///
    /// # Errors
    /// * `RouterError::InvalidRingSize` if `buffer_size` is not a power of 2
    /// * `RouterError::AllocationFailed` if the slots or any entry's storage cannot be reserved
    pub fn new(
        buffer_size: usize,
        max_parameters: usize,
        payload_capacity: usize,
        wait_strategy: Arc<WaitStrategy>,
    ) -> Result<Self> {
        let sequencer = Sequencer::new(buffer_size, wait_strategy)?;

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(buffer_size)
            .map_err(|_| RouterError::AllocationFailed {
                what: "ring slots",
                requested: buffer_size,
            })?;
        for _ in 0..buffer_size {
            slots.push(UnsafeCell::new(EventEntry::new(
                max_parameters,
                payload_capacity,
            )?));
        }

        Ok(Self {
            slots: slots.into_boxed_slice(),
            index_mask: (buffer_size - 1) as i64,
            sequencer,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.slots.len()
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Claim the next sequence, blocking while the ring is full
    ///
    /// # Errors
    /// Returns `RouterError::ShutdownInProgress` after [`RingBuffer::close`]
    pub fn claim_next(&self) -> Result<i64> {
        self.sequencer.claim_next()
    }

    /// Claim the next sequence if a slot is free right now
    ///
    /// # Errors
    /// Returns `RouterError::ShutdownInProgress` after [`RingBuffer::close`]
    pub fn try_claim_next(&self) -> Result<Option<i64>> {
        self.sequencer.try_claim_next()
    }

    /// Get the entry for `sequence`
    ///
    /// # Safety
    /// The caller must own `sequence`: either it claimed the sequence and has not
    /// published it yet, or it is the consumer and the sequence lies between the
    /// consumed and published cursors. No other reference to the slot may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn entry_at(&self, sequence: i64) -> &mut EventEntry {
        let index = (sequence & self.index_mask) as usize;
        // SAFETY: Index is within bounds - guaranteed by invariant and index mask.
        let slot = self.slots.get_unchecked(index);
        &mut *slot.get()
    }

    /// Address of the entry stored in the slot for `sequence`
    pub fn entry_ptr(&self, sequence: i64) -> *const EventEntry {
        let index = (sequence & self.index_mask) as usize;
        self.slots[index].get()
    }

    /// Make `sequence` visible to the consumer once all lower sequences are
    pub fn publish(&self, sequence: i64) {
        self.sequencer.publish(sequence);
    }

    pub fn highest_published(&self) -> i64 {
        self.sequencer.highest_published()
    }

    /// Release every slot up to and including `sequence` for reuse
    pub fn mark_consumed(&self, sequence: i64) {
        self.sequencer.mark_consumed(sequence);
    }

    pub fn consumed(&self) -> i64 {
        self.sequencer.consumed()
    }

    pub fn remaining_capacity(&self) -> i64 {
        self.sequencer.remaining_capacity()
    }

    /// Stop accepting claims, returning the last claimed sequence
    pub fn close(&self) -> i64 {
        self.sequencer.close()
    }

    pub fn wait_strategy(&self) -> &Arc<WaitStrategy> {
        self.sequencer.wait_strategy()
    }
}

// SAFETY: slots are only reached through entry_at, whose contract gives every slot
// a single owner at a time; the hand-off between owners is ordered by the
// Release/Acquire cursors in the sequencer.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}
