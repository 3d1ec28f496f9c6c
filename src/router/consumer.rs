//! Consumer Loop Implementation
//!
//! The consumer loop runs on the router's single consumer thread. It waits for the
//! published cursor to move, then drains every newly published sequence in order,
//! flags the last entry of each batch and hands each entry to the registry.
//!
//! State machine: `Idle -> Waiting -> Draining -> Waiting ... -> Stopped`. After a
//! stop request the loop keeps draining until it has consumed every sequence that
//! was claimed before the ring closed, so in-flight telemetry is not lost.

use crate::router::{
    DestinationRegistry, Diagnostic, DiagnosticsSink, EventEntry, RingBuffer, RouterError,
};
use crossbeam_utils::Backoff;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Observable state of the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsumerState {
    /// Not started yet
    Idle = 0,
    /// Parked in the wait strategy
    Waiting = 1,
    /// Handing a batch to the registry
    Draining = 2,
    /// Drained and exited
    Stopped = 3,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsumerState::Waiting,
            2 => ConsumerState::Draining,
            3 => ConsumerState::Stopped,
            _ => ConsumerState::Idle,
        }
    }
}

/// State shared between the router and its consumer loop
#[derive(Debug)]
pub(crate) struct ConsumerControl {
    alert: AtomicBool,
    state: AtomicU8,
    /// Last sequence that must be drained before the loop may exit
    drain_target: AtomicI64,
    dispatched: AtomicU64,
    failed: AtomicU64,
}

impl ConsumerControl {
    pub(crate) fn new() -> Self {
        Self {
            alert: AtomicBool::new(false),
            state: AtomicU8::new(ConsumerState::Idle as u8),
            drain_target: AtomicI64::new(crate::router::INITIAL_CURSOR_VALUE),
            dispatched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Ask the loop to drain up to `drain_target` and exit
    pub(crate) fn request_stop(&self, drain_target: i64) {
        self.drain_target.store(drain_target, Ordering::Release);
        self.alert.store(true, Ordering::Release);
    }

    pub(crate) fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Drains the ring buffer into the destination registry
pub struct ConsumerLoop {
    ring: Arc<RingBuffer>,
    registry: Arc<dyn DestinationRegistry>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    control: Arc<ConsumerControl>,
}

impl ConsumerLoop {
    pub(crate) fn new(
        ring: Arc<RingBuffer>,
        registry: Arc<dyn DestinationRegistry>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        control: Arc<ConsumerControl>,
    ) -> Self {
        Self {
            ring,
            registry,
            diagnostics,
            control,
        }
    }

    /// Run until a stop is requested and everything claimed before it is drained
    pub fn run(&mut self) {
        let mut next_sequence = self.ring.consumed() + 1;
        let wait_strategy = Arc::clone(self.ring.wait_strategy());

        loop {
            self.control.set_state(ConsumerState::Waiting);
            let cursor = self.ring.sequencer().published_cursor();
            match wait_strategy.wait_for(next_sequence, cursor, &self.control.alert) {
                Ok(available) => {
                    self.dispatch_batch(next_sequence, available);
                    next_sequence = available + 1;
                }
                Err(RouterError::Timeout) => {
                    tracing::trace!(next_sequence, "consumer wait timed out");
                }
                Err(RouterError::Alert) => break,
                Err(error) => {
                    tracing::error!(%error, "consumer wait failed, draining and stopping");
                    break;
                }
            }
        }

        let drain_target = self.control.drain_target.load(Ordering::Acquire);
        tracing::debug!(next_sequence, drain_target, "consumer draining before stop");
        let backoff = Backoff::new();
        while next_sequence <= drain_target {
            let available = self.ring.highest_published();
            if available >= next_sequence {
                self.dispatch_batch(next_sequence, available);
                next_sequence = available + 1;
                backoff.reset();
            } else if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }

        self.control.set_state(ConsumerState::Stopped);
    }

    /// Dispatch `start..=end` in order and release the slots
    fn dispatch_batch(&self, start: i64, end: i64) {
        self.control.set_state(ConsumerState::Draining);
        for sequence in start..=end {
            // SAFETY: start..=end lies between the consumed and published cursors,
            // and this loop is the only consumer.
            let entry = unsafe { self.ring.entry_at(sequence) };
            entry.end_of_batch = sequence == end;
            if entry.abandoned {
                continue;
            }
            if dispatch_entry(&*self.registry, &*self.diagnostics, entry) {
                self.control.dispatched.fetch_add(1, Ordering::Relaxed);
            } else {
                self.control.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.ring.mark_consumed(end);
    }
}

/// Write one entry, containing both errors and panics from the registry
///
/// # Returns
/// `true` if the registry accepted the entry
pub(crate) fn dispatch_entry(
    registry: &dyn DestinationRegistry,
    diagnostics: &dyn DiagnosticsSink,
    entry: &EventEntry,
) -> bool {
    let message = match panic::catch_unwind(AssertUnwindSafe(|| registry.write(entry))) {
        Ok(Ok(())) => return true,
        Ok(Err(error)) => format!("{error:#}"),
        Err(payload) => panic_message(payload.as_ref()),
    };

    diagnostics.report(Diagnostic::DispatchFailure {
        sequence: Some(entry.sequence()),
        destination_index: entry.destination_index,
        message,
    });
    false
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("registry panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("registry panicked: {message}")
    } else {
        "registry panicked".to_string()
    }
}
