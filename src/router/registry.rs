//! Destination Registry contract
//!
//! The registry is the collaborator that owns the actual destinations (console,
//! file, remote sinks). It resolves a small integer index to a writer and performs
//! the write. The router never owns a registry; it shares one that outlives it.

use crate::router::{EventEntry, Level, Value};

/// Resolves destination indices and writes events to them
///
/// Implementations are called from the consumer thread in asynchronous mode and
/// from producer threads, one at a time under the router's lock, in synchronous mode.
pub trait DestinationRegistry: Send + Sync {
    /// Write a fully populated entry
    ///
    /// `entry.destination_index` selects the destination and
    /// [`EventEntry::end_of_batch`] tells the registry whether more entries follow
    /// immediately, so buffered destinations know when to flush.
    ///
    /// # Errors
    /// Any error is reported to the diagnostics sink; the router moves on to the
    /// next entry.
    fn write(&self, entry: &EventEntry) -> anyhow::Result<()>;

    /// Write an event directly from its parts, used by synchronous mode
    ///
    /// # Errors
    /// Any error is reported to the diagnostics sink.
    fn write_direct(
        &self,
        destination_index: u32,
        level: Level,
        timestamp_nanos: i64,
        source: Option<&str>,
        template: Option<&str>,
        args: &[Value],
    ) -> anyhow::Result<()>;

    /// Resolve a destination name to its index
    fn index_of(&self, name: &str) -> Option<u32>;
}
