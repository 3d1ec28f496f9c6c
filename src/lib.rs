//! Telemetry Router - Asynchronous Log and Monitor Event Routing
//!
//! Moves structured telemetry events from many producer threads to a single
//! dispatching consumer thread through a pre-allocated ring buffer, so that logging
//! on a hot path costs a slot claim and a few field writes.
//!
//! ## Features
//!
//! - **Zero-allocation steady state**: every entry, parameter slot and payload buffer
//!   is allocated once when the router is built
//! - **Ordered delivery**: the registry sees entries in exactly the order they were
//!   claimed, across all producers
//! - **Backpressure**: producers wait when the ring is full; nothing is dropped
//! - **Pluggable waiting**: blocking, yielding, sleeping, busy-spin, phased backoff
//!   and timeout-blocking consumer wait strategies
//! - **Graceful shutdown**: everything claimed before `stop` is delivered
//! - **Synchronous fallback**: a lock-serialized mode that writes on the caller's thread
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use telemetry_router::{
//!     DestinationRegistry, EventEntry, Level, Router, RouterSettings, TracingDiagnostics,
//!     Value,
//! };
//!
//! struct Console;
//!
//! impl DestinationRegistry for Console {
//!     fn write(&self, entry: &EventEntry) -> anyhow::Result<()> {
//!         println!("[{}] {:?} {:?}", entry.level, entry.template, entry.parameters());
//!         Ok(())
//!     }
//!
//!     fn write_direct(
//!         &self,
//!         _destination_index: u32,
//!         level: Level,
//!         _timestamp_nanos: i64,
//!         _source: Option<&str>,
//!         template: Option<&str>,
//!         args: &[Value],
//!     ) -> anyhow::Result<()> {
//!         println!("[{level}] {template:?} {args:?}");
//!         Ok(())
//!     }
//!
//!     fn index_of(&self, name: &str) -> Option<u32> {
//!         (name == "console").then_some(0)
//!     }
//! }
//!
//! let settings =
//!     RouterSettings::from_json(r#"{"mode": "asynchronous", "ringSize": 1024}"#).unwrap();
//! let router =
//!     Router::from_settings(&settings, Arc::new(Console), Arc::new(TracingDiagnostics))
//!         .unwrap();
//! router.start().unwrap();
//!
//! let console = router.index_of("console").unwrap();
//! let mut entry = router.get().unwrap();
//! entry.destination_index = console;
//! entry.template = Some("user {} logged in".into());
//! entry.push_parameter("alice");
//! router.publish(entry);
//!
//! router.stop().unwrap();
//! ```
//!
//! ## Architecture
//!
//! - **`RingBuffer`**: pre-allocated slots of reusable `EventEntry` values
//! - **`Sequence`**: cache-padded atomic cursors
//! - **`Sequencer`**: claim, publish and consume cursors plus the shutdown gate
//! - **`WaitStrategy`**: how the consumer waits for the published cursor to move
//! - **`ConsumerLoop`**: drains published entries in batches into the registry
//! - **`Router`**: the producer-facing API and lifecycle

pub mod router;

// Re-export the main types for convenience
pub use router::{
    is_power_of_two,
    now_nanos,
    BackoffVariant,
    ConfigurationWarning,
    ConsumerLoop,
    ConsumerState,
    DestinationRegistry,
    Diagnostic,
    DiagnosticsSink,
    EntryHandle,
    EventEntry,
    Level,
    Mode,
    Payload,
    Result,
    RingBuffer,
    Router,
    RouterConfig,
    RouterError,
    RouterSettings,
    Sequence,
    Sequencer,
    TracingDiagnostics,
    Value,
    WaitStrategy,
    WaitStrategyKind,
    INITIAL_CURSOR_VALUE,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the version of the telemetry router library
#[must_use]
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
