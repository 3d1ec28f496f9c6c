//! Telemetry Router Implementation
//!
//! This module moves structured log/monitor events from many producer threads to a
//! single consumer thread through a pre-allocated ring buffer. The consumer hands
//! every entry, in claim order, to a [`DestinationRegistry`].

pub mod config;
pub mod consumer;
pub mod diagnostics;
pub mod entry;
pub mod registry;
pub mod ring_buffer;
#[allow(clippy::module_inception)]
pub mod router;
pub mod sequence;
pub mod sequencer;
pub mod thread_management;
pub mod wait_strategy;

#[cfg(test)]
mod property_tests;

pub use config::{ConfigurationWarning, Mode, RouterConfig, RouterSettings};
pub use consumer::{ConsumerLoop, ConsumerState};
pub use diagnostics::{Diagnostic, DiagnosticsSink, TracingDiagnostics};
pub use entry::{EventEntry, Level, Payload, Value};
pub use registry::DestinationRegistry;
pub use ring_buffer::RingBuffer;
pub use router::{now_nanos, EntryHandle, Router};
pub use sequence::Sequence;
pub use sequencer::Sequencer;
pub use wait_strategy::{BackoffVariant, WaitStrategy, WaitStrategyKind};

/// The initial cursor value for sequences
pub const INITIAL_CURSOR_VALUE: i64 = -1;

/// Errors that can occur in the router
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Ring size must be a power of 2, got: {0}")]
    InvalidRingSize(usize),

    #[error("Could not allocate {requested} {what}")]
    AllocationFailed { what: &'static str, requested: usize },

    #[error("This thread already holds an unpublished entry from this router")]
    EntryStillOpen,

    #[error("Router is shutting down, no new claims are accepted")]
    ShutdownInProgress,

    #[error("Consumer thread has already been started")]
    AlreadyStarted,

    #[error("Wait was interrupted by an alert")]
    Alert,

    #[error("Timeout waiting for sequence")]
    Timeout,

    #[error("Failed to spawn consumer thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("Consumer thread panicked")]
    ConsumerPanicked,

    #[error("Invalid router configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// Utility function to check if a number is a power of 2
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(4));
        assert!(is_power_of_two(65536));

        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(3));
        assert!(!is_power_of_two(1023));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            RouterError::InvalidRingSize(7).to_string(),
            "Ring size must be a power of 2, got: 7"
        );
        assert!(RouterError::ShutdownInProgress
            .to_string()
            .contains("no new claims"));
        assert_eq!(
            RouterError::AllocationFailed {
                what: "payload bytes",
                requested: 64
            }
            .to_string(),
            "Could not allocate 64 payload bytes"
        );
    }
}
