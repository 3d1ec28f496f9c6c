//! Diagnostics Sink contract
//!
//! The diagnostics sink receives everything the router wants a human to know about
//! but does not treat as fatal: configuration problems that were defaulted away,
//! registry writes that failed, arguments that did not fit an entry.

use crate::router::ConfigurationWarning;

/// A non-fatal problem observed by the router
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Diagnostic {
    #[error("configuration warning: {0}")]
    Configuration(#[from] ConfigurationWarning),

    #[error("dispatch of sequence {sequence:?} to destination {destination_index} failed: {message}")]
    DispatchFailure {
        /// Ring sequence of the entry, `None` for direct synchronous writes
        sequence: Option<i64>,
        destination_index: u32,
        message: String,
    },

    #[error("{supplied} arguments sent to destination {destination_index}, only {capacity} kept")]
    ParameterOverflow {
        destination_index: u32,
        supplied: usize,
        capacity: usize,
    },
}

/// Receives router diagnostics
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

impl<F> DiagnosticsSink for F
where
    F: Fn(Diagnostic) + Send + Sync,
{
    fn report(&self, diagnostic: Diagnostic) {
        self(diagnostic)
    }
}

/// Default sink that forwards diagnostics to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::Configuration(warning) => {
                tracing::warn!(%warning, "telemetry router configuration defaulted");
            }
            Diagnostic::DispatchFailure {
                sequence,
                destination_index,
                message,
            } => {
                tracing::error!(
                    ?sequence,
                    destination_index,
                    error = %message,
                    "telemetry dispatch failed"
                );
            }
            Diagnostic::ParameterOverflow { .. } => {
                tracing::warn!(%diagnostic, "telemetry arguments dropped");
            }
        }
    }
}
