//! Router configuration
//!
//! [`RouterSettings`] is the raw, string-typed form read from JSON or from a flat
//! key/value map. [`RouterConfig::resolve`] turns it into typed configuration,
//! reporting a [`ConfigurationWarning`] for every value it had to replace with a
//! default. Configuration problems never fail router construction.

use crate::router::wait_strategy::{BackoffVariant, WaitStrategyKind};
use crate::router::{is_power_of_two, Diagnostic, DiagnosticsSink, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_RING_SIZE: usize = 65536;
pub const DEFAULT_ENTRY_CAPACITY_BYTES: usize = 256;
pub const DEFAULT_MAX_PARAMETERS: usize = 8;
pub const DEFAULT_SPIN_TIMEOUT_NANOS: u64 = 10_000;
pub const DEFAULT_YIELD_TIMEOUT_NANOS: u64 = 100_000;
pub const DEFAULT_BLOCKING_TIMEOUT_NANOS: u64 = 1_000_000;
pub const DEFAULT_SLEEP_NANOS: u64 = 100_000;
pub const DEFAULT_CONSUMER_THREAD_NAME: &str = "telemetry-router";

/// How events reach the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Producers hand entries to a consumer thread through the ring buffer
    Asynchronous,
    /// Producers write to the registry themselves, serialized by a lock
    #[default]
    Synchronous,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Asynchronous => "asynchronous",
            Mode::Synchronous => "synchronous",
        }
    }
}

/// A configuration value that was replaced by a default
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationWarning {
    #[error("unknown mode '{0}', using synchronous")]
    UnknownMode(String),

    #[error("unknown wait strategy '{0}', using blocking")]
    UnknownWaitStrategy(String),

    #[error("unknown backoff variant '{0}', using lock")]
    UnknownBackoffVariant(String),

    #[error("ring size {requested} is not a power of 2, using {applied}")]
    InvalidRingSize { requested: usize, applied: usize },

    #[error("option '{key}' has unparsable value '{value}', using the default")]
    InvalidValue { key: String, value: String },

    #[error("unknown option '{0}' ignored")]
    UnknownOption(String),
}

/// Raw router settings, keyed the way configuration files spell them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterSettings {
    pub entry_capacity_bytes: Option<usize>,
    pub ring_size: Option<usize>,
    pub mode: Option<String>,
    pub wait_strategy: Option<String>,
    pub backoff_variant: Option<String>,
    pub spin_timeout_nanos: Option<u64>,
    pub yield_timeout_nanos: Option<u64>,
    pub blocking_timeout_nanos: Option<u64>,
    pub sleep_nanos: Option<u64>,
    pub max_parameters: Option<usize>,
    pub consumer_thread_name: Option<String>,
    pub consumer_core: Option<usize>,
    /// Keys this version does not recognise
    #[serde(flatten, skip_serializing)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl RouterSettings {
    /// Parse settings from a JSON object
    ///
    /// # Errors
    /// Returns `RouterError::Config` if the text is not a JSON object of the right shape
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Build settings from flat string pairs, as found in properties files
    ///
    /// Values that do not parse and keys that are not recognised are reported to
    /// `diagnostics` and otherwise ignored.
    pub fn from_pairs<I, K, V>(pairs: I, diagnostics: &dyn DiagnosticsSink) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Self::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref().trim(), value.as_ref().trim());
            match key {
                "entryCapacityBytes" => {
                    settings.entry_capacity_bytes = parse_number(key, value, diagnostics)
                }
                "ringSize" => settings.ring_size = parse_number(key, value, diagnostics),
                "mode" => settings.mode = Some(value.to_string()),
                "waitStrategy" => settings.wait_strategy = Some(value.to_string()),
                "backoffVariant" => settings.backoff_variant = Some(value.to_string()),
                "spinTimeoutNanos" => {
                    settings.spin_timeout_nanos = parse_number(key, value, diagnostics)
                }
                "yieldTimeoutNanos" => {
                    settings.yield_timeout_nanos = parse_number(key, value, diagnostics)
                }
                "blockingTimeoutNanos" => {
                    settings.blocking_timeout_nanos = parse_number(key, value, diagnostics)
                }
                "sleepNanos" => settings.sleep_nanos = parse_number(key, value, diagnostics),
                "maxParameters" => settings.max_parameters = parse_number(key, value, diagnostics),
                "consumerThreadName" => settings.consumer_thread_name = Some(value.to_string()),
                "consumerCore" => settings.consumer_core = parse_number(key, value, diagnostics),
                _ => diagnostics.report(ConfigurationWarning::UnknownOption(key.to_string()).into()),
            }
        }
        settings
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &str,
    value: &str,
    diagnostics: &dyn DiagnosticsSink,
) -> Option<T> {
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            diagnostics.report(
                ConfigurationWarning::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                }
                .into(),
            );
            None
        }
    }
}

/// Typed router configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    pub mode: Mode,
    pub ring_size: usize,
    pub entry_capacity_bytes: usize,
    pub max_parameters: usize,
    pub wait_strategy: WaitStrategyKind,
    pub consumer_thread_name: String,
    pub consumer_core: Option<usize>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            ring_size: DEFAULT_RING_SIZE,
            entry_capacity_bytes: DEFAULT_ENTRY_CAPACITY_BYTES,
            max_parameters: DEFAULT_MAX_PARAMETERS,
            wait_strategy: WaitStrategyKind::default(),
            consumer_thread_name: DEFAULT_CONSUMER_THREAD_NAME.to_string(),
            consumer_core: None,
        }
    }
}

impl RouterConfig {
    /// Default configuration in asynchronous mode
    pub fn asynchronous() -> Self {
        Self::default().with_mode(Mode::Asynchronous)
    }

    /// Default configuration in synchronous mode
    pub fn synchronous() -> Self {
        Self::default().with_mode(Mode::Synchronous)
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the number of ring slots (must be a power of 2 when the router is built)
    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    pub fn with_entry_capacity_bytes(mut self, bytes: usize) -> Self {
        self.entry_capacity_bytes = bytes;
        self
    }

    pub fn with_max_parameters(mut self, max_parameters: usize) -> Self {
        self.max_parameters = max_parameters;
        self
    }

    pub fn with_wait_strategy(mut self, wait_strategy: WaitStrategyKind) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    pub fn with_consumer_thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.consumer_thread_name = name.into();
        self
    }

    /// Pin the consumer thread to a CPU core
    pub fn pin_consumer_at_core(mut self, core_id: usize) -> Self {
        self.consumer_core = Some(core_id);
        self
    }

    /// Resolve raw settings, reporting every defaulted value to `diagnostics`
    pub fn resolve(settings: &RouterSettings, diagnostics: &dyn DiagnosticsSink) -> Self {
        let warn = |warning: ConfigurationWarning| diagnostics.report(Diagnostic::from(warning));

        for key in settings.unknown.keys() {
            warn(ConfigurationWarning::UnknownOption(key.clone()));
        }

        let mode = match settings.mode.as_deref() {
            None => Mode::default(),
            Some(name) => parse_mode(name).unwrap_or_else(|| {
                warn(ConfigurationWarning::UnknownMode(name.to_string()));
                Mode::default()
            }),
        };

        let ring_size = match settings.ring_size {
            None => DEFAULT_RING_SIZE,
            Some(requested) if is_power_of_two(requested) => requested,
            Some(requested) => {
                let applied = requested
                    .checked_next_power_of_two()
                    .filter(|&size| requested != 0 && size > 0)
                    .unwrap_or(DEFAULT_RING_SIZE);
                warn(ConfigurationWarning::InvalidRingSize { requested, applied });
                applied
            }
        };

        let variant = match settings.backoff_variant.as_deref() {
            None => BackoffVariant::Lock,
            Some(name) => parse_backoff_variant(name).unwrap_or_else(|| {
                warn(ConfigurationWarning::UnknownBackoffVariant(name.to_string()));
                BackoffVariant::Lock
            }),
        };

        let nanos = |value: Option<u64>, default: u64| Duration::from_nanos(value.unwrap_or(default));
        let sleep = nanos(settings.sleep_nanos, DEFAULT_SLEEP_NANOS);
        let wait_strategy = match settings.wait_strategy.as_deref() {
            None => WaitStrategyKind::default(),
            Some(name) => match normalize(name).as_str() {
                "blocking" => WaitStrategyKind::Blocking,
                "yielding" => WaitStrategyKind::Yielding,
                "sleeping" => WaitStrategyKind::Sleeping { sleep },
                "busyspin" => WaitStrategyKind::BusySpin,
                "backoff" | "phasedbackoff" => WaitStrategyKind::PhasedBackoff {
                    spin_timeout: nanos(settings.spin_timeout_nanos, DEFAULT_SPIN_TIMEOUT_NANOS),
                    yield_timeout: nanos(settings.yield_timeout_nanos, DEFAULT_YIELD_TIMEOUT_NANOS),
                    variant,
                    sleep,
                },
                "timeout" | "timeoutblocking" => WaitStrategyKind::TimeoutBlocking {
                    timeout: nanos(settings.blocking_timeout_nanos, DEFAULT_BLOCKING_TIMEOUT_NANOS),
                },
                _ => {
                    warn(ConfigurationWarning::UnknownWaitStrategy(name.to_string()));
                    WaitStrategyKind::default()
                }
            },
        };

        Self {
            mode,
            ring_size,
            entry_capacity_bytes: settings
                .entry_capacity_bytes
                .unwrap_or(DEFAULT_ENTRY_CAPACITY_BYTES),
            max_parameters: settings.max_parameters.unwrap_or(DEFAULT_MAX_PARAMETERS),
            wait_strategy,
            consumer_thread_name: settings
                .consumer_thread_name
                .clone()
                .unwrap_or_else(|| DEFAULT_CONSUMER_THREAD_NAME.to_string()),
            consumer_core: settings.consumer_core,
        }
    }
}

/// Lower-case and strip separators so `busy-spin`, `Busy_Spin` and `busyspin` agree
fn normalize(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn parse_mode(name: &str) -> Option<Mode> {
    match normalize(name).as_str() {
        "asynchronous" | "async" => Some(Mode::Asynchronous),
        "synchronous" | "sync" => Some(Mode::Synchronous),
        _ => None,
    }
}

fn parse_backoff_variant(name: &str) -> Option<BackoffVariant> {
    match normalize(name).as_str() {
        "lock" => Some(BackoffVariant::Lock),
        "sleep" => Some(BackoffVariant::Sleep),
        _ => None,
    }
}
