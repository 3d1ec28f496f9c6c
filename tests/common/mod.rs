//! Shared fixtures for the router integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use telemetry_router::{
    DestinationRegistry, Diagnostic, DiagnosticsSink, EventEntry, Level, Value,
};

/// Destination index whose writes fail with an error
pub const FAILING_DESTINATION: u32 = 13;
/// Destination index whose writes panic
pub const PANICKING_DESTINATION: u32 = 14;

/// Install a test-friendly tracing subscriber, honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .with_thread_ids(true)
        .try_init();
}

/// What the registry saw for one entry
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub sequence: i64,
    pub destination_index: u32,
    pub end_of_batch: bool,
    pub payload: Vec<u8>,
    pub parameters: Vec<Value>,
    pub entry_address: usize,
    pub payload_address: usize,
}

/// Direct write seen in synchronous mode
#[derive(Debug, Clone, PartialEq)]
pub struct SeenDirect {
    pub destination_index: u32,
    pub level: Level,
    pub template: Option<String>,
    pub args: Vec<Value>,
    pub thread: ThreadId,
}

/// Registry that records every write and refuses re-entrant or concurrent use
#[derive(Default)]
pub struct RecordingRegistry {
    pub entries: Mutex<Vec<Seen>>,
    pub direct: Mutex<Vec<SeenDirect>>,
    /// Per-write delay, simulating slow I/O
    pub delay: Option<Duration>,
    busy: AtomicBool,
    pub overlaps: Mutex<usize>,
}

impl RecordingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn sequences(&self) -> Vec<i64> {
        self.entries.lock().iter().map(|seen| seen.sequence).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn enter(&self) {
        if self.busy.swap(true, Ordering::AcqRel) {
            *self.overlaps.lock() += 1;
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
    }

    fn leave(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl DestinationRegistry for RecordingRegistry {
    fn write(&self, entry: &EventEntry) -> anyhow::Result<()> {
        match entry.destination_index {
            FAILING_DESTINATION => anyhow::bail!("destination {FAILING_DESTINATION} is closed"),
            PANICKING_DESTINATION => panic!("destination {PANICKING_DESTINATION} blew up"),
            _ => {}
        }

        self.enter();
        self.entries.lock().push(Seen {
            sequence: entry.sequence(),
            destination_index: entry.destination_index,
            end_of_batch: entry.end_of_batch(),
            payload: entry.payload().as_bytes().to_vec(),
            parameters: entry.parameters().to_vec(),
            entry_address: entry as *const EventEntry as usize,
            payload_address: entry.payload().storage_ptr() as usize,
        });
        self.leave();
        Ok(())
    }

    fn write_direct(
        &self,
        destination_index: u32,
        level: Level,
        _timestamp_nanos: i64,
        _source: Option<&str>,
        template: Option<&str>,
        args: &[Value],
    ) -> anyhow::Result<()> {
        if destination_index == FAILING_DESTINATION {
            anyhow::bail!("destination {FAILING_DESTINATION} is closed");
        }

        self.enter();
        self.direct.lock().push(SeenDirect {
            destination_index,
            level,
            template: template.map(str::to_string),
            args: args.to_vec(),
            thread: thread::current().id(),
        });
        self.leave();
        Ok(())
    }

    fn index_of(&self, name: &str) -> Option<u32> {
        match name {
            "console" => Some(0),
            "file" => Some(1),
            _ => None,
        }
    }
}

/// Diagnostics sink collecting everything it is told
pub fn collecting_sink() -> (Arc<Mutex<Vec<Diagnostic>>>, Arc<dyn DiagnosticsSink>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = Arc::clone(&seen);
        move |diagnostic: Diagnostic| seen.lock().push(diagnostic)
    };
    let sink: Arc<dyn DiagnosticsSink> = Arc::new(sink);
    (seen, sink)
}

/// Poll `condition` until it holds or five seconds pass
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
