//! Router Implementation
//!
//! The router is the entry point producers talk to. In asynchronous mode it owns a
//! [`RingBuffer`] and a consumer thread: producers claim an entry with
//! [`Router::get`], populate it in place and [`Router::publish`] it, and the consumer
//! thread hands it to the [`DestinationRegistry`]. In synchronous mode there is no
//! ring and no thread; every write happens on the caller's thread under one lock.
//!
//! # Examples
//! ```
//! use std::sync::Arc;
//! use telemetry_router::{
//!     DestinationRegistry, EventEntry, Level, Router, RouterConfig, TracingDiagnostics, Value,
//! };
//!
//! struct Stdout;
//!
//! impl DestinationRegistry for Stdout {
//!     fn write(&self, entry: &EventEntry) -> anyhow::Result<()> {
//!         println!("{} {:?}", entry.level, entry.parameters());
//!         Ok(())
//!     }
//!
//!     fn write_direct(
//!         &self,
//!         _index: u32,
//!         level: Level,
//!         _timestamp_nanos: i64,
//!         _source: Option<&str>,
//!         template: Option<&str>,
//!         args: &[Value],
//!     ) -> anyhow::Result<()> {
//!         println!("{level} {template:?} {args:?}");
//!         Ok(())
//!     }
//!
//!     fn index_of(&self, name: &str) -> Option<u32> {
//!         (name == "stdout").then_some(0)
//!     }
//! }
//!
//! let router = Router::new(
//!     RouterConfig::asynchronous().with_ring_size(1024),
//!     Arc::new(Stdout),
//!     Arc::new(TracingDiagnostics),
//! )
//! .unwrap();
//! router.start().unwrap();
//!
//! let mut entry = router.get().unwrap();
//! entry.level = Level::Warn;
//! entry.push_parameter(42i64);
//! router.publish(entry);
//!
//! router.stop().unwrap();
//! ```

use crate::router::consumer::{dispatch_entry, panic_message, ConsumerControl};
use crate::router::thread_management::{ManagedThread, ThreadBuilder};
use crate::router::{
    ConsumerLoop, ConsumerState, DestinationRegistry, Diagnostic, DiagnosticsSink, EventEntry,
    Level, Mode, Result, RingBuffer, RouterConfig, RouterError, RouterSettings, Value,
    WaitStrategy, WaitStrategyKind,
};
use parking_lot::{Mutex, MutexGuard};
use std::borrow::Cow;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

thread_local! {
    /// Routers this thread holds an unpublished entry from, by address
    static OPEN_ENTRIES: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Current wall-clock time in nanoseconds since the Unix epoch
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Routes telemetry events from producers to the destination registry
pub struct Router {
    config: RouterConfig,
    registry: Arc<dyn DestinationRegistry>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    engine: Engine,
}

enum Engine {
    Asynchronous(AsyncEngine),
    Synchronous(SyncEngine),
}

struct AsyncEngine {
    ring: Arc<RingBuffer>,
    control: Arc<ConsumerControl>,
    consumer: Mutex<ConsumerSlot>,
}

enum ConsumerSlot {
    NotStarted,
    Running(ManagedThread),
    Stopped,
}

struct SyncEngine {
    /// Serializes every synchronous write; also holds the scratch entry for `get`
    scratch: Mutex<EventEntry>,
    closed: AtomicBool,
}

impl Router {
    /// Build a router
    ///
    /// In asynchronous mode this allocates the whole ring up front; the consumer
    /// thread is not spawned until [`Router::start`].
    ///
    /// # Errors
    /// * `RouterError::InvalidRingSize` if the ring size is not a power of 2
    /// * `RouterError::AllocationFailed` if the ring or the scratch entry cannot be allocated
    pub fn new(
        config: RouterConfig,
        registry: Arc<dyn DestinationRegistry>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self> {
        let engine = match config.mode {
            Mode::Asynchronous => {
                let wait_strategy = Arc::new(WaitStrategy::new(config.wait_strategy));
                let ring = RingBuffer::new(
                    config.ring_size,
                    config.max_parameters,
                    config.entry_capacity_bytes,
                    wait_strategy,
                )?;
                Engine::Asynchronous(AsyncEngine {
                    ring: Arc::new(ring),
                    control: Arc::new(ConsumerControl::new()),
                    consumer: Mutex::new(ConsumerSlot::NotStarted),
                })
            }
            Mode::Synchronous => Engine::Synchronous(SyncEngine {
                scratch: Mutex::new(EventEntry::new(
                    config.max_parameters,
                    config.entry_capacity_bytes,
                )?),
                closed: AtomicBool::new(false),
            }),
        };

        tracing::debug!(
            mode = config.mode.name(),
            ring_size = config.ring_size,
            wait_strategy = %config.wait_strategy,
            "telemetry router created"
        );

        Ok(Self {
            config,
            registry,
            diagnostics,
            engine,
        })
    }

    /// Build a router from raw settings, reporting defaulted values to `diagnostics`
    ///
    /// # Errors
    /// Same as [`Router::new`]
    pub fn from_settings(
        settings: &RouterSettings,
        registry: Arc<dyn DestinationRegistry>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self> {
        let config = RouterConfig::resolve(settings, &*diagnostics);
        Self::new(config, registry, diagnostics)
    }

    /// Spawn the consumer thread
    ///
    /// A no-op in synchronous mode.
    ///
    /// # Errors
    /// * `RouterError::AlreadyStarted` if the consumer is already running
    /// * `RouterError::ShutdownInProgress` if the router has been stopped
    /// * `RouterError::ThreadSpawn` if the OS refused the thread
    pub fn start(&self) -> Result<()> {
        let engine = match &self.engine {
            Engine::Asynchronous(engine) => engine,
            Engine::Synchronous(engine) => {
                return if engine.closed.load(Ordering::Acquire) {
                    Err(RouterError::ShutdownInProgress)
                } else {
                    Ok(())
                };
            }
        };

        let mut slot = engine.consumer.lock();
        match *slot {
            ConsumerSlot::NotStarted => {}
            ConsumerSlot::Running(_) => return Err(RouterError::AlreadyStarted),
            ConsumerSlot::Stopped => return Err(RouterError::ShutdownInProgress),
        }

        let mut consumer = self.consumer_loop(engine);
        let thread = ThreadBuilder::new()
            .thread_name(self.config.consumer_thread_name.clone())
            .pin_at_core(self.config.consumer_core)
            .spawn(move || consumer.run())?;

        tracing::info!(
            thread = thread.thread_name(),
            ring_size = engine.ring.buffer_size(),
            wait_strategy = %self.config.wait_strategy,
            "telemetry router consumer started"
        );
        *slot = ConsumerSlot::Running(thread);
        Ok(())
    }

    /// Stop the router
    ///
    /// New claims are rejected from here on. Every entry claimed before the stop is
    /// still delivered: the consumer drains up to the last claimed sequence before
    /// its thread is joined. If the consumer was never started the drain runs on
    /// the calling thread. Calling `stop` again is a no-op.
    ///
    /// # Errors
    /// * `RouterError::EntryStillOpen` if the calling thread holds an unpublished
    ///   entry from this router; the drain would wait for it forever
    /// * `RouterError::ConsumerPanicked` if the consumer thread died
    pub fn stop(&self) -> Result<()> {
        self.check_no_open_entry()?;
        let engine = match &self.engine {
            Engine::Asynchronous(engine) => engine,
            Engine::Synchronous(engine) => {
                engine.closed.store(true, Ordering::Release);
                // Wait out any write still holding the lock
                drop(engine.scratch.lock());
                return Ok(());
            }
        };

        let mut slot = engine.consumer.lock();
        if matches!(*slot, ConsumerSlot::Stopped) {
            return Ok(());
        }

        let drain_target = engine.ring.close();
        engine.control.request_stop(drain_target);
        engine.ring.wait_strategy().signal_all_when_blocking();
        tracing::debug!(drain_target, "telemetry router stopping");

        let result = match std::mem::replace(&mut *slot, ConsumerSlot::Stopped) {
            ConsumerSlot::Running(thread) => {
                thread.join().map_err(|_| RouterError::ConsumerPanicked)
            }
            ConsumerSlot::NotStarted => {
                self.consumer_loop(engine).run();
                Ok(())
            }
            ConsumerSlot::Stopped => Ok(()),
        };

        tracing::info!(
            dispatched = engine.control.dispatched(),
            failed = engine.control.failed(),
            "telemetry router stopped"
        );
        result
    }

    /// Claim an entry for a structured producer
    ///
    /// Blocks while the ring is full. The returned handle must be passed to
    /// [`Router::publish`]; dropping it publishes it as well. In synchronous mode the
    /// handle holds the router's lock until it is published.
    ///
    /// # Deadlocks
    /// Publishing waits for every lower sequence, so a thread may hold at most one
    /// unpublished entry per router. Claiming a second one would leave it waiting on
    /// the first, which that same thread can no longer publish. This is detected:
    /// `get`, `try_get`, `send` and `stop` fail with `RouterError::EntryStillOpen`
    /// instead of blocking. Entries leaked with `mem::forget` are never published
    /// and stall every later sequence.
    ///
    /// # Errors
    /// * `RouterError::ShutdownInProgress` once the router is stopping
    /// * `RouterError::EntryStillOpen` if this thread already holds an unpublished entry
    pub fn get(&self) -> Result<EntryHandle<'_>> {
        self.check_no_open_entry()?;
        match &self.engine {
            Engine::Asynchronous(engine) => {
                let sequence = engine.ring.claim_next()?;
                Ok(self.ring_handle(engine, sequence))
            }
            Engine::Synchronous(engine) => self.locked_handle(engine),
        }
    }

    /// Claim an entry only if one is free right now
    ///
    /// # Returns
    /// `Ok(None)` when the ring is full
    ///
    /// # Errors
    /// Same as [`Router::get`]
    pub fn try_get(&self) -> Result<Option<EntryHandle<'_>>> {
        self.check_no_open_entry()?;
        match &self.engine {
            Engine::Asynchronous(engine) => Ok(engine
                .ring
                .try_claim_next()?
                .map(|sequence| self.ring_handle(engine, sequence))),
            Engine::Synchronous(engine) => self.locked_handle(engine).map(Some),
        }
    }

    /// Publish a populated entry
    pub fn publish(&self, handle: EntryHandle<'_>) {
        handle.publish();
    }

    /// Send an event from loose arguments
    ///
    /// This is the slow path for rare and bootstrap call sites: `args` are cloned
    /// into the entry's parameter slots (and owned strings are copied), so it does
    /// not keep the zero-allocation guarantee of [`Router::get`]. Arguments beyond
    /// the entry's slot count are dropped and reported to the diagnostics sink.
    ///
    /// In synchronous mode the registry is called directly on this thread, under the
    /// router's lock, before `send` returns.
    ///
    /// # Errors
    /// Same as [`Router::get`]
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        level: Level,
        destination_index: u32,
        timestamp_nanos: i64,
        source: Option<Cow<'static, str>>,
        template: Option<Cow<'static, str>>,
        parse: bool,
        args: &[Value],
    ) -> Result<()> {
        self.check_no_open_entry()?;
        match &self.engine {
            Engine::Asynchronous(engine) => {
                let sequence = engine.ring.claim_next()?;
                let mut handle = self.ring_handle(engine, sequence);
                handle.level = level;
                handle.destination_index = destination_index;
                handle.timestamp_nanos = timestamp_nanos;
                handle.source = source;
                handle.template = template;
                handle.parse = parse;
                for arg in args {
                    if !handle.push_parameter(arg.clone()) {
                        break;
                    }
                }
                let capacity = handle.parameter_capacity();
                handle.publish();
                self.check_overflow(destination_index, args.len(), capacity);
                Ok(())
            }
            Engine::Synchronous(engine) => {
                let _guard = engine.scratch.lock();
                if engine.closed.load(Ordering::Acquire) {
                    return Err(RouterError::ShutdownInProgress);
                }

                let write = || {
                    self.registry.write_direct(
                        destination_index,
                        level,
                        timestamp_nanos,
                        source.as_deref(),
                        template.as_deref(),
                        args,
                    )
                };
                let message = match panic::catch_unwind(AssertUnwindSafe(write)) {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(error)) => format!("{error:#}"),
                    Err(payload) => panic_message(payload.as_ref()),
                };
                self.diagnostics.report(Diagnostic::DispatchFailure {
                    sequence: None,
                    destination_index,
                    message,
                });
                Ok(())
            }
        }
    }

    /// Resolve a destination name through the registry
    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.registry.index_of(name)
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The wait strategy the consumer uses, `None` in synchronous mode
    pub fn wait_strategy(&self) -> Option<WaitStrategyKind> {
        match &self.engine {
            Engine::Asynchronous(engine) => Some(engine.ring.wait_strategy().kind()),
            Engine::Synchronous(_) => None,
        }
    }

    /// Where the consumer loop currently is, `None` in synchronous mode
    pub fn consumer_state(&self) -> Option<ConsumerState> {
        match &self.engine {
            Engine::Asynchronous(engine) => Some(engine.control.state()),
            Engine::Synchronous(_) => None,
        }
    }

    /// Slots that can be claimed without blocking, `None` in synchronous mode
    pub fn remaining_capacity(&self) -> Option<i64> {
        match &self.engine {
            Engine::Asynchronous(engine) => Some(engine.ring.remaining_capacity()),
            Engine::Synchronous(_) => None,
        }
    }

    /// Entries the consumer handed to the registry successfully
    pub fn dispatched_count(&self) -> u64 {
        match &self.engine {
            Engine::Asynchronous(engine) => engine.control.dispatched(),
            Engine::Synchronous(_) => 0,
        }
    }

    /// Entries the registry rejected or panicked on
    pub fn failed_dispatch_count(&self) -> u64 {
        match &self.engine {
            Engine::Asynchronous(engine) => engine.control.failed(),
            Engine::Synchronous(_) => 0,
        }
    }

    fn consumer_loop(&self, engine: &AsyncEngine) -> ConsumerLoop {
        ConsumerLoop::new(
            Arc::clone(&engine.ring),
            Arc::clone(&self.registry),
            Arc::clone(&self.diagnostics),
            Arc::clone(&engine.control),
        )
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Fail instead of blocking on an entry only this thread can publish
    fn check_no_open_entry(&self) -> Result<()> {
        let key = self.key();
        let open = OPEN_ENTRIES
            .try_with(|open| open.borrow().contains(&key))
            .unwrap_or(false);
        if open {
            Err(RouterError::EntryStillOpen)
        } else {
            Ok(())
        }
    }

    fn handle<'a>(&self, slot: Slot<'a>) -> EntryHandle<'a> {
        let owner = self.key();
        let _ = OPEN_ENTRIES.try_with(|open| open.borrow_mut().push(owner));
        EntryHandle {
            slot,
            owner,
            published: false,
            _not_send: PhantomData,
        }
    }

    fn ring_handle<'a>(&'a self, engine: &'a AsyncEngine, sequence: i64) -> EntryHandle<'a> {
        // SAFETY: `sequence` was just claimed by this producer and is not yet published
        let entry = unsafe { engine.ring.entry_at(sequence) };
        entry.reset();
        entry.sequence = sequence;
        self.handle(Slot::Ring {
            ring: &engine.ring,
            entry,
        })
    }

    fn locked_handle<'a>(&'a self, engine: &'a SyncEngine) -> Result<EntryHandle<'a>> {
        let mut entry = engine.scratch.lock();
        if engine.closed.load(Ordering::Acquire) {
            return Err(RouterError::ShutdownInProgress);
        }
        entry.reset();
        entry.sequence += 1;
        Ok(self.handle(Slot::Locked {
            entry,
            registry: &*self.registry,
            diagnostics: &*self.diagnostics,
        }))
    }

    fn check_overflow(&self, destination_index: u32, supplied: usize, capacity: usize) {
        if supplied > capacity {
            self.diagnostics.report(Diagnostic::ParameterOverflow {
                destination_index,
                supplied,
                capacity,
            });
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            tracing::error!(%error, "telemetry router did not stop cleanly");
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .field("consumer_state", &self.consumer_state())
            .finish()
    }
}

/// A claimed entry, exclusively owned by one producer until published
///
/// Dereferences to [`EventEntry`] for populating. Dropping an unpublished handle
/// publishes it; if the drop happens while the thread is panicking the entry is
/// published as abandoned and the consumer skips it, so later producers are never
/// left waiting on a sequence that will not arrive.
///
/// # Deadlocks
/// A handle must be published or dropped on the thread that claimed it, before
/// that thread claims again from the same router. Locals drop in reverse order, so
/// two handles held in one scope would publish out of order; the second claim is
/// refused with `RouterError::EntryStillOpen` rather than allowed to hang. The
/// handle is not `Send`.
pub struct EntryHandle<'a> {
    slot: Slot<'a>,
    /// Address of the router that handed this entry out
    owner: usize,
    published: bool,
    _not_send: PhantomData<*const ()>,
}

enum Slot<'a> {
    Ring {
        ring: &'a RingBuffer,
        entry: &'a mut EventEntry,
    },
    Locked {
        entry: MutexGuard<'a, EventEntry>,
        registry: &'a dyn DestinationRegistry,
        diagnostics: &'a dyn DiagnosticsSink,
    },
}

impl EntryHandle<'_> {
    /// The sequence this entry was claimed for
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Make the entry visible to the consumer, or write it in synchronous mode
    pub fn publish(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if self.published {
            return;
        }
        self.published = true;

        match &mut self.slot {
            Slot::Ring { ring, entry } => ring.publish(entry.sequence),
            Slot::Locked {
                entry,
                registry,
                diagnostics,
            } => {
                if !entry.abandoned {
                    entry.end_of_batch = true;
                    dispatch_entry(*registry, *diagnostics, &**entry);
                }
            }
        }

        let owner = self.owner;
        let _ = OPEN_ENTRIES.try_with(|open| {
            let mut open = open.borrow_mut();
            if let Some(index) = open.iter().position(|key| *key == owner) {
                open.swap_remove(index);
            }
        });
    }
}

impl Deref for EntryHandle<'_> {
    type Target = EventEntry;

    fn deref(&self) -> &EventEntry {
        match &self.slot {
            Slot::Ring { entry, .. } => &**entry,
            Slot::Locked { entry, .. } => &**entry,
        }
    }
}

impl DerefMut for EntryHandle<'_> {
    fn deref_mut(&mut self) -> &mut EventEntry {
        match &mut self.slot {
            Slot::Ring { entry, .. } => &mut **entry,
            Slot::Locked { entry, .. } => &mut **entry,
        }
    }
}

impl Drop for EntryHandle<'_> {
    fn drop(&mut self) {
        if !self.published {
            if std::thread::panicking() {
                self.abandoned = true;
            }
            self.commit();
        }
    }
}

impl std::fmt::Debug for EntryHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle")
            .field("entry", &**self)
            .field("published", &self.published)
            .finish()
    }
}
