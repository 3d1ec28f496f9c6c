//! Wait Strategy Implementation
//!
//! Wait strategies decide how the consumer thread idles between batches. The
//! strategy is a closed set of variants chosen once from configuration; the
//! choice only changes how the consumer waits, never what producers observe.
//!
//! Every variant checks the alert flag while it waits so a stop request wakes the
//! consumer no matter which strategy is in use. Variants that park on the condition
//! variable additionally rely on [`WaitStrategy::signal_all_when_blocking`], which
//! producers call on every publish and the router calls on stop.

use crate::router::{Result, RouterError, Sequence};
use parking_lot::{Condvar, Mutex};
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Spin iterations the yielding strategy burns before each yield
const SPIN_TRIES: u32 = 100;

/// Retry budget of the sleeping strategy: spin while above `SPIN_TRIES`, yield until zero, then sleep
const SLEEP_RETRIES: u32 = 200;

/// How often the phased backoff strategy reads the clock while spinning
const PHASED_SPIN_CHECK: u32 = 10_000;

/// Fallback used by phased backoff once the yield phase has timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackoffVariant {
    /// Park on the condition variable, woken by producers
    Lock,
    /// Sleep for a fixed interval between checks
    Sleep,
}

/// The configured flavour of waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WaitStrategyKind {
    /// Park on a condition variable; producers notify on publish
    #[default]
    Blocking,
    /// Spin briefly, then yield the time slice
    Yielding,
    /// Spin, then yield, then sleep a fixed short interval
    Sleeping { sleep: Duration },
    /// Spin with no yield at all
    BusySpin,
    /// Spin until `spin_timeout`, yield until `yield_timeout` has elapsed, then fall back
    PhasedBackoff {
        spin_timeout: Duration,
        yield_timeout: Duration,
        variant: BackoffVariant,
        sleep: Duration,
    },
    /// Block with a bounded wait, returning [`RouterError::Timeout`] so the caller can do housekeeping
    TimeoutBlocking { timeout: Duration },
}

impl WaitStrategyKind {
    /// The configuration name of this variant
    pub fn name(&self) -> &'static str {
        match self {
            WaitStrategyKind::Blocking => "blocking",
            WaitStrategyKind::Yielding => "yielding",
            WaitStrategyKind::Sleeping { .. } => "sleeping",
            WaitStrategyKind::BusySpin => "busy-spin",
            WaitStrategyKind::PhasedBackoff { .. } => "backoff",
            WaitStrategyKind::TimeoutBlocking { .. } => "timeout",
        }
    }

    /// Whether this variant may park on the condition variable
    pub fn is_blocking(&self) -> bool {
        match self {
            WaitStrategyKind::Blocking | WaitStrategyKind::TimeoutBlocking { .. } => true,
            WaitStrategyKind::PhasedBackoff { variant, .. } => *variant == BackoffVariant::Lock,
            _ => false,
        }
    }
}

impl std::fmt::Display for WaitStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Strategy for waiting for events to become available
///
/// Holds the configured [`WaitStrategyKind`] plus the mutex/condvar pair the
/// blocking variants park on.
#[derive(Debug)]
pub struct WaitStrategy {
    kind: WaitStrategyKind,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl WaitStrategy {
    /// Create a wait strategy of the given kind
    pub fn new(kind: WaitStrategyKind) -> Self {
        Self {
            kind,
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// The configured kind
    pub fn kind(&self) -> WaitStrategyKind {
        self.kind
    }

    /// Wait until `cursor` reaches at least `sequence`
    ///
    /// # Returns
    /// The available sequence, which may be higher than requested
    ///
    /// # Errors
    /// * [`RouterError::Alert`] if `alert` was raised while waiting
    /// * [`RouterError::Timeout`] if the timeout-blocking variant's bound expired
    pub fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AtomicBool) -> Result<i64> {
        let available = cursor.get();
        if available >= sequence {
            return Ok(available);
        }

        match self.kind {
            WaitStrategyKind::Blocking => self.block(sequence, cursor, alert, None),
            WaitStrategyKind::TimeoutBlocking { timeout } => {
                self.block(sequence, cursor, alert, Some(Instant::now() + timeout))
            }
            WaitStrategyKind::BusySpin => loop {
                check_alert(alert)?;
                let available = cursor.get();
                if available >= sequence {
                    return Ok(available);
                }
                hint::spin_loop();
            },
            WaitStrategyKind::Yielding => {
                let mut counter = SPIN_TRIES;
                loop {
                    check_alert(alert)?;
                    let available = cursor.get();
                    if available >= sequence {
                        return Ok(available);
                    }
                    if counter == 0 {
                        thread::yield_now();
                    } else {
                        counter -= 1;
                        hint::spin_loop();
                    }
                }
            }
            WaitStrategyKind::Sleeping { sleep } => self.sleep(sequence, cursor, alert, sleep),
            WaitStrategyKind::PhasedBackoff {
                spin_timeout,
                yield_timeout,
                variant,
                sleep,
            } => {
                let start = Instant::now();
                let mut counter = PHASED_SPIN_CHECK;
                loop {
                    check_alert(alert)?;
                    let available = cursor.get();
                    if available >= sequence {
                        return Ok(available);
                    }

                    counter -= 1;
                    if counter > 0 {
                        hint::spin_loop();
                        continue;
                    }
                    counter = PHASED_SPIN_CHECK;

                    let elapsed = start.elapsed();
                    if elapsed > yield_timeout.max(spin_timeout) {
                        return match variant {
                            BackoffVariant::Lock => self.block(sequence, cursor, alert, None),
                            BackoffVariant::Sleep => self.sleep(sequence, cursor, alert, sleep),
                        };
                    }
                    if elapsed > spin_timeout {
                        thread::yield_now();
                    }
                }
            }
        }
    }

    /// Wake every thread parked in this strategy
    ///
    /// A no-op for the non-blocking variants.
    pub fn signal_all_when_blocking(&self) {
        if self.kind.is_blocking() {
            // Taking the lock orders this notify after any waiter's cursor check
            let _guard = self.mutex.lock();
            self.condvar.notify_all();
        }
    }

    fn block(
        &self,
        sequence: i64,
        cursor: &Sequence,
        alert: &AtomicBool,
        deadline: Option<Instant>,
    ) -> Result<i64> {
        let mut guard = self.mutex.lock();
        loop {
            check_alert(alert)?;
            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                        let available = cursor.get();
                        if available >= sequence {
                            return Ok(available);
                        }
                        return Err(RouterError::Timeout);
                    }
                }
                None => self.condvar.wait(&mut guard),
            }
        }
    }

    fn sleep(
        &self,
        sequence: i64,
        cursor: &Sequence,
        alert: &AtomicBool,
        sleep: Duration,
    ) -> Result<i64> {
        let mut counter = SLEEP_RETRIES;
        loop {
            check_alert(alert)?;
            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            if counter > SPIN_TRIES {
                counter -= 1;
                hint::spin_loop();
            } else if counter > 0 {
                counter -= 1;
                thread::yield_now();
            } else {
                thread::sleep(sleep);
            }
        }
    }
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::new(WaitStrategyKind::Blocking)
    }
}

#[inline]
fn check_alert(alert: &AtomicBool) -> Result<()> {
    if alert.load(Ordering::Acquire) {
        Err(RouterError::Alert)
    } else {
        Ok(())
    }
}
