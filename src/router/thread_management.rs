//! Consumer thread management
//!
//! Spawns the router's consumer as a named thread, optionally pinned to a CPU core,
//! and wraps the join handle so the router can join it on stop.

use core_affinity::CoreId;
use std::thread::{self, JoinHandle};

/// A named thread owned by the router
#[derive(Debug)]
pub struct ManagedThread {
    join_handle: Option<JoinHandle<()>>,
    thread_name: String,
}

impl ManagedThread {
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Join the thread, waiting for it to complete
    ///
    /// # Errors
    /// Returns the panic payload if the thread panicked
    pub fn join(mut self) -> thread::Result<()> {
        match self.join_handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }

    /// Check if the thread is still running
    pub fn is_running(&self) -> bool {
        self.join_handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ManagedThread {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            // Try to join the thread, but don't panic if it fails
            let _ = handle.join();
        }
    }
}

/// Thread builder with CPU affinity and naming support
#[derive(Debug, Default)]
pub struct ThreadBuilder {
    name: Option<String>,
    affinity: Option<usize>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pin the thread to a CPU core
    ///
    /// A core that does not exist on this machine is logged and ignored at spawn time.
    pub fn pin_at_core(mut self, core_id: Option<usize>) -> Self {
        self.affinity = core_id;
        self
    }

    /// Spawn a thread with the configured settings
    ///
    /// # Errors
    /// Returns the OS error if the thread could not be created
    pub fn spawn<F>(self, f: F) -> std::io::Result<ManagedThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread_name = self
            .name
            .unwrap_or_else(|| crate::router::config::DEFAULT_CONSUMER_THREAD_NAME.to_string());
        let affinity = self.affinity;

        let name_for_closure = thread_name.clone();
        let join_handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                set_affinity_if_defined(affinity, &name_for_closure);
                f();
            })?;

        Ok(ManagedThread {
            join_handle: Some(join_handle),
            thread_name,
        })
    }
}

fn set_affinity_if_defined(affinity: Option<usize>, thread_name: &str) {
    let Some(core_id) = affinity else {
        return;
    };

    if !get_available_cores().contains(&core_id) {
        tracing::warn!(thread = thread_name, core_id, "CPU core not available, thread left unpinned");
        return;
    }

    if core_affinity::set_for_current(CoreId { id: core_id }) {
        tracing::debug!(thread = thread_name, core_id, "pinned thread to CPU core");
    } else {
        tracing::warn!(thread = thread_name, core_id, "could not pin thread to CPU core");
    }
}

/// Get available CPU core IDs
pub fn get_available_cores() -> Vec<usize> {
    core_affinity::get_core_ids()
        .unwrap_or_default()
        .iter()
        .map(|core| core.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier, Mutex};

    #[test]
    fn test_thread_builder() {
        let counter = Arc::new(Mutex::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let managed_thread = {
            let counter = Arc::clone(&counter);
            let barrier = Arc::clone(&barrier);
            ThreadBuilder::new()
                .thread_name("test-consumer")
                .spawn(move || {
                    barrier.wait();
                    *counter.lock().unwrap() = 42;
                })
                .expect("Failed to spawn thread")
        };

        assert_eq!(managed_thread.thread_name(), "test-consumer");
        assert!(managed_thread.is_running());

        barrier.wait();
        managed_thread.join().expect("Thread should complete successfully");
        assert_eq!(*counter.lock().unwrap(), 42);
    }

    #[test]
    fn test_default_name() {
        let managed_thread = ThreadBuilder::new()
            .spawn(|| {
                assert_eq!(thread::current().name(), Some("telemetry-router"));
            })
            .unwrap();
        managed_thread.join().unwrap();
    }

    #[test]
    fn test_unknown_core_is_ignored() {
        let managed_thread = ThreadBuilder::new()
            .pin_at_core(Some(usize::MAX))
            .spawn(|| {})
            .unwrap();
        assert!(managed_thread.join().is_ok());
    }

    #[test]
    #[cfg(not(miri))]
    fn test_cpu_affinity() {
        let available_cores = get_available_cores();
        if let Some(&core_id) = available_cores.first() {
            let managed_thread = ThreadBuilder::new()
                .pin_at_core(Some(core_id))
                .thread_name("affinity-test")
                .spawn(|| {})
                .expect("Failed to spawn thread");
            managed_thread.join().expect("Thread should complete");
        }
    }
}
