//! `AllocationCounter` implementations.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use memquota_core::counter::AllocationCounter;
use memquota_core::id::ThreadId;

use crate::alloc;
use crate::error::{Error, Result};

/// Probe the environment and switch accounting on.
///
/// Fails with `Unsupported` instead of proceeding when per-thread accounting
/// is unavailable; there is no degraded mode.
pub fn ensure_accounting(counter: &dyn AllocationCounter) -> Result<()> {
    if !counter.is_supported() {
        return Err(Error::Unsupported);
    }
    if !counter.is_enabled() {
        counter.enable();
        #[cfg(feature = "tracing")]
        tracing::debug!("thread allocation accounting enabled");
    }
    Ok(())
}

/// Reads the table maintained by [`CountingAllocator`](crate::alloc::CountingAllocator).
///
/// Unsupported unless that allocator is the process's global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadAllocCounter;

impl AllocationCounter for ThreadAllocCounter {
    fn is_supported(&self) -> bool {
        alloc::is_installed()
    }

    fn is_enabled(&self) -> bool {
        alloc::is_enabled()
    }

    fn enable(&self) {
        alloc::enable();
    }

    fn allocated_bytes(&self, thread: ThreadId) -> Option<u64> {
        alloc::thread_allocated_bytes(thread)
    }
}

#[derive(Default)]
struct ManualState {
    values: HashMap<ThreadId, u64>,
    scripted: HashMap<ThreadId, VecDeque<u64>>,
}

/// Test double: counts are whatever the test says they are.
///
/// Each read of a thread with scripted samples pops the next one and makes it
/// the thread's current value; once the script runs out, reads repeat the
/// last value.
pub struct ManualCounter {
    supported: bool,
    enabled: AtomicBool,
    state: Mutex<ManualState>,
}

impl Default for ManualCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualCounter {
    pub fn new() -> Self {
        Self {
            supported: true,
            enabled: AtomicBool::new(false),
            state: Mutex::new(ManualState::default()),
        }
    }

    /// An environment without per-thread accounting.
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, thread: ThreadId, bytes: u64) {
        self.state().values.insert(thread, bytes);
    }

    pub fn advance(&self, thread: ThreadId, bytes: u64) {
        let mut state = self.state();
        let v = state.values.entry(thread).or_default();
        *v = v.saturating_add(bytes);
    }

    /// Queue raw counter readings for `thread`, consumed one per read.
    pub fn script<I>(&self, thread: ThreadId, samples: I)
    where
        I: IntoIterator<Item = u64>,
    {
        self.state()
            .scripted
            .entry(thread)
            .or_default()
            .extend(samples);
    }
}

impl AllocationCounter for ManualCounter {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    fn allocated_bytes(&self, thread: ThreadId) -> Option<u64> {
        if thread.is_unset() {
            return None;
        }
        let mut state = self.state();
        if let Some(next) = state.scripted.get_mut(&thread).and_then(|q| q.pop_front()) {
            state.values.insert(thread, next);
            return Some(next);
        }
        Some(state.values.get(&thread).copied().unwrap_or(0))
    }
}
