//! Counting global allocator.
//!
//! Install it once per binary:
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: memquota_mem::CountingAllocator = memquota_mem::CountingAllocator::system();
//! ```
//!
//! Every successful allocation adds its size to the calling thread's slot in a
//! fixed table. Frees never subtract: the count is "bytes ever allocated",
//! monotonic per thread. Accounting is off until `enable()` is called.
//!
//! A thread claims a slot on its first counted allocation and hands it back
//! when its thread-locals are destroyed, so the table bounds live threads,
//! not threads ever started. Allocations made while the thread is exiting are
//! not counted.
#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{Acquire, Relaxed, Release},
};

use memquota_core::id::ThreadId;

/// Number of live threads that can be sampled at once. Threads started while
/// every slot is taken are not counted.
pub const MAX_TRACKED_THREADS: usize = 4096;

struct Slot {
    /// `ThreadId` of the holder, 0 when free.
    owner: AtomicU64,
    bytes: AtomicU64,
}

impl Slot {
    const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }
}

static SLOTS: [Slot; MAX_TRACKED_THREADS] = [const { Slot::new() }; MAX_TRACKED_THREADS];

/// Owner value while a claim resets the byte count.
const CLAIMING: u64 = u64::MAX;
/// Slot index sentinels.
const NO_SLOT: usize = usize::MAX;
const UNTRACKED: usize = usize::MAX - 1;

/// Set the first time any allocation goes through a `CountingAllocator`.
static INSTALLED: AtomicBool = AtomicBool::new(false);
static ENABLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static SLOT_INDEX: Cell<usize> = const { Cell::new(NO_SLOT) };
    // Registering `RELEASE` may allocate; this keeps that from recursing.
    static BUSY: Cell<bool> = const { Cell::new(false) };
    static RELEASE: SlotRelease = const { SlotRelease };
}

/// Frees the thread's slot when thread-locals are torn down.
struct SlotRelease;

impl Drop for SlotRelease {
    fn drop(&mut self) {
        let _ = SLOT_INDEX.try_with(|index| {
            if let Some(slot) = SLOTS.get(index.replace(UNTRACKED)) {
                slot.owner.store(0, Release);
            }
        });
    }
}

fn claim(id: u64) -> usize {
    if id == 0 {
        return UNTRACKED;
    }
    for (i, slot) in SLOTS.iter().enumerate() {
        if slot
            .owner
            .compare_exchange(0, CLAIMING, Acquire, Relaxed)
            .is_ok()
        {
            slot.bytes.store(0, Relaxed);
            slot.owner.store(id, Release);
            return i;
        }
    }
    UNTRACKED
}

/// The calling thread's slot, claimed on first use.
fn current_slot() -> Option<&'static Slot> {
    let index = SLOT_INDEX
        .try_with(|index| {
            if index.get() == NO_SLOT {
                let claimed = claim(ThreadId::current().get());
                index.set(claimed);
                if let Some(slot) = SLOTS.get(claimed) {
                    // No destructor can run for this thread any more.
                    if RELEASE.try_with(|_| ()).is_err() {
                        index.set(UNTRACKED);
                        slot.owner.store(0, Release);
                    }
                }
            }
            index.get()
        })
        .ok()?;
    SLOTS.get(index)
}

pub struct CountingAllocator<A = System> {
    inner: A,
}

impl CountingAllocator<System> {
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> CountingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

#[inline]
fn record(bytes: usize) {
    if !INSTALLED.load(Relaxed) {
        INSTALLED.store(true, Relaxed);
    }
    if !ENABLED.load(Relaxed) {
        return;
    }
    let _ = BUSY.try_with(|busy| {
        if busy.replace(true) {
            return;
        }
        if let Some(slot) = current_slot() {
            slot.bytes.fetch_add(bytes as u64, Relaxed);
        }
        busy.set(false);
    });
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for CountingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            record(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() {
            record(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            record(new_size);
        }
        new_ptr
    }
}

/// Whether a `CountingAllocator` is serving this process's allocations.
pub fn is_installed() -> bool {
    INSTALLED.load(Relaxed)
}

pub fn is_enabled() -> bool {
    ENABLED.load(Relaxed)
}

/// Turn accounting on for every thread. Idempotent.
pub fn enable() {
    ENABLED.store(true, Relaxed);
}

/// Bytes allocated by `thread` since accounting was enabled. `None` when the
/// thread holds no slot: it has exited, or the table was full.
pub fn thread_allocated_bytes(thread: ThreadId) -> Option<u64> {
    if thread.is_unset() {
        return None;
    }
    if thread == ThreadId::current() {
        return current_slot().map(|slot| slot.bytes.load(Relaxed));
    }
    SLOTS
        .iter()
        .find(|slot| slot.owner.load(Acquire) == thread.get())
        .map(|slot| slot.bytes.load(Relaxed))
}
