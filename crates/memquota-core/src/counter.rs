//! Abstract allocation counter interface.
//!
//! The concrete implementations live in `memquota-mem`. We keep only the trait
//! here so the planner can probe the environment without pulling the
//! allocator in.

use crate::id::ThreadId;

/// Source of per-thread cumulative allocation counts.
///
/// Contract:
/// - `allocated_bytes` is monotonically non-decreasing for a given thread
///   (frees never lower it).
/// - `enable` is idempotent and cheap; it may be called once per instrumented
///   unit.
/// - If the environment cannot account allocations per thread,
///   `is_supported` must report `false` so setup can fail fast instead of
///   silently monitoring nothing.
pub trait AllocationCounter: Send + Sync + 'static {
    /// Whether the environment can provide per-thread accounting at all.
    fn is_supported(&self) -> bool;

    /// Whether accounting is currently switched on.
    fn is_enabled(&self) -> bool;

    /// Switch accounting on. No-op if already enabled.
    fn enable(&self);

    /// Bytes allocated by `thread` since accounting started, or `None` if the
    /// thread cannot be sampled (unset id, unknown thread, table overflow).
    fn allocated_bytes(&self, thread: ThreadId) -> Option<u64>;
}

// NOTE: Do *not* add a "null" impl here that silently reports zero.
// A counter that cannot count must say so through `is_supported`.
