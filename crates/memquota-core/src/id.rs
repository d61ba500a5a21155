//! Strongly-typed identifiers used across the engine.
//!
//! Downstream crates (mem, planner, exec) should *not* use raw integers for IDs.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            Hash,
            Serialize,
            Deserialize,
            Ord,
            PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(ThreadId);

/// Next id handed out to a thread that asks for its id for the first time.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Const-initialized and drop-free: safe to touch from inside a global
    // allocator without allocating or registering a destructor.
    static CURRENT: Cell<u64> = const { Cell::new(0) };
}

impl ThreadId {
    /// The "not yet set" sentinel. Sampling it is always an error.
    pub const UNSET: ThreadId = ThreadId(0);

    /// Id of the calling OS thread, assigned lazily and never reused.
    ///
    /// Returns `UNSET` only while thread-local storage is being torn down.
    pub fn current() -> ThreadId {
        CURRENT
            .try_with(|slot| {
                let mut id = slot.get();
                if id == 0 {
                    id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
                    slot.set(id);
                }
                ThreadId(id)
            })
            .unwrap_or(ThreadId::UNSET)
    }

    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}
