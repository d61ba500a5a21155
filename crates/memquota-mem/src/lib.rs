#![deny(unsafe_code)]
//! memquota-mem: per-thread allocation accounting and the quota watchdog.
//!
//! This crate provides concrete implementations for the *interface* defined
//! in `memquota-core::counter`, plus the runtime object that instrumented
//! programs call at every injection point.
//!
//! The only `unsafe` lives in `alloc` (the `GlobalAlloc` wrapper).

pub mod alloc;
pub mod counter;
pub mod error;
pub mod tracking;
pub mod watchdog;

pub use alloc::CountingAllocator;
pub use counter::{ensure_accounting, ManualCounter, ThreadAllocCounter};
pub use error::{Error, HandlerError, Result};
pub use tracking::RunningStats;
pub use watchdog::{
    resolve_handler, Handler, HandlerResolver, HandlerResult, QuotaWatchdog, Resolution,
};
