//! Memory quota watchdog.
//!
//! One `QuotaWatchdog` per monitored execution. It stores a baseline usage
//! that is subtracted from every sample, so allocations made before
//! monitoring started do not count against the limit.
//!
//! The watchdog never stops execution itself. On overage it calls the
//! handler; a handler that wants the script to stop returns an error, and
//! that error comes back out of `check()` unmodified.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use memquota_core::counter::AllocationCounter;
use memquota_core::id::ThreadId;
use memquota_core::manifest::QuotaSnapshot;

use crate::error::{Error, HandlerError, Result};
use crate::tracking::RunningStats;

pub type HandlerResult = std::result::Result<(), HandlerError>;

type HandlerFn = dyn Fn(&QuotaWatchdog) -> HandlerResult + Send + Sync;

/// Infringement handler. Receives the whole watchdog so it can read the
/// overage (`last_sample`) as well as the running statistics.
#[derive(Clone)]
pub struct Handler(Arc<HandlerFn>);

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&QuotaWatchdog) -> HandlerResult + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Adapt a handler that only wants the raw overage in bytes.
    pub fn from_overage<F>(f: F) -> Self
    where
        F: Fn(i64) -> HandlerResult + Send + Sync + 'static,
    {
        Self::new(move |watchdog| f(watchdog.last_sample()))
    }

    pub fn invoke(&self, watchdog: &QuotaWatchdog) -> HandlerResult {
        (self.0)(watchdog)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler(..)")
    }
}

/// Outcome of looking a handler up by type and method name.
#[derive(Debug, Clone)]
pub enum Resolution {
    Found(Handler),
    NotFound,
    /// The method exists but is not externally callable.
    NotAccessible,
}

/// Capability lookup from a (type, method) name pair to a handler.
pub trait HandlerResolver {
    fn resolve(&self, handler_type: &str, method: &str) -> Resolution;
}

/// Look a handler up, mapping missing and non-public methods to distinct errors.
pub fn resolve_handler<R>(resolver: &R, handler_type: &str, method: &str) -> Result<Handler>
where
    R: HandlerResolver + ?Sized,
{
    match resolver.resolve(handler_type, method) {
        Resolution::Found(handler) => Ok(handler),
        Resolution::NotFound => Err(Error::NoSuchMethod {
            handler_type: handler_type.to_string(),
            method: method.to_string(),
        }),
        Resolution::NotAccessible => Err(Error::AccessDenied {
            handler_type: handler_type.to_string(),
            method: method.to_string(),
        }),
    }
}

pub struct QuotaWatchdog {
    counter: Arc<dyn AllocationCounter>,
    thread_id: ThreadId,
    base_usage: i64,
    limit: i64,
    stats: RunningStats,
    last_sample: i64,
    handler: Option<Handler>,
    // `Send` but not `Sync`: statistics are updated without synchronization,
    // so an instance belongs to exactly one execution.
    _single_owner: PhantomData<Cell<()>>,
}

impl QuotaWatchdog {
    pub fn new(counter: Arc<dyn AllocationCounter>) -> Self {
        Self {
            counter,
            thread_id: ThreadId::UNSET,
            base_usage: 0,
            limit: 0,
            stats: RunningStats::new(),
            last_sample: 0,
            handler: None,
            _single_owner: PhantomData,
        }
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    pub fn set_handler(&mut self, handler: Handler) {
        self.handler = Some(handler);
    }

    /// Resolve `method` on `handler_type` through `resolver` and install it.
    ///
    /// The current handler is left in place on failure.
    pub fn set_handler_from<R>(
        &mut self,
        resolver: &R,
        handler_type: &str,
        method: &str,
    ) -> Result<()>
    where
        R: HandlerResolver + ?Sized,
    {
        let handler = resolve_handler(resolver, handler_type, method)?;
        self.set_handler(handler);
        Ok(())
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn set_thread_id(&mut self, thread_id: ThreadId) {
        self.thread_id = thread_id;
    }

    pub fn base_usage(&self) -> i64 {
        self.base_usage
    }

    /// Bytes to discount from every sample. Must be >= 0.
    pub fn set_base_usage(&mut self, base_usage: i64) -> Result<()> {
        if base_usage < 0 {
            return Err(Error::InvalidArgument {
                what: "base memory usage",
                value: base_usage,
            });
        }
        self.base_usage = base_usage;
        Ok(())
    }

    /// Store the watched thread's current counter value as the baseline.
    pub fn record_base_usage(&mut self) -> Result<()> {
        self.base_usage = self.sample()?;
        Ok(())
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Memory quota in bytes. Must be >= 0; on error the old limit is kept.
    pub fn set_limit(&mut self, limit: i64) -> Result<()> {
        if limit < 0 {
            return Err(Error::InvalidArgument {
                what: "memory usage limit",
                value: limit,
            });
        }
        self.limit = limit;
        Ok(())
    }

    /// Highest overage-adjusted sample seen by `check()`.
    pub fn maximum(&self) -> i64 {
        self.stats.maximum()
    }

    /// Mean of all overage-adjusted samples seen by `check()`.
    pub fn average(&self) -> i64 {
        self.stats.average()
    }

    pub fn checks(&self) -> u64 {
        self.stats.checks()
    }

    /// `sample - baseline` as computed by the most recent `check()`.
    pub fn last_sample(&self) -> i64 {
        self.last_sample
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            thread_id: self.thread_id,
            base_usage: self.base_usage,
            limit: self.limit,
            maximum: self.maximum(),
            average: self.average(),
            checks: self.checks(),
            last_sample: self.last_sample,
        }
    }

    /// Watch the calling thread, starting from its current usage.
    ///
    /// Must run once before the first `check()`.
    pub fn init(&mut self) -> Result<()> {
        self.thread_id = ThreadId::current();
        self.record_base_usage()
    }

    /// Sample the watched thread, update statistics and call the handler if
    /// usage net of the baseline is above the limit.
    pub fn check(&mut self) -> Result<()> {
        if self.thread_id.is_unset() {
            return Err(Error::InvalidState);
        }
        let current = self.sample()?.saturating_sub(self.base_usage);

        self.last_sample = current;
        self.stats.observe(current);

        if current > self.limit {
            if let Some(handler) = self.handler.clone() {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    thread = %self.thread_id,
                    current,
                    limit = self.limit,
                    "memory quota exceeded, invoking handler"
                );
                handler.invoke(self)?;
            }
        }
        Ok(())
    }

    fn sample(&self) -> Result<i64> {
        let bytes = self
            .counter
            .allocated_bytes(self.thread_id)
            .ok_or(Error::Untracked(self.thread_id))?;
        Ok(i64::try_from(bytes).unwrap_or(i64::MAX))
    }
}

impl fmt::Debug for QuotaWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaWatchdog")
            .field("thread_id", &self.thread_id)
            .field("base_usage", &self.base_usage)
            .field("limit", &self.limit)
            .field("stats", &self.stats)
            .field("last_sample", &self.last_sample)
            .field("handler", &self.handler)
            .finish()
    }
}
