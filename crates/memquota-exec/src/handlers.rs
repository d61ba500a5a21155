//! Infringement handler registry.
//!
//! Handlers are addressed the way a quota declaration names them: a type
//! name plus a method name. Registration records whether the method is
//! externally callable, so lookups can tell "missing" from "not public".

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use memquota_mem::{
    Handler, HandlerError, HandlerResolver, HandlerResult, QuotaWatchdog, Resolution,
};

pub const BUILTIN_HANDLER_TYPE: &str = "QuotaInfringementHandler";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

type OverageFn = dyn Fn(i64) -> HandlerResult + Send + Sync;

/// The two handler signatures a method may have.
#[derive(Clone)]
pub enum HandlerFn {
    /// Receives the watchdog and can read its statistics.
    Watchdog(Handler),
    /// Receives the overage-adjusted sample in bytes.
    Overage(Arc<OverageFn>),
}

impl HandlerFn {
    fn to_handler(&self) -> Handler {
        match self {
            HandlerFn::Watchdog(h) => h.clone(),
            HandlerFn::Overage(f) => {
                let f = Arc::clone(f);
                Handler::from_overage(move |bytes| f(bytes))
            }
        }
    }
}

impl fmt::Debug for HandlerFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerFn::Watchdog(_) => f.write_str("Watchdog(..)"),
            HandlerFn::Overage(_) => f.write_str("Overage(..)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    entries: HashMap<(String, String), (Visibility, HandlerFn)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock `QuotaInfringementHandler`:
    /// - `handle(bytes)` stops the run, naming the current usage;
    /// - `report(watchdog)` stops the run with the full statistics.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        r.register_overage(BUILTIN_HANDLER_TYPE, "handle", Visibility::Public, |bytes| {
            Err(HandlerError::stop(format!(
                "Memory quota exceeded, current memory use {bytes} bytes"
            )))
        });
        r.register(BUILTIN_HANDLER_TYPE, "report", Visibility::Public, |w| {
            Err(HandlerError::stop(format!(
                "usage {} bytes over limit {} (maximum {}, average {}, {} checks)",
                w.last_sample(),
                w.limit(),
                w.maximum(),
                w.average(),
                w.checks()
            )))
        });
        r
    }

    pub fn register<F>(
        &mut self,
        handler_type: impl Into<String>,
        method: impl Into<String>,
        visibility: Visibility,
        f: F,
    ) -> &mut Self
    where
        F: Fn(&QuotaWatchdog) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(handler_type, method, visibility, HandlerFn::Watchdog(Handler::new(f)))
    }

    pub fn register_overage<F>(
        &mut self,
        handler_type: impl Into<String>,
        method: impl Into<String>,
        visibility: Visibility,
        f: F,
    ) -> &mut Self
    where
        F: Fn(i64) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(handler_type, method, visibility, HandlerFn::Overage(Arc::new(f)))
    }

    pub fn insert(
        &mut self,
        handler_type: impl Into<String>,
        method: impl Into<String>,
        visibility: Visibility,
        handler: HandlerFn,
    ) -> &mut Self {
        self.entries
            .insert((handler_type.into(), method.into()), (visibility, handler));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, handler_type: &str, method: &str) -> Resolution {
        match self
            .entries
            .get(&(handler_type.to_string(), method.to_string()))
        {
            None => Resolution::NotFound,
            Some((Visibility::Private, _)) => Resolution::NotAccessible,
            Some((Visibility::Public, f)) => Resolution::Found(f.to_handler()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memquota_core::id::ThreadId;
    use memquota_mem::{resolve_handler, Error, ManualCounter};

    fn watchdog_over_limit(counter: &Arc<ManualCounter>) -> QuotaWatchdog {
        let t = ThreadId::new(11);
        counter.set(t, 500);
        let mut w = QuotaWatchdog::new(counter.clone());
        w.set_thread_id(t);
        w.set_limit(100).expect("limit");
        w
    }

    #[test]
    fn missing_and_private_are_distinct() {
        let mut r = HandlerRegistry::new();
        r.register_overage("H", "hidden", Visibility::Private, |_| Ok(()));

        assert!(matches!(
            resolve_handler(&r, "H", "absent"),
            Err(Error::NoSuchMethod { .. })
        ));
        assert!(matches!(
            resolve_handler(&r, "Nope", "hidden"),
            Err(Error::NoSuchMethod { .. })
        ));
        assert!(matches!(
            resolve_handler(&r, "H", "hidden"),
            Err(Error::AccessDenied { .. })
        ));
    }

    #[test]
    fn builtin_handle_stops_with_usage() {
        let counter = Arc::new(ManualCounter::new());
        let mut w = watchdog_over_limit(&counter);
        w.set_handler_from(&HandlerRegistry::builtin(), BUILTIN_HANDLER_TYPE, "handle")
            .expect("resolve");

        match w.check() {
            Err(Error::Handler(HandlerError::Stop { message })) => {
                assert_eq!(message, "Memory quota exceeded, current memory use 500 bytes");
            }
            other => panic!("expected stop, got {other:?}"),
        }
    }

    #[test]
    fn builtin_report_sees_statistics() {
        let counter = Arc::new(ManualCounter::new());
        let mut w = watchdog_over_limit(&counter);
        w.set_handler_from(&HandlerRegistry::builtin(), BUILTIN_HANDLER_TYPE, "report")
            .expect("resolve");

        let err = w.check().expect_err("stop");
        assert_eq!(
            err.to_string(),
            "memory quota exceeded: usage 500 bytes over limit 100 (maximum 500, average 500, 1 checks)"
        );
    }

    #[test]
    fn overage_and_watchdog_forms_see_the_same_value() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let seen_overage = Arc::new(AtomicI64::new(0));
        let seen_watchdog = Arc::new(AtomicI64::new(0));
        let mut r = HandlerRegistry::new();
        {
            let seen = seen_overage.clone();
            r.register_overage("H", "bytes", Visibility::Public, move |b| {
                seen.store(b, Ordering::SeqCst);
                Ok(())
            });
        }
        {
            let seen = seen_watchdog.clone();
            r.register("H", "full", Visibility::Public, move |w| {
                seen.store(w.last_sample(), Ordering::SeqCst);
                Ok(())
            });
        }

        let counter = Arc::new(ManualCounter::new());
        for method in ["bytes", "full"] {
            let mut w = watchdog_over_limit(&counter);
            w.set_handler_from(&r, "H", method).expect("resolve");
            w.check().expect("handler returns normally");
        }
        assert_eq!(seen_overage.load(Ordering::SeqCst), 500);
        assert_eq!(seen_watchdog.load(Ordering::SeqCst), 500);
    }
}
