//! QuotaWatchdog against the counting allocator, without any script.

use memquota::mem::alloc::MAX_TRACKED_THREADS;
use memquota::mem::{ensure_accounting, Handler, QuotaWatchdog, ThreadAllocCounter};
use memquota::CountingAllocator;
use memquota_core::counter::AllocationCounter;
use memquota_core::id::ThreadId;
use std::hint::black_box;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator::system();

const MIB: usize = 1024 * 1024;

/// Watchdog on the current thread whose handler records the overage it saw.
fn watched(limit: i64) -> (QuotaWatchdog, Arc<AtomicI64>) {
    ensure_accounting(&ThreadAllocCounter).expect("counting allocator installed");
    let seen = Arc::new(AtomicI64::new(-1));
    let mut w = QuotaWatchdog::new(Arc::new(ThreadAllocCounter));
    w.set_thread_id(ThreadId::current());
    {
        let seen = seen.clone();
        w.set_handler(Handler::from_overage(move |bytes| {
            seen.store(bytes, Ordering::SeqCst);
            Ok(())
        }));
    }
    w.set_limit(limit).expect("limit");
    w.record_base_usage().expect("baseline");
    (w, seen)
}

fn touch(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate().step_by(4096) {
        *b = i as u8;
    }
    black_box(buf);
}

#[test]
fn check_exceeded() {
    let (mut w, seen) = watched(64 * MIB as i64);
    w.check().expect("check");
    assert_eq!(seen.load(Ordering::SeqCst), -1, "quota exceeded before any allocations");

    let mut aux = vec![0u8; 64 * MIB];
    touch(&mut aux);
    w.check().expect("check");
    assert!(
        seen.load(Ordering::SeqCst) >= 64 * MIB as i64,
        "quota not exceeded after allocations"
    );
    drop(aux);
}

#[test]
fn check_not_exceeded() {
    let (mut w, seen) = watched(65 * MIB as i64);
    w.check().expect("check");
    assert_eq!(seen.load(Ordering::SeqCst), -1);

    let mut aux = vec![0u8; 64 * MIB];
    touch(&mut aux);
    w.check().expect("check");
    assert_eq!(seen.load(Ordering::SeqCst), -1, "quota exceeded after allocations");
    assert!(w.maximum() >= 64 * MIB as i64);
    assert_eq!(w.checks(), 2);
}

#[test]
fn init_records_thread_and_baseline() {
    ensure_accounting(&ThreadAllocCounter).expect("counting allocator installed");
    let warmup = black_box(vec![1u8; 4096]);
    let mut w = QuotaWatchdog::new(Arc::new(ThreadAllocCounter));
    w.init().expect("init");
    assert_eq!(w.thread_id(), ThreadId::current());
    assert_ne!(w.base_usage(), 0, "unexpected base usage after init");
    drop(warmup);
}

#[test]
fn counts_are_per_thread_and_monotonic() {
    ensure_accounting(&ThreadAllocCounter).expect("counting allocator installed");
    let me = ThreadId::current();
    let before = ThreadAllocCounter.allocated_bytes(me).expect("tracked");

    let (other, other_bytes) = std::thread::spawn(|| {
        drop(black_box(vec![0u8; 8 * MIB]));
        let id = ThreadId::current();
        (id, ThreadAllocCounter.allocated_bytes(id))
    })
    .join()
    .expect("join");

    let after = ThreadAllocCounter.allocated_bytes(me).expect("tracked");
    assert!(after - before < 8 * MIB as u64, "other thread's bytes leaked into ours");
    assert!(other_bytes.expect("tracked while alive") >= 8 * MIB as u64);
    assert_eq!(ThreadAllocCounter.allocated_bytes(other), None, "slot kept after exit");

    drop(black_box(vec![0u8; MIB]));
    assert!(ThreadAllocCounter.allocated_bytes(me).expect("tracked") >= after + MIB as u64);
}

#[test]
fn exited_threads_give_their_slots_back() {
    ensure_accounting(&ThreadAllocCounter).expect("counting allocator installed");
    for _ in 0..MAX_TRACKED_THREADS + 8 {
        std::thread::spawn(|| drop(black_box(vec![0u8; 64])))
            .join()
            .expect("join");
    }

    let fresh = std::thread::spawn(|| {
        let (mut w, seen) = watched(MIB as i64);
        let mut buf = vec![0u8; 2 * MIB];
        touch(&mut buf);
        w.check().expect("fresh thread still tracked");
        (w.last_sample(), seen.load(Ordering::SeqCst))
    })
    .join()
    .expect("join");

    let (sample, seen) = fresh;
    assert!(sample >= 2 * MIB as i64, "sample = {sample}");
    assert!(seen >= 2 * MIB as i64, "handler did not fire");
}
