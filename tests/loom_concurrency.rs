//! Loom model of the AIO cancel-slot race (spec §4.A): `abort`, `finish`,
//! and an expiring deadline timer can all reach for the same cancel hook
//! concurrently (`src/aio.rs`'s `cancel: Arc<Mutex<Option<CancelHook>>>`);
//! whichever gets there first must fire it, and the other two must find it
//! already gone. Grounded on the teacher's
//! `spark-core/tests/loom_concurrency.rs`, which models its own
//! close-path race the same way: a small, self-contained harness mirroring
//! just the synchronization primitive in question, run under
//! `loom::model`.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --test loom_concurrency
//! --release`.

#![cfg(any(loom, meshpipe_loom))]

use loom::sync::{Arc, Mutex};
use loom::thread;

/// Stands in for `Aio<T>`'s `cancel: Arc<Mutex<Option<CancelHook>>>` plus a
/// counter recording how many times the hook would actually have run.
struct CancelSlot {
    hook: Mutex<Option<()>>,
    fired: Mutex<u32>,
}

impl CancelSlot {
    fn new() -> Self {
        Self {
            hook: Mutex::new(Some(())),
            fired: Mutex::new(0),
        }
    }

    /// Mirrors the `take()`-and-invoke pattern shared by `Aio::abort`'s
    /// `Scheduled` branch, `Aio::finish`'s neutralization step, and the
    /// deadline timer task spawned in `Aio::schedule`.
    fn take_and_fire(&self) {
        if self.hook.lock().unwrap().take().is_some() {
            *self.fired.lock().unwrap() += 1;
        }
    }
}

#[test]
fn abort_and_finish_race_fires_the_hook_at_most_once() {
    loom::model(|| {
        let slot = Arc::new(CancelSlot::new());

        let s1 = slot.clone();
        let aborter = thread::spawn(move || s1.take_and_fire());

        let s2 = slot.clone();
        let finisher = thread::spawn(move || s2.take_and_fire());

        aborter.join().unwrap();
        finisher.join().unwrap();

        assert!(*slot.fired.lock().unwrap() <= 1);
    });
}

#[test]
fn abort_finish_and_deadline_timer_three_way_race_fires_at_most_once() {
    loom::model(|| {
        let slot = Arc::new(CancelSlot::new());

        let s1 = slot.clone();
        let aborter = thread::spawn(move || s1.take_and_fire());

        let s2 = slot.clone();
        let finisher = thread::spawn(move || s2.take_and_fire());

        let s3 = slot.clone();
        let timer = thread::spawn(move || s3.take_and_fire());

        aborter.join().unwrap();
        finisher.join().unwrap();
        timer.join().unwrap();

        assert!(*slot.fired.lock().unwrap() <= 1);
    });
}
