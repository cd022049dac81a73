//! The reap list (spec §4.B): a deferred-destruction queue for objects whose
//! teardown may race with an in-flight callback on their own call stack.
//!
//! Pipes and endpoints sometimes need to `stop` (join) AIOs from inside a
//! callback that one of those same AIOs invoked — joining synchronously
//! there would self-deadlock. Scheduling the object onto the reap list and
//! letting a separate worker drain it breaks that cycle, the same way the
//! teacher crate keeps a plexer's run loop (`multiplexer::Plexer::run`) on
//! its own spawned task rather than letting a caller block waiting for it to
//! unwind from inside a handler it triggered.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// An object that can be finalized once every callback holding it has
/// unwound.
pub trait Reapable: Send {
    /// Runs outside any callback stack frame of the object (spec §4.B).
    fn fini(self: Box<Self>);
}

struct Inner {
    queue: Mutex<VecDeque<Box<dyn Reapable>>>,
    notify: Notify,
}

/// A singly-linked, mutex-guarded list of objects awaiting deferred
/// destruction, plus a background worker that drains it.
#[derive(Clone)]
pub struct ReapList {
    inner: std::sync::Arc<Inner>,
}

impl Default for ReapList {
    fn default() -> Self {
        Self::new()
    }
}

impl ReapList {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Schedules `obj` for deferred destruction. Safe to call from inside a
    /// callback belonging to `obj`.
    pub fn schedule(&self, obj: Box<dyn Reapable>) {
        self.inner.queue.lock().unwrap().push_back(obj);
        self.inner.notify.notify_one();
    }

    /// Drains everything currently queued, running each object's `fini`.
    /// Intended to be called from a dedicated worker task; also callable
    /// directly in tests for deterministic draining.
    pub fn drain_now(&self) {
        loop {
            let next = self.inner.queue.lock().unwrap().pop_front();
            match next {
                Some(obj) => obj.fini(),
                None => break,
            }
        }
    }

    /// Runs forever, draining the queue as items are scheduled. Spawn this
    /// once per runtime the way the teacher spawns its plexer run loop.
    pub async fn run(&self) {
        loop {
            self.inner.notify.notified().await;
            self.drain_now();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().unwrap().is_empty()
    }
}
