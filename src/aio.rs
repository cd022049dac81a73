//! The asynchronous I/O primitive (spec §4.A) — the unit of in-flight work
//! that pipe and endpoint operations are built on.
//!
//! The source specification describes a C-style completion-callback object:
//! a caller `begin()`s it, `schedule()`s a cancellation hook, and some
//! producer eventually `finish()`es it exactly once. The idiomatic Rust
//! shape for that lifecycle is a cancellable, deadline-bounded future backed
//! by a [`tokio::sync::oneshot`] channel — `finish`/`finish_sync` correspond
//! to the producer side sending the result, `begin`/`schedule`/`abort`
//! correspond to arming and tearing down the receiver side. This mirrors how
//! the teacher crate hands independent units of work to the Tokio runtime
//! (`multiplexer::Plexer::spawn`, `facades::KeepAliveLoop::spawn`) rather
//! than polling a bespoke completion queue.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, ErrorKind};

type CancelHook = Box<dyn FnMut(Error) + Send>;

/// A single scatter/gather buffer segment submitted with an AIO.
#[derive(Debug, Clone)]
pub struct IoSlice {
    pub data: bytes::Bytes,
}

impl IoSlice {
    pub fn new(data: bytes::Bytes) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The outcome handed to an AIO's completion callback.
#[derive(Debug)]
pub struct Completion<T> {
    pub result: std::result::Result<T, Error>,
    /// Number of bytes actually transferred, when the operation is a
    /// byte-oriented send/recv (spec §4.A `finish(aio, err, n)`).
    pub transferred: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Idle = 0,
    Begun = 1,
    Scheduled = 2,
    Completing = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Idle,
            1 => State::Begun,
            2 => State::Scheduled,
            _ => State::Completing,
        }
    }
}

/// Shared, cancellable state for one in-flight operation.
///
/// One `Aio<T>` is attached to exactly one in-flight operation at a time
/// (spec §3 "attached to exactly one in-flight operation"); after
/// `finish`/`finish_sync` complete it, a fresh `Aio` is created for the next
/// submission — reuse at the type level is achieved by the pipe/endpoint
/// engines replacing their stored `Aio` handle rather than by resetting this
/// one in place, which keeps the state machine's "completes exactly once"
/// guarantee trivially true.
pub struct Aio<T> {
    state: Arc<AtomicU8>,
    iov: Vec<IoSlice>,
    deadline: Option<Instant>,
    /// Shared with the deadline timer task spawned in [`Self::schedule`] so
    /// an elapsed deadline and a manual [`Self::abort`] race safely onto the
    /// same `take()` — whichever gets there first fires the hook, the other
    /// finds it already gone (spec §4.A `abort`: "invokes the cancel hook at
    /// most once").
    cancel: Arc<Mutex<Option<CancelHook>>>,
    tx: Option<oneshot::Sender<Completion<T>>>,
    /// Set if a cancel/timeout request arrived before a cancel hook was
    /// installed; `schedule` returns it immediately (spec §4.A `schedule`
    /// "If the AIO already holds a pending cancel request, returns the
    /// queued error immediately").
    pending_cancel: Arc<Mutex<Option<Error>>>,
    /// The task enforcing `deadline`, if one was set before [`Self::schedule`]
    /// ran; aborted on `finish`/`abort`/drop so it never outlives the AIO.
    timeout_task: Option<JoinHandle<()>>,
}

impl<T> fmt::Debug for Aio<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aio")
            .field("state", &State::from_u8(self.state.load(Ordering::SeqCst)))
            .field("iov_len", &self.iov.len())
            .finish()
    }
}

/// The receiving half of an AIO: awaited by whoever submitted the operation.
pub struct AioWait<T> {
    rx: oneshot::Receiver<Completion<T>>,
}

impl<T> AioWait<T> {
    pub async fn wait(self) -> Completion<T> {
        match self.rx.await {
            Ok(completion) => completion,
            Err(_) => Completion {
                result: Err(Error::new(ErrorKind::Closed)),
                transferred: 0,
            },
        }
    }
}

impl<T: Send + 'static> Aio<T> {
    /// Allocates a fresh, idle AIO paired with its waiter half.
    pub fn new() -> (Self, AioWait<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                state: Arc::new(AtomicU8::new(State::Idle as u8)),
                iov: Vec::new(),
                deadline: None,
                cancel: Arc::new(Mutex::new(None)),
                tx: Some(tx),
                pending_cancel: Arc::new(Mutex::new(None)),
                timeout_task: None,
            },
            AioWait { rx },
        )
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Marks the AIO in-flight. Fails if a cancel/close already raced ahead
    /// of the producer (spec §4.A: "Fails if the caller has already
    /// canceled or closed the AIO; in that case the operation must not be
    /// submitted").
    pub fn begin(&mut self) -> Result<(), Error> {
        if let Some(err) = self.pending_cancel.lock().unwrap().take() {
            return Err(err);
        }
        self.state.store(State::Begun as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Sets the scatter/gather buffer list (spec §4.A `set_iov`).
    pub fn set_iov(&mut self, iov: Vec<IoSlice>) {
        self.iov = iov;
    }

    pub fn iov(&self) -> &[IoSlice] {
        &self.iov
    }

    pub fn iov_count(&self) -> usize {
        self.iov.iter().map(IoSlice::len).sum()
    }

    /// Consumes `n` bytes from the front of the iov list without
    /// reallocating, used by frame handlers recovering from partial I/O
    /// (spec §4.A `iov_advance`).
    pub fn iov_advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.iov.first_mut() else {
                break;
            };
            let len = front.len();
            if n < len {
                front.data = front.data.slice(n..);
                break;
            }
            n -= len;
            self.iov.remove(0);
        }
    }

    /// Installs an absolute deadline; expiry is surfaced as
    /// [`ErrorKind::Timeout`] through the cancel hook (spec §4.A
    /// `set_timeout`).
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Installs the cancellation hook. If a cancel was already requested
    /// before this call, the queued error is returned immediately so the
    /// submitter can short-circuit instead of starting I/O it would just
    /// have to unwind (spec §4.A `schedule`).
    ///
    /// If [`Self::set_timeout`] was called first, this also arms a timer
    /// that invokes the cancel hook with [`ErrorKind::Timeout`] on its own
    /// once the deadline elapses (spec §4.A: "the AIO's expiry fires the
    /// cancel hook with a timeout error") — the caller never has to poll
    /// `deadline()` or race it against anything itself.
    pub fn schedule<F>(&mut self, cancel_fn: F) -> Result<(), Error>
    where
        F: FnMut(Error) + Send + 'static,
    {
        if let Some(err) = self.pending_cancel.lock().unwrap().take() {
            return Err(err);
        }
        *self.cancel.lock().unwrap() = Some(Box::new(cancel_fn));
        self.state.store(State::Scheduled as u8, Ordering::SeqCst);

        if let Some(deadline) = self.deadline {
            let state = self.state.clone();
            let cancel = self.cancel.clone();
            self.timeout_task = Some(tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if State::from_u8(state.load(Ordering::SeqCst)) == State::Scheduled {
                    if let Some(mut hook) = cancel.lock().unwrap().take() {
                        hook(Error::new(ErrorKind::Timeout));
                    }
                }
            }));
        }

        Ok(())
    }

    /// Requests cancellation. Idempotent: only the first call invokes the
    /// cancel hook (spec §4.A `abort` — "invokes the cancel hook at most
    /// once; is idempotent").
    pub fn abort(&mut self, err: Error) {
        match self.state() {
            State::Scheduled => {
                if let Some(task) = self.timeout_task.take() {
                    task.abort();
                }
                if let Some(mut cancel) = self.cancel.lock().unwrap().take() {
                    cancel(err);
                }
            }
            State::Idle | State::Begun => {
                // Not yet scheduled: remember the request so `begin`/
                // `schedule` fail fast instead of racing a cancel hook that
                // doesn't exist yet.
                self.pending_cancel.lock().unwrap().get_or_insert(err);
            }
            State::Completing => {
                // Lost the race with `finish`; nothing to do.
            }
        }
    }

    /// Completes the AIO, dispatching the callback onto the async runtime
    /// (spec §4.A `finish` — "handed to a dispatch queue (async)").
    pub fn finish(mut self, result: Result<T, Error>, transferred: usize) {
        self.state.store(State::Completing as u8, Ordering::SeqCst);
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        // Neutralizes the cancel hook: a deadline timer that had already
        // passed `sleep_until` and was about to fire when we got here must
        // not still invoke it against an AIO that just completed normally.
        self.cancel.lock().unwrap().take();
        if let Some(tx) = self.tx.take() {
            let completion = Completion {
                result,
                transferred,
            };
            // A dropped receiver (the waiter gave up) is not an error for
            // the producer: the oneshot send failing just means nobody is
            // listening anymore.
            let _ = tx.send(completion);
        }
    }

    /// Completes the AIO synchronously: for a single-threaded caller that is
    /// itself the only consumer, this is equivalent to `finish` — the
    /// distinction (spec §4.A `finish_sync`) is about which thread the user
    /// callback runs on, and in this crate the callback *is* the future
    /// polling `AioWait::wait`, so both paths converge on the same
    /// channel send.
    pub fn finish_sync(self, result: Result<T, Error>, transferred: usize) {
        self.finish(result, transferred)
    }
}

impl<T> Drop for Aio<T> {
    fn drop(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_then_finish_delivers_result() {
        let (mut aio, wait) = Aio::<u32>::new();
        aio.begin().unwrap();
        aio.finish(Ok(7), 4);

        let completion = wait.wait().await;
        assert_eq!(completion.result.unwrap(), 7);
        assert_eq!(completion.transferred, 4);
    }

    #[tokio::test]
    async fn abort_before_begin_fails_begin() {
        let (mut aio, wait) = Aio::<u32>::new();
        aio.abort(Error::new(ErrorKind::Closed));

        let err = aio.begin().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        drop(aio);

        let completion = wait.wait().await;
        assert_eq!(completion.result.unwrap_err().kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn schedule_returns_pending_cancel_immediately() {
        let (mut aio, _wait) = Aio::<u32>::new();
        aio.begin().unwrap();
        aio.abort(Error::new(ErrorKind::Timeout));

        let err = aio.schedule(|_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn abort_after_schedule_invokes_hook_at_most_once() {
        let (mut aio, _wait) = Aio::<u32>::new();
        aio.begin().unwrap();

        let calls = Arc::new(AtomicU8::new(0));
        let calls2 = calls.clone();
        aio.schedule(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        aio.abort(Error::new(ErrorKind::Timeout));
        aio.abort(Error::new(ErrorKind::Timeout));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn elapsed_deadline_fires_the_cancel_hook_on_its_own() {
        let (mut aio, _wait) = Aio::<u32>::new();
        aio.begin().unwrap();
        aio.set_timeout(Duration::from_millis(20));

        let fired = Arc::new(AtomicU8::new(0));
        let fired2 = fired.clone();
        aio.schedule(move |err| {
            assert_eq!(err.kind(), ErrorKind::Timeout);
            fired2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Nobody calls `abort` here: the deadline timer installed by
        // `schedule` must fire the hook by itself.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finishing_before_the_deadline_suppresses_the_timer() {
        let (mut aio, wait) = Aio::<u32>::new();
        aio.begin().unwrap();
        aio.set_timeout(Duration::from_millis(20));

        let fired = Arc::new(AtomicU8::new(0));
        let fired2 = fired.clone();
        aio.schedule(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        aio.finish(Ok(1), 0);
        let completion = wait.wait().await;
        assert_eq!(completion.result.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn iov_advance_consumes_across_segments() {
        let (mut aio, _wait) = Aio::<u32>::new();
        aio.set_iov(vec![
            IoSlice::new(bytes::Bytes::from_static(b"abc")),
            IoSlice::new(bytes::Bytes::from_static(b"defgh")),
        ]);

        aio.iov_advance(4);

        let remaining: Vec<u8> = aio.iov().iter().flat_map(|s| s.data.to_vec()).collect();
        assert_eq!(remaining, b"efgh");
    }
}
