//! The endpoint engine (spec §4.E): dialers and listeners, the two
//! endpoint kinds that resolve a URL into a stream, drive it through the
//! pipe handshake, and hand a matched [`crate::pipe::Pipe`] to whatever owns
//! the endpoint.
//!
//! Grounded on the teacher's `facades::PeerClient`/`PeerServer`
//! (connect/accept → handshake → surfaced handle) and
//! `manager::Manager::run`'s accept-loop shape; see `dialer.rs`/`listener.rs`
//! for the per-kind detail.

pub mod dialer;
pub mod inproc;
pub mod listener;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorKind};
use crate::pipe::{Pipe, WeakPipe};

pub use dialer::Dialer;
pub use listener::Listener;

/// Bookkeeping shared by dialers and listeners (spec §3 `Endpoint`):
/// closed/busy flags and the refcount invariant — an endpoint is only
/// finalized once every pipe it ever matched has also closed (spec §4.E.5).
pub(crate) struct EndpointState {
    closed: AtomicBool,
    busy: AtomicBool,
    /// Starts at 1 for the endpoint's own handle; each matched pipe holds
    /// one more until it closes (spec §4.E.5).
    refcount: AtomicUsize,
    /// Weak linkage onto every pipe this endpoint has matched and handed to
    /// a caller, so [`Self::close_tracked_pipes`] can force them closed
    /// without keeping any of them alive on its own (spec §3). Does *not*
    /// cover a pipe still mid-handshake — see `DESIGN.md`'s note on this
    /// simplification.
    pipes: Mutex<Vec<WeakPipe>>,
}

impl EndpointState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            refcount: AtomicUsize::new(1),
            pipes: Mutex::new(Vec::new()),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Claims the endpoint's single in-flight connect/accept slot (spec
    /// §4.E.2/§4.E.3: "at most one user-level connect/accept in flight").
    fn try_begin(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::new(ErrorKind::Closed));
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::Busy));
        }
        Ok(())
    }

    fn end_busy(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Claims the busy slot as an RAII guard instead of a bare
    /// [`Self::try_begin`]/[`Self::end_busy`] pair: if the future driving the
    /// connect/accept attempt is dropped before finishing — e.g. wrapped in
    /// an outer `tokio::time::timeout` or raced in a `tokio::select!` — the
    /// guard's `Drop` still releases the slot, so cancellation can never
    /// leave the endpoint permanently `busy` (spec §4.E.2 "at most one
    /// user-level connect/accept in flight" must not deadlock on its own
    /// cancellation).
    fn begin_busy(self: &Arc<Self>) -> Result<BusyGuard, Error> {
        self.try_begin()?;
        Ok(BusyGuard { state: self.clone() })
    }

    fn retain(self: &Arc<Self>) -> crate::pipe::OwnerRelease {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        let state = self.clone();
        Arc::new(move || {
            state.refcount.fetch_sub(1, Ordering::AcqRel);
        })
    }

    /// Undoes a [`retain`](Self::retain) whose pipe never came into being
    /// (e.g. the handshake failed before a [`crate::pipe::Pipe`] existed to
    /// own the release hook).
    fn release_failed_match(&self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }

    fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Records a weak linkage onto a freshly matched pipe (spec §3).
    /// Opportunistically drops any already-dead entries so the list doesn't
    /// grow unbounded across a long-lived endpoint's lifetime.
    pub(crate) fn track_pipe(&self, pipe: &Pipe) {
        let mut pipes = self.pipes.lock().unwrap();
        pipes.retain(|weak| weak.is_alive());
        pipes.push(pipe.downgrade());
    }

    /// Force-closes every pipe this endpoint is still tracking (spec §4.E.5
    /// "closes every pipe on all three lists" — `negopipes`/`waitpipes`/
    /// `busypipes` collapse here onto the one list of matched pipes this
    /// crate keeps; see `DESIGN.md` for the scope this simplification
    /// leaves out).
    pub(crate) fn close_tracked_pipes(&self) {
        let pipes = self.pipes.lock().unwrap();
        for weak in pipes.iter() {
            weak.close();
        }
    }
}

/// Holds the endpoint's single busy slot for the lifetime of one connect or
/// accept attempt; releases it on drop regardless of whether that attempt
/// ran to completion or was cancelled partway through.
pub(crate) struct BusyGuard {
    state: Arc<EndpointState>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.state.end_busy();
    }
}

fn is_transient_accept_error(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::NoMemory | ErrorKind::NoFiles)
}
