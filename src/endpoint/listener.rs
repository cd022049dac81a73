//! The listener (spec §4.E.3): binds a URL, then runs an accept loop that
//! hands each matched pipe to the caller without letting a slow handshake
//! stall the accept backlog.
//!
//! Grounded on `pallas-network::facades::PeerServer::accept` for bind/accept
//! itself, and on `manager::Manager::run`'s `tokio::select!` idiom for
//! re-entering the accept loop immediately after dispatching one unit of
//! concurrent work — here, spawning the handshake rather than awaiting it
//! inline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, ErrorKind};
use crate::options::EndpointOptions;
use crate::pipe::Pipe;
use crate::stream::{accept_tcp, BoxedStream};
use crate::url::{scheme_supported, validate_listen_url};

use super::{inproc, is_transient_accept_error, EndpointState};

/// Cool-off between accept attempts after a transient resource failure
/// (spec §4.E.3; not user-tunable).
const ACCEPT_COOL_OFF: Duration = Duration::from_millis(10);

enum Backing {
    Tcp(TcpListener),
    Inproc {
        name: String,
        requests: mpsc::UnboundedReceiver<inproc::ConnectRequest>,
    },
}

pub struct Listener {
    url: Url,
    protocol: u16,
    options: EndpointOptions,
    state: Arc<EndpointState>,
    backing: Backing,
    /// Set once [`Self::run`] is entered; a second call fails with
    /// `invalid-state` rather than running two accept loops over the same
    /// bound socket (spec §8 "a listener already started cannot be started
    /// again").
    started: AtomicBool,
}

impl Listener {
    /// Validates the URL and binds (spec §4.E.1 init, §4.E.3 "binding
    /// happens synchronously in `listener_start`, not lazily on first
    /// accept").
    pub async fn bind(raw_url: &str, protocol: u16) -> Result<Self, Error> {
        let (url, family) = validate_listen_url(raw_url)?;
        if !scheme_supported(&url) {
            return Err(Error::new(ErrorKind::NotSupported));
        }

        let backing = match url.scheme() {
            "tcp" | "tcp4" | "tcp6" => {
                let host = url.host_str().unwrap_or("0.0.0.0");
                let port = url.port().unwrap_or(0);
                let bind_host = match family {
                    crate::url::AddressFamily::V4 if host == "0.0.0.0" || host.is_empty() => {
                        "0.0.0.0"
                    }
                    crate::url::AddressFamily::V6 if host.is_empty() => "::",
                    _ => host,
                };
                let listener = TcpListener::bind((bind_host, port)).await?;
                Backing::Tcp(listener)
            }
            "inproc" => {
                let name = url.as_str().trim_start_matches("inproc://").to_string();
                let requests = inproc::bind(&name)?;
                Backing::Inproc { name, requests }
            }
            _ => return Err(Error::new(ErrorKind::NotSupported)),
        };

        let mut options = EndpointOptions::new();
        options.set_resolved_url(url.as_str().to_string());

        Ok(Self {
            url,
            protocol,
            options,
            state: EndpointState::new(),
            backing,
            started: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut EndpointOptions {
        &mut self.options
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.backing {
            Backing::Tcp(listener) => listener.local_addr().ok(),
            Backing::Inproc { .. } => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    async fn accept_raw(&mut self) -> Result<BoxedStream, Error> {
        match &mut self.backing {
            Backing::Tcp(listener) => {
                let (stream, _addr) = accept_tcp(listener).await?;
                Ok(stream)
            }
            Backing::Inproc { requests, .. } => match requests.recv().await {
                Some(request) => Ok(inproc::accept_one(request, 4096)),
                None => Err(Error::new(ErrorKind::Closed)),
            },
        }
    }

    /// Runs the accept loop until the listener is closed, sending each
    /// successfully matched pipe on `results`. A transient out-of-memory or
    /// out-of-files failure backs off for [`ACCEPT_COOL_OFF`] and retries in
    /// place rather than tearing the listener down (spec §4.E.3).
    ///
    /// Fails with [`ErrorKind::InvalidState`] if the accept loop is already
    /// running on this listener (spec §8 "a listener already started cannot
    /// be started again").
    pub async fn run(&mut self, results: mpsc::UnboundedSender<Pipe>) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::InvalidState));
        }

        loop {
            if self.state.is_closed() {
                return Ok(());
            }

            let mut raw = match self.accept_raw().await {
                Ok(raw) => raw,
                Err(err) if is_transient_accept_error(&err) => {
                    warn!(url = %self.url, ?err, "accept failed transiently, cooling off");
                    tokio::time::sleep(ACCEPT_COOL_OFF).await;
                    continue;
                }
                Err(err) => {
                    warn!(url = %self.url, ?err, "listener accept loop stopping");
                    return Ok(());
                }
            };
            crate::stream::apply_options(&mut raw, &self.options);

            let protocol = self.protocol;
            let rcvmax = self.options.recv_max_size();
            let owner = self.state.retain();
            let state = self.state.clone();
            let results = results.clone();
            let url = self.url.clone();

            // Decoupled from the accept loop so a slow handshake never
            // stalls the backlog (spec §4.E.3).
            tokio::spawn(async move {
                match Pipe::open_with_owner(raw, protocol, rcvmax, Some(owner)).await {
                    Ok(pipe) => {
                        state.track_pipe(&pipe);
                        if results.send(pipe).is_err() {
                            debug!(%url, "accepted pipe dropped: no receiver");
                        }
                    }
                    Err(err) => {
                        state.release_failed_match();
                        debug!(%url, ?err, "accepted stream failed handshake");
                    }
                }
            });
        }
    }

    /// Closes the listener (spec §4.E.5): also force-closes every pipe this
    /// listener has matched and is still tracking (spec §3 "the endpoint
    /// retains a weak linkage so that endpoint close forces pipe close").
    /// Idempotent; unbinds the `inproc` name, if any, so it can be reused.
    pub fn close(&self) {
        self.state.mark_closed();
        self.state.close_tracked_pipes();
        if let Backing::Inproc { name, .. } = &self.backing {
            inproc::unbind(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_rejects_bogus_scheme() {
        let err = Listener::bind("carrier-pigeon://nest", 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn tcp_listener_binds_an_ephemeral_port() {
        let listener = Listener::bind("tcp://127.0.0.1:0", 1).await.unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn binding_the_same_inproc_address_twice_is_address_in_use() {
        let first = Listener::bind("inproc://listener-dup-test", 1).await.unwrap();
        let err = Listener::bind("inproc://listener-dup-test", 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressInUse);
        first.close();
    }

    #[tokio::test]
    async fn accept_loop_matches_a_dialed_inproc_connection() {
        let mut listener = Listener::bind("inproc://listener-accept-test", 1).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            let _ = listener.run(tx).await;
        });

        let dialed = crate::endpoint::inproc::dial("listener-accept-test")
            .await
            .unwrap();
        let _our_pipe = Pipe::open(dialed, 1, 0).await.unwrap();

        let accepted = rx.recv().await.unwrap();
        assert_eq!(accepted.peer_protocol(), 1);

        accept_task.abort();
        inproc::unbind("listener-accept-test");
    }

    #[tokio::test]
    async fn closing_the_listener_force_closes_pipes_it_matched() {
        let mut listener = Listener::bind("inproc://listener-close-force-test", 1)
            .await
            .unwrap();
        let state = listener.state.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(async move {
            let _ = listener.run(tx).await;
        });

        let dialed = crate::endpoint::inproc::dial("listener-close-force-test")
            .await
            .unwrap();
        let _our_pipe = Pipe::open(dialed, 1, 0).await.unwrap();
        let accepted = rx.recv().await.unwrap();

        assert!(!accepted.is_closed());
        // Exercises exactly what `Listener::close` does, without needing
        // `listener` back from the task it was moved into.
        state.mark_closed();
        state.close_tracked_pipes();
        assert!(accepted.is_closed());

        accept_task.abort();
        inproc::unbind("listener-close-force-test");
    }

    #[tokio::test]
    async fn starting_an_already_running_listener_is_invalid_state() {
        let mut listener = Listener::bind("inproc://listener-double-start-test", 1)
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        // Simulates a second `run()` call racing an already-started accept
        // loop: once `started` is claimed, any further call must fail fast
        // rather than run a second accept loop over the same bound socket.
        listener.started.store(true, Ordering::SeqCst);
        let err = listener.run(tx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        inproc::unbind("listener-double-start-test");
    }
}
