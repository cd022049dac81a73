//! The dialer (spec §4.E.2): resolves a URL to a stream, drives the pipe
//! handshake, and hands back a matched pipe. Grounded on
//! `pallas-network::facades::PeerClient::connect`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, ErrorKind};
use crate::options::EndpointOptions;
use crate::pipe::Pipe;
use crate::stream::{connect_tcp, BoxedStream};
use crate::url::{scheme_supported, validate_dial_url};

use super::{inproc, EndpointState};

/// Default reconnect bounds when the caller hasn't set `reconnect-min`/
/// `reconnect-max` (spec §6: these options default to implementation-defined
/// values when unset).
const DEFAULT_RECONNECT_MIN: Duration = Duration::from_millis(100);
const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(10);

pub struct Dialer {
    url: Url,
    protocol: u16,
    options: EndpointOptions,
    state: Arc<EndpointState>,
}

impl Dialer {
    /// Validates `raw_url` and prepares a dialer (spec §4.E.1 init). The URL
    /// is resolved synchronously here; no connection is attempted yet.
    pub fn new(raw_url: &str, protocol: u16) -> Result<Self, Error> {
        let url = validate_dial_url(raw_url)?;
        if !scheme_supported(&url) {
            return Err(Error::new(ErrorKind::NotSupported));
        }
        let mut options = EndpointOptions::new();
        options.set_resolved_url(url.as_str().to_string());
        Ok(Self {
            url,
            protocol,
            options,
            state: EndpointState::new(),
        })
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut EndpointOptions {
        &mut self.options
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// One connect attempt (spec §4.E.2 `connect`). At most one connect is
    /// ever in flight per dialer; a concurrent second call fails with `busy`
    /// rather than queuing behind the first (spec §4.E.2 "a second
    /// concurrent `connect` fails immediately"). The busy slot is held by an
    /// RAII guard, so a caller that drops this future early — a
    /// `tokio::time::timeout` around `connect()`, a losing `select!` branch
    /// — still releases it; without the guard the slot would stay claimed
    /// forever since nothing downstream of the drop point would run.
    pub async fn connect(&self) -> Result<Pipe, Error> {
        let _busy = self.state.begin_busy()?;
        self.connect_inner().await
    }

    async fn connect_inner(&self) -> Result<Pipe, Error> {
        let mut stream = self.resolve_stream().await?;
        crate::stream::apply_options(&mut stream, &self.options);
        let rcvmax = self.options.recv_max_size();
        let owner = self.state.retain();
        match Pipe::open_with_owner(stream, self.protocol, rcvmax, Some(owner)).await {
            Ok(pipe) => {
                self.state.track_pipe(&pipe);
                Ok(pipe)
            }
            Err(err) => {
                // Handshake failed: undo the speculative retain, the pipe
                // never became visible to the caller.
                self.state.release_failed_match();
                Err(err)
            }
        }
    }

    async fn resolve_stream(&self) -> Result<BoxedStream, Error> {
        match self.url.scheme() {
            "tcp" | "tcp4" | "tcp6" => {
                let host = self.url.host_str().unwrap_or_default();
                let port = self.url.port().unwrap_or(0);
                let addr = resolve_socket_addr(host, port).await?;
                connect_tcp(addr).await
            }
            "inproc" => {
                let name = self.url.as_str().trim_start_matches("inproc://");
                inproc::dial(name).await
            }
            _ => Err(Error::new(ErrorKind::NotSupported)),
        }
    }

    /// Connects with exponential backoff bounded by `reconnect-min`/
    /// `reconnect-max`, retrying transport-level failures until a pipe is
    /// established or the dialer is closed (spec §4.E.2's reconnect
    /// behavior — owned here since this crate has no socket core of its own
    /// to drive it, see `src/socket.rs`).
    pub async fn connect_with_backoff(&self) -> Result<Pipe, Error> {
        let mut backoff = self.options.reconnect_min().unwrap_or(DEFAULT_RECONNECT_MIN);
        let max = self.options.reconnect_max().unwrap_or(DEFAULT_RECONNECT_MAX);

        loop {
            match self.connect().await {
                Ok(pipe) => return Ok(pipe),
                Err(err) if matches!(err.kind(), ErrorKind::Busy | ErrorKind::Closed) => {
                    return Err(err)
                }
                Err(err) => {
                    // A little jitter keeps many dialers that lost the same
                    // peer from all retrying in lockstep.
                    let jittered = backoff + Duration::from_millis(
                        rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4 + 1),
                    );
                    warn!(
                        url = %self.url,
                        ?err,
                        backoff_ms = jittered.as_millis(),
                        "dial failed, backing off"
                    );
                    tokio::time::sleep(jittered).await;
                    backoff = std::cmp::min(backoff * 2, max);
                }
            }
        }
    }

    /// Closes the dialer (spec §4.E.5): also force-closes every pipe this
    /// dialer has matched and is still tracking (spec §3 "the endpoint
    /// retains a weak linkage so that endpoint close forces pipe close").
    /// Idempotent.
    pub fn close(&self) {
        if !self.state.is_closed() {
            debug!(url = %self.url, "dialer closed");
        }
        self.state.mark_closed();
        self.state.close_tracked_pipes();
    }
}

async fn resolve_socket_addr(host: &str, port: u16) -> Result<std::net::SocketAddr, Error> {
    use tokio::net::lookup_host;
    let mut addrs = lookup_host((host, port)).await?;
    addrs
        .next()
        .ok_or_else(|| Error::new(ErrorKind::AddressInvalid))
}
