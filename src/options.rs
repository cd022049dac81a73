//! Recognized endpoint options (spec §6) as a typed, validated surface.
//!
//! The abstract API is a stringly-typed `get/set option(name, value)` pair;
//! idiomatic for a Rust crate is a struct of typed fields with validated
//! setters, the way the teacher exposes typed accessors
//! (`PeerClient::chainsync()`, `PeerServer::blockfetch()`, …) rather than a
//! generic dictionary. A name-indexed fallback is kept alongside for
//! introspection callers that only have a string in hand (e.g. a CLI option
//! parser, out of this crate's scope per spec §1).

use std::time::Duration;

use crate::error::{Error, ErrorKind};

/// Ceiling used when `recv-max-size` is clamped (spec §6: "Clamped to ≤ 4
/// GiB on 64-bit systems").
pub const MAX_RECV_SIZE: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Per-pipe receive ceiling; `0` means unbounded (spec §6).
    recv_max_size: u64,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
    reconnect_min: Option<Duration>,
    reconnect_max: Option<Duration>,
    /// Read-only once a listener has bound (spec §6 `url`); set internally.
    resolved_url: Option<String>,
    /// `TCP_NODELAY`, inherited from the underlying stream (spec §6:
    /// "Inherited from stream: ... nodelay"); `None` leaves the transport's
    /// own default alone.
    nodelay: Option<bool>,
    /// `SO_KEEPALIVE`, inherited from the underlying stream (spec §6:
    /// "Inherited from stream: keep-alive, ..."); `None` leaves the
    /// transport's own default alone.
    keep_alive: Option<bool>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            recv_max_size: 0,
            send_timeout: None,
            recv_timeout: None,
            reconnect_min: None,
            reconnect_max: None,
            resolved_url: None,
            nodelay: None,
            keep_alive: None,
        }
    }
}

impl EndpointOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recv_max_size(&self) -> u64 {
        self.recv_max_size
    }

    /// Sets `recv-max-size`. Rejects a value above [`MAX_RECV_SIZE`] as
    /// `Invalid`, retaining the previous value (spec §8 boundary behavior).
    pub fn set_recv_max_size(&mut self, value: u64) -> Result<(), Error> {
        if value > MAX_RECV_SIZE {
            return Err(Error::new(ErrorKind::Invalid));
        }
        self.recv_max_size = value;
        Ok(())
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    pub fn set_send_timeout(&mut self, value: Option<Duration>) -> Result<(), Error> {
        self.send_timeout = value;
        Ok(())
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout
    }

    pub fn set_recv_timeout(&mut self, value: Option<Duration>) -> Result<(), Error> {
        self.recv_timeout = value;
        Ok(())
    }

    pub fn reconnect_min(&self) -> Option<Duration> {
        self.reconnect_min
    }

    pub fn set_reconnect_min(&mut self, value: Option<Duration>) -> Result<(), Error> {
        self.reconnect_min = value;
        Ok(())
    }

    pub fn reconnect_max(&self) -> Option<Duration> {
        self.reconnect_max
    }

    pub fn set_reconnect_max(&mut self, value: Option<Duration>) -> Result<(), Error> {
        self.reconnect_max = value;
        Ok(())
    }

    pub fn url(&self) -> Option<&str> {
        self.resolved_url.as_deref()
    }

    pub(crate) fn set_resolved_url(&mut self, url: String) {
        self.resolved_url = Some(url);
    }

    pub fn nodelay(&self) -> Option<bool> {
        self.nodelay
    }

    /// Sets `nodelay`, applied to the stream the next time this endpoint
    /// resolves or accepts one (spec §6). Has no effect on a stream that's
    /// already been handed to a pipe.
    pub fn set_nodelay(&mut self, value: Option<bool>) {
        self.nodelay = value;
    }

    pub fn keep_alive(&self) -> Option<bool> {
        self.keep_alive
    }

    /// Sets `keep-alive`, applied to the stream the next time this endpoint
    /// resolves or accepts one (spec §6). Has no effect on a stream that's
    /// already been handed to a pipe.
    pub fn set_keep_alive(&mut self, value: Option<bool>) {
        self.keep_alive = value;
    }

    /// Name-indexed duration setter shared by `send-timeout`, `recv-timeout`,
    /// `reconnect-min`, `reconnect-max`: all four reject a negative value as
    /// `Invalid` (spec §6, §8).
    pub fn set_named_duration_ms(&mut self, name: &str, millis: i64) -> Result<(), Error> {
        if millis < 0 {
            return Err(Error::new(ErrorKind::Invalid));
        }
        let value = Some(Duration::from_millis(millis as u64));
        match name {
            "send-timeout" => self.set_send_timeout(value),
            "recv-timeout" => self.set_recv_timeout(value),
            "reconnect-min" => self.set_reconnect_min(value),
            "reconnect-max" => self.set_reconnect_max(value),
            _ => Err(Error::new(ErrorKind::NotSupported)),
        }
    }
}
