//! The byte-stream abstraction (spec §4.C): a uniform send/recv/close/option
//! surface that each transport exposes to the pipe engine.
//!
//! Grounded on the teacher's `bearer::Bearer` enum (`Tcp`/`Unix` variants
//! wrapping `tokio::net` types, with `readable`/`try_read`/`write_all`/
//! `flush` as the four operations a pipe drives). Rather than reimplement
//! that read/write surface by hand, this crate leans on the fact that
//! `tokio::net::TcpStream` and `tokio::io::DuplexStream` already *are*
//! `AsyncRead + AsyncWrite` byte streams: [`Bytestream`] is a thin marker
//! trait over that pair adding the option surface spec §4.C and §6 ask for
//! (`get/set option`, `get_addr`). `Box<dyn Bytestream>` is what a pipe
//! owns; [`tokio::io::split`] gives it independent read/write halves so
//! send and recv can run concurrently without serializing on each other
//! (spec §4.C: "must each be safe against concurrent use by independent
//! directions"), while the pipe engine (`src/pipe/mod.rs`) is what enforces
//! "no two concurrent sends" and "no two concurrent recvs" on top.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

use crate::error::Error;
use crate::options::EndpointOptions;

/// A byte-oriented transport a pipe can be layered on. Transports out of
/// this crate's scope (TLS, WebSocket — spec §1) plug in by implementing
/// this trait for their own stream type and handing a `Box<dyn Bytestream>`
/// to an endpoint the same way [`connect_tcp`]/[`accept_tcp`] do here.
pub trait Bytestream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn set_nodelay(&mut self, _value: bool) -> io::Result<()> {
        Ok(())
    }

    fn set_keepalive(&mut self, _value: bool) -> io::Result<()> {
        Ok(())
    }

    /// A short tag used in diagnostics/log fields; not part of the wire
    /// protocol.
    fn kind_name(&self) -> &'static str;
}

impl Bytestream for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn set_nodelay(&mut self, value: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, value)
    }

    fn set_keepalive(&mut self, value: bool) -> io::Result<()> {
        socket2::SockRef::from(&*self).set_keepalive(value)
    }

    fn kind_name(&self) -> &'static str {
        "tcp"
    }
}

impl Bytestream for tokio::io::DuplexStream {
    fn kind_name(&self) -> &'static str {
        "inproc"
    }
}

/// The owned, boxed form a pipe holds (spec §3 "Pipe exclusively owns its
/// byte stream").
pub type BoxedStream = Box<dyn Bytestream>;

pub async fn connect_tcp(addr: SocketAddr) -> Result<BoxedStream, Error> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Box::new(stream))
}

pub async fn accept_tcp(listener: &TcpListener) -> Result<(BoxedStream, SocketAddr), Error> {
    let (stream, addr) = listener.accept().await?;
    Ok((Box::new(stream), addr))
}

/// Applies the endpoint's `nodelay`/`keep-alive` options (spec §6:
/// "Inherited from stream") to a freshly resolved or accepted stream before
/// it is handed to the handshake. Unset options leave the transport's own
/// default alone; a failure to apply one is logged and otherwise ignored —
/// these are performance hints, not something worth failing a connect or
/// accept over.
pub(crate) fn apply_options(stream: &mut BoxedStream, options: &EndpointOptions) {
    if let Some(value) = options.nodelay() {
        if let Err(err) = stream.set_nodelay(value) {
            warn!(?err, value, "failed to set nodelay on stream");
        }
    }
    if let Some(value) = options.keep_alive() {
        if let Err(err) = stream.set_keepalive(value) {
            warn!(?err, value, "failed to set keep-alive on stream");
        }
    }
}

/// Creates a connected in-process pair, as if one side had dialed and the
/// other accepted (spec §4.C's in-proc transport; see spec §1 — in-proc is
/// one of the in-scope transport kinds named in the system overview, unlike
/// TCP+TLS/WebSocket+TLS which remain external).
pub fn inproc_pair(buffer: usize) -> (BoxedStream, BoxedStream) {
    let (a, b) = tokio::io::duplex(buffer);
    (Box::new(a), Box::new(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn inproc_pair_round_trips_bytes() {
        let (mut a, mut b) = inproc_pair(4096);

        a.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn apply_options_is_a_no_op_when_unset() {
        let (mut a, _b) = inproc_pair(4096);
        apply_options(&mut a, &EndpointOptions::new());
    }

    #[tokio::test]
    async fn apply_options_sets_nodelay_on_a_real_tcp_stream() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(connect_tcp(addr), accept_tcp(&listener));
        let mut client = client.unwrap();
        let (_server, _peer_addr) = accepted.unwrap();

        let mut options = EndpointOptions::new();
        options.set_nodelay(Some(true));
        options.set_keep_alive(Some(true));
        apply_options(&mut client, &options);
    }
}
