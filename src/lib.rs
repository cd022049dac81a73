//! Transport core for a Scalability-Protocols-style messaging library.
//!
//! This crate is the engine underneath a socket library in the `nng`/
//! `nanomsg` family: dialer and listener endpoints resolve URLs into byte
//! streams, drive each one through a length-prefixed handshake, and surface
//! the result as a [`pipe::Pipe`] — one established, framed connection that
//! a higher-level socket/protocol layer sends and receives opaque messages
//! over. TCP and TLS/WebSocket bearer semantics, protocol-specific framing
//! above the pipe, and configuration/packaging tooling are out of scope;
//! see each module's documentation for the exact boundary.
//!
//! ```text
//! application → Socket → Endpoint (dial/bind) → Stream → Pipe (handshake, framing) → application
//! ```

pub mod aio;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod pipe;
pub mod reap;
pub mod socket;
pub mod stream;
pub mod url;

pub use error::{Error, ErrorKind, Result};
pub use pipe::Pipe;
pub use socket::Socket;
