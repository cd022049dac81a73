//! The closed set of error kinds surfaced across the transport core (spec §6, §7).

use std::fmt;
use std::io;

/// Abstract error kind surfaced upward by the AIO, pipe and endpoint layers.
///
/// This is the Rust encoding of the abstract kind list in the specification:
/// every error that crosses a public API boundary is one of these, never a
/// bare [`std::io::Error`] or a module-local enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An AIO's deadline elapsed before completion.
    Timeout,
    /// A non-blocking operation had nothing to do right now.
    Again,
    /// The underlying stream or owning object was closed.
    Closed,
    /// The stream reported closure during the handshake, not during data
    /// transfer (spec §4.D.1 rule 4, §7 canonical translation).
    ConnectionShutdown,
    /// The peer refused the connection at the transport level.
    ConnectionRefused,
    /// A listener could not bind because the address is already in use.
    AddressInUse,
    /// A URL or address failed endpoint-level validation (spec §4.E.1).
    AddressInvalid,
    /// Handshake or frame-level protocol violation (spec §4.D.1, §6).
    Protocol,
    /// TLS peer authentication failed.
    ///
    /// Preserved per the Open Question in spec §9: the invalid-verify TLS
    /// scenario may surface as `PeerAuth`, `Closed`, or `Crypto` depending on
    /// timing; callers that care about that scenario must treat all three as
    /// equivalent rather than match on `PeerAuth` alone.
    PeerAuth,
    /// A cryptographic operation (TLS handshake, certificate parsing) failed.
    Crypto,
    /// An inbound message exceeded the pipe's `recv-max-size` ceiling.
    MessageTooBig,
    /// The system is out of memory.
    NoMemory,
    /// The process is out of file descriptors.
    NoFiles,
    /// A finalized pipe or endpoint handle was operated on.
    NotFound,
    /// A second user-level connect/accept was attempted while one is in flight.
    Busy,
    /// An option was set with the wrong type.
    BadType,
    /// A scheme or option name is not recognized (e.g. dial/listen on an
    /// unregistered URL scheme — spec §8 "bogus URL scheme").
    NotSupported,
    /// An operation (e.g. `listener_start`) was attempted in a state that
    /// cannot accept it (spec §8 "a listener already started").
    InvalidState,
    /// An option value failed validation (negative timeout, oversize
    /// `recv-max-size`, malformed URL component).
    Invalid,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Again => "again",
            ErrorKind::Closed => "closed",
            ErrorKind::ConnectionShutdown => "connection-shutdown",
            ErrorKind::ConnectionRefused => "connection-refused",
            ErrorKind::AddressInUse => "address-in-use",
            ErrorKind::AddressInvalid => "address-invalid",
            ErrorKind::Protocol => "protocol",
            ErrorKind::PeerAuth => "peer-auth",
            ErrorKind::Crypto => "crypto",
            ErrorKind::MessageTooBig => "message-too-big",
            ErrorKind::NoMemory => "no-memory",
            ErrorKind::NoFiles => "no-files",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Busy => "busy",
            ErrorKind::BadType => "bad-type",
            ErrorKind::NotSupported => "not-supported",
            ErrorKind::InvalidState => "invalid-state",
            ErrorKind::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// The error type returned across the public surface of this crate.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn with_source(
        kind: ErrorKind,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::WouldBlock => ErrorKind::Again,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::Closed,
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::AddrInUse => ErrorKind::AddressInUse,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                ErrorKind::AddressInvalid
            }
            _ => {
                // ENOMEM / EMFILE / ENFILE are the transient accept failures
                // spec §4.E.3 asks us to recover locally with a bounded
                // cool-off.
                const ENOMEM: i32 = 12;
                const ENFILE: i32 = 23;
                const EMFILE: i32 = 24;
                match err.raw_os_error() {
                    Some(ENOMEM) => ErrorKind::NoMemory,
                    Some(ENFILE) | Some(EMFILE) => ErrorKind::NoFiles,
                    _ => ErrorKind::Closed,
                }
            }
        };
        Error::with_source(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
