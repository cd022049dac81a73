//! The in-process transport's address registry (spec §4.C's `inproc`
//! transport scope note in `SPEC_FULL.md` §4.C). Unlike TCP, `inproc` has no
//! OS-level namespace to bind into, so listeners register their address in
//! a process-wide table and dialers look it up — the in-memory analogue of
//! a listening socket and a connect-by-name.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, ErrorKind};
use crate::stream::{inproc_pair, BoxedStream};

pub(crate) type ConnectRequest = oneshot::Sender<BoxedStream>;

fn registry() -> &'static Mutex<HashMap<String, mpsc::UnboundedSender<ConnectRequest>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, mpsc::UnboundedSender<ConnectRequest>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers `name` as bound. Fails with `address-in-use` if another
/// listener already holds it (spec §4.E.1/§4.E.3 bind semantics apply
/// uniformly regardless of transport).
pub(crate) fn bind(name: &str) -> Result<mpsc::UnboundedReceiver<ConnectRequest>, Error> {
    let mut map = registry().lock().unwrap();
    if map.contains_key(name) {
        return Err(Error::new(ErrorKind::AddressInUse));
    }
    let (tx, rx) = mpsc::unbounded_channel();
    map.insert(name.to_string(), tx);
    Ok(rx)
}

pub(crate) fn unbind(name: &str) {
    registry().lock().unwrap().remove(name);
}

/// Dials a bound name. Fails with `connection-refused` if nothing is bound
/// there, the same kind a refused TCP connect surfaces (spec §6).
pub(crate) async fn dial(name: &str) -> Result<BoxedStream, Error> {
    let tx = {
        let map = registry().lock().unwrap();
        map.get(name)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::ConnectionRefused))?
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(reply_tx)
        .map_err(|_| Error::new(ErrorKind::ConnectionRefused))?;
    reply_rx
        .await
        .map_err(|_| Error::new(ErrorKind::ConnectionRefused))
}

/// Services one pending connect request from a listener's accept loop: hands
/// the dialer one end of a fresh pair, keeps the other as the accepted
/// stream.
pub(crate) fn accept_one(request: ConnectRequest, buffer: usize) -> BoxedStream {
    let (accepted, dialed) = inproc_pair(buffer);
    let _ = request.send(dialed);
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_without_a_bound_listener_is_refused() {
        let err = dial("nobody-home").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn binding_the_same_name_twice_is_address_in_use() {
        let _rx = bind("dup-test").unwrap();
        let err = bind("dup-test").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressInUse);
        unbind("dup-test");
    }

    #[tokio::test]
    async fn dial_completes_once_the_listener_services_it() {
        let mut rx = bind("echo-test").unwrap();

        let dialer = tokio::spawn(async move { dial("echo-test").await });

        let request = rx.recv().await.unwrap();
        let _accepted = accept_one(request, 4096);

        let dialed = dialer.await.unwrap().unwrap();
        drop(dialed);
        unbind("echo-test");
    }
}
