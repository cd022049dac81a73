//! The socket-transport binding (spec §2 component F): the thin seam that
//! lets a higher-level socket core attach dialers/listeners and observe the
//! pipes they match, without this crate needing to know anything about
//! protocol semantics (req/rep, pub/sub, …) or delivery guarantees — those
//! are out of scope (spec §1).
//!
//! Grounded on `pallas-network::facades` surfacing `PeerClient`/`PeerServer`
//! as the handles a caller holds after dial/accept; `Socket` here is the
//! same idea generalized across many endpoints instead of one fixed set of
//! miniprotocols.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::endpoint::{Dialer, Listener};
use crate::error::Error;
use crate::pipe::Pipe;

/// Binds together every dialer/listener registered against one logical
/// protocol id and funnels their matched pipes through a single channel
/// (spec §2 "pipe joins the socket's active pipe set").
pub struct Socket {
    protocol: u16,
    pipes_tx: mpsc::UnboundedSender<Pipe>,
    pipes_rx: mpsc::UnboundedReceiver<Pipe>,
}

impl Socket {
    pub fn new(protocol: u16) -> Self {
        let (pipes_tx, pipes_rx) = mpsc::unbounded_channel();
        Self {
            protocol,
            pipes_tx,
            pipes_rx,
        }
    }

    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    /// Adds a dialer and drives one connect-with-backoff attempt on a
    /// spawned task, feeding the matched pipe into this socket's pipe set.
    /// Call again (e.g. once the caller observes the matched pipe close) to
    /// reconnect — this crate has no socket core of its own to decide when
    /// that should happen (spec §1).
    pub fn add_dialer(&self, url: &str) -> Result<(), Error> {
        let dialer = Dialer::new(url, self.protocol)?;
        let tx = self.pipes_tx.clone();
        tokio::spawn(async move {
            match dialer.connect_with_backoff().await {
                Ok(pipe) => {
                    info!(url = dialer.url(), "dialer matched a pipe");
                    let _ = tx.send(pipe);
                }
                Err(err) => {
                    warn!(url = dialer.url(), ?err, "dialer stopped");
                }
            }
        });
        Ok(())
    }

    /// Adds a listener and drives its accept loop on a spawned task, feeding
    /// every pipe it matches into this socket's pipe set.
    pub async fn add_listener(&self, url: &str) -> Result<(), Error> {
        let mut listener = Listener::bind(url, self.protocol).await?;
        let tx = self.pipes_tx.clone();
        tokio::spawn(async move {
            let _ = listener.run(tx).await;
        });
        Ok(())
    }

    /// Awaits the next pipe matched by any attached dialer or listener.
    pub async fn next_pipe(&mut self) -> Option<Pipe> {
        self.pipes_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dialer_and_listener_on_the_same_socket_match_a_pipe() {
        let mut listener_socket = Socket::new(1);
        listener_socket
            .add_listener("inproc://socket-test-address")
            .await
            .unwrap();

        let mut dialer_socket = Socket::new(1);
        dialer_socket
            .add_dialer("inproc://socket-test-address")
            .unwrap();

        let accepted = listener_socket.next_pipe().await.unwrap();
        let dialed = dialer_socket.next_pipe().await.unwrap();

        assert_eq!(accepted.peer_protocol(), 1);
        assert_eq!(dialed.peer_protocol(), 1);
    }
}
