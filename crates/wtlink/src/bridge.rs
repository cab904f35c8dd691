//! Bridge facade - the host's control surface over the IPC session.
//!
//! Flow:
//! 1. `init`: bind the loopback listener
//! 2. `wait_for_worker`: accept the one worker connection
//! 3. `start_transport`: send StartTransport, launch the receive loop (once)
//! 4. `send_to_peer` / `stop_transport`: write through the session on demand
//! 5. `shutdown`: cancel the loop, release the socket
//!
//! A receive loop that loses the worker closes the session and is not
//! restarted. `closed()` lets the host notice and decide what to do.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::ipc::protocol::{ConnectionId, Message};
use crate::ipc::session::IpcSession;
use crate::receive_loop::{LoopExit, PeerPayload, ReceiveLoop};

enum LoopSlot {
    Pending(ReceiveLoop),
    Running(JoinHandle<LoopExit>),
    Finished,
}

pub struct Bridge {
    config: BridgeConfig,
    session: Arc<IpcSession>,
    connections: watch::Receiver<BTreeSet<ConnectionId>>,
    receive_loop: Mutex<LoopSlot>,
    receiving: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Bridge {
    /// Start listening for the worker.
    ///
    /// Returns the bridge together with the receiver for payloads the worker
    /// forwards from remote connections.
    pub async fn init(config: BridgeConfig) -> Result<(Self, mpsc::Receiver<PeerPayload>)> {
        let session = Arc::new(IpcSession::listen(config.port).await?);

        let (connections_tx, connections) = watch::channel(BTreeSet::new());
        let (payload_tx, payload_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let cancel = CancellationToken::new();

        let receive_loop = ReceiveLoop::new(
            Arc::clone(&session),
            connections_tx,
            payload_tx,
            cancel.child_token(),
        );

        let bridge = Self {
            config,
            session,
            connections,
            receive_loop: Mutex::new(LoopSlot::Pending(receive_loop)),
            receiving: Arc::new(AtomicBool::new(false)),
            cancel,
        };
        Ok((bridge, payload_rx))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.session.local_addr()
    }

    /// Block until the worker connects, honouring `accept_timeout`.
    pub async fn wait_for_worker(&self) -> Result<SocketAddr> {
        self.session.accept_once(self.config.accept_timeout).await
    }

    pub fn is_established(&self) -> bool {
        self.session.is_established()
    }

    /// Tell the worker to start serving; the first successful call also
    /// launches the receive loop.
    pub async fn start_transport(&self) -> Result<()> {
        let mut slot = self.receive_loop.lock().await;
        self.session.send(Message::StartTransport).await?;

        match std::mem::replace(&mut *slot, LoopSlot::Finished) {
            LoopSlot::Pending(receive_loop) => {
                let receiving = Arc::clone(&self.receiving);
                receiving.store(true, Ordering::Release);
                *slot = LoopSlot::Running(tokio::spawn(async move {
                    let exit = receive_loop.run().await;
                    receiving.store(false, Ordering::Release);
                    exit
                }));
                tracing::info!("Receive loop launched");
            }
            other => *slot = other,
        }
        Ok(())
    }

    /// Tell the worker to stop serving. The session and receive loop stay up.
    pub async fn stop_transport(&self) -> Result<()> {
        self.session.send(Message::StopTransport).await
    }

    /// Forward a payload to a remote connection via the worker.
    ///
    /// The id is not checked against the registry.
    pub async fn send_to_peer(
        &self,
        connection_id: impl Into<ConnectionId>,
        body: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let connection_id = connection_id.into();
        if !self.is_registered(connection_id) {
            tracing::debug!(%connection_id, "Sending to unregistered connection");
        }
        self.session.send(Message::send(connection_id, body)).await
    }

    /// Snapshot of the connection ids the worker has announced.
    pub fn connections(&self) -> BTreeSet<ConnectionId> {
        self.connections.borrow().clone()
    }

    pub fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.connections.borrow().contains(&connection_id)
    }

    /// Receiver notified whenever a connection id is registered.
    pub fn watch_connections(&self) -> watch::Receiver<BTreeSet<ConnectionId>> {
        self.connections.clone()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    /// Resolve once the session is closed, by `shutdown` or by losing the worker.
    pub async fn closed(&self) {
        self.session.closed().await;
    }

    /// Cancel the receive loop and release the socket.
    ///
    /// Returns how the loop ended, or `None` if it never ran.
    pub async fn shutdown(&self) -> Option<LoopExit> {
        self.cancel.cancel();

        let slot = std::mem::replace(&mut *self.receive_loop.lock().await, LoopSlot::Finished);
        let exit = match slot {
            LoopSlot::Running(handle) => match handle.await {
                Ok(exit) => Some(exit),
                Err(e) => {
                    tracing::error!(error = %e, "Receive loop task failed");
                    None
                }
            },
            LoopSlot::Pending(_) | LoopSlot::Finished => None,
        };

        self.session.close().await;
        exit
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
