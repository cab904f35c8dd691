//! Receive loop - decodes worker messages and dispatches them.
//!
//! Flow:
//! 1. Wait for the session's Established transition (no polling)
//! 2. Take sole ownership of the session's read half
//! 3. ConnectionEstablished: register the id, reply with a zero-filled ack
//! 4. Send: forward the payload to the host's inbound channel
//! 5. On connection loss: close the session and exit (no reconnect)

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::ipc::protocol::{ConnectionId, Message};
use crate::ipc::session::IpcSession;
use crate::registry::ConnectionRegistry;

/// Size of the acknowledgment sent back for every ConnectionEstablished.
pub const ACK_PAYLOAD_LEN: usize = 32;

/// Data the worker forwarded from a remote connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPayload {
    pub connection_id: ConnectionId,
    pub body: Vec<u8>,
}

/// Why the receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    /// Worker closed the socket or it errored. The session is closed too.
    ConnectionLost(String),
    /// The session closed before the loop got hold of it.
    SessionClosed,
}

pub struct ReceiveLoop {
    session: Arc<IpcSession>,
    registry: ConnectionRegistry,
    connections: watch::Sender<BTreeSet<ConnectionId>>,
    payloads: mpsc::Sender<PeerPayload>,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    pub fn new(
        session: Arc<IpcSession>,
        connections: watch::Sender<BTreeSet<ConnectionId>>,
        payloads: mpsc::Sender<PeerPayload>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            registry: ConnectionRegistry::new(),
            connections,
            payloads,
            cancel,
        }
    }

    pub async fn run(mut self) -> LoopExit {
        let established = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return LoopExit::Cancelled,
            established = self.session.wait_established() => established,
        };
        if let Err(e) = established {
            tracing::warn!(error = %e, "Receive loop not started");
            return LoopExit::SessionClosed;
        }

        let Some(mut reader) = self.session.take_reader().await else {
            tracing::warn!("Session reader unavailable, receive loop not started");
            return LoopExit::SessionClosed;
        };

        tracing::info!(peer = %reader.peer(), "Receive loop running");

        let exit = loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break LoopExit::Cancelled,
                received = reader.receive_one() => received,
            };

            match received {
                Ok(message) => {
                    if let Err(e) = self.dispatch(message).await {
                        tracing::warn!(error = %e, "Failed to dispatch worker message");
                    }
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "Skipping undecodable frame");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Worker connection lost, receive loop stopping");
                    break LoopExit::ConnectionLost(e.to_string());
                }
            }
        };

        drop(reader);
        if matches!(exit, LoopExit::ConnectionLost(_)) {
            self.session.close().await;
        }

        tracing::info!(?exit, connections = self.registry.len(), "Receive loop exiting");
        exit
    }

    async fn dispatch(&mut self, message: Message) -> Result<()> {
        match message {
            Message::ConnectionEstablished { connection_id } => {
                if self.registry.register(connection_id) {
                    tracing::info!(%connection_id, "Remote connection established");
                } else {
                    tracing::debug!(%connection_id, "Remote connection already registered");
                }
                self.connections.send_replace(self.registry.all());

                let ack = Message::Send {
                    connection_id,
                    body: vec![0u8; ACK_PAYLOAD_LEN],
                };
                self.cancel
                    .run_until_cancelled(self.session.send(ack))
                    .await
                    .unwrap_or(Ok(()))
            }
            Message::Send {
                connection_id,
                body,
            } => {
                tracing::trace!(%connection_id, body_len = body.len(), "Payload from worker");
                let payload = PeerPayload {
                    connection_id,
                    body,
                };
                if let Some(Err(_)) = self
                    .cancel
                    .run_until_cancelled(self.payloads.send(payload))
                    .await
                {
                    tracing::debug!(%connection_id, "Inbound receiver dropped, discarding payload");
                }
                Ok(())
            }
            other => Err(BridgeError::UnexpectedMessage(other.header())),
        }
    }
}
