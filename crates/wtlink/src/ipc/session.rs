//! IPC session: the single loopback socket between host and worker.
//!
//! The host binds a listener, accepts exactly one worker connection and then
//! drops the listener, so later connection attempts are refused. The write
//! half stays behind a mutex (one writer path, ordered sends). The read half
//! is handed to whichever task takes it, which becomes its only owner.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{self, MessageCodec};
use super::protocol::Message;
use crate::error::{BridgeError, Result};

type SessionWriter = FramedWrite<OwnedWriteHalf, MessageCodec>;

/// How long `close` waits for buffered bytes to reach a worker that may
/// have stopped reading.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Bound, waiting for the worker.
    Listening,
    Established {
        peer: SocketAddr,
    },
    /// Released; never re-established.
    Closed,
}

impl SessionState {
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Read half of an established session.
pub struct SessionReader {
    inner: FramedRead<OwnedReadHalf, MessageCodec>,
    peer: SocketAddr,
}

impl SessionReader {
    /// Wait for the next message from the worker.
    ///
    /// A frame that fails to decode yields `MalformedMessage` and leaves the
    /// stream positioned at the next frame. EOF and socket errors yield
    /// `ConnectionLost`.
    pub async fn receive_one(&mut self) -> Result<Message> {
        match self.inner.next().await {
            Some(Ok(Ok(message))) => Ok(message),
            Some(Ok(Err(malformed))) => Err(BridgeError::MalformedMessage(malformed)),
            Some(Err(e)) => Err(BridgeError::ConnectionLost(e.to_string())),
            None => Err(BridgeError::ConnectionLost(
                "worker closed the connection".to_string(),
            )),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

pub struct IpcSession {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    writer: Mutex<Option<SessionWriter>>,
    reader: Mutex<Option<SessionReader>>,
    state: watch::Sender<SessionState>,
    /// Fired first thing in `close`; aborts in-flight accepts and writes.
    closing: CancellationToken,
}

impl IpcSession {
    /// Bind the loopback listener. Port 0 picks an ephemeral port.
    pub async fn listen(port: u16) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BridgeError::Bind { addr, source })?;

        tracing::info!(%local_addr, "Listening for worker connection");

        let (state, _) = watch::channel(SessionState::Listening);
        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            state,
            closing: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_established(&self) -> bool {
        self.state().is_established()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Block until exactly one worker connects.
    ///
    /// On timeout the listener is kept and the call may be retried. After a
    /// successful accept the listener is dropped and further calls fail with
    /// `AlreadyEstablished`.
    pub async fn accept_once(&self, timeout: Option<Duration>) -> Result<SocketAddr> {
        let mut listener_slot = self.listener.lock().await;
        let Some(listener) = listener_slot.as_ref() else {
            return Err(if self.state().is_closed() {
                BridgeError::SessionClosed
            } else {
                BridgeError::AlreadyEstablished
            });
        };

        tracing::debug!(local_addr = %self.local_addr, ?timeout, "Waiting for worker to connect");

        let accept = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, listener.accept()).await {
                    Ok(accepted) => accepted.map_err(BridgeError::Accept),
                    Err(_) => Err(BridgeError::AcceptTimeout(limit)),
                },
                None => listener.accept().await.map_err(BridgeError::Accept),
            }
        };

        let accepted = tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(BridgeError::SessionClosed),
            accepted = accept => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(BridgeError::SessionClosed) => {
                listener_slot.take();
                return Err(BridgeError::SessionClosed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Worker accept failed");
                return Err(e);
            }
        };

        listener_slot.take();

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "Failed to set TCP_NODELAY on worker socket");
        }

        // State transitions happen under the writer lock; `close` fires
        // `closing` before taking it.
        let mut writer = self.writer.lock().await;
        if self.closing.is_cancelled() {
            tracing::debug!(%peer, "Session closed during accept, dropping worker socket");
            return Err(BridgeError::SessionClosed);
        }

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(SessionReader {
            inner: FramedRead::new(read_half, MessageCodec::new()),
            peer,
        });
        *writer = Some(FramedWrite::new(write_half, MessageCodec::new()));
        self.state.send_replace(SessionState::Established { peer });
        drop(writer);

        tracing::info!(%peer, "Worker connected");
        Ok(peer)
    }

    /// Resolve once the session is established (or closed without ever being
    /// established, which is an error).
    pub async fn wait_established(&self) -> Result<SocketAddr> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| !matches!(state, SessionState::Listening))
            .await
            .map_err(|_| BridgeError::SessionClosed)?;

        match state {
            SessionState::Established { peer } => Ok(peer),
            _ => Err(BridgeError::SessionClosed),
        }
    }

    /// Resolve once the session has been closed.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(SessionState::is_closed).await;
    }

    /// Hand the read half to its sole owner. Returns `None` before the
    /// session is established or once it has been taken.
    pub async fn take_reader(&self) -> Option<SessionReader> {
        self.reader.lock().await.take()
    }

    /// Encode and write one message to the worker.
    ///
    /// Before a worker connects the message is dropped and `NoPeerConnected`
    /// is returned; nothing is written. A message too large for one frame is
    /// rejected with `MessageTooLarge` and the session stays usable. A write
    /// still pending when the session closes returns `SessionClosed`.
    pub async fn send(&self, message: Message) -> Result<()> {
        let header = message.header();
        let mut writer = tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(BridgeError::SessionClosed),
            writer = self.writer.lock() => writer,
        };

        let Some(framed) = writer.as_mut() else {
            let err = if self.state().is_closed() {
                BridgeError::SessionClosed
            } else {
                BridgeError::NoPeerConnected
            };
            tracing::warn!(%header, error = %err, "Dropping message");
            return Err(err);
        };

        match self.closing.run_until_cancelled(framed.send(message)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                if let Some(too_large) = codec::frame_too_large(&e) {
                    tracing::warn!(
                        %header,
                        len = too_large.len,
                        max = too_large.max,
                        "Message exceeds frame limit"
                    );
                    return Err(BridgeError::MessageTooLarge {
                        len: too_large.len,
                        max: too_large.max,
                    });
                }
                tracing::error!(%header, error = %e, "Failed to write message to worker");
                return Err(BridgeError::ConnectionLost(e.to_string()));
            }
            None => {
                tracing::debug!(%header, "Session closed while writing");
                return Err(BridgeError::SessionClosed);
            }
        }

        tracing::trace!(%header, "Sent message to worker");
        Ok(())
    }

    /// Release the socket. Idempotent.
    pub async fn close(&self) {
        self.closing.cancel();

        let mut writer = self.writer.lock().await;
        let previous = self.state.send_replace(SessionState::Closed);
        if let Some(mut framed) = writer.take() {
            match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, framed.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Error shutting down worker socket"),
                Err(_) => tracing::debug!("Worker not reading, dropping unflushed bytes"),
            }
        }
        drop(writer);
        self.reader.lock().await.take();
        // An in-flight accept holds the listener lock and drops it on its way out.
        if let Ok(mut listener) = self.listener.try_lock() {
            listener.take();
        }

        if !previous.is_closed() {
            tracing::info!(local_addr = %self.local_addr, "Worker session closed");
        }
    }
}
