use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::ipc::protocol::{Header, MalformedMessage};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept worker connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("no worker connected within {0:?}")]
    AcceptTimeout(Duration),

    /// Only one worker session is supported per bridge.
    #[error("worker session already established")]
    AlreadyEstablished,

    #[error("no worker connected")]
    NoPeerConnected,

    #[error("worker session closed")]
    SessionClosed,

    #[error(transparent)]
    MalformedMessage(#[from] MalformedMessage),

    /// Rejected before anything was written; the session is unaffected.
    #[error("message of {len} bytes exceeds frame limit of {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("connection to worker lost: {0}")]
    ConnectionLost(String),

    #[error("unexpected {0} message from worker")]
    UnexpectedMessage(Header),
}

impl BridgeError {
    /// Whether the receive loop can keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::MalformedMessage(_) | BridgeError::UnexpectedMessage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
