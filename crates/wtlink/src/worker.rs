//! Worker side of the IPC channel.
//!
//! The host side (listening, dispatch) is in bridge.rs. A worker connects to
//! the host's loopback listener, waits for StartTransport, reports accepted
//! peers with ConnectionEstablished and exchanges Send payloads.

use std::io;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{BridgeError, Result};
use crate::ipc::codec::MessageCodec;
use crate::ipc::protocol::Message;

pub struct WorkerLink {
    reader: FramedRead<OwnedReadHalf, MessageCodec>,
    writer: FramedWrite<OwnedWriteHalf, MessageCodec>,
}

impl WorkerLink {
    /// Connect to the host's listener.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        tracing::debug!(%addr, "Connecting to host");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: FramedRead::new(read_half, MessageCodec::new()),
            writer: FramedWrite::new(write_half, MessageCodec::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.writer.get_ref().local_addr()
    }

    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.writer
            .send(message)
            .await
            .map_err(|e| BridgeError::ConnectionLost(e.to_string()))
    }

    /// Next message from the host.
    pub async fn recv(&mut self) -> Result<Message> {
        match self.reader.next().await {
            Some(Ok(Ok(message))) => Ok(message),
            Some(Ok(Err(malformed))) => Err(BridgeError::MalformedMessage(malformed)),
            Some(Err(e)) => Err(BridgeError::ConnectionLost(e.to_string())),
            None => Err(BridgeError::ConnectionLost(
                "host closed the connection".to_string(),
            )),
        }
    }

    /// Flush and shut down the write half; the host sees EOF.
    pub async fn close(mut self) -> Result<()> {
        self.writer
            .close()
            .await
            .map_err(|e| BridgeError::ConnectionLost(e.to_string()))
    }
}
