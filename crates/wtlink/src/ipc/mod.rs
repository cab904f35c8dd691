//! IPC channel between the host and the transport worker.
//!
//! # Architecture
//!
//! - **protocol**: Message types (StartTransport, StopTransport, Send, ConnectionEstablished)
//! - **codec**: Length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **session**: The single accepted loopback socket and its send/receive primitives

pub mod codec;
pub mod protocol;
pub mod session;
