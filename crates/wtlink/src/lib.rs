//! Host side of a host/worker IPC bridge.
//!
//! The host listens on loopback, accepts a single transport worker and then
//! exchanges length-prefixed JSON messages with it: commands to start and
//! stop the transport, payloads for remote connections, and notifications
//! of newly established connections.

pub mod bridge;
pub mod config;
pub mod error;
pub mod ipc;
pub mod receive_loop;
pub mod registry;
pub mod worker;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use ipc::protocol::{ConnectionId, Header, MalformedMessage, Message};
pub use receive_loop::{ACK_PAYLOAD_LEN, LoopExit, PeerPayload};
pub use registry::ConnectionRegistry;
pub use worker::WorkerLink;
