//! Remote USB access: RPC framing, opcode dispatch, and session
//! state-transfer over a caller-supplied byte stream (a socket, a pipe, or
//! anything else that implements `Read + Write`).
//!
//! The crate is split the way a host-side protocol library usually is:
//! [`record`] owns the wire codec, [`connection`] owns the per-session role
//! and state machine, [`dispatch`] and [`server`] own request handling on
//! each side, and [`backend`] adapts the local USB stack the server talks
//! to. [`client`] is the typed, ergonomic entry point most callers want.

pub mod backend;
pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod record;
pub mod server;
pub mod usb;

pub use backend::{Backend, RusbBackend};
pub use client::UsbRpcClient;
pub use connection::{ConnState, ConnectionInfo, Role};
pub use error::RpcError;
pub use record::{DeviceRef, HandleRef, OpCode, RpcRecord, MAX_DATA, MAX_DEVICES, RECORD_SIZE};
pub use server::{run as serve, ServerState};
pub use usb::DeviceDescriptor;
