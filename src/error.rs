//! Local result kind for in-process callers (Design Note 3).
//!
//! The wire only ever carries `SUCCESS`/`FAILURE` (or a raw byte count for
//! the two transfer ops, §7). Locally, callers get a richer breakdown so
//! library consumers can log and branch without re-deriving it from a single
//! boolean.
use std::fmt;

/// Sentinel written into `RpcRecord::server_error` and returned to callers
/// on the wire-visible `status` channel.
pub const WIRE_SUCCESS: u32 = 0;
pub const WIRE_FAILURE: u32 = 1;

/// Sentinel returned by `USB_CONTROL_TRANSFER` / `USB_BULK_TRANSFER` in
/// place of a byte count when the transfer failed (§7).
pub const TRANSFER_FAILURE: i32 = -1;

#[derive(Debug)]
pub enum RpcError {
    /// Null/invalid argument, oversized length, or other input the caller
    /// could have caught before touching the wire.
    InvalidArg(String),
    /// Role/state mismatch: wrong context, or an op issued against a
    /// `Terminal` connection.
    BadContext(String),
    /// Short read/write, EOF, or any other transport-level failure. The
    /// connection is `Terminal` after this.
    Wire(String),
    /// The backend capability call itself returned failure.
    Backend(String),
    /// A `dev`/`handle` session id did not resolve in the identity table.
    NotFound,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
            RpcError::BadContext(msg) => write!(f, "illegal context: {msg}"),
            RpcError::Wire(msg) => write!(f, "wire failure: {msg}"),
            RpcError::Backend(msg) => write!(f, "backend failure: {msg}"),
            RpcError::NotFound => write!(f, "session id not found"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Wire(e.to_string())
    }
}

impl RpcError {
    /// Maps any local error to the wire-visible status value for S-ops.
    pub fn to_wire_status(&self) -> u32 {
        WIRE_FAILURE
    }
}
