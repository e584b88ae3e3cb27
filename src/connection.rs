//! `ConnectionInfo` (§3) and its state machine (§4.4 "State machine").
use std::io::{Read, Write};

use crate::error::RpcError;

/// Whether a `ConnectionInfo` is the client or server side of a connection.
/// Immutable for the connection's lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            Role::Client => 0,
            Role::Server => 1,
        }
    }
}

/// `FRESH -> INITIALIZED -> TERMINAL` (§4.4). Operations other than
/// `USB_INIT`/`USB_EXIT` against a `Terminal` connection fail with
/// `BadContext` before any I/O is attempted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnState {
    Fresh,
    Initialized,
    Terminal,
}

/// Per-session handle carrying the side role and the socket stream.
///
/// Generic over `Read + Write` rather than a raw file descriptor: spec.md
/// treats sockets as an external collaborator (§1 "out of scope"), so the
/// core only needs the byte-stream contract and can run over a
/// `TcpStream`, a `UnixStream`, or an in-memory pipe in tests.
pub struct ConnectionInfo<S> {
    role: Role,
    socket: S,
    state: ConnState,
    /// Mirrors the wire's `server_error` field after the last call.
    pub server_error: u32,
}

impl<S: Read + Write> ConnectionInfo<S> {
    pub fn new(role: Role, socket: S) -> Self {
        Self {
            role,
            socket,
            state: ConnState::Fresh,
            server_error: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Validates that this connection may carry an operation other than
    /// `USB_INIT`/`USB_EXIT` (§4.4 "Failure semantics").
    pub fn require_usable(&self) -> Result<(), RpcError> {
        if self.state == ConnState::Terminal {
            return Err(RpcError::BadContext(
                "operation on a terminal connection".into(),
            ));
        }
        Ok(())
    }

    /// Transitions `Fresh -> Initialized` (idempotent: a connection already
    /// `Initialized` or `Terminal` is left alone by this call).
    pub fn mark_initialized(&mut self) {
        if self.state == ConnState::Fresh {
            self.state = ConnState::Initialized;
        }
    }

    /// Transitions to `Terminal`. Called on `USB_EXIT` and on any
    /// transport-level failure (§4.4 "Wire I/O failure").
    pub fn mark_terminal(&mut self) {
        self.state = ConnState::Terminal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn starts_fresh_and_initializes_once() {
        let mut ci = ConnectionInfo::new(Role::Client, Cursor::new(Vec::<u8>::new()));
        assert_eq!(ci.state(), ConnState::Fresh);
        ci.mark_initialized();
        assert_eq!(ci.state(), ConnState::Initialized);
        ci.mark_initialized();
        assert_eq!(ci.state(), ConnState::Initialized);
    }

    #[test]
    fn terminal_connection_rejects_ops() {
        let mut ci = ConnectionInfo::new(Role::Server, Cursor::new(Vec::<u8>::new()));
        ci.mark_terminal();
        assert!(matches!(
            ci.require_usable(),
            Err(RpcError::BadContext(_))
        ));
    }
}
