//! Explicit server-owned state (§9 Design Note "Process-global backend
//! context → explicit ownership") and the top-level server read loop
//! (§4.4).
use std::io::{Read, Write};

use crate::backend::Backend;
use crate::connection::ConnectionInfo;
use crate::dispatch;
use crate::error::RpcError;
use crate::identity::IdentityTable;

/// Replaces the source's file-scope `libusbip_ctx` global: one value owned
/// by the server's connection-accept loop and passed to every handler,
/// rather than referenced through a static.
pub struct ServerState<B: Backend> {
    pub backend: B,
    pub identity: IdentityTable<B>,
    initialized: bool,
}

impl<B: Backend> ServerState<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            identity: IdentityTable::new(),
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn set_initialized(&mut self, value: bool) {
        self.initialized = value;
    }
}

/// Serves one connection until the client closes the socket (clean EOF at
/// an opcode boundary) or a transport failure occurs mid-record.
///
/// A server may run this concurrently for multiple accepted connections,
/// each with its own `ConnectionInfo`; the shared `ServerState` (backend +
/// identity table) must then be serialized by the caller (§5 "Shared
/// resources") — e.g. behind a `Mutex`, or by handling one connection per
/// process.
pub fn run<S: Read + Write, B: Backend>(
    ci: &mut ConnectionInfo<S>,
    state: &mut ServerState<B>,
) -> Result<(), RpcError> {
    loop {
        match dispatch::serve_one(ci, state) {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(e) => {
                log::error!("server connection terminated: {e}");
                ci.mark_terminal();
                return Err(e);
            }
        }
    }
}
