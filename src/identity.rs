//! Identity table (§4.2): server-side bookkeeping mapping wire-stable
//! session ids to live backend device/handle objects for one connection's
//! session.
use std::collections::HashMap;

use crate::backend::Backend;
use crate::error::RpcError;
use crate::record::{DeviceRef, HandleRef};

/// Maps session-local ids to backend objects. Ids are never reused within a
/// session; `release_all` drops the whole table (called on `USB_EXIT`).
///
/// Generic over `Backend` so the table (and everything built on it) can run
/// against a real `rusb` context in production and a canned `StubBackend` in
/// tests without real hardware.
pub struct IdentityTable<B: Backend> {
    devices: HashMap<u32, B::Device>,
    next_device_id: u32,
    handles: HashMap<u32, B::Handle>,
    next_handle_id: u32,
}

impl<B: Backend> Default for IdentityTable<B> {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
            next_device_id: 0,
            handles: HashMap::new(),
            next_handle_id: 0,
        }
    }
}

impl<B: Backend> IdentityTable<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the device namespace to empty before a fresh `GET_DEVICE_LIST`
    /// (§4.2: ids "reset on each GET_DEVICE_LIST").
    pub fn clear_devices(&mut self) {
        self.devices.clear();
        self.next_device_id = 0;
    }

    pub fn register_device(&mut self, device: B::Device) -> DeviceRef {
        let id = self.next_device_id;
        self.next_device_id += 1;
        self.devices.insert(id, device);
        DeviceRef(id)
    }

    pub fn resolve_device(&self, r: DeviceRef) -> Result<&B::Device, RpcError> {
        self.devices.get(&r.0).ok_or(RpcError::NotFound)
    }

    pub fn register_handle(&mut self, handle: B::Handle) -> HandleRef {
        let id = self.next_handle_id;
        self.next_handle_id += 1;
        self.handles.insert(id, handle);
        HandleRef(id)
    }

    pub fn resolve_handle(&self, r: HandleRef) -> Result<&B::Handle, RpcError> {
        self.handles.get(&r.0).ok_or(RpcError::NotFound)
    }

    pub fn resolve_handle_mut(&mut self, r: HandleRef) -> Result<&mut B::Handle, RpcError> {
        self.handles.get_mut(&r.0).ok_or(RpcError::NotFound)
    }

    pub fn take_handle(&mut self, r: HandleRef) -> Result<B::Handle, RpcError> {
        self.handles.remove(&r.0).ok_or(RpcError::NotFound)
    }

    /// Closes any outstanding handles and drops the device table. Called on
    /// `USB_EXIT` / connection teardown.
    pub fn release_all(&mut self, backend: &mut B) {
        for (_, handle) in self.handles.drain() {
            backend.close(handle);
        }
        self.devices.clear();
        self.next_device_id = 0;
        self.next_handle_id = 0;
    }
}
