//! The native USB backend capability interface (§6) consumed by the
//! server path. Out of scope per spec.md §1 ("enumeration, descriptor
//! parsing, transfer submission" belong to the backend, not this crate's
//! core) — this module only adapts that external capability to the shape
//! the dispatcher needs.
//!
//! Grounded on the teacher's `usbip::Driver`: a small struct wrapping a
//! context handle, methods returning `Result<_, RpcError>`, `log::debug!`
//! at each step. The concrete implementation is backed by `rusb` (seen used
//! for exactly this purpose — real libusb bindings behind a small surface —
//! in the `cyme` example crate's dependency table).

use packed_struct::prelude::Integer;

use crate::error::RpcError;
use crate::usb::DeviceDescriptor;

/// Capability interface a server path needs from the local USB stack.
/// Associated types let tests swap in a `StubBackend` with no real
/// hardware, while `RusbBackend` talks to `rusb` in production.
pub trait Backend {
    type Device: Clone;
    type Handle;

    fn list_devices(&mut self) -> Result<Vec<Self::Device>, RpcError>;
    fn device_descriptor(&self, device: &Self::Device) -> Result<DeviceDescriptor, RpcError>;
    fn open(&mut self, device: &Self::Device) -> Result<Self::Handle, RpcError>;
    fn open_with_vid_pid(
        &mut self,
        vid: u16,
        pid: u16,
    ) -> Result<Option<Self::Handle>, RpcError>;
    fn close(&mut self, handle: Self::Handle);
    fn claim_interface(&mut self, handle: &mut Self::Handle, intf: i32) -> Result<(), RpcError>;
    fn release_interface(&mut self, handle: &mut Self::Handle, intf: i32)
        -> Result<(), RpcError>;
    fn get_configuration(&self, handle: &Self::Handle) -> Result<i32, RpcError>;
    fn set_configuration(&mut self, handle: &mut Self::Handle, conf: i32)
        -> Result<(), RpcError>;
    fn set_interface_alt_setting(
        &mut self,
        handle: &mut Self::Handle,
        intf: i32,
        alt: i32,
    ) -> Result<(), RpcError>;
    fn reset_device(&mut self, handle: &mut Self::Handle) -> Result<(), RpcError>;
    fn clear_halt(&mut self, handle: &mut Self::Handle, endpoint: u16) -> Result<(), RpcError>;
    fn read_string_descriptor_ascii(
        &self,
        handle: &Self::Handle,
        idx: u16,
        buf: &mut [u8],
    ) -> Result<usize, RpcError>;
    fn control_transfer(
        &self,
        handle: &Self::Handle,
        req_type: u16,
        req: u16,
        val: u16,
        idx: u16,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, RpcError>;
    fn bulk_transfer(
        &self,
        handle: &mut Self::Handle,
        endpoint: u16,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, RpcError>;
}

fn version_to_bcd(v: rusb::Version) -> u16 {
    ((v.major() as u16) << 8) | ((v.minor() as u16) << 4) | (v.sub_minor() as u16)
}

/// Production backend: a thin adapter over `rusb`'s global libusb context.
pub struct RusbBackend {
    ctx: rusb::Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self, RpcError> {
        log::debug!("opening rusb context");
        let ctx = rusb::Context::new()
            .map_err(|e| RpcError::Backend(format!("failed to init libusb context: {e}")))?;
        Ok(Self { ctx })
    }
}

impl Backend for RusbBackend {
    type Device = rusb::Device<rusb::Context>;
    type Handle = rusb::DeviceHandle<rusb::Context>;

    fn list_devices(&mut self) -> Result<Vec<Self::Device>, RpcError> {
        let list = self
            .ctx
            .devices()
            .map_err(|e| RpcError::Backend(format!("failed to list devices: {e}")))?;
        Ok(list.iter().collect())
    }

    fn device_descriptor(&self, device: &Self::Device) -> Result<DeviceDescriptor, RpcError> {
        let d = device
            .device_descriptor()
            .map_err(|e| RpcError::Backend(format!("failed to read device descriptor: {e}")))?;
        Ok(DeviceDescriptor {
            b_length: d.length(),
            b_descriptor_type: d.descriptor_type(),
            bcd_usb: Integer::from_primitive(version_to_bcd(d.usb_version())),
            b_device_class: d.class_code(),
            b_device_sub_class: d.sub_class_code(),
            b_device_protocol: d.protocol_code(),
            b_max_packet_size_0: d.max_packet_size(),
            id_vendor: Integer::from_primitive(d.vendor_id()),
            id_product: Integer::from_primitive(d.product_id()),
            bcd_device: Integer::from_primitive(version_to_bcd(d.device_version())),
            i_manufacturer: d.manufacturer_string_index().unwrap_or(0),
            i_product: d.product_string_index().unwrap_or(0),
            i_serial_number: d.serial_number_string_index().unwrap_or(0),
            b_num_configurations: d.num_configurations(),
        })
    }

    fn open(&mut self, device: &Self::Device) -> Result<Self::Handle, RpcError> {
        device
            .open()
            .map_err(|e| RpcError::Backend(format!("failed to open device: {e}")))
    }

    fn open_with_vid_pid(
        &mut self,
        vid: u16,
        pid: u16,
    ) -> Result<Option<Self::Handle>, RpcError> {
        Ok(self.ctx.open_device_with_vid_pid(vid, pid))
    }

    fn close(&mut self, handle: Self::Handle) {
        drop(handle);
    }

    fn claim_interface(&mut self, handle: &mut Self::Handle, intf: i32) -> Result<(), RpcError> {
        handle
            .claim_interface(intf as u8)
            .map_err(|e| RpcError::Backend(format!("failed to claim interface {intf}: {e}")))
    }

    fn release_interface(
        &mut self,
        handle: &mut Self::Handle,
        intf: i32,
    ) -> Result<(), RpcError> {
        handle
            .release_interface(intf as u8)
            .map_err(|e| RpcError::Backend(format!("failed to release interface {intf}: {e}")))
    }

    fn get_configuration(&self, handle: &Self::Handle) -> Result<i32, RpcError> {
        handle
            .active_configuration()
            .map(|c| c as i32)
            .map_err(|e| RpcError::Backend(format!("failed to read configuration: {e}")))
    }

    fn set_configuration(
        &mut self,
        handle: &mut Self::Handle,
        conf: i32,
    ) -> Result<(), RpcError> {
        handle
            .set_active_configuration(conf as u8)
            .map_err(|e| RpcError::Backend(format!("failed to set configuration {conf}: {e}")))
    }

    fn set_interface_alt_setting(
        &mut self,
        handle: &mut Self::Handle,
        intf: i32,
        alt: i32,
    ) -> Result<(), RpcError> {
        handle
            .set_alternate_setting(intf as u8, alt as u8)
            .map_err(|e| RpcError::Backend(format!("failed to set alt setting: {e}")))
    }

    fn reset_device(&mut self, handle: &mut Self::Handle) -> Result<(), RpcError> {
        handle
            .reset()
            .map_err(|e| RpcError::Backend(format!("failed to reset device: {e}")))
    }

    fn clear_halt(&mut self, handle: &mut Self::Handle, endpoint: u16) -> Result<(), RpcError> {
        handle
            .clear_halt(endpoint as u8)
            .map_err(|e| RpcError::Backend(format!("failed to clear halt on ep {endpoint}: {e}")))
    }

    fn read_string_descriptor_ascii(
        &self,
        handle: &Self::Handle,
        idx: u16,
        buf: &mut [u8],
    ) -> Result<usize, RpcError> {
        let s = handle
            .read_string_descriptor_ascii(idx as u8)
            .map_err(|e| RpcError::Backend(format!("failed to read string descriptor: {e}")))?;
        let bytes = s.as_bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn control_transfer(
        &self,
        handle: &Self::Handle,
        req_type: u16,
        req: u16,
        val: u16,
        idx: u16,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, RpcError> {
        use std::time::Duration;
        let timeout = Duration::from_millis(timeout_ms as u64);
        let request_type = req_type as u8;
        let direction_in = request_type & 0x80 != 0;
        if direction_in {
            handle
                .read_control(request_type, req as u8, val, idx, buf, timeout)
                .map_err(|e| RpcError::Backend(format!("control transfer (in) failed: {e}")))
        } else {
            handle
                .write_control(request_type, req as u8, val, idx, buf, timeout)
                .map_err(|e| RpcError::Backend(format!("control transfer (out) failed: {e}")))
        }
    }

    fn bulk_transfer(
        &self,
        handle: &mut Self::Handle,
        endpoint: u16,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, RpcError> {
        use std::time::Duration;
        let timeout = Duration::from_millis(timeout_ms as u64);
        let ep = endpoint as u8;
        if ep & 0x80 != 0 {
            handle
                .read_bulk(ep, buf, timeout)
                .map_err(|e| RpcError::Backend(format!("bulk transfer (in) failed: {e}")))
        } else {
            handle
                .write_bulk(ep, buf, timeout)
                .map_err(|e| RpcError::Backend(format!("bulk transfer (out) failed: {e}")))
        }
    }
}

/// Canned backend used by unit and integration tests (no real hardware
/// involved): a plain state-based fake, configured through its public
/// fields rather than call expectations.
#[cfg(any(test, feature = "test-util"))]
pub struct StubBackend {
    pub devices: Vec<(u32, DeviceDescriptor)>,
    pub next_handle: u32,
    pub string_responses: std::collections::HashMap<u16, Vec<u8>>,
    pub control_response: Vec<u8>,
    pub bulk_response: Vec<u8>,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for StubBackend {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            next_handle: 0,
            string_responses: std::collections::HashMap::new(),
            control_response: Vec::new(),
            bulk_response: Vec::new(),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Backend for StubBackend {
    type Device = u32;
    type Handle = u32;

    fn list_devices(&mut self) -> Result<Vec<Self::Device>, RpcError> {
        Ok(self.devices.iter().map(|(id, _)| *id).collect())
    }

    fn device_descriptor(&self, device: &Self::Device) -> Result<DeviceDescriptor, RpcError> {
        self.devices
            .iter()
            .find(|(id, _)| id == device)
            .map(|(_, d)| *d)
            .ok_or(RpcError::NotFound)
    }

    fn open(&mut self, _device: &Self::Device) -> Result<Self::Handle, RpcError> {
        let h = self.next_handle;
        self.next_handle += 1;
        Ok(h)
    }

    fn open_with_vid_pid(
        &mut self,
        vid: u16,
        pid: u16,
    ) -> Result<Option<Self::Handle>, RpcError> {
        let found = self.devices.iter().any(|(_, d)| {
            d.id_vendor.to_primitive() == vid && d.id_product.to_primitive() == pid
        });
        if !found {
            return Ok(None);
        }
        let h = self.next_handle;
        self.next_handle += 1;
        Ok(Some(h))
    }

    fn close(&mut self, _handle: Self::Handle) {}

    fn claim_interface(&mut self, _handle: &mut Self::Handle, _intf: i32) -> Result<(), RpcError> {
        Ok(())
    }

    fn release_interface(
        &mut self,
        _handle: &mut Self::Handle,
        _intf: i32,
    ) -> Result<(), RpcError> {
        Ok(())
    }

    fn get_configuration(&self, _handle: &Self::Handle) -> Result<i32, RpcError> {
        Ok(1)
    }

    fn set_configuration(
        &mut self,
        _handle: &mut Self::Handle,
        _conf: i32,
    ) -> Result<(), RpcError> {
        Ok(())
    }

    fn set_interface_alt_setting(
        &mut self,
        _handle: &mut Self::Handle,
        _intf: i32,
        _alt: i32,
    ) -> Result<(), RpcError> {
        Ok(())
    }

    fn reset_device(&mut self, _handle: &mut Self::Handle) -> Result<(), RpcError> {
        Ok(())
    }

    fn clear_halt(&mut self, _handle: &mut Self::Handle, _endpoint: u16) -> Result<(), RpcError> {
        Ok(())
    }

    fn read_string_descriptor_ascii(
        &self,
        _handle: &Self::Handle,
        idx: u16,
        buf: &mut [u8],
    ) -> Result<usize, RpcError> {
        let resp = self
            .string_responses
            .get(&idx)
            .ok_or_else(|| RpcError::Backend(format!("no canned string for index {idx}")))?;
        let n = resp.len().min(buf.len());
        buf[..n].copy_from_slice(&resp[..n]);
        Ok(n)
    }

    fn control_transfer(
        &self,
        _handle: &Self::Handle,
        _req_type: u16,
        _req: u16,
        _val: u16,
        _idx: u16,
        buf: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<usize, RpcError> {
        let n = self.control_response.len().min(buf.len());
        buf[..n].copy_from_slice(&self.control_response[..n]);
        Ok(n)
    }

    fn bulk_transfer(
        &self,
        _handle: &mut Self::Handle,
        _endpoint: u16,
        buf: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<usize, RpcError> {
        let n = self.bulk_response.len().min(buf.len());
        buf[..n].copy_from_slice(&self.bulk_response[..n]);
        Ok(n)
    }
}
