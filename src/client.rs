//! Typed client-side API (Design Note 1: the `client_path_*` half of each
//! operation, wrapped behind ergonomic Rust method names).
use std::io::{Read, Write};

use packed_struct::prelude::*;

use crate::connection::{ConnState, ConnectionInfo, Role};
use crate::dispatch::{client_roundtrip, validate_len, validate_length};
use crate::error::{RpcError, WIRE_SUCCESS};
use crate::record::{decode_opcode, DeviceRef, HandleRef, OpCode, RpcRecord};
use crate::usb::DeviceDescriptor;

fn check_status(record: &RpcRecord) -> Result<(), RpcError> {
    if record.server_error.to_primitive() == WIRE_SUCCESS {
        Ok(())
    } else {
        Err(RpcError::Backend("server reported failure".into()))
    }
}

/// Client-side handle to one session. Each method performs exactly one
/// opcode's worth of wire round-trip and unpacks the result into plain
/// Rust types.
pub struct UsbRpcClient<S> {
    ci: ConnectionInfo<S>,
}

impl<S: Read + Write> UsbRpcClient<S> {
    pub fn new(socket: S) -> Self {
        Self {
            ci: ConnectionInfo::new(Role::Client, socket),
        }
    }

    pub fn state(&self) -> ConnState {
        self.ci.state()
    }

    fn blank_record(&self) -> RpcRecord {
        RpcRecord::new(self.ci.role().to_wire())
    }

    /// Generic entry point alongside the typed methods above (§4.4): takes
    /// a raw wire opcode tag rather than a checked `OpCode`, so a caller
    /// driving the protocol dynamically (or a test exercising the illegal
    /// range) can still go through one call. An opcode outside the catalog
    /// is rejected locally — `FAILURE` with no wire I/O — exactly like any
    /// other local validation failure (§8 scenario 6).
    pub fn rpc_call(&mut self, opcode: u32, record: &RpcRecord) -> Result<RpcRecord, RpcError> {
        let op = decode_opcode(opcode.to_le_bytes())?;
        client_roundtrip(&mut self.ci, op, record)
    }

    /// Idempotent on the server; calling it twice from one client is also
    /// harmless (§4.4).
    pub fn usb_init(&mut self) -> Result<(), RpcError> {
        let record = self.blank_record();
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbInit, &record)?;
        self.ci.mark_initialized();
        check_status(&reply)
    }

    pub fn usb_exit(&mut self) -> Result<(), RpcError> {
        let record = self.blank_record();
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbExit, &record)?;
        self.ci.mark_terminal();
        check_status(&reply)
    }

    pub fn get_device_list(&mut self) -> Result<Vec<DeviceRef>, RpcError> {
        let record = self.blank_record();
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbGetDeviceList, &record)?;
        Ok(reply.device_list())
    }

    pub fn get_device_descriptor(&mut self, dev: DeviceRef) -> Result<DeviceDescriptor, RpcError> {
        let mut record = self.blank_record();
        record.dev = Integer::from_primitive(dev.0);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbGetDeviceDescriptor, &record)?;
        check_status(&reply)?;
        Ok(reply.dd)
    }

    pub fn open(&mut self, dev: DeviceRef) -> Result<HandleRef, RpcError> {
        let mut record = self.blank_record();
        record.dev = Integer::from_primitive(dev.0);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbOpen, &record)?;
        check_status(&reply)?;
        Ok(HandleRef(reply.dh.to_primitive()))
    }

    /// Returns `Ok(None)` rather than an error when no matching device is
    /// attached — a miss here is a normal outcome, not a failure (§4.3).
    pub fn open_device_with_vid_pid(
        &mut self,
        vid: u16,
        pid: u16,
    ) -> Result<Option<HandleRef>, RpcError> {
        let mut record = self.blank_record();
        record.vid = Integer::from_primitive(vid);
        record.pid = Integer::from_primitive(pid);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbOpenDeviceWithVidPid, &record)?;
        if reply.server_error.to_primitive() == WIRE_SUCCESS {
            Ok(Some(HandleRef(reply.dh.to_primitive())))
        } else {
            Ok(None)
        }
    }

    pub fn close(&mut self, dh: HandleRef) -> Result<(), RpcError> {
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbClose, &record)?;
        check_status(&reply)
    }

    pub fn claim_interface(&mut self, dh: HandleRef, intf: i32) -> Result<(), RpcError> {
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        record.intf = Integer::from_primitive(intf);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbClaimInterface, &record)?;
        check_status(&reply)
    }

    pub fn release_interface(&mut self, dh: HandleRef, intf: i32) -> Result<(), RpcError> {
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        record.intf = Integer::from_primitive(intf);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbReleaseInterface, &record)?;
        check_status(&reply)
    }

    pub fn get_configuration(&mut self, dh: HandleRef) -> Result<i32, RpcError> {
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbGetConfiguration, &record)?;
        check_status(&reply)?;
        Ok(reply.conf.to_primitive())
    }

    pub fn set_configuration(&mut self, dh: HandleRef, conf: i32) -> Result<(), RpcError> {
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        record.conf = Integer::from_primitive(conf);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbSetConfiguration, &record)?;
        check_status(&reply)
    }

    pub fn set_interface_alt_setting(
        &mut self,
        dh: HandleRef,
        intf: i32,
        alt: i32,
    ) -> Result<(), RpcError> {
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        record.intf = Integer::from_primitive(intf);
        record.alt_setting = Integer::from_primitive(alt);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbSetInterfaceAltSetting, &record)?;
        check_status(&reply)
    }

    pub fn reset_device(&mut self, dh: HandleRef) -> Result<(), RpcError> {
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbResetDevice, &record)?;
        check_status(&reply)
    }

    pub fn clear_halt(&mut self, dh: HandleRef, endpoint: u16) -> Result<(), RpcError> {
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        record.endpoint = Integer::from_primitive(endpoint);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbClearHalt, &record)?;
        check_status(&reply)
    }

    pub fn get_string_descriptor_ascii(
        &mut self,
        dh: HandleRef,
        idx: u16,
        len: u16,
    ) -> Result<Vec<u8>, RpcError> {
        validate_len(len)?;
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        record.idx = Integer::from_primitive(idx);
        record.len = Integer::from_primitive(len);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbGetStringDescriptorAscii, &record)?;
        check_status(&reply)?;
        let n = reply.transferred.to_primitive().max(0) as usize;
        Ok(reply.data[..n.min(len as usize)].to_vec())
    }

    /// `req_type` bit 7 selects direction, per the USB control request
    /// convention: set, `buf` is filled by the device on return; clear,
    /// `buf`'s contents are sent to the device.
    pub fn control_transfer(
        &mut self,
        dh: HandleRef,
        req_type: u16,
        req: u16,
        val: u16,
        idx: u16,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, RpcError> {
        let len = validate_len(u16::try_from(buf.len()).map_err(|_| {
            RpcError::InvalidArg(format!("buffer length {} exceeds MAX_DATA", buf.len()))
        })?)?;
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        record.req_type = Integer::from_primitive(req_type);
        record.req = Integer::from_primitive(req);
        record.val = Integer::from_primitive(val);
        record.idx = Integer::from_primitive(idx);
        record.len = Integer::from_primitive(len as u16);
        record.timeout = Integer::from_primitive(timeout_ms);
        record.data[..len].copy_from_slice(&buf[..len]);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbControlTransfer, &record)?;
        let n = reply.transferred.to_primitive();
        if n < 0 {
            return Err(RpcError::Backend("control transfer failed".into()));
        }
        let n = n as usize;
        buf[..n].copy_from_slice(&reply.data[..n]);
        Ok(n)
    }

    pub fn bulk_transfer(
        &mut self,
        dh: HandleRef,
        endpoint: u16,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, RpcError> {
        let len = validate_length(i32::try_from(buf.len()).map_err(|_| {
            RpcError::InvalidArg(format!("buffer length {} exceeds MAX_DATA", buf.len()))
        })?)?;
        let mut record = self.blank_record();
        record.dh = Integer::from_primitive(dh.0);
        record.endpoint = Integer::from_primitive(endpoint);
        record.length = Integer::from_primitive(len as i32);
        record.timeout = Integer::from_primitive(timeout_ms);
        record.data[..len].copy_from_slice(&buf[..len]);
        let reply = client_roundtrip(&mut self.ci, OpCode::UsbBulkTransfer, &record)?;
        let n = reply.transferred.to_primitive();
        if n < 0 {
            return Err(RpcError::Backend("bulk transfer failed".into()));
        }
        let n = n as usize;
        buf[..n].copy_from_slice(&reply.data[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use crate::server::ServerState;
    use std::io::Cursor;

    /// A tiny in-memory duplex: everything written by one side is read by
    /// the other. Enough to drive `client_roundtrip` against `serve_one`
    /// without a real socket.
    struct Loopback {
        inbound: Cursor<Vec<u8>>,
        outbound: Vec<u8>,
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn client_rejects_oversized_string_length_before_any_io() {
        let socket = Loopback {
            inbound: Cursor::new(Vec::new()),
            outbound: Vec::new(),
        };
        let mut client = UsbRpcClient::new(socket);
        let err = client
            .get_string_descriptor_ascii(HandleRef(0), 0, 9000)
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidArg(_)));
    }

    #[test]
    fn rpc_call_rejects_unknown_opcode_before_any_io() {
        struct NeverTouched;
        impl Read for NeverTouched {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                panic!("an illegal opcode must not reach the wire");
            }
        }
        impl Write for NeverTouched {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                panic!("an illegal opcode must not reach the wire");
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut client = UsbRpcClient::new(NeverTouched);
        let record = client.blank_record();
        let err = client.rpc_call(0xFFFF_FFFF, &record).unwrap_err();
        assert!(matches!(err, RpcError::InvalidArg(_)));
    }

    #[test]
    fn full_handshake_against_in_process_server() {
        // Drives one request through the real wire codec: encode on the
        // client side, decode + dispatch on the server side, encode the
        // reply, decode it back on the client side.
        let mut state = ServerState::new(StubBackend::default());
        let mut server_ci = ConnectionInfo::new(Role::Server, Cursor::new(Vec::<u8>::new()));

        let mut client = UsbRpcClient::new(Loopback {
            inbound: Cursor::new(Vec::new()),
            outbound: Vec::new(),
        });

        // usb_init() writes its request into client.ci's outbound buffer;
        // feed that straight to serve_one, then feed the server's reply
        // back as the client's next inbound bytes.
        let request_bytes = {
            let record = client.blank_record();
            let mut buf = crate::record::encode_opcode(OpCode::UsbInit).to_vec();
            buf.extend_from_slice(&record.encode().unwrap());
            buf
        };
        let request_len = request_bytes.len();
        *server_ci.socket_mut() = Cursor::new(request_bytes);
        assert!(crate::dispatch::serve_one(&mut server_ci, &mut state).unwrap());
        let reply_bytes = server_ci.socket_mut().get_ref()[request_len..].to_vec();

        client.ci.socket_mut().inbound = Cursor::new(reply_bytes);
        client.usb_init().expect("usb_init should succeed");
        assert_eq!(client.state(), ConnState::Initialized);
    }
}
