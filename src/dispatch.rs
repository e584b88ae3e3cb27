//! Per-opcode request handling (§4.3 catalog, §4.4 dispatch).
//!
//! Design Note 1: rather than one context-polymorphic entry per operation,
//! each op gets two explicit, non-polymorphic functions — `client_path_*`
//! (build a request, round-trip it, unpack the reply) and `server_path_*`
//! (resolve session ids, call the backend, fill in the reply) — selected by
//! the connection's role rather than branched on inside a shared body.
use std::io::{Read, Write};

use packed_struct::prelude::*;

use crate::backend::Backend;
use crate::connection::ConnectionInfo;
use crate::error::{RpcError, TRANSFER_FAILURE, WIRE_FAILURE, WIRE_SUCCESS};
use crate::record::{decode_opcode, encode_opcode, DeviceRef, HandleRef, OpCode, RpcRecord, MAX_DATA};
use crate::server::ServerState;

pub(crate) fn write_opcode<S: Write>(socket: &mut S, op: OpCode) -> Result<(), RpcError> {
    socket.write_all(&encode_opcode(op))?;
    Ok(())
}

pub(crate) fn write_record<S: Write>(socket: &mut S, record: &RpcRecord) -> Result<(), RpcError> {
    socket.write_all(&record.encode()?)?;
    Ok(())
}

pub(crate) fn read_record<S: Read>(socket: &mut S) -> Result<RpcRecord, RpcError> {
    let mut buf = [0u8; crate::record::RECORD_SIZE];
    socket.read_exact(&mut buf)?;
    RpcRecord::decode(&buf)
}

/// Validates a caller-supplied buffer length before it ever touches the
/// wire (§4.4 validate step: "if role==CLIENT and the op takes a
/// caller-sized buffer, validate 0 <= length < MAX_DATA").
pub(crate) fn validate_len(len: u16) -> Result<usize, RpcError> {
    let len = len as usize;
    if len >= MAX_DATA {
        return Err(RpcError::InvalidArg(format!(
            "requested length {len} exceeds MAX_DATA"
        )));
    }
    Ok(len)
}

/// Same bound as `validate_len`, for the `length` field (§4.3/§6 pairs this
/// `i32` field with `transferred` specifically for `USB_BULK_TRANSFER`,
/// distinct from the `len` field `USB_CONTROL_TRANSFER` shares with the
/// other fixed-argument ops).
pub(crate) fn validate_length(len: i32) -> Result<usize, RpcError> {
    if len < 0 {
        return Err(RpcError::InvalidArg(format!("negative length {len}")));
    }
    let len = len as usize;
    if len >= MAX_DATA {
        return Err(RpcError::InvalidArg(format!(
            "requested length {len} exceeds MAX_DATA"
        )));
    }
    Ok(len)
}

/// Writes the opcode tag and request record, then reads and returns the
/// reply. A transport error here always marks the connection `Terminal`
/// (§4.4 "Wire I/O failure").
pub(crate) fn client_roundtrip<S: Read + Write>(
    ci: &mut ConnectionInfo<S>,
    op: OpCode,
    record: &RpcRecord,
) -> Result<RpcRecord, RpcError> {
    ci.require_usable()?;
    let result = (|| {
        write_opcode(ci.socket_mut(), op)?;
        write_record(ci.socket_mut(), record)?;
        read_record(ci.socket_mut())
    })();
    if result.is_err() {
        ci.mark_terminal();
    }
    result
}

// ---- server paths -------------------------------------------------------
//
// Each function receives the already-decoded request record and fills in
// its reply fields in place. None of them perform their own wire I/O; that
// happens once in `serve_one`.

fn server_path_usb_init<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    // Idempotent: a second USB_INIT on an already-initialized server is a
    // no-op that still reports success.
    state.set_initialized(true);
    record.server_error = Integer::from_primitive(WIRE_SUCCESS);
}

fn server_path_usb_exit<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    state.identity.release_all(&mut state.backend);
    state.set_initialized(false);
    record.server_error = Integer::from_primitive(WIRE_SUCCESS);
}

fn server_path_get_device_list<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    state.identity.clear_devices();
    match state.backend.list_devices() {
        Ok(devices) => {
            let refs: Vec<DeviceRef> = devices
                .into_iter()
                .take(crate::record::MAX_DEVICES)
                .map(|d| state.identity.register_device(d))
                .collect();
            record.set_device_list(&refs);
        }
        Err(e) => {
            log::error!("failed to list devices: {e}");
            record.set_device_list(&[]);
        }
    }
}

fn server_path_get_device_descriptor<B: Backend>(
    state: &mut ServerState<B>,
    record: &mut RpcRecord,
) {
    let dev = DeviceRef(record.dev.to_primitive());
    let device = match state.identity.resolve_device(dev) {
        Ok(d) => d.clone(),
        Err(_) => {
            record.server_error = Integer::from_primitive(WIRE_FAILURE);
            return;
        }
    };
    match state.backend.device_descriptor(&device) {
        Ok(dd) => {
            record.dd = dd;
            record.server_error = Integer::from_primitive(WIRE_SUCCESS);
        }
        Err(e) => {
            log::error!("failed to read device descriptor: {e}");
            record.server_error = Integer::from_primitive(WIRE_FAILURE);
        }
    }
}

fn server_path_open<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    let dev = DeviceRef(record.dev.to_primitive());
    let device = match state.identity.resolve_device(dev) {
        Ok(d) => d.clone(),
        Err(_) => {
            record.server_error = Integer::from_primitive(WIRE_FAILURE);
            return;
        }
    };
    match state.backend.open(&device) {
        Ok(handle) => {
            let h = state.identity.register_handle(handle);
            record.dh = Integer::from_primitive(h.0);
            record.server_error = Integer::from_primitive(WIRE_SUCCESS);
        }
        Err(e) => {
            log::error!("failed to open device: {e}");
            record.server_error = Integer::from_primitive(WIRE_FAILURE);
        }
    }
}

fn server_path_open_device_with_vid_pid<B: Backend>(
    state: &mut ServerState<B>,
    record: &mut RpcRecord,
) {
    let vid = record.vid.to_primitive();
    let pid = record.pid.to_primitive();
    match state.backend.open_with_vid_pid(vid, pid) {
        Ok(Some(handle)) => {
            let h = state.identity.register_handle(handle);
            record.dh = Integer::from_primitive(h.0);
            record.server_error = Integer::from_primitive(WIRE_SUCCESS);
        }
        Ok(None) => {
            record.server_error = Integer::from_primitive(WIRE_FAILURE);
        }
        Err(e) => {
            log::error!("failed to open device {vid:04x}:{pid:04x}: {e}");
            record.server_error = Integer::from_primitive(WIRE_FAILURE);
        }
    }
}

fn server_path_close<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    let dh = HandleRef(record.dh.to_primitive());
    match state.identity.take_handle(dh) {
        Ok(handle) => {
            state.backend.close(handle);
            record.server_error = Integer::from_primitive(WIRE_SUCCESS);
        }
        Err(_) => record.server_error = Integer::from_primitive(WIRE_FAILURE),
    }
}

fn server_path_claim_interface<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    let dh = HandleRef(record.dh.to_primitive());
    let intf = record.intf.to_primitive();
    let status = match state.identity.resolve_handle_mut(dh) {
        Ok(handle) => state.backend.claim_interface(handle, intf),
        Err(e) => Err(e),
    };
    record.server_error = Integer::from_primitive(status.map_or(WIRE_FAILURE, |_| WIRE_SUCCESS));
}

fn server_path_release_interface<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    let dh = HandleRef(record.dh.to_primitive());
    let intf = record.intf.to_primitive();
    let status = match state.identity.resolve_handle_mut(dh) {
        Ok(handle) => state.backend.release_interface(handle, intf),
        Err(e) => Err(e),
    };
    record.server_error = Integer::from_primitive(status.map_or(WIRE_FAILURE, |_| WIRE_SUCCESS));
}

fn server_path_get_configuration<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    let dh = HandleRef(record.dh.to_primitive());
    match state
        .identity
        .resolve_handle(dh)
        .and_then(|h| state.backend.get_configuration(h))
    {
        Ok(conf) => {
            record.conf = Integer::from_primitive(conf);
            record.server_error = Integer::from_primitive(WIRE_SUCCESS);
        }
        Err(_) => record.server_error = Integer::from_primitive(WIRE_FAILURE),
    }
}

fn server_path_set_configuration<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    let dh = HandleRef(record.dh.to_primitive());
    let conf = record.conf.to_primitive();
    let status = match state.identity.resolve_handle_mut(dh) {
        Ok(handle) => state.backend.set_configuration(handle, conf),
        Err(e) => Err(e),
    };
    record.server_error = Integer::from_primitive(status.map_or(WIRE_FAILURE, |_| WIRE_SUCCESS));
}

fn server_path_set_interface_alt_setting<B: Backend>(
    state: &mut ServerState<B>,
    record: &mut RpcRecord,
) {
    let dh = HandleRef(record.dh.to_primitive());
    let intf = record.intf.to_primitive();
    let alt = record.alt_setting.to_primitive();
    let status = match state.identity.resolve_handle_mut(dh) {
        Ok(handle) => state.backend.set_interface_alt_setting(handle, intf, alt),
        Err(e) => Err(e),
    };
    record.server_error = Integer::from_primitive(status.map_or(WIRE_FAILURE, |_| WIRE_SUCCESS));
}

fn server_path_reset_device<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    let dh = HandleRef(record.dh.to_primitive());
    let status = match state.identity.resolve_handle_mut(dh) {
        Ok(handle) => state.backend.reset_device(handle),
        Err(e) => Err(e),
    };
    record.server_error = Integer::from_primitive(status.map_or(WIRE_FAILURE, |_| WIRE_SUCCESS));
}

fn server_path_clear_halt<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    let dh = HandleRef(record.dh.to_primitive());
    let endpoint = record.endpoint.to_primitive();
    let status = match state.identity.resolve_handle_mut(dh) {
        Ok(handle) => state.backend.clear_halt(handle, endpoint),
        Err(e) => Err(e),
    };
    record.server_error = Integer::from_primitive(status.map_or(WIRE_FAILURE, |_| WIRE_SUCCESS));
}

fn server_path_get_string_descriptor_ascii<B: Backend>(
    state: &mut ServerState<B>,
    record: &mut RpcRecord,
) {
    let dh = HandleRef(record.dh.to_primitive());
    let idx = record.idx.to_primitive();
    let len = match validate_len(record.len.to_primitive()) {
        Ok(len) => len,
        Err(_) => {
            record.server_error = Integer::from_primitive(WIRE_FAILURE);
            return;
        }
    };
    let mut buf = vec![0u8; len];
    let result = state
        .identity
        .resolve_handle(dh)
        .and_then(|h| state.backend.read_string_descriptor_ascii(h, idx, &mut buf));
    match result {
        Ok(n) => {
            record.data[..n].copy_from_slice(&buf[..n]);
            record.transferred = Integer::from_primitive(n as i32);
            record.server_error = Integer::from_primitive(WIRE_SUCCESS);
        }
        Err(_) => {
            record.transferred = Integer::from_primitive(TRANSFER_FAILURE);
            record.server_error = Integer::from_primitive(WIRE_FAILURE);
        }
    }
}

/// `USB_CONTROL_TRANSFER` is a B-op (§7): no `server_error`, only a byte
/// count in `transferred` (`TRANSFER_FAILURE` on error).
fn server_path_control_transfer<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    let dh = HandleRef(record.dh.to_primitive());
    let len = match validate_len(record.len.to_primitive()) {
        Ok(len) => len,
        Err(_) => {
            record.transferred = Integer::from_primitive(TRANSFER_FAILURE);
            return;
        }
    };
    let req_type = record.req_type.to_primitive();
    let req = record.req.to_primitive();
    let val = record.val.to_primitive();
    let idx = record.idx.to_primitive();
    let timeout = record.timeout.to_primitive();
    let mut buf = record.data[..len].to_vec();
    let result = state.identity.resolve_handle(dh).and_then(|h| {
        state
            .backend
            .control_transfer(h, req_type, req, val, idx, &mut buf, timeout)
    });
    match result {
        Ok(n) => {
            record.data[..n].copy_from_slice(&buf[..n]);
            record.transferred = Integer::from_primitive(n as i32);
        }
        Err(e) => {
            log::error!("control transfer failed: {e}");
            record.transferred = Integer::from_primitive(TRANSFER_FAILURE);
        }
    }
}

/// `USB_BULK_TRANSFER` is a B-op (§7): same byte-count-or-`-1` convention
/// as `USB_CONTROL_TRANSFER`, but its length travels in the dedicated
/// `length` field rather than the `len` field the other ops share.
fn server_path_bulk_transfer<B: Backend>(state: &mut ServerState<B>, record: &mut RpcRecord) {
    let dh = HandleRef(record.dh.to_primitive());
    let len = match validate_length(record.length.to_primitive()) {
        Ok(len) => len,
        Err(_) => {
            record.transferred = Integer::from_primitive(TRANSFER_FAILURE);
            return;
        }
    };
    let endpoint = record.endpoint.to_primitive();
    let timeout = record.timeout.to_primitive();
    let mut buf = record.data[..len].to_vec();
    let result = state
        .identity
        .resolve_handle_mut(dh)
        .and_then(|h| state.backend.bulk_transfer(h, endpoint, &mut buf, timeout));
    match result {
        Ok(n) => {
            record.data[..n].copy_from_slice(&buf[..n]);
            record.transferred = Integer::from_primitive(n as i32);
        }
        Err(e) => {
            log::error!("bulk transfer failed: {e}");
            record.transferred = Integer::from_primitive(TRANSFER_FAILURE);
        }
    }
}

fn dispatch_server<S: Read + Write, B: Backend>(
    op: OpCode,
    ci: &mut ConnectionInfo<S>,
    state: &mut ServerState<B>,
    record: &mut RpcRecord,
) {
    match op {
        OpCode::UsbInit => {
            server_path_usb_init(state, record);
            ci.mark_initialized();
        }
        OpCode::UsbExit => {
            server_path_usb_exit(state, record);
            ci.mark_terminal();
        }
        OpCode::UsbGetDeviceList => server_path_get_device_list(state, record),
        OpCode::UsbGetDeviceDescriptor => server_path_get_device_descriptor(state, record),
        OpCode::UsbOpen => server_path_open(state, record),
        OpCode::UsbOpenDeviceWithVidPid => server_path_open_device_with_vid_pid(state, record),
        OpCode::UsbClose => server_path_close(state, record),
        OpCode::UsbClaimInterface => server_path_claim_interface(state, record),
        OpCode::UsbReleaseInterface => server_path_release_interface(state, record),
        OpCode::UsbGetConfiguration => server_path_get_configuration(state, record),
        OpCode::UsbSetConfiguration => server_path_set_configuration(state, record),
        OpCode::UsbSetInterfaceAltSetting => {
            server_path_set_interface_alt_setting(state, record)
        }
        OpCode::UsbResetDevice => server_path_reset_device(state, record),
        OpCode::UsbClearHalt => server_path_clear_halt(state, record),
        OpCode::UsbGetStringDescriptorAscii => {
            server_path_get_string_descriptor_ascii(state, record)
        }
        OpCode::UsbControlTransfer => server_path_control_transfer(state, record),
        OpCode::UsbBulkTransfer => server_path_bulk_transfer(state, record),
    }
}

/// Serves a single request. Returns `Ok(true)` to keep reading, `Ok(false)`
/// on a clean EOF at the opcode boundary (§4.4 "top-level server read
/// loop"). A transport failure while reading the record that follows an
/// already-read opcode is fatal and bubbles up as `Err`.
pub fn serve_one<S: Read + Write, B: Backend>(
    ci: &mut ConnectionInfo<S>,
    state: &mut ServerState<B>,
) -> Result<bool, RpcError> {
    let mut opbuf = [0u8; 4];
    match ci.socket_mut().read_exact(&mut opbuf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let mut record = read_record(ci.socket_mut())?;

    match decode_opcode(opbuf) {
        Ok(op) => {
            let allowed = ci.state() != crate::connection::ConnState::Terminal
                || matches!(op, OpCode::UsbInit | OpCode::UsbExit);
            if allowed {
                dispatch_server(op, ci, state, &mut record);
            } else {
                log::warn!("op issued against a terminal connection");
                record.server_error = Integer::from_primitive(WIRE_FAILURE);
                record.transferred = Integer::from_primitive(TRANSFER_FAILURE);
            }
        }
        Err(e) => {
            log::warn!("{e}");
            record.server_error = Integer::from_primitive(WIRE_FAILURE);
            record.transferred = Integer::from_primitive(TRANSFER_FAILURE);
        }
    }

    write_record(ci.socket_mut(), &record)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use crate::usb::DeviceDescriptor;
    use std::io::Cursor;

    fn harness() -> (ConnectionInfo<Cursor<Vec<u8>>>, ServerState<StubBackend>) {
        let ci = ConnectionInfo::new(crate::connection::Role::Server, Cursor::new(Vec::new()));
        let state = ServerState::new(StubBackend::default());
        (ci, state)
    }

    #[test]
    fn init_then_exit_transitions_state() {
        let (mut ci, mut state) = harness();
        let mut record = RpcRecord::new(1);
        dispatch_server(OpCode::UsbInit, &mut ci, &mut state, &mut record);
        assert_eq!(record.server_error.to_primitive(), WIRE_SUCCESS);
        assert!(state.is_initialized());
        assert_eq!(ci.state(), crate::connection::ConnState::Initialized);

        dispatch_server(OpCode::UsbExit, &mut ci, &mut state, &mut record);
        assert!(!state.is_initialized());
        assert_eq!(ci.state(), crate::connection::ConnState::Terminal);
    }

    #[test]
    fn get_device_list_then_descriptor() {
        let (mut ci, mut state) = harness();
        state
            .backend
            .devices
            .push((0, DeviceDescriptor::new(0x1d6b, 0x0002)));

        let mut record = RpcRecord::new(1);
        dispatch_server(OpCode::UsbGetDeviceList, &mut ci, &mut state, &mut record);
        let devices = record.device_list();
        assert_eq!(devices.len(), 1);

        record.dev = Integer::from_primitive(devices[0].0);
        dispatch_server(
            OpCode::UsbGetDeviceDescriptor,
            &mut ci,
            &mut state,
            &mut record,
        );
        assert_eq!(record.server_error.to_primitive(), WIRE_SUCCESS);
        assert_eq!(record.dd.id_vendor.to_primitive(), 0x1d6b);
    }

    #[test]
    fn open_with_unknown_vid_pid_fails() {
        let (mut ci, mut state) = harness();
        let mut record = RpcRecord::new(1);
        record.vid = Integer::from_primitive(0xdead);
        record.pid = Integer::from_primitive(0xbeef);
        dispatch_server(
            OpCode::UsbOpenDeviceWithVidPid,
            &mut ci,
            &mut state,
            &mut record,
        );
        assert_eq!(record.server_error.to_primitive(), WIRE_FAILURE);
    }

    #[test]
    fn oversized_length_is_rejected_before_backend_call() {
        let (mut ci, mut state) = harness();
        let mut record = RpcRecord::new(1);
        record.len = Integer::from_primitive((MAX_DATA + 1) as u16);
        dispatch_server(
            OpCode::UsbControlTransfer,
            &mut ci,
            &mut state,
            &mut record,
        );
        assert_eq!(record.transferred.to_primitive(), TRANSFER_FAILURE);
    }

    #[test]
    fn bulk_transfer_round_trips_canned_response() {
        let (mut ci, mut state) = harness();
        state.backend.bulk_response = vec![1, 2, 3, 4];
        let h = state.identity.register_handle(0);

        let mut record = RpcRecord::new(1);
        record.dh = Integer::from_primitive(h.0);
        record.length = Integer::from_primitive(4);
        record.endpoint = Integer::from_primitive(0x81);
        dispatch_server(OpCode::UsbBulkTransfer, &mut ci, &mut state, &mut record);
        assert_eq!(record.transferred.to_primitive(), 4);
        assert_eq!(&record.data[..4], &[1, 2, 3, 4]);
    }
}
