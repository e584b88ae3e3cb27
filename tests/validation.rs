//! Two failure-path scenarios from §4.4: a caller-sized buffer too large
//! for `MAX_DATA` is rejected locally before any I/O, and an opcode tag the
//! catalog doesn't recognize gets a failure reply rather than a panic.
use std::io::{Read, Result as IoResult, Write};
use std::os::unix::net::UnixStream;

use packed_struct::prelude::*;
use usbrpc::backend::StubBackend;
use usbrpc::connection::{ConnectionInfo, Role};
use usbrpc::dispatch::serve_one;
use usbrpc::error::WIRE_FAILURE;
use usbrpc::server::ServerState;
use usbrpc::{HandleRef, RpcError, RpcRecord, UsbRpcClient, MAX_DATA, RECORD_SIZE};

/// A stream that panics if touched — proves the length check runs before
/// any wire I/O is attempted.
struct NeverTouched;

impl Read for NeverTouched {
    fn read(&mut self, _buf: &mut [u8]) -> IoResult<usize> {
        panic!("oversized request must not reach the wire");
    }
}

impl Write for NeverTouched {
    fn write(&mut self, _buf: &[u8]) -> IoResult<usize> {
        panic!("oversized request must not reach the wire");
    }
    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

#[test]
fn oversized_bulk_transfer_length_is_rejected_before_any_io() {
    let mut client = UsbRpcClient::new(NeverTouched);
    let mut buf = vec![0u8; MAX_DATA];
    let err = client
        .bulk_transfer(HandleRef(0), 0x81, &mut buf, 1000)
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidArg(_)));
}

#[test]
fn rpc_call_with_unknown_opcode_fails_without_io() {
    let mut client = UsbRpcClient::new(NeverTouched);
    let record = RpcRecord::new(0);
    let err = client.rpc_call(0xFFFF_FFFF, &record).unwrap_err();
    assert!(matches!(err, RpcError::InvalidArg(_)));
}

#[test]
fn unknown_opcode_on_the_wire_gets_a_failure_reply_not_a_panic() {
    let (mut client_sock, server_sock) = UnixStream::pair().expect("socketpair");

    let record = RpcRecord::new(1);
    let mut request = 0xFFFF_FFFFu32.to_le_bytes().to_vec();
    request.extend_from_slice(&record.encode().expect("encode"));
    client_sock.write_all(&request).expect("write request");

    let mut ci = ConnectionInfo::new(Role::Server, server_sock);
    let mut state = ServerState::new(StubBackend::default());
    let kept_going = serve_one(&mut ci, &mut state).expect("serve_one should not error");
    assert!(kept_going, "an illegal opcode should not end the session");

    let mut reply_buf = [0u8; RECORD_SIZE];
    client_sock.read_exact(&mut reply_buf).expect("read reply");
    let reply = RpcRecord::decode(&reply_buf).expect("decode reply");
    assert_eq!(reply.server_error.to_primitive(), WIRE_FAILURE);
}
