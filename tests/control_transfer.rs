//! Claim an interface, then round-trip a control transfer (§4.3
//! USB_CLAIM_INTERFACE / USB_CONTROL_TRANSFER). Control and bulk transfers
//! carry a byte count rather than a status (§7 "B-ops").
use std::os::unix::net::UnixStream;
use std::thread;

use usbrpc::backend::StubBackend;
use usbrpc::connection::{ConnectionInfo, Role};
use usbrpc::server::ServerState;
use usbrpc::{serve, DeviceDescriptor, UsbRpcClient};

#[test]
fn claim_interface_then_control_transfer_round_trips() {
    let (client_sock, server_sock) = UnixStream::pair().expect("socketpair");
    let mut backend = StubBackend::default();
    backend.devices.push((0, DeviceDescriptor::new(0x1d6b, 0x0002)));
    // A stand-in 18-byte device descriptor response, matching the length a
    // real GET_DESCRIPTOR(DEVICE) control transfer returns.
    backend.control_response = (0u8..18).collect();

    let server_thread = thread::spawn(move || {
        let mut ci = ConnectionInfo::new(Role::Server, server_sock);
        let mut state = ServerState::new(backend);
        serve(&mut ci, &mut state).expect("server loop");
    });

    let mut client = UsbRpcClient::new(client_sock);
    client.usb_init().expect("usb_init");

    let devices = client.get_device_list().expect("get_device_list");
    let handle = client.open(devices[0]).expect("open");
    client.claim_interface(handle, 0).expect("claim_interface");

    let mut buf = vec![0u8; 18];
    let n = client
        .control_transfer(handle, 0x80, 0x06, 0x0100, 0x0000, &mut buf, 1000)
        .expect("control_transfer");
    assert_eq!(n, 18);
    assert_eq!(buf, (0u8..18).collect::<Vec<u8>>());

    client
        .release_interface(handle, 0)
        .expect("release_interface");
    client.close(handle).expect("close");
    client.usb_exit().expect("usb_exit");
    drop(client);
    server_thread.join().expect("server thread panicked");
}
