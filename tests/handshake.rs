//! Handshake and teardown: USB_INIT brings a connection to Initialized,
//! USB_EXIT brings it to Terminal and the server's read loop exits cleanly
//! once the client closes its end.
use std::os::unix::net::UnixStream;
use std::thread;

use usbrpc::backend::StubBackend;
use usbrpc::connection::{ConnectionInfo, Role};
use usbrpc::server::ServerState;
use usbrpc::{serve, ConnState, UsbRpcClient};

#[test]
fn handshake_then_exit_closes_session_cleanly() {
    let (client_sock, server_sock) = UnixStream::pair().expect("socketpair");

    let server_thread = thread::spawn(move || {
        let mut ci = ConnectionInfo::new(Role::Server, server_sock);
        let mut state = ServerState::new(StubBackend::default());
        serve(&mut ci, &mut state).expect("server loop");
    });

    let mut client = UsbRpcClient::new(client_sock);
    assert_eq!(client.state(), ConnState::Fresh);

    client.usb_init().expect("usb_init");
    assert_eq!(client.state(), ConnState::Initialized);

    // Idempotent per §4.4: a second USB_INIT on an already-initialized
    // session still succeeds.
    client.usb_init().expect("second usb_init");

    client.usb_exit().expect("usb_exit");
    assert_eq!(client.state(), ConnState::Terminal);

    drop(client);
    server_thread.join().expect("server thread panicked");
}
