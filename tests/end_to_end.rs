mod util;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use rotor::{init_listener, Action, Conn, EventHandler, Options, Server};

struct EchoHandler {
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl EchoHandler {
    fn new() -> Self {
        EchoHandler {
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

impl EventHandler for EchoHandler {
    fn on_opened(&self, _conn: &mut Conn) -> (Option<Bytes>, Action) {
        self.opens.fetch_add(1, Ordering::SeqCst);
        (None, Action::None)
    }

    fn on_closed(&self, _conn: &Conn, _err: Option<&std::io::Error>) -> Action {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Action::None
    }

    fn react(&self, frame: Bytes, _conn: &mut Conn) -> (Option<Bytes>, Action) {
        (Some(frame), Action::None)
    }
}

fn echo_roundtrip(addr: SocketAddr, payload: &[u8]) {
    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.write_all(payload).unwrap();
    let mut buf = vec![0u8; payload.len()];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(buf, payload);
}

#[test]
fn reactor_mode_serves_many_connections_across_sub_reactors() {
    util::init();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let opts = Options::default().with_num_event_loop(3);
    let listener = init_listener("tcp", addr, &opts).unwrap();
    let bound = listener.lnaddr().unwrap();

    let server = Server::new();
    let handler = Arc::new(EchoHandler::new());
    let server_thread = {
        let server = server.clone();
        let handler = Arc::clone(&handler);
        thread::spawn(move || {
            server.serve(handler, listener, opts, "test/reactor-many").unwrap();
        })
    };

    assert!(util::wait_until(Duration::from_secs(2), || {
        TcpStream::connect(bound).is_ok()
    }));

    for i in 0..12 {
        echo_roundtrip(bound, format!("msg-{i}").as_bytes());
    }

    server.signal_shutdown();
    server_thread.join().unwrap();

    assert_eq!(handler.opens.load(Ordering::SeqCst), 12);
    assert_eq!(handler.closes.load(Ordering::SeqCst), 12);
}

#[test]
fn distributed_mode_with_reuse_port_serves_connections() {
    util::init();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let opts = Options::default()
        .with_num_event_loop(2)
        .with_reuse_port(true);
    let listener = init_listener("tcp", addr, &opts).unwrap();
    let bound = listener.lnaddr().unwrap();

    let server = Server::new();
    let handler = Arc::new(EchoHandler::new());
    let server_thread = {
        let server = server.clone();
        let handler = Arc::clone(&handler);
        thread::spawn(move || {
            server
                .serve(handler, listener, opts, "test/distributed")
                .unwrap();
        })
    };

    assert!(util::wait_until(Duration::from_secs(2), || {
        TcpStream::connect(bound).is_ok()
    }));

    for i in 0..6 {
        echo_roundtrip(bound, format!("ping-{i}").as_bytes());
    }

    server.signal_shutdown();
    server_thread.join().unwrap();

    assert_eq!(handler.opens.load(Ordering::SeqCst), 6);
}

struct ShutdownAfterOneFrame {
    server: Server,
}

impl EventHandler for ShutdownAfterOneFrame {
    fn react(&self, frame: Bytes, _conn: &mut Conn) -> (Option<Bytes>, Action) {
        self.server.signal_shutdown();
        (Some(frame), Action::None)
    }
}

#[test]
fn handler_initiated_shutdown_stops_the_server() {
    util::init();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let opts = Options::default().with_num_event_loop(1);
    let listener = init_listener("tcp", addr, &opts).unwrap();
    let bound = listener.lnaddr().unwrap();

    let server = Server::new();
    let handler = Arc::new(ShutdownAfterOneFrame {
        server: server.clone(),
    });
    let server_thread = {
        let server = server.clone();
        thread::spawn(move || {
            server
                .serve(handler, listener, opts, "test/handler-shutdown")
                .unwrap();
        })
    };

    assert!(util::wait_until(Duration::from_secs(2), || {
        TcpStream::connect(bound).is_ok()
    }));

    let mut client = TcpStream::connect(bound).unwrap();
    client.write_all(b"bye").unwrap();

    server_thread.join().unwrap();
    assert!(server.in_shutdown());
}
