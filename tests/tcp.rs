// Socket networking toolkit with a single-threaded callback-driven reactor.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! End-to-end TCP scenarios running a real event loop against real sockets.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener as StdListener, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use netmux::{Connection, Error, EventLoop, Listener, Socket, State};

fn ephemeral() -> SocketAddr { "127.0.0.1:0".parse().unwrap() }

/// Binds and immediately drops a listener, yielding a port nothing listens
/// on. Racy against port reuse in principle, reliable in practice.
fn closed_port() -> SocketAddr {
    let listener = StdListener::bind(ephemeral()).unwrap();
    listener.local_addr().unwrap()
}

#[test]
fn accept_reports_peer_address() {
    let mut eloop = EventLoop::new();
    let handle = eloop.handle();

    let listener = Listener::new(&handle, ephemeral()).unwrap();
    listener.listen(1).unwrap();
    let addr = listener.local_addr();
    assert_ne!(addr.port(), 0);
    assert!(listener.is_listening());

    let (addr_tx, addr_rx) = chan::bounded(1);
    let (done_tx, done_rx) = chan::bounded::<()>(1);
    let peer = thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        addr_tx.send(stream.local_addr().unwrap()).unwrap();
        // Keep the stream open until the assertions ran.
        done_rx.recv().unwrap();
    });

    let seen = Rc::new(RefCell::new(None));
    let seen2 = seen.clone();
    let stopper = handle.clone();
    listener.set_connected_callback(move |conn| {
        *seen2.borrow_mut() = conn.peer_addr();
        stopper.stop();
    });
    eloop.run().unwrap();

    let expected = addr_rx.recv().unwrap();
    assert_eq!(seen.borrow().unwrap(), expected);
    assert_eq!(listener.connections(), 1);

    done_tx.send(()).unwrap();
    peer.join().unwrap();
}

#[test]
fn inbound_bytes_reach_the_message_callback() {
    let mut eloop = EventLoop::new();
    let handle = eloop.handle();

    let listener = Listener::new(&handle, ephemeral()).unwrap();
    listener.listen(1).unwrap();
    let addr = listener.local_addr();

    let (done_tx, done_rx) = chan::bounded::<()>(1);
    let peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"Hello").unwrap();
        done_rx.recv().unwrap();
    });

    let received = Rc::new(RefCell::new(Vec::new()));
    let received2 = received.clone();
    let stopper = handle.clone();
    listener.set_connected_callback(move |conn| {
        let received = received2.clone();
        let stopper = stopper.clone();
        conn.set_message_callback(move |_conn, buf| {
            received.borrow_mut().extend_from_slice(buf.peek());
            let pending = buf.readable();
            buf.consume(pending);
            if received.borrow().len() >= 5 {
                stopper.stop();
            }
        });
    });
    eloop.run().unwrap();

    assert_eq!(received.borrow().as_slice(), b"Hello");

    done_tx.send(()).unwrap();
    peer.join().unwrap();
}

#[test]
fn outbound_connect_sends_and_receives() {
    let server = StdListener::bind(ephemeral()).unwrap();
    let addr = server.local_addr().unwrap();
    let echo = thread::spawn(move || {
        let (mut stream, _) = server.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").unwrap();
        // Hold the stream until the client saw the reply.
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
    });

    let mut eloop = EventLoop::new();
    let handle = eloop.handle();

    let conn = Connection::connect(&handle, addr).unwrap();
    assert_eq!(conn.state(), State::Connecting);

    let reply = Rc::new(RefCell::new(Vec::new()));
    let reply2 = reply.clone();
    let stopper = handle.clone();
    conn.set_connected_callback(|conn| {
        conn.send(b"ping").unwrap();
    });
    conn.set_message_callback(move |_conn, buf| {
        reply2.borrow_mut().extend_from_slice(buf.peek());
        buf.consume(buf.readable());
        if reply2.borrow().len() >= 4 {
            stopper.stop();
        }
    });
    eloop.run().unwrap();

    assert_eq!(conn.state(), State::Connected);
    assert_eq!(reply.borrow().as_slice(), b"pong");
    assert!(conn.local_addr().is_some());
    assert_eq!(conn.peer_addr(), Some(addr));

    conn.close().unwrap();
    echo.join().unwrap();
}

#[test]
fn bytes_sent_while_connecting_are_flushed_after_completion() {
    let server = StdListener::bind(ephemeral()).unwrap();
    let addr = server.local_addr().unwrap();
    let sink = thread::spawn(move || {
        let (mut stream, _) = server.accept().unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).unwrap();
        buf
    });

    let mut eloop = EventLoop::new();
    let handle = eloop.handle();

    let conn = Connection::connect(&handle, addr).unwrap();
    // Queued before the connect completed; delivery happens on the first
    // write-readiness after the transition.
    conn.send(b"deferred").unwrap();

    let stopper = handle.clone();
    conn.set_connected_callback(move |_conn| stopper.stop());
    eloop.run().unwrap();

    // A couple more passes so the flush gets dispatched.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !sink.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(&sink.join().unwrap(), b"deferred");
    conn.close().unwrap();
}

#[test]
fn refused_connect_reports_failure() {
    let addr = closed_port();
    let mut eloop = EventLoop::new();
    let handle = eloop.handle();

    let conn = match Connection::connect(&handle, addr) {
        Err(Error::ConnectFailed(_)) => return,
        Err(err) => panic!("unexpected connect error: {err}"),
        Ok(conn) => conn,
    };

    let stopper = handle.clone();
    conn.set_closed_callback(move |_conn| stopper.stop());
    eloop.run().unwrap();

    assert_eq!(conn.state(), State::Closed);
    assert!(matches!(conn.take_error(), Some(Error::ConnectFailed(_))));
}

#[test]
fn peer_shutdown_moves_connection_to_closing() {
    let mut eloop = EventLoop::new();
    let handle = eloop.handle();

    let listener = Listener::new(&handle, ephemeral()).unwrap();
    listener.listen(1).unwrap();
    let addr = listener.local_addr();

    let peer = thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        drop(stream);
    });

    let accepted = Rc::new(RefCell::new(None));
    let accepted2 = accepted.clone();
    let stopper = handle.clone();
    listener.set_connected_callback(move |conn| {
        let stopper = stopper.clone();
        conn.set_closed_callback(move |_conn| stopper.stop());
        *accepted2.borrow_mut() = Some(conn.clone());
    });
    eloop.run().unwrap();
    peer.join().unwrap();

    let conn = accepted.borrow().clone().unwrap();
    assert_eq!(conn.state(), State::Closing);
    assert!(conn.take_error().is_none());
    conn.close().unwrap();
    assert_eq!(conn.state(), State::Closed);
}

#[test]
fn one_readiness_report_accepts_all_queued_connects() {
    let mut eloop = EventLoop::new();
    let handle = eloop.handle();

    let listener = Listener::new(&handle, ephemeral()).unwrap();
    listener.listen(8).unwrap();
    let addr = listener.local_addr();

    const K: usize = 3;
    let (done_tx, done_rx) = chan::bounded::<()>(K);
    let mut peers = Vec::new();
    for _ in 0..K {
        let done_rx = done_rx.clone();
        peers.push(thread::spawn(move || {
            let stream = TcpStream::connect(addr).unwrap();
            done_rx.recv().unwrap();
            drop(stream);
        }));
    }

    let fds = Rc::new(RefCell::new(Vec::new()));
    let fds2 = fds.clone();
    let stopper = handle.clone();
    listener.set_connected_callback(move |conn| {
        assert!(conn.peer_addr().is_some());
        fds2.borrow_mut().push(conn.fd());
        if fds2.borrow().len() == K {
            stopper.stop();
        }
    });
    eloop.run().unwrap();

    let mut fds = fds.borrow().clone();
    fds.sort_unstable();
    fds.dedup();
    assert_eq!(fds.len(), K);
    assert_eq!(listener.connections(), K);

    listener.close().unwrap();
    assert_eq!(listener.connections(), 0);
    assert!(!listener.is_listening());

    for _ in 0..K {
        done_tx.send(()).unwrap();
    }
    for peer in peers {
        peer.join().unwrap();
    }
}

#[test]
fn released_connection_outlives_the_listener() {
    let mut eloop = EventLoop::new();
    let handle = eloop.handle();

    let listener = Listener::new(&handle, ephemeral()).unwrap();
    listener.listen(1).unwrap();
    let addr = listener.local_addr();

    let (done_tx, done_rx) = chan::bounded::<()>(1);
    let peer = thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        done_rx.recv().unwrap();
        drop(stream);
    });

    let released = Rc::new(RefCell::new(None));
    let released2 = released.clone();
    let inner_listener = listener.clone();
    let stopper = handle.clone();
    listener.set_connected_callback(move |conn| {
        *released2.borrow_mut() = inner_listener.release(conn.fd());
        stopper.stop();
    });
    eloop.run().unwrap();

    let conn = released.borrow().clone().unwrap();
    assert_eq!(listener.connections(), 0);

    // Closing the listener must not touch the released connection.
    listener.close().unwrap();
    assert_eq!(conn.state(), State::Connected);

    conn.close().unwrap();
    done_tx.send(()).unwrap();
    peer.join().unwrap();
}

#[test]
fn close_is_idempotent() {
    let server = StdListener::bind(ephemeral()).unwrap();
    let addr = server.local_addr().unwrap();

    let eloop = EventLoop::new();
    let handle = eloop.handle();

    let conn = Connection::connect_timeout(&handle, addr, Some(Duration::from_secs(2))).unwrap();
    assert_eq!(conn.state(), State::Connected);

    conn.close().unwrap();
    assert_eq!(conn.state(), State::Closed);
    conn.close().unwrap();
    assert_eq!(conn.state(), State::Closed);
    assert!(conn.send(b"late").is_err());
}

#[test]
fn synchronous_socket_io_respects_timeouts() {
    let server = StdListener::bind(ephemeral()).unwrap();
    let addr = server.local_addr().unwrap();
    let echo = thread::spawn(move || {
        let (mut stream, _) = server.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(&buf).unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
    });

    let mut socket = Socket::tcp(&addr).unwrap();
    let status = socket.connect_timeout(&addr, Some(Duration::from_secs(2))).unwrap();
    assert_eq!(status, netmux::ConnectStatus::Connected);

    // Nothing arrived yet; a short bounded receive reports "not ready"
    // rather than blocking.
    let started = Instant::now();
    let mut buf = [0u8; 16];
    let got = socket.recv_timeout(&mut buf, Some(Duration::from_millis(50))).unwrap();
    assert!(got.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));

    let sent = socket.send_timeout(b"ping", Some(Duration::from_secs(1))).unwrap();
    assert_eq!(sent, Some(4));

    let got = socket.recv_timeout(&mut buf, Some(Duration::from_secs(2))).unwrap();
    assert_eq!(got, Some(4));
    assert_eq!(&buf[..4], b"ping");

    socket.close().unwrap();
    echo.join().unwrap();
}

#[test]
fn bounded_connect_to_dead_port_times_out_or_fails() {
    let addr = closed_port();
    let socket = Socket::tcp(&addr).unwrap();

    let started = Instant::now();
    let res = socket.connect_timeout(&addr, Some(Duration::from_secs(1)));
    assert!(matches!(
        res,
        Err(Error::ConnectFailed(_)) | Err(Error::TimedOut) | Err(Error::Io(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn zero_timeout_poll_never_blocks() {
    use std::os::unix::io::AsRawFd;

    use netmux::poller::popol::Poller;
    use netmux::poller::{IoType, Poll};

    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut poller = Poller::new();
    poller.register(&socket.as_raw_fd(), IoType::read_only());

    let started = Instant::now();
    let count = poller.poll(Some(Duration::ZERO)).unwrap();
    assert_eq!(count, 0);
    assert!(started.elapsed() < Duration::from_millis(200));
}
