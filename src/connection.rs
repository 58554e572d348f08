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

//! Established (or half-established) TCP connection driven by the event loop.

use std::cell::RefCell;
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use crate::event_loop::{EventHandler, LoopHandle};
use crate::poller::IoFail;
use crate::socket::ConnectStatus;
use crate::{Buffer, Channel, Error, Socket};

/// Minimum writable capacity ensured in the inbound buffer before each
/// receive call.
pub const READ_RESERVE: usize = 4096;

/// Connection lifecycle state.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum State {
    /// A connect was issued and its completion has not been observed yet.
    #[display("connecting")]
    Connecting,
    /// The connection is established in both directions.
    #[display("connected")]
    Connected,
    /// The peer performed an orderly shutdown; the local side may still
    /// flush outgoing data until the owner closes the connection.
    #[display("closing")]
    Closing,
    /// The underlying socket is shut down and closed. Terminal.
    #[display("closed")]
    Closed,
}

type ConnectedCallback = Box<dyn FnMut(&Connection)>;
type MessageCallback = Box<dyn FnMut(&Connection, &mut Buffer)>;
type ClosedCallback = Box<dyn FnMut(&Connection)>;

struct Inner {
    socket: Socket,
    channel: Channel,
    state: State,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    inbound: Buffer,
    outbound: Buffer,
    error: Option<Error>,
    notified_close: bool,
    on_connected: Option<ConnectedCallback>,
    on_message: Option<MessageCallback>,
    on_closed: Option<ClosedCallback>,
    owner_hook: Option<Box<dyn FnMut(RawFd)>>,
}

/// One TCP connection, wrapping a non-blocking socket with an inbound and an
/// outbound byte buffer and one [`Channel`] registered with the event loop.
///
/// Cloning produces another handle to the same connection; the event loop
/// keeps one such handle for callback dispatch until the connection
/// deregisters. State is mutated only by the loop dispatching the channel, or
/// by the owner issuing explicit writes and close.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<Inner>>,
}

enum ReadOutcome {
    /// Received bytes were appended to the inbound buffer.
    Message,
    /// Zero-length read: orderly shutdown by the peer.
    PeerClosed,
    /// Spurious readiness; nothing to do.
    Idle,
    /// Unrecoverable I/O error.
    Failed(Error),
}

impl Connection {
    /// Starts a non-blocking outbound connect driven by the event loop.
    ///
    /// The returned connection is in [`State::Connecting`]; completion is
    /// observed via write-readiness followed by the authoritative
    /// pending-error query, after which the connected callback fires. An
    /// immediate connect success follows the very same path on the first
    /// dispatch, so the `Connecting → Connected` transition happens exactly
    /// once either way.
    pub fn connect(handle: &LoopHandle, peer: SocketAddr) -> Result<Connection, Error> {
        Connection::connect_from(handle, peer, None)
    }

    /// Same as [`Connection::connect`], binding the local address first.
    pub fn connect_from(
        handle: &LoopHandle,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<Connection, Error> {
        let socket = Socket::tcp(&peer)?;
        socket.set_nonblocking(true)?;
        if let Some(local) = local {
            socket.bind(&local)?;
        }
        let status = socket.connect(&peer).map_err(Error::ConnectFailed)?;
        log::debug!(target: "connection", "Connect to {peer} issued: {status}");

        let conn = Connection::register(handle, socket, Some(peer), State::Connecting);
        conn.inner.borrow().channel.enable_writing();
        Ok(conn)
    }

    /// Blocking connect with a bounded timeout, registered with the loop once
    /// established.
    ///
    /// Timeout semantics follow [`Socket::connect_timeout`]. A zero timeout
    /// whose connect is still in progress hands completion over to the event
    /// loop and returns a [`State::Connecting`] connection.
    pub fn connect_timeout(
        handle: &LoopHandle,
        peer: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<Connection, Error> {
        let socket = Socket::tcp(&peer)?;
        match socket.connect_timeout(&peer, timeout)? {
            ConnectStatus::Connected => {
                socket.set_nonblocking(true)?;
                let conn = Connection::register(handle, socket, Some(peer), State::Connected);
                conn.inner.borrow().channel.enable_reading();
                Ok(conn)
            }
            ConnectStatus::InProgress => {
                let conn = Connection::register(handle, socket, Some(peer), State::Connecting);
                conn.inner.borrow().channel.enable_writing();
                Ok(conn)
            }
        }
    }

    /// Wraps a socket accepted by a listener; the peer address comes from the
    /// accept call and the connection starts out established.
    pub(crate) fn accepted(handle: &LoopHandle, socket: Socket, peer: SocketAddr) -> Connection {
        let conn = Connection::register(handle, socket, Some(peer), State::Connected);
        conn.inner.borrow().channel.enable_reading();
        conn
    }

    fn register(
        handle: &LoopHandle,
        socket: Socket,
        peer: Option<SocketAddr>,
        state: State,
    ) -> Connection {
        let channel = Channel::new(handle.clone(), socket.as_raw_fd());
        let local = socket.local_addr().ok();
        let conn = Connection {
            inner: Rc::new(RefCell::new(Inner {
                socket,
                channel,
                state,
                local,
                peer,
                inbound: Buffer::new(),
                outbound: Buffer::new(),
                error: None,
                notified_close: false,
                on_connected: None,
                on_message: None,
                on_closed: None,
                owner_hook: None,
            })),
        };
        let handler: Rc<RefCell<dyn EventHandler>> = Rc::new(RefCell::new(conn.clone()));
        conn.inner.borrow().channel.attach(handler);
        conn
    }

    /// Descriptor of the underlying socket; stable for the connection's
    /// lifetime, used as its identity key.
    pub fn fd(&self) -> RawFd { self.inner.borrow().channel.fd() }

    pub fn state(&self) -> State { self.inner.borrow().state }

    pub fn local_addr(&self) -> Option<SocketAddr> { self.inner.borrow().local }

    /// Peer address; empty until resolved (outbound connections know it from
    /// the start, accepted ones from the accept call).
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.inner.borrow().peer }

    /// Takes the error which moved the connection to [`State::Closed`], if
    /// any; a connect failure is reported here exactly once.
    pub fn take_error(&self) -> Option<Error> { self.inner.borrow_mut().error.take() }

    /// Called once the connection reaches [`State::Connected`].
    pub fn set_connected_callback(&self, f: impl FnMut(&Connection) + 'static) {
        self.inner.borrow_mut().on_connected = Some(Box::new(f));
    }

    /// Called whenever received bytes were appended to the inbound buffer;
    /// the callback consumes from the buffer at its own pace.
    pub fn set_message_callback(&self, f: impl FnMut(&Connection, &mut Buffer) + 'static) {
        self.inner.borrow_mut().on_message = Some(Box::new(f));
    }

    /// Called once when the connection leaves the established state: either
    /// the peer performed an orderly shutdown, or the connection was closed
    /// locally or by an error.
    pub fn set_closed_callback(&self, f: impl FnMut(&Connection) + 'static) {
        self.inner.borrow_mut().on_closed = Some(Box::new(f));
    }

    /// Hook for the owning listener, fired when the connection reaches
    /// [`State::Closed`].
    pub(crate) fn set_owner_hook(&self, f: impl FnMut(RawFd) + 'static) {
        self.inner.borrow_mut().owner_hook = Some(Box::new(f));
    }

    pub(crate) fn clear_owner_hook(&self) { self.inner.borrow_mut().owner_hook = None; }

    /// Queues bytes for sending, transmitting immediately as much as the
    /// socket accepts; the remainder is buffered and flushed on
    /// write-readiness.
    ///
    /// Bytes sent while still [`State::Connecting`] are buffered and flushed
    /// once the connect completes.
    pub fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        let res = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            match inner.state {
                State::Closing | State::Closed => return Err(Error::NotConnected),
                State::Connecting => {
                    inner.outbound.extend(bytes);
                    return Ok(());
                }
                State::Connected => {}
            }
            if inner.outbound.is_empty() {
                match inner.socket.send(bytes) {
                    Ok(Some(count)) if count == bytes.len() => return Ok(()),
                    Ok(Some(count)) => {
                        inner.outbound.extend(&bytes[count..]);
                        inner.channel.enable_writing();
                        Ok(())
                    }
                    Ok(None) => {
                        inner.outbound.extend(bytes);
                        inner.channel.enable_writing();
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            } else {
                inner.outbound.extend(bytes);
                inner.channel.enable_writing();
                Ok(())
            }
        };
        match res {
            Ok(()) => Ok(()),
            Err(err) => {
                log::debug!(target: "connection", "Fatal error sending on {}: {err}", self.fd());
                self.teardown(None);
                Err(Error::Io(err))
            }
        }
    }

    /// Closes the connection: deregisters its channel, shuts the socket down
    /// and closes it, tolerating failure. Closing an already closed
    /// connection is a no-op reporting success.
    pub fn close(&self) -> Result<(), Error> {
        self.teardown(None);
        Ok(())
    }

    /// Moves to [`State::Closed`], fires the closed callback (at most once
    /// over the connection lifetime) and notifies the owner.
    fn teardown(&self, error: Option<Error>) {
        let fd = self.fd();
        let closed_cb = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == State::Closed {
                return;
            }
            log::debug!(target: "connection", "Closing connection {fd}");
            inner.state = State::Closed;
            if error.is_some() {
                inner.error = error;
            }
            // The channel must be tombstoned before the descriptor is
            // closed, so readiness events already collected for this pass
            // are ignored rather than dispatched against a dead socket.
            inner.channel.remove();
            let _ = inner.socket.shutdown(Shutdown::Both);
            let _ = inner.socket.close();
            if inner.notified_close {
                None
            } else {
                inner.notified_close = true;
                inner.on_closed.take()
            }
        };
        if let Some(mut cb) = closed_cb {
            cb(self);
        }
        let owner_hook = self.inner.borrow_mut().owner_hook.take();
        if let Some(mut hook) = owner_hook {
            hook(fd);
        }
    }

    /// Completes an asynchronous connect after write-readiness was observed.
    ///
    /// The pending-error query is the authoritative verdict; writability
    /// alone never implies success.
    fn complete_connect(&self) {
        let verdict = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            match inner.socket.take_error() {
                Ok(None) => {
                    inner.state = State::Connected;
                    inner.local = inner.socket.local_addr().ok();
                    if inner.peer.is_none() {
                        inner.peer = inner.socket.peer_addr().ok();
                    }
                    inner.channel.enable_reading();
                    if inner.outbound.is_empty() {
                        inner.channel.disable_writing();
                    }
                    Ok(())
                }
                Ok(Some(err)) => Err(Error::ConnectFailed(err)),
                Err(err) => Err(Error::Io(err)),
            }
        };
        match verdict {
            Ok(()) => {
                log::debug!(target: "connection", "Connection {} established", self.fd());
                self.fire_connected();
                self.flush();
            }
            Err(err) => {
                log::debug!(target: "connection", "Connect on {} failed: {err}", self.fd());
                self.teardown(Some(err));
            }
        }
    }

    /// Drains as many leading bytes out of the outbound buffer as the socket
    /// accepts, advancing the read cursor by exactly that count. Write
    /// interest stays enabled only while unsent bytes remain.
    fn flush(&self) {
        let res = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if inner.outbound.is_empty() {
                inner.channel.disable_writing();
                return;
            }
            match inner.socket.send(inner.outbound.peek()) {
                Ok(Some(count)) => {
                    inner.outbound.consume(count);
                    if inner.outbound.is_empty() {
                        inner.channel.disable_writing();
                    }
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(err) => Err(err),
            }
        };
        if let Err(err) = res {
            log::debug!(target: "connection", "Fatal error flushing {}: {err}", self.fd());
            self.teardown(Some(Error::Io(err)));
        }
    }

    /// Performs one receive into the inbound buffer, after ensuring at least
    /// [`READ_RESERVE`] bytes of writable capacity.
    fn receive(&self) -> ReadOutcome {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        if inner.state != State::Connected {
            return ReadOutcome::Idle;
        }
        inner.inbound.reserve(READ_RESERVE);
        match inner.socket.recv(inner.inbound.writable_mut()) {
            Ok(Some(0)) => {
                inner.state = State::Closing;
                inner.channel.disable_reading();
                ReadOutcome::PeerClosed
            }
            Ok(Some(count)) => {
                inner.inbound.advance_write(count);
                ReadOutcome::Message
            }
            Ok(None) => ReadOutcome::Idle,
            Err(err) => ReadOutcome::Failed(Error::Io(err)),
        }
    }

    fn fire_connected(&self) {
        let cb = self.inner.borrow_mut().on_connected.take();
        if let Some(mut cb) = cb {
            cb(self);
            let mut inner = self.inner.borrow_mut();
            if inner.on_connected.is_none() {
                inner.on_connected = Some(cb);
            }
        }
    }

    fn fire_message(&self) {
        let taken = {
            let mut inner = self.inner.borrow_mut();
            match inner.on_message.take() {
                Some(cb) => Some((cb, mem::take(&mut inner.inbound))),
                None => None,
            }
        };
        let Some((mut cb, mut buffer)) = taken else { return };
        cb(self, &mut buffer);
        let mut inner = self.inner.borrow_mut();
        // Unconsumed bytes stay queued for the next dispatch.
        inner.inbound = buffer;
        if inner.on_message.is_none() {
            inner.on_message = Some(cb);
        }
    }

    /// Fires the closed callback for a peer-initiated shutdown; the
    /// connection stays in [`State::Closing`] until its owner closes it.
    fn notify_peer_closed(&self) {
        let cb = {
            let mut inner = self.inner.borrow_mut();
            if inner.notified_close {
                None
            } else {
                inner.notified_close = true;
                inner.on_closed.take()
            }
        };
        if let Some(mut cb) = cb {
            cb(self);
        }
    }
}

impl EventHandler for Connection {
    fn on_readable(&mut self) {
        match self.receive() {
            ReadOutcome::Message => self.fire_message(),
            ReadOutcome::PeerClosed => {
                log::debug!(target: "connection", "Peer closed connection {}", self.fd());
                self.notify_peer_closed();
            }
            ReadOutcome::Idle => {}
            ReadOutcome::Failed(err) => {
                log::debug!(target: "connection", "Fatal error reading {}: {err}", self.fd());
                self.teardown(Some(err));
            }
        }
    }

    fn on_writable(&mut self) {
        let state = self.inner.borrow().state;
        match state {
            State::Connecting => self.complete_connect(),
            State::Connected | State::Closing => self.flush(),
            State::Closed => {}
        }
    }

    fn on_error(&mut self, fail: IoFail) {
        let state = self.inner.borrow().state;
        if state == State::Connecting {
            // A refused connect often reports as hangup; the pending-error
            // query decides.
            self.complete_connect();
        } else {
            self.teardown(Some(Error::Disconnected(fail)));
        }
    }
}
