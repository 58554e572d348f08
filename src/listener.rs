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

//! TCP listener accepting inbound connections and owning them until they are
//! released or closed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use crate::event_loop::{EventHandler, LoopHandle};
use crate::{Channel, Connection, Error, Socket};

type ConnectedCallback = Box<dyn FnMut(&Connection)>;
type ErrorCallback = Box<dyn FnMut(Error)>;

struct Inner {
    socket: Socket,
    channel: Channel,
    handle: LoopHandle,
    addr: SocketAddr,
    listening: bool,
    conns: HashMap<RawFd, Connection>,
    on_connected: Option<ConnectedCallback>,
    on_error: Option<ErrorCallback>,
}

/// Listening TCP socket registered with the event loop.
///
/// Accepted connections are owned by the listener: it holds them in an
/// internal table keyed by descriptor and drops the entry when a connection
/// closes. Ownership of a single connection can be taken over with
/// [`Listener::release`].
#[derive(Clone)]
pub struct Listener {
    inner: Rc<RefCell<Inner>>,
}

impl Listener {
    /// Creates a listener bound-to-be at the given address; no syscall beyond
    /// socket creation happens until [`Listener::listen`].
    pub fn new(handle: &LoopHandle, addr: SocketAddr) -> Result<Listener, Error> {
        let socket = Socket::tcp(&addr)?;
        let channel = Channel::new(handle.clone(), socket.as_raw_fd());
        let listener = Listener {
            inner: Rc::new(RefCell::new(Inner {
                socket,
                channel,
                handle: handle.clone(),
                addr,
                listening: false,
                conns: HashMap::new(),
                on_connected: None,
                on_error: None,
            })),
        };
        let handler: Rc<RefCell<dyn EventHandler>> = Rc::new(RefCell::new(listener.clone()));
        listener.inner.borrow().channel.attach(handler);
        Ok(listener)
    }

    /// Binds (unless the address is fully wildcard), starts listening with
    /// the given backlog and registers for read-readiness.
    ///
    /// A negative backlog selects the system default. The bound address,
    /// with any ephemeral port resolved, is available from
    /// [`Listener::local_addr`] afterwards.
    pub fn listen(&self, backlog: i32) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let addr = inner.addr;
        if !(addr.ip().is_unspecified() && addr.port() == 0) {
            inner.socket.set_reuse_addr(true)?;
            inner.socket.bind(&addr)?;
        }
        inner.socket.listen(backlog)?;
        inner.socket.set_nonblocking(true)?;
        inner.addr = inner.socket.local_addr()?;
        inner.channel.enable_reading();
        inner.listening = true;
        log::debug!(target: "listener", "Listening on {}", inner.addr);
        Ok(())
    }

    /// Convenience for listening on a given port across all interfaces of
    /// the address family the listener was created with.
    pub fn listen_on(&self, port: u16, backlog: i32) -> Result<(), Error> {
        {
            let mut inner = self.inner.borrow_mut();
            let ip = inner.addr.ip();
            inner.addr = SocketAddr::new(ip, port);
        }
        self.listen(backlog)
    }

    /// Address the listener is (or will be) bound to.
    pub fn local_addr(&self) -> SocketAddr { self.inner.borrow().addr }

    pub fn is_listening(&self) -> bool { self.inner.borrow().listening }

    /// Number of accepted connections currently owned by the listener.
    pub fn connections(&self) -> usize { self.inner.borrow().conns.len() }

    /// Called for each accepted connection, after it was added to the owned
    /// set, so the callback may immediately [`Listener::release`] it.
    pub fn set_connected_callback(&self, f: impl FnMut(&Connection) + 'static) {
        self.inner.borrow_mut().on_connected = Some(Box::new(f));
    }

    /// Called for accept-loop failures; without a callback they are logged
    /// and the listener keeps running.
    pub fn set_error_callback(&self, f: impl FnMut(Error) + 'static) {
        self.inner.borrow_mut().on_error = Some(Box::new(f));
    }

    /// Hands ownership of an accepted connection over to the caller; the
    /// listener forgets about it and will not close it anymore.
    pub fn release(&self, fd: RawFd) -> Option<Connection> {
        let conn = self.inner.borrow_mut().conns.remove(&fd)?;
        conn.clear_owner_hook();
        Some(conn)
    }

    /// Stops listening, deregisters from the loop and closes every owned
    /// connection.
    pub fn close(&self) -> Result<(), Error> {
        let conns = {
            let mut inner = self.inner.borrow_mut();
            if !inner.listening && inner.conns.is_empty() {
                return Ok(());
            }
            log::debug!(target: "listener", "Closing listener on {}", inner.addr);
            inner.listening = false;
            inner.channel.remove();
            let _ = inner.socket.shutdown(Shutdown::Both);
            let _ = inner.socket.close();
            mem::take(&mut inner.conns)
        };
        for (_, conn) in conns {
            conn.clear_owner_hook();
            let _ = conn.close();
        }
        Ok(())
    }

    fn adopt(&self, socket: Socket, peer: SocketAddr) {
        if let Err(err) = socket.set_nonblocking(true) {
            self.report(Error::Io(err));
            return;
        }
        let fd = socket.as_raw_fd();
        let handle = self.inner.borrow().handle.clone();
        let conn = Connection::accepted(&handle, socket, peer);
        let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
        conn.set_owner_hook(move |fd| {
            if let Some(inner) = weak.upgrade() {
                // The hook may fire while the listener itself is tearing
                // down and holding the borrow; the entry is gone either way.
                if let Ok(mut inner) = inner.try_borrow_mut() {
                    inner.conns.remove(&fd);
                }
            }
        });
        log::debug!(target: "listener", "Accepted connection {fd} from {peer}");
        self.inner.borrow_mut().conns.insert(fd, conn.clone());
        self.fire_connected(&conn);
    }

    fn fire_connected(&self, conn: &Connection) {
        let cb = self.inner.borrow_mut().on_connected.take();
        if let Some(mut cb) = cb {
            cb(conn);
            let mut inner = self.inner.borrow_mut();
            if inner.on_connected.is_none() {
                inner.on_connected = Some(cb);
            }
        }
    }

    fn report(&self, err: Error) {
        let cb = self.inner.borrow_mut().on_error.take();
        match cb {
            Some(mut cb) => {
                cb(err);
                let mut inner = self.inner.borrow_mut();
                if inner.on_error.is_none() {
                    inner.on_error = Some(cb);
                }
            }
            None => log::error!(target: "listener", "Accept failure: {err}"),
        }
    }
}

impl EventHandler for Listener {
    /// Accepts greedily: one readiness report may cover several queued
    /// connects, and edge conditions must not leave them stranded.
    fn on_readable(&mut self) {
        loop {
            let accepted = self.inner.borrow_mut().socket.accept();
            match accepted {
                Ok(Some((socket, peer))) => self.adopt(socket, peer),
                Ok(None) => break,
                Err(err) => {
                    // Transient failures (the peer vanished between the
                    // readiness report and the accept call, descriptor
                    // exhaustion) must not spin; readiness re-reports if
                    // connects are still pending.
                    self.report(Error::Io(err));
                    break;
                }
            }
        }
    }
}
