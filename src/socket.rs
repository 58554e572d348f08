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

//! Thin syscall wrapper around an OS socket descriptor.
//!
//! All operations report results as values: would-block and interrupted are
//! distinguished results, never generic errors. Interrupted calls which made
//! no progress are retried in place, so callers never observe them.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;
use std::{fmt, io};

use crate::poller::{wait_io, IoType};
use crate::Error;

/// Sentinel for an absent descriptor; a closed or detached socket holds it.
pub const INVALID: RawFd = -1;

#[cfg(not(target_os = "macos"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(target_os = "macos")]
const SEND_FLAGS: libc::c_int = 0;

/// Immediate outcome of a connect call on a non-blocking socket.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum ConnectStatus {
    /// The connection was established by the call itself.
    #[display("connected")]
    Connected,
    /// The connection is being established asynchronously; completion is
    /// observed as write-readiness followed by a pending-error query.
    #[display("in-progress")]
    InProgress,
}

/// An owned OS socket descriptor plus the minimal syscalls needed to create,
/// bind, listen, accept, connect, shut down, close, send and receive.
///
/// Exactly one owner at a time: ownership is given up via [`IntoRawFd`]
/// (descriptor stays open) and taken over an externally opened descriptor via
/// [`FromRawFd`] or [`Socket::attach`]. Destruction always attempts closure;
/// close failures are swallowed since they are unrecoverable anyway.
pub struct Socket {
    fd: RawFd,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

impl Socket {
    /// Opens a new socket with the given domain, type and protocol.
    pub fn new(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<Self> {
        let fd = cvt(unsafe { libc::socket(domain, ty, protocol) })?;
        Ok(Socket { fd })
    }

    /// Opens a TCP stream socket in the address family of `addr`.
    pub fn tcp(addr: &SocketAddr) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        Self::new(domain, libc::SOCK_STREAM, libc::IPPROTO_TCP)
    }

    /// Takes ownership of an externally opened descriptor, closing any
    /// previously owned one first.
    pub fn attach(&mut self, fd: RawFd) {
        if self.fd != INVALID {
            unsafe { libc::close(self.fd) };
        }
        self.fd = fd;
    }

    /// Closes the descriptor now instead of at drop time.
    ///
    /// The descriptor is invalidated even when the close call fails; calling
    /// `close` on an already closed socket reports success.
    pub fn close(&mut self) -> io::Result<()> {
        if self.fd == INVALID {
            return Ok(());
        }
        let ret = unsafe { libc::close(self.fd) };
        self.fd = INVALID;
        cvt(ret).map(|_| ())
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (raw, len) = sockaddr_raw(addr);
        cvt(unsafe { libc::bind(self.fd, &raw as *const _ as *const libc::sockaddr, len) })?;
        Ok(())
    }

    /// Starts listening; a negative `backlog` maps to the platform maximum.
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let backlog = if backlog < 0 { libc::SOMAXCONN } else { backlog };
        cvt(unsafe { libc::listen(self.fd, backlog) })?;
        Ok(())
    }

    /// Accepts one pending connection.
    ///
    /// # Returns
    ///
    /// `None` when no connection is pending (would block); otherwise the
    /// accepted socket together with the peer address reported by the accept
    /// call.
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        loop {
            let ret = unsafe {
                libc::accept(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
            };
            if ret != -1 {
                let peer = sockaddr_from_raw(&storage)?;
                return Ok(Some((Socket { fd: ret }, peer)));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    /// Issues a connect call.
    ///
    /// On a non-blocking socket an asynchronous completion is reported as
    /// [`ConnectStatus::InProgress`]; an interrupted call also completes
    /// asynchronously and is reported the same way.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<ConnectStatus> {
        let (raw, len) = sockaddr_raw(addr);
        let ret = unsafe { libc::connect(self.fd, &raw as *const _ as *const libc::sockaddr, len) };
        if ret == 0 {
            return Ok(ConnectStatus::Connected);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EINTR) => Ok(ConnectStatus::InProgress),
            _ => Err(err),
        }
    }

    /// Sends bytes, returning `None` when the socket is not ready (would
    /// block). Partial sends are reported by count, not retried.
    pub fn send(&self, bytes: &[u8]) -> io::Result<Option<usize>> {
        loop {
            let ret = unsafe {
                libc::send(self.fd, bytes.as_ptr() as *const libc::c_void, bytes.len(), SEND_FLAGS)
            };
            if ret >= 0 {
                return Ok(Some(ret as usize));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    /// Receives bytes, returning `None` when no data is ready (would block).
    ///
    /// A return of `Some(0)` on a stream socket signals orderly shutdown by
    /// the peer: a state transition, not an error.
    pub fn recv(&self, bytes: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            let ret = unsafe {
                libc::recv(self.fd, bytes.as_mut_ptr() as *mut libc::c_void, bytes.len(), 0)
            };
            if ret >= 0 {
                return Ok(Some(ret as usize));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        cvt(unsafe { libc::shutdown(self.fd, how) })?;
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let flags = cvt(unsafe { libc::fcntl(self.fd, libc::F_GETFL) })?;
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        cvt(unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) })?;
        Ok(())
    }

    pub fn set_reuse_addr(&self, reuse: bool) -> io::Result<()> {
        let value: libc::c_int = reuse.into();
        cvt(unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &value as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    /// Queries and clears the pending socket error (`SO_ERROR`).
    ///
    /// After an asynchronous connect this is the authoritative completion
    /// check: write-readiness alone does not imply the connect succeeded.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        })?;
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        sockaddr_from_raw(&storage)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            libc::getpeername(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        sockaddr_from_raw(&storage)
    }

    /// Blocking connect with a bounded timeout; no event loop involved.
    ///
    /// - `None`: the connect call itself blocks (the socket is switched to
    ///   blocking mode).
    /// - `Some(Duration::ZERO)`: no waiting at all; reports whatever the
    ///   connect call itself returned.
    /// - `Some(timeout)`: issues a non-blocking connect, waits for
    ///   write-readiness for at most `timeout`, then queries the pending
    ///   socket error for the verdict. Elapsing without readiness is
    ///   [`Error::TimedOut`].
    pub fn connect_timeout(
        &self,
        addr: &SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<ConnectStatus, Error> {
        match timeout {
            None => {
                self.set_nonblocking(false)?;
                match self.connect(addr) {
                    Ok(ConnectStatus::Connected) => Ok(ConnectStatus::Connected),
                    Ok(ConnectStatus::InProgress) => {
                        // The blocking call was interrupted; completion is
                        // asynchronous from here on.
                        wait_io(self, IoType::write_only(), None)?;
                        self.connect_verdict()
                    }
                    Err(err) => Err(Error::ConnectFailed(err)),
                }
            }
            Some(timeout) => {
                self.set_nonblocking(true)?;
                match self.connect(addr) {
                    Ok(ConnectStatus::Connected) => Ok(ConnectStatus::Connected),
                    Ok(ConnectStatus::InProgress) if timeout.is_zero() => {
                        Ok(ConnectStatus::InProgress)
                    }
                    Ok(ConnectStatus::InProgress) => {
                        if wait_io(self, IoType::write_only(), Some(timeout))? {
                            self.connect_verdict()
                        } else {
                            Err(Error::TimedOut)
                        }
                    }
                    Err(err) => Err(Error::ConnectFailed(err)),
                }
            }
        }
    }

    fn connect_verdict(&self) -> Result<ConnectStatus, Error> {
        match self.take_error()? {
            Some(err) => Err(Error::ConnectFailed(err)),
            None => Ok(ConnectStatus::Connected),
        }
    }

    /// Sends bytes after waiting up to `timeout` for write-readiness; the I/O
    /// call itself is performed once. `None` result means not ready, retry.
    pub fn send_timeout(
        &self,
        bytes: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Option<usize>, Error> {
        if let Some(timeout) = timeout {
            if !timeout.is_zero() && !wait_io(self, IoType::write_only(), Some(timeout))? {
                return Ok(None);
            }
        }
        Ok(self.send(bytes)?)
    }

    /// Receives bytes after waiting up to `timeout` for read-readiness; the
    /// I/O call itself is performed once. `None` result means not ready,
    /// retry; `Some(0)` is orderly peer shutdown.
    pub fn recv_timeout(
        &self,
        bytes: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Option<usize>, Error> {
        if let Some(timeout) = timeout {
            if !timeout.is_zero() && !wait_io(self, IoType::read_only(), Some(timeout))? {
                return Ok(None);
            }
        }
        Ok(self.recv(bytes)?)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd { self.fd }
}

impl IntoRawFd for Socket {
    /// Gives up ownership; the descriptor remains open.
    fn into_raw_fd(mut self) -> RawFd { mem::replace(&mut self.fd, INVALID) }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self { Socket { fd } }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd != INVALID {
            // Close failures are unrecoverable at this point.
            unsafe { libc::close(self.fd) };
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Socket").field(&self.fd).finish()
    }
}

fn sockaddr_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_from_raw(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported socket address family {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:8080".parse().unwrap();
        let (raw, _) = sockaddr_raw(&addr);
        assert_eq!(sockaddr_from_raw(&raw).unwrap(), addr);
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::42]:443".parse().unwrap();
        let (raw, _) = sockaddr_raw(&addr);
        assert_eq!(sockaddr_from_raw(&raw).unwrap(), addr);
    }

    #[test]
    fn close_is_idempotent() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut socket = Socket::tcp(&addr).unwrap();
        socket.close().unwrap();
        assert_eq!(socket.as_raw_fd(), INVALID);
        socket.close().unwrap();
    }

    #[test]
    fn detach_leaves_descriptor_open() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::tcp(&addr).unwrap();
        let fd = socket.into_raw_fd();
        assert_ne!(fd, INVALID);
        let mut adopted = unsafe { Socket::from_raw_fd(fd) };
        adopted.bind(&addr).unwrap();
        adopted.close().unwrap();
    }
}
