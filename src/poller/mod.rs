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

//! Readiness multiplexing: the [`Poll`] contract and the poll(2)-backed
//! implementation in [`popol`].

pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{io, ops};

/// A single I/O event dispatched to a channel.
///
/// When both kinds fired for one descriptor, write is always dispatched before
/// read (see the `Iterator` implementation on [`IoType`]).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Io {
    Read,
    Write,
}

/// Information about I/O events which happened for a descriptor, or the
/// interest mask requested for it.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Specifies whether I/O source has data to read.
    pub read: bool,
    /// Specifies whether I/O source is ready for write operations.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
    pub fn is_read_only(self) -> bool { self.read && !self.write }
    pub fn is_write_only(self) -> bool { !self.read && self.write }
    pub fn is_read_write(self) -> bool { self.read && self.write }
}

impl ops::Not for IoType {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self {
            read: !self.read,
            write: !self.write,
        }
    }
}

impl Iterator for IoType {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        if self.write {
            self.write = false;
            Some(Io::Write)
        } else if self.read {
            self.read = false;
            Some(Io::Read)
        } else {
            None
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else if self.is_read_write() {
            f.write_str("read-write")
        } else if self.read {
            f.write_str("read")
        } else if self.write {
            f.write_str("write")
        } else {
            unreachable!()
        }
    }
}

/// Exceptional condition reported for a descriptor instead of plain readiness.
#[derive(Copy, Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection is absent (POSIX events {0:#b})
    Connectivity(i16),
    /// OS-level error (POSIX events {0:#b})
    Os(i16),
}

/// Readiness multiplexer contract.
///
/// [`Poll::poll`] blocks the calling thread until at least one registered
/// descriptor becomes ready or the timeout elapses; the ready subset is then
/// drained through the `Iterator` implementation. `None` timeout blocks
/// indefinitely; a zero timeout returns immediately with whatever is currently
/// ready. A wait interrupted by a transient signal is retried internally and
/// never surfaced to the caller.
pub trait Poll
where Self: Iterator<Item = (RawFd, Result<IoType, IoFail>)>
{
    fn register(&mut self, fd: &impl AsRawFd, interest: IoType);
    fn unregister(&mut self, fd: &impl AsRawFd);
    fn set_interest(&mut self, fd: &impl AsRawFd, interest: IoType) -> bool;

    /// # Returns
    ///
    /// Number of new events; zero with no error means the timeout elapsed.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;
}

/// Waits for readiness on a single descriptor without an event loop.
///
/// This is the synchronous code path used by the bounded-timeout connect, send
/// and receive operations on [`crate::Socket`]; it shares the multiplexer with
/// the event loop but performs no callback dispatch.
///
/// # Returns
///
/// Whether any event (including an exceptional condition) fired before the
/// timeout elapsed.
pub fn wait_io(fd: &impl AsRawFd, interest: IoType, timeout: Option<Duration>) -> io::Result<bool> {
    let mut poller = self::popol::Poller::new();
    poller.register(fd, interest);
    Ok(poller.poll(timeout)? > 0)
}
