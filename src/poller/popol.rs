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

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::poller::{IoFail, IoType, Poll};

/// Manager for a set of descriptors multiplexed for readiness by the
/// [`popol`] library (a poll(2) wrapper).
pub struct Poller {
    poll: popol::Sources<RawFd>,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            poll: popol::Sources::new(),
            events: empty!(),
        }
    }
}

impl Default for Poller {
    fn default() -> Self { Poller::new() }
}

impl Poll for Poller {
    fn register(&mut self, fd: &impl AsRawFd, interest: IoType) {
        log::trace!(target: "poller", "Registering {}", fd.as_raw_fd());
        self.poll.register(fd.as_raw_fd(), fd, interest.into());
    }

    fn unregister(&mut self, fd: &impl AsRawFd) {
        log::trace!(target: "poller", "Unregistering {}", fd.as_raw_fd());
        self.poll.unregister(&fd.as_raw_fd());
    }

    fn set_interest(&mut self, fd: &impl AsRawFd, interest: IoType) -> bool {
        let fd = fd.as_raw_fd();
        log::trace!(target: "poller", "Setting interest `{interest}` on {}", fd);

        self.poll.unset(&fd, (!interest).into());
        self.poll.set(&fd, interest.into())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.events.len();
        let deadline = timeout.map(|t| Instant::now() + t);

        log::trace!(target: "poller",
            "Polling {} descriptors with timeout {timeout:?} (pending event queue is {len})",
            self.poll.len(),
        );

        // Blocking call; interruption by a signal means the wait made no
        // progress, so it is retried with the remaining timeout budget.
        let mut fired = Vec::new();
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut fired, remaining) {
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    log::trace!(target: "poller", "Poll timed out with zero events generated");
                    return Ok(0);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    if matches!(deadline, Some(d) if Instant::now() >= d) {
                        return Ok(0);
                    }
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        for ev in fired {
            let fd = ev.key;
            let res = if ev.is_hangup() {
                Err(IoFail::Connectivity(ev.raw_events()))
            } else if ev.is_error() {
                Err(IoFail::Os(ev.raw_events()))
            } else {
                Ok(IoType {
                    read: ev.is_readable(),
                    write: ev.is_writable(),
                })
            };
            log::trace!(target: "poller", "Got `{res:?}` for {fd}");
            self.events.push_back((fd, res))
        }

        log::trace!(target: "poller", "Poll resulted in {} new event(s)", self.events.len() - len);

        Ok(self.events.len() - len)
    }
}

impl Iterator for Poller {
    type Item = (RawFd, Result<IoType, IoFail>);

    fn next(&mut self) -> Option<Self::Item> { self.events.pop_front() }
}

impl From<IoType> for popol::Interest {
    fn from(ev: IoType) -> Self {
        let mut e = popol::interest::NONE;
        if ev.read {
            e |= popol::interest::READ;
        }
        if ev.write {
            e |= popol::interest::WRITE;
        }
        e
    }
}
