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

//! Single-threaded callback-driven event loop multiplexing many non-blocking
//! sockets.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::poller::{Io, IoFail, IoType, Poll};
use crate::poller::popol::Poller;
use crate::Error;

/// Maximum amount of time one poll pass waits for I/O when no shorter timeout
/// is configured.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Capability interface dispatched by the event loop for a ready descriptor.
///
/// Implemented per component (listeners, connections); registered by handle
/// with the loop through [`crate::Channel::attach`]. Within one dispatch pass
/// the fixed per-descriptor order is error, then write, then read.
pub trait EventHandler {
    fn on_readable(&mut self) {}
    fn on_writable(&mut self) {}
    fn on_error(&mut self, fail: IoFail) {
        let _ = fail;
    }
}

/// Deferred channel-set mutation raised from within a callback (or before the
/// loop starts) and applied only after the current dispatch pass completes.
#[derive(Display)]
pub(crate) enum Action {
    #[display("register({0}, {1})")]
    Register(RawFd, IoType, Rc<Cell<bool>>, Rc<RefCell<dyn EventHandler>>),

    #[display("set_interest({0}, {1})")]
    SetInterest(RawFd, IoType),

    #[display("unregister({0})")]
    Unregister(RawFd),
}

/// Cheap cloneable handle onto an [`EventLoop`], usable from inside callbacks.
///
/// Carries the deferred-action queue and the stop flag; registering a channel,
/// changing its interest or removing it through this handle never invalidates
/// the ready set the loop is currently iterating.
#[derive(Clone, Default)]
pub struct LoopHandle {
    queue: Rc<RefCell<VecDeque<Action>>>,
    stopping: Rc<Cell<bool>>,
}

impl LoopHandle {
    pub(crate) fn push(&self, action: Action) {
        log::trace!(target: "event-loop", "Queueing deferred action {action}");
        self.queue.borrow_mut().push_back(action);
    }

    /// Requests the loop to stop; takes effect at the start of the next
    /// iteration, never mid-dispatch, so every callback already begun
    /// completes.
    pub fn stop(&self) { self.stopping.set(true); }

    pub(crate) fn is_stopping(&self) -> bool { self.stopping.get() }
}

/// Event loop lifecycle: `Idle → Running → Stopped`, with `Stopped` terminal.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum Status {
    #[display("idle")]
    Idle,
    #[display("running")]
    Running,
    #[display("stopped")]
    Stopped,
}

struct Registration {
    interest: IoType,
    alive: Rc<Cell<bool>>,
    handler: Rc<RefCell<dyn EventHandler>>,
}

/// Single-threaded reactor owning a collection of channels keyed by
/// descriptor.
///
/// Each iteration of [`EventLoop::run`] asks the multiplexer for ready
/// descriptors and invokes the matching handler callbacks in readiness order;
/// callback-driven mutation of the channel set is deferred to the end of the
/// pass. The loop is the only driver of all asynchronous behavior: no
/// component spawns threads, and every channel registered here is only ever
/// touched from the thread calling `run`.
pub struct EventLoop<P: Poll = Poller> {
    poller: P,
    channels: HashMap<RawFd, Registration>,
    handle: LoopHandle,
    status: Status,
    timeout: Option<Duration>,
}

impl EventLoop<Poller> {
    /// Creates a loop backed by the default poll(2) multiplexer.
    pub fn new() -> Self { Self::with_poller(Poller::new()) }
}

impl Default for EventLoop<Poller> {
    fn default() -> Self { EventLoop::new() }
}

impl<P: Poll> EventLoop<P> {
    pub fn with_poller(poller: P) -> Self {
        EventLoop {
            poller,
            channels: empty!(),
            handle: LoopHandle::default(),
            status: Status::Idle,
            timeout: Some(WAIT_TIMEOUT),
        }
    }

    /// The handle components use to register channels and to stop the loop.
    pub fn handle(&self) -> LoopHandle { self.handle.clone() }

    pub fn status(&self) -> Status { self.status }

    /// Number of registered channels.
    pub fn len(&self) -> usize { self.channels.len() }

    pub fn is_empty(&self) -> bool { self.channels.is_empty() }

    /// Sets the per-iteration poll timeout; `None` blocks each pass
    /// indefinitely until an event arrives.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) { self.timeout = timeout; }

    /// Requests the loop to stop at the next iteration boundary.
    pub fn stop(&self) { self.handle.stop(); }

    /// Runs the loop until explicitly stopped.
    ///
    /// Escalates only multiplexer failures; a single misbehaving channel
    /// cannot abort the loop or affect its siblings.
    ///
    /// # Panics
    ///
    /// Panics when called on a loop that is already running or was stopped:
    /// `Stopped` is a terminal state.
    pub fn run(&mut self) -> Result<(), Error> {
        match self.status {
            Status::Idle => {}
            Status::Running => panic!("event loop run() is not re-entrant"),
            Status::Stopped => panic!("a stopped event loop cannot be run again"),
        }
        self.status = Status::Running;
        log::debug!(target: "event-loop", "Entering event loop");

        // Registrations queued before the loop started.
        self.drain_actions();

        loop {
            if self.handle.is_stopping() {
                break;
            }

            for (fd, reg) in &self.channels {
                if reg.alive.get() {
                    self.poller.set_interest(fd, reg.interest);
                }
            }

            // Blocking
            log::trace!(target: "event-loop", "Polling {} channels with timeout {:?}",
                self.channels.len(), self.timeout);

            match self.poller.poll(self.timeout) {
                Ok(0) => {
                    log::trace!(target: "event-loop", "Poll timeout; no I/O events had happened");
                }
                Ok(_) => {}
                Err(err) => {
                    log::error!(target: "event-loop", "Error during polling: {err}");
                    self.status = Status::Stopped;
                    return Err(Error::Io(err));
                }
            }

            self.dispatch();
            self.drain_actions();
        }

        self.status = Status::Stopped;
        log::debug!(target: "event-loop", "Event loop stopped");
        Ok(())
    }

    /// Invokes handler callbacks for every ready descriptor reported by the
    /// poller, in the fixed error-write-read order per descriptor.
    fn dispatch(&mut self) {
        while let Some((fd, res)) = self.poller.next() {
            let Some(reg) = self.channels.get(&fd) else {
                panic!("descriptor {fd} in the poll set is not registered with the event loop");
            };
            if !reg.alive.get() {
                // Removed synchronously earlier in this pass; its remaining
                // events must be ignored.
                log::trace!(target: "event-loop", "Skipping event for removed channel {fd}");
                continue;
            }
            let handler = reg.handler.clone();
            let alive = reg.alive.clone();
            let interest = reg.interest;

            match res {
                Err(fail) => {
                    log::trace!(target: "event-loop", "Channel {fd} failed: {fail}");
                    handler.borrow_mut().on_error(fail);
                }
                Ok(ev) => {
                    log::trace!(target: "event-loop", "Got `{ev}` event for channel {fd}");
                    let fired = IoType {
                        read: ev.read && interest.read,
                        write: ev.write && interest.write,
                    };
                    for io in fired {
                        if !alive.get() {
                            break;
                        }
                        match io {
                            Io::Write => handler.borrow_mut().on_writable(),
                            Io::Read => handler.borrow_mut().on_readable(),
                        }
                    }
                }
            }
        }
    }

    /// Applies queued channel-set mutations, in request order.
    fn drain_actions(&mut self) {
        loop {
            let action = self.handle.queue.borrow_mut().pop_front();
            let Some(action) = action else { break };
            log::trace!(target: "event-loop", "Applying deferred action {action}");

            match action {
                Action::Register(fd, interest, alive, handler) => {
                    if self.channels.contains_key(&fd) {
                        panic!("descriptor {fd} is registered with the event loop twice");
                    }
                    self.poller.register(&fd, interest);
                    self.channels.insert(fd, Registration {
                        interest,
                        alive,
                        handler,
                    });
                }
                Action::SetInterest(fd, interest) => match self.channels.get_mut(&fd) {
                    Some(reg) if reg.alive.get() => reg.interest = interest,
                    _ => {
                        log::warn!(target: "event-loop",
                            "Interest change for unregistered channel {fd} discarded")
                    }
                },
                Action::Unregister(fd) => {
                    if self.channels.remove(&fd).is_some() {
                        self.poller.unregister(&fd);
                    } else {
                        log::warn!(target: "event-loop", "Unregistering non-registered channel {fd}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use super::*;
    use crate::Channel;

    struct Ticker {
        channel: Channel,
        hits: Rc<Cell<u32>>,
        handle: LoopHandle,
    }

    impl EventHandler for Ticker {
        fn on_writable(&mut self) {
            self.hits.set(self.hits.get() + 1);
            if self.hits.get() == 3 {
                self.channel.remove();
                self.handle.stop();
            }
        }
    }

    fn udp_ticker(eloop: &EventLoop, hits: Rc<Cell<u32>>) -> (UdpSocket, Rc<RefCell<Ticker>>) {
        use std::os::unix::io::AsRawFd;

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let handle = eloop.handle();
        let channel = Channel::new(handle.clone(), udp.as_raw_fd());
        let ticker = Rc::new(RefCell::new(Ticker {
            channel,
            hits,
            handle,
        }));
        ticker.borrow().channel.attach(ticker.clone());
        ticker.borrow().channel.enable_writing();
        (udp, ticker)
    }

    #[test]
    fn stop_takes_effect_at_iteration_boundary() {
        let mut eloop = EventLoop::new();
        let hits = Rc::new(Cell::new(0));
        let (_udp, _ticker) = udp_ticker(&eloop, hits.clone());

        eloop.run().unwrap();

        // The third callback requested the stop and still ran to completion.
        assert_eq!(hits.get(), 3);
        assert_eq!(eloop.status(), Status::Stopped);
    }

    #[test]
    fn removal_is_applied_after_the_pass() {
        let mut eloop = EventLoop::new();
        let hits = Rc::new(Cell::new(0));
        let (_udp, _ticker) = udp_ticker(&eloop, hits.clone());

        assert_eq!(eloop.len(), 0, "registration is deferred until the loop drains its queue");
        eloop.run().unwrap();
        assert_eq!(eloop.len(), 0, "channel removed itself before stopping the loop");
    }

    struct Spawner {
        channel: Channel,
        keep: Option<UdpSocket>,
        spawned: Option<Rc<RefCell<Ticker>>>,
        hits: Rc<Cell<u32>>,
        handle: LoopHandle,
    }

    impl EventHandler for Spawner {
        fn on_writable(&mut self) {
            use std::os::unix::io::AsRawFd;

            let udp = self.keep.as_ref().expect("dispatched after removing own channel");
            // Register a second channel from within a callback; it must not
            // be dispatched within this same pass.
            assert_eq!(self.hits.get(), 0);
            let channel = Channel::new(self.handle.clone(), udp.as_raw_fd());
            let ticker = Rc::new(RefCell::new(Ticker {
                channel,
                hits: self.hits.clone(),
                handle: self.handle.clone(),
            }));
            ticker.borrow().channel.attach(ticker.clone());
            ticker.borrow().channel.enable_writing();
            self.spawned = Some(ticker);
            self.channel.remove();
        }
    }

    #[test]
    fn callbacks_can_mutate_the_channel_set() {
        let mut eloop = EventLoop::new();
        let hits = Rc::new(Cell::new(0));

        let udp_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let udp_b = UdpSocket::bind("127.0.0.1:0").unwrap();

        use std::os::unix::io::AsRawFd;
        let handle = eloop.handle();
        let channel = Channel::new(handle.clone(), udp_a.as_raw_fd());
        let spawner = Rc::new(RefCell::new(Spawner {
            channel,
            keep: Some(udp_b),
            spawned: None,
            hits: hits.clone(),
            handle,
        }));
        spawner.borrow().channel.attach(spawner.clone());
        spawner.borrow().channel.enable_writing();

        eloop.run().unwrap();
        assert_eq!(hits.get(), 3, "the channel registered from a callback was dispatched");
    }

    #[test]
    #[should_panic(expected = "cannot be run again")]
    fn stopped_is_terminal() {
        let mut eloop = EventLoop::new();
        let hits = Rc::new(Cell::new(0));
        let (_udp, _ticker) = udp_ticker(&eloop, hits);
        eloop.run().unwrap();
        eloop.run().unwrap();
    }
}
