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

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::event_loop::{Action, EventHandler, LoopHandle};
use crate::poller::IoType;

/// Binding of one descriptor to a mutable interest mask and an
/// [`EventHandler`].
///
/// The channel does not own the descriptor; its lifetime is tied to the
/// component which registered it. All interest changes are forwarded to the
/// owning loop through the deferred-action queue and become visible only after
/// the current dispatch pass. A descriptor may be registered with at most one
/// event loop at a time; setting a new interest mask replaces the old one,
/// never appends.
pub struct Channel {
    fd: RawFd,
    interest: Cell<IoType>,
    alive: Rc<Cell<bool>>,
    handle: LoopHandle,
}

impl Channel {
    pub fn new(handle: LoopHandle, fd: RawFd) -> Self {
        Channel {
            fd,
            interest: Cell::new(IoType::none()),
            alive: Rc::new(Cell::new(true)),
            handle,
        }
    }

    pub fn fd(&self) -> RawFd { self.fd }

    pub fn interest(&self) -> IoType { self.interest.get() }

    /// Registers the channel with the loop, dispatching its events to
    /// `handler`.
    pub fn attach(&self, handler: Rc<RefCell<dyn EventHandler>>) {
        self.handle.push(Action::Register(
            self.fd,
            self.interest.get(),
            self.alive.clone(),
            handler,
        ));
    }

    /// Replaces the interest mask.
    pub fn set_interest(&self, interest: IoType) {
        self.interest.set(interest);
        self.handle.push(Action::SetInterest(self.fd, interest));
    }

    pub fn enable_reading(&self) {
        let mut interest = self.interest.get();
        interest.read = true;
        self.set_interest(interest);
    }

    pub fn disable_reading(&self) {
        let mut interest = self.interest.get();
        interest.read = false;
        self.set_interest(interest);
    }

    pub fn enable_writing(&self) {
        let mut interest = self.interest.get();
        interest.write = true;
        self.set_interest(interest);
    }

    pub fn disable_writing(&self) {
        let mut interest = self.interest.get();
        interest.write = false;
        self.set_interest(interest);
    }

    pub fn disable_all(&self) { self.set_interest(IoType::none()); }

    /// Deregisters the channel from its loop.
    ///
    /// Takes effect structurally after the current dispatch pass, but the
    /// channel is tombstoned synchronously: any event already in the ready set
    /// for this descriptor is ignored from this point on, which makes it safe
    /// to close the descriptor immediately afterwards.
    pub fn remove(&self) {
        if self.alive.replace(false) {
            self.handle.push(Action::Unregister(self.fd));
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) { self.remove(); }
}
