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

//! Socket networking toolkit built from two layers: [`Socket`], a thin
//! owning wrapper around raw TCP socket system calls, and a single-threaded
//! callback-driven [`EventLoop`] multiplexing descriptor readiness across
//! registered [`Channel`]s.
//!
//! [`Connection`] and [`Listener`] combine both layers into non-blocking TCP
//! endpoints: connects, sends and receives never block, and completion is
//! reported through callbacks fired by the loop. For callers preferring to
//! wait in place, [`Socket`] offers synchronous variants bounded by a
//! timeout.
//!
//! Everything here is single-threaded: an event loop, its channels and the
//! connections on top of them belong to the thread running the loop, and no
//! type in this crate is `Send`.

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

#[macro_use]
extern crate amplify;

mod buffer;
mod channel;
mod connection;
mod error;
mod event_loop;
mod listener;
pub mod poller;
pub mod socket;

pub use buffer::Buffer;
pub use channel::Channel;
pub use connection::{Connection, State, READ_RESERVE};
pub use error::Error;
pub use event_loop::{EventHandler, EventLoop, LoopHandle, Status, WAIT_TIMEOUT};
pub use listener::Listener;
pub use socket::{ConnectStatus, Socket};
