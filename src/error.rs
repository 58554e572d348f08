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

use std::io;

use crate::poller::IoFail;

/// Errors reported by the socket toolkit.
///
/// Transient conditions (interrupted syscalls, would-block results) never
/// appear here: they are retried in place or reported as "not ready" through
/// `Option` returns. An error value always means the operation failed for
/// real.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// OS-level I/O error: {0}
    #[from]
    Io(io::Error),

    /// connect attempt failed: {0}
    ConnectFailed(io::Error),

    /// operation timed out
    TimedOut,

    /// connection lost: {0}
    Disconnected(IoFail),

    /// connection is not in a state which accepts data
    NotConnected,
}
