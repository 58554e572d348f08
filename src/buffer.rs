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

/// Growable byte buffer with a sequential readable head and an append-only
/// writable tail.
///
/// Readable bytes (`[rpos..wpos)`) and writable spare capacity
/// (`[wpos..storage)`) are tracked separately; both cursors advance only by
/// explicit caller action ([`Buffer::consume`] and [`Buffer::advance_write`]).
/// Fully consumed storage is reclaimed before the buffer grows.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            data: Vec::new(),
            rpos: 0,
            wpos: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: vec![0; capacity],
            rpos: 0,
            wpos: 0,
        }
    }

    /// Number of unconsumed bytes in the readable head.
    pub fn readable(&self) -> usize { self.wpos - self.rpos }

    /// Number of bytes the writable tail can take without growing.
    pub fn writable(&self) -> usize { self.data.len() - self.wpos }

    pub fn is_empty(&self) -> bool { self.readable() == 0 }

    /// Unconsumed bytes, contiguous from the current read cursor.
    pub fn peek(&self) -> &[u8] { &self.data[self.rpos..self.wpos] }

    /// Advances the read cursor past `count` consumed bytes.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the readable byte count; consuming bytes that
    /// were never received is a caller contract violation.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.readable(), "consuming past the readable head of the buffer");
        self.rpos += count;
        if self.rpos == self.wpos {
            self.rpos = 0;
            self.wpos = 0;
        }
    }

    /// Discards all content, consumed and unconsumed alike.
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    /// Appends bytes to the writable tail, growing it as needed.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.data[self.wpos..self.wpos + bytes.len()].copy_from_slice(bytes);
        self.wpos += bytes.len();
    }

    /// Ensures at least `min` bytes of writable spare capacity, compacting the
    /// consumed head before allocating more storage.
    pub fn reserve(&mut self, min: usize) {
        if self.writable() >= min {
            return;
        }
        if self.rpos > 0 {
            self.data.copy_within(self.rpos..self.wpos, 0);
            self.wpos -= self.rpos;
            self.rpos = 0;
        }
        if self.data.len() - self.wpos < min {
            self.data.resize(self.wpos + min, 0);
        }
    }

    /// The writable spare tail, for single-call reads from a socket.
    pub fn writable_mut(&mut self) -> &mut [u8] { &mut self.data[self.wpos..] }

    /// Advances the write cursor past `count` bytes actually produced into
    /// [`Buffer::writable_mut`].
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the writable spare capacity.
    pub fn advance_write(&mut self, count: usize) {
        assert!(count <= self.writable(), "advancing past the writable tail of the buffer");
        self.wpos += count;
    }
}
