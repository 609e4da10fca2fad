// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Buffers addressed by schedule entries
//!
//! A `CclBuffer` is a cheap, cloneable view (`offset`, `len`) into shared
//! storage, like `buf + offset` on a raw pointer. Entries hold views into the
//! caller's buffers and the transport writes received bytes through them.
//! Clones of one storage are the in-process analogue of an IPC memory
//! handle: any holder can address the owner's memory directly.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{poisoned, CclError, CclResult};

/// Where the memory lives, as reported by the allocator that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    Host,
    Device,
}

/// Shared byte buffer with a window into it
#[derive(Clone)]
pub struct CclBuffer {
    storage: Arc<RwLock<Vec<u8>>>,
    offset: usize,
    len: usize,
    kind: MemKind,
}

impl CclBuffer {
    /// Allocate a zeroed host buffer
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Wrap existing bytes as a host buffer
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            storage: Arc::new(RwLock::new(data)),
            offset: 0,
            len,
            kind: MemKind::Host,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Allocate a zeroed buffer tagged as device memory
    pub fn new_device(len: usize) -> Self {
        Self::new(len).into_device()
    }

    pub fn into_device(mut self) -> Self {
        self.kind = MemKind::Device;
        self
    }

    /// Empty placeholder for ranks that contribute no local memory
    pub fn empty() -> Self {
        Self::new(0)
    }

    pub fn kind(&self) -> MemKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// View `len` bytes starting `offset` bytes into this view
    pub fn slice(&self, offset: usize, len: usize) -> CclResult<Self> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(CclError::invalid(format!(
                "buffer view [{}, +{}) exceeds buffer of {} bytes",
                offset, len, self.len
            )));
        }
        Ok(Self {
            storage: self.storage.clone(),
            offset: self.offset + offset,
            len,
            kind: self.kind,
        })
    }

    /// Whether both views point into the same allocation
    pub fn same_storage(&self, other: &CclBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Same storage and same window, i.e. `send_buf == recv_buf`
    pub fn is_same(&self, other: &CclBuffer) -> bool {
        self.same_storage(other) && self.offset == other.offset && self.len == other.len
    }

    fn read_guard(&self) -> CclResult<RwLockReadGuard<'_, Vec<u8>>> {
        self.storage.read().map_err(poisoned)
    }

    fn write_guard(&self) -> CclResult<RwLockWriteGuard<'_, Vec<u8>>> {
        self.storage.write().map_err(poisoned)
    }

    /// Copy the window out
    pub fn to_vec(&self) -> CclResult<Vec<u8>> {
        let guard = self.read_guard()?;
        Ok(guard[self.offset..self.offset + self.len].to_vec())
    }

    /// Overwrite the start of the window with `data`
    pub fn write(&self, data: &[u8]) -> CclResult<()> {
        if data.len() > self.len {
            return Err(CclError::invalid(format!(
                "write of {} bytes into a {} byte buffer",
                data.len(),
                self.len
            )));
        }
        let mut guard = self.write_guard()?;
        guard[self.offset..self.offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Run `f` over the window mutably
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> CclResult<R> {
        let mut guard = self.write_guard()?;
        Ok(f(&mut guard[self.offset..self.offset + self.len]))
    }

    /// Copy `min(src.len(), self.len())` bytes from `src`
    ///
    /// Overlapping views of one storage behave like `memmove`. Distinct storages
    /// are staged through a temporary so no two locks are held at once.
    pub fn copy_from(&self, src: &CclBuffer) -> CclResult<usize> {
        let n = src.len().min(self.len);
        if n == 0 {
            return Ok(0);
        }
        if self.same_storage(src) {
            let mut guard = self.write_guard()?;
            guard.copy_within(src.offset..src.offset + n, self.offset);
        } else {
            let data = {
                let guard = src.read_guard()?;
                guard[src.offset..src.offset + n].to_vec()
            };
            let mut guard = self.write_guard()?;
            guard[self.offset..self.offset + n].copy_from_slice(&data);
        }
        Ok(n)
    }
}

impl fmt::Debug for CclBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CclBuffer")
            .field("storage", &Arc::as_ptr(&self.storage))
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("kind", &self.kind)
            .finish()
    }
}
