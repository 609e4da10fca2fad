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

//! Reusable node barriers
//!
//! A barrier counts arrivals and bumps a generation counter when the last
//! participant arrives. `arrive` hands back the generation the caller joined,
//! so schedule entries can poll `is_released` instead of blocking, while
//! `wait` gives the blocking join used by `SharedResources::init_barrier`.

use std::sync::{Condvar, Mutex};

use crate::error::{poisoned, CclError, CclResult};

/// Generation a participant joined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarrierTicket(pub u64);

/// Barrier shared by the ranks of one node group
pub trait NodeBarrier: Send + Sync {
    fn participants(&self) -> usize;

    /// Register the caller's arrival without waiting
    fn arrive(&self) -> CclResult<BarrierTicket>;

    /// True once every participant arrived for `ticket`'s generation
    fn is_released(&self, ticket: BarrierTicket) -> CclResult<bool>;

    /// Arrive and block until released
    fn wait(&self) -> CclResult<()> {
        let ticket = self.arrive()?;
        while !self.is_released(ticket)? {
            std::thread::yield_now();
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ThreadBarrierState {
    arrived: usize,
    generation: u64,
}

/// Barrier for ranks that are threads of one process
#[derive(Debug)]
pub struct ThreadBarrier {
    participants: usize,
    state: Mutex<ThreadBarrierState>,
    released: Condvar,
}

impl ThreadBarrier {
    pub fn new(participants: usize) -> CclResult<Self> {
        if participants == 0 {
            return Err(CclError::invalid("barrier needs at least one participant"));
        }
        Ok(Self {
            participants,
            state: Mutex::new(ThreadBarrierState::default()),
            released: Condvar::new(),
        })
    }
}

impl NodeBarrier for ThreadBarrier {
    fn participants(&self) -> usize {
        self.participants
    }

    fn arrive(&self) -> CclResult<BarrierTicket> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let ticket = BarrierTicket(state.generation);
        state.arrived += 1;
        if state.arrived == self.participants {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
        }
        Ok(ticket)
    }

    fn is_released(&self, ticket: BarrierTicket) -> CclResult<bool> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state.generation > ticket.0)
    }

    fn wait(&self) -> CclResult<()> {
        let ticket = self.arrive()?;
        let mut state = self.state.lock().map_err(poisoned)?;
        while state.generation <= ticket.0 {
            state = self.released.wait(state).map_err(poisoned)?;
        }
        Ok(())
    }
}

#[cfg(all(unix, feature = "shm"))]
pub use self::shm::ShmBarrier;

#[cfg(all(unix, feature = "shm"))]
mod shm {
    use std::ffi::CString;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::{BarrierTicket, NodeBarrier};
    use crate::error::{CclError, CclResult};
    use crate::{ccl_debug, ccl_warn};

    const MAGIC: u64 = 0x4343_4c42_4152_5232;

    /// Layout of the shared segment
    #[repr(C)]
    struct SegmentState {
        magic: AtomicU64,
        epoch: AtomicU64,
        participants: AtomicU64,
        attached: AtomicU64,
        arrived: AtomicU64,
        generation: AtomicU64,
    }

    const SEGMENT_SIZE: usize = std::mem::size_of::<SegmentState>();

    /// Barrier living in a POSIX shared-memory segment, usable across processes
    ///
    /// The first process to open a name creates and initializes the segment
    /// and stamps it with the job's `epoch`. Later openers wait for
    /// initialization and must agree on both the epoch and the participant
    /// count. A segment carrying another epoch was left behind by an earlier
    /// job that never detached; it is rejected rather than joined, and can be
    /// removed with [`ShmBarrier::unlink`].
    ///
    /// Every handle counts itself in the segment while attached and the last
    /// one to drop unlinks the name, so participants may open in any order as
    /// long as one of them is still attached. An opener arriving after all
    /// others detached creates a fresh segment.
    pub struct ShmBarrier {
        name: String,
        state: *mut SegmentState,
        participants: usize,
        epoch: u64,
        creator: bool,
    }

    // the segment only holds atomics
    unsafe impl Send for ShmBarrier {}
    unsafe impl Sync for ShmBarrier {}

    impl ShmBarrier {
        pub fn open(name: &str, participants: usize, epoch: u64) -> CclResult<Self> {
            if participants == 0 {
                return Err(CclError::invalid("barrier needs at least one participant"));
            }
            let cname = segment_cname(name)?;

            let (fd, creator) = unsafe {
                let fd = libc::shm_open(
                    cname.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o600 as libc::mode_t,
                );
                if fd >= 0 {
                    (fd, true)
                } else {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EEXIST) {
                        return Err(err.into());
                    }
                    let fd = libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o600 as libc::mode_t);
                    if fd < 0 {
                        return Err(std::io::Error::last_os_error().into());
                    }
                    (fd, false)
                }
            };

            let mapped = Self::map(fd, creator);
            unsafe {
                libc::close(fd);
            }
            let state = match mapped {
                Ok(state) => state,
                Err(e) => {
                    if creator {
                        unsafe {
                            libc::shm_unlink(cname.as_ptr());
                        }
                    }
                    return Err(e);
                }
            };

            if creator {
                let shared = unsafe { &*state };
                shared.epoch.store(epoch, Ordering::Relaxed);
                shared.participants.store(participants as u64, Ordering::Relaxed);
                shared.attached.store(1, Ordering::Relaxed);
                shared.arrived.store(0, Ordering::Relaxed);
                shared.generation.store(0, Ordering::Relaxed);
                shared.magic.store(MAGIC, Ordering::Release);
                ccl_debug!(
                    "created shm barrier {} for {} participants, epoch {}",
                    name,
                    participants,
                    epoch
                );
            } else if let Err(e) = Self::check_existing(name, state, participants, epoch) {
                unsafe {
                    libc::munmap(state as *mut libc::c_void, SEGMENT_SIZE);
                }
                return Err(e);
            }

            Ok(Self {
                name: name.to_string(),
                state,
                participants,
                epoch,
                creator,
            })
        }

        /// Remove a segment name, typically one left behind by a crashed job
        ///
        /// Handles that are still attached keep working on the old segment.
        pub fn unlink(name: &str) -> CclResult<()> {
            let cname = segment_cname(name)?;
            if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            ccl_debug!("unlinked shm barrier {}", name);
            Ok(())
        }

        /// Validate a segment created by someone else and attach to it
        fn check_existing(
            name: &str,
            state: *mut SegmentState,
            participants: usize,
            epoch: u64,
        ) -> CclResult<()> {
            let shared = unsafe { &*state };
            while shared.magic.load(Ordering::Acquire) != MAGIC {
                std::thread::yield_now();
            }
            let existing_epoch = shared.epoch.load(Ordering::Relaxed);
            if existing_epoch != epoch {
                return Err(CclError::Synchronization(format!(
                    "shm barrier {} belongs to epoch {}, opened for epoch {}; unlink the stale segment first",
                    name, existing_epoch, epoch
                )));
            }
            let existing = shared.participants.load(Ordering::Relaxed) as usize;
            if existing != participants {
                return Err(CclError::Synchronization(format!(
                    "shm barrier {} was created for {} participants, opened for {}",
                    name, existing, participants
                )));
            }
            shared.attached.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        fn map(fd: libc::c_int, creator: bool) -> CclResult<*mut SegmentState> {
            unsafe {
                if creator {
                    if libc::ftruncate(fd, SEGMENT_SIZE as libc::off_t) != 0 {
                        return Err(std::io::Error::last_os_error().into());
                    }
                } else {
                    // the creator may not have sized the segment yet
                    loop {
                        let mut st: libc::stat = std::mem::zeroed();
                        if libc::fstat(fd, &mut st) != 0 {
                            return Err(std::io::Error::last_os_error().into());
                        }
                        if st.st_size as usize >= SEGMENT_SIZE {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
                let ptr = libc::mmap(
                    std::ptr::null_mut(),
                    SEGMENT_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    return Err(std::io::Error::last_os_error().into());
                }
                Ok(ptr as *mut SegmentState)
            }
        }

        fn shared(&self) -> &SegmentState {
            unsafe { &*self.state }
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        pub fn epoch(&self) -> u64 {
            self.epoch
        }

        /// True if this handle created the segment
        pub fn is_creator(&self) -> bool {
            self.creator
        }

        /// Handles currently attached to the segment, across processes
        pub fn attached(&self) -> usize {
            self.shared().attached.load(Ordering::Acquire) as usize
        }
    }

    fn segment_cname(name: &str) -> CclResult<CString> {
        CString::new(name).map_err(|_| CclError::invalid(format!("invalid segment name {}", name)))
    }

    impl NodeBarrier for ShmBarrier {
        fn participants(&self) -> usize {
            self.participants
        }

        fn arrive(&self) -> CclResult<BarrierTicket> {
            let shared = self.shared();
            let generation = shared.generation.load(Ordering::Acquire);
            let arrived = shared.arrived.fetch_add(1, Ordering::AcqRel) + 1;
            if arrived as usize == self.participants {
                shared.arrived.store(0, Ordering::Relaxed);
                shared.generation.fetch_add(1, Ordering::Release);
            }
            Ok(BarrierTicket(generation))
        }

        fn is_released(&self, ticket: BarrierTicket) -> CclResult<bool> {
            Ok(self.shared().generation.load(Ordering::Acquire) > ticket.0)
        }
    }

    impl Drop for ShmBarrier {
        fn drop(&mut self) {
            let last = self.shared().attached.fetch_sub(1, Ordering::AcqRel) == 1;
            unsafe {
                libc::munmap(self.state as *mut libc::c_void, SEGMENT_SIZE);
            }
            if last {
                if let Err(e) = Self::unlink(&self.name) {
                    ccl_warn!("failed to unlink shm barrier {}: {}", self.name, e);
                }
            }
        }
    }
}
