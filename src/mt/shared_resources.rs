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

//! Node-scoped state for peer-memory algorithms
//!
//! Every node group (identified by a small integer, the id of its node
//! communicator) owns one slot: a reusable barrier and a table of exchanged
//! memory handles keyed by exchange id and node rank. Slots are created on
//! first use and each one is guarded by its own mutex, so unrelated groups
//! never contend.
//!
//! Callers must use the same exchange id and participant count on every
//! rank of a group. A mismatch shows up as a barrier that never releases.

use std::sync::{Arc, Mutex, RwLock};

use hashbrown::HashMap;

use crate::buffer::CclBuffer;
use crate::error::{poisoned, CclError, CclResult};
use crate::net::Communicator;
use crate::{ccl_debug, ccl_trace};

use super::barrier::{NodeBarrier, ThreadBarrier};

/// Handle through which a peer's memory can be addressed directly
pub type MemHandle = CclBuffer;

/// How barriers of new groups are created
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierBackend {
    /// Ranks are threads of this process
    Thread,
    /// Ranks are processes meeting in POSIX shared memory; processes of one
    /// job pass the same session string and the same epoch, which must
    /// differ between jobs reusing a session
    #[cfg(all(unix, feature = "shm"))]
    Shm { session: Option<String>, epoch: u64 },
}

#[derive(Default)]
struct GroupState {
    barrier: Option<Arc<dyn NodeBarrier>>,
    hash_table: HashMap<u64, HashMap<usize, Vec<MemHandle>>>,
}

struct GroupSlot {
    state: Mutex<GroupState>,
}

/// Position of the caller in the node grid and the dimension its peers vary in
///
/// Node ranks are laid out as `node_rank = even_rank * pair_size + pair_rank`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddressing {
    /// Peers are indexed by node rank
    Node { rank: usize, size: usize },
    /// Peers are the ranks of the caller's even group (same pair position)
    Even {
        even_rank: usize,
        even_size: usize,
        pair_rank: usize,
        pair_size: usize,
    },
    /// Peers are the ranks of the caller's pair group (same card)
    Pair {
        even_rank: usize,
        pair_rank: usize,
        pair_size: usize,
    },
}

impl PeerAddressing {
    pub fn node(comm: &dyn Communicator) -> Self {
        PeerAddressing::Node {
            rank: comm.rank(),
            size: comm.size(),
        }
    }

    pub fn even(even: &dyn Communicator, pair: &dyn Communicator) -> Self {
        PeerAddressing::Even {
            even_rank: even.rank(),
            even_size: even.size(),
            pair_rank: pair.rank(),
            pair_size: pair.size(),
        }
    }

    pub fn pair(even: &dyn Communicator, pair: &dyn Communicator) -> Self {
        PeerAddressing::Pair {
            even_rank: even.rank(),
            pair_rank: pair.rank(),
            pair_size: pair.size(),
        }
    }

    /// Caller's index along the addressed dimension
    pub fn rank(&self) -> usize {
        match *self {
            PeerAddressing::Node { rank, .. } => rank,
            PeerAddressing::Even { even_rank, .. } => even_rank,
            PeerAddressing::Pair { pair_rank, .. } => pair_rank,
        }
    }

    /// Number of peers along the addressed dimension, the caller included
    pub fn size(&self) -> usize {
        match *self {
            PeerAddressing::Node { size, .. } => size,
            PeerAddressing::Even { even_size, .. } => even_size,
            PeerAddressing::Pair { pair_size, .. } => pair_size,
        }
    }

    /// Node rank of the peer at index `peer` along the addressed dimension
    pub fn node_rank_of(&self, peer: usize) -> usize {
        match *self {
            PeerAddressing::Node { .. } => peer,
            PeerAddressing::Even {
                pair_rank,
                pair_size,
                ..
            } => SharedResources::get_node_rank([peer, pair_rank], pair_size),
            PeerAddressing::Pair {
                even_rank,
                pair_size,
                ..
            } => SharedResources::get_node_rank([even_rank, peer], pair_size),
        }
    }
}

/// Handle tables and barriers of every node group seen by this process
pub struct SharedResources {
    backend: BarrierBackend,
    slots: RwLock<Vec<Option<Arc<GroupSlot>>>>,
}

impl Default for SharedResources {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedResources {
    /// Resources for ranks running as threads of this process
    pub fn new() -> Self {
        Self::with_backend(BarrierBackend::Thread)
    }

    pub fn with_backend(backend: BarrierBackend) -> Self {
        Self {
            backend,
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn backend(&self) -> &BarrierBackend {
        &self.backend
    }

    /// `ranks` is `[even_rank, pair_rank]`
    pub fn get_node_rank(ranks: [usize; 2], pair_size: usize) -> usize {
        ranks[0] * pair_size + ranks[1]
    }

    fn slot(&self, group_id: usize) -> CclResult<Arc<GroupSlot>> {
        {
            let slots = self.slots.read().map_err(poisoned)?;
            if let Some(Some(slot)) = slots.get(group_id) {
                return Ok(slot.clone());
            }
        }
        let mut slots = self.slots.write().map_err(poisoned)?;
        if slots.len() <= group_id {
            slots.resize_with(group_id + 1, || None);
        }
        let slot = slots[group_id].get_or_insert_with(|| {
            Arc::new(GroupSlot {
                state: Mutex::new(GroupState::default()),
            })
        });
        Ok(slot.clone())
    }

    #[cfg_attr(not(all(unix, feature = "shm")), allow(unused_variables))]
    fn make_barrier(&self, participants: usize, group_id: usize) -> CclResult<Arc<dyn NodeBarrier>> {
        match &self.backend {
            BarrierBackend::Thread => Ok(Arc::new(ThreadBarrier::new(participants)?)),
            #[cfg(all(unix, feature = "shm"))]
            BarrierBackend::Shm { session, epoch } => {
                let name =
                    crate::util::shm_segment_name("ccl-barrier", session.as_deref(), group_id);
                Ok(Arc::new(super::barrier::ShmBarrier::open(&name, participants, *epoch)?))
            }
        }
    }

    /// Barrier of `group_id`, created on first call
    ///
    /// The first caller decides the participant count; a later call with a
    /// different count is rejected.
    pub fn barrier(&self, participants: usize, group_id: usize) -> CclResult<Arc<dyn NodeBarrier>> {
        let slot = self.slot(group_id)?;
        let mut state = slot.state.lock().map_err(poisoned)?;
        if let Some(barrier) = &state.barrier {
            if barrier.participants() == participants {
                return Ok(barrier.clone());
            }
            return Err(CclError::Synchronization(format!(
                "barrier of group {} has {} participants, requested {}",
                group_id,
                barrier.participants(),
                participants
            )));
        }
        ccl_debug!(
            "init barrier: group {}, participants {}",
            group_id,
            participants
        );
        let barrier = self.make_barrier(participants, group_id)?;
        state.barrier = Some(barrier.clone());
        Ok(barrier)
    }

    /// Initialize the barrier of `group_id` if needed, then wait on it
    pub fn init_barrier(&self, participants: usize, group_id: usize) -> CclResult<()> {
        self.barrier(participants, group_id)?.wait()
    }

    pub fn is_initialized(&self, group_id: usize) -> CclResult<bool> {
        let slots = self.slots.read().map_err(poisoned)?;
        match slots.get(group_id) {
            Some(Some(slot)) => Ok(slot.state.lock().map_err(poisoned)?.barrier.is_some()),
            _ => Ok(false),
        }
    }

    /// Record `pointers` of `rank` under `exchange_id` without waiting
    pub fn publish(
        &self,
        group_id: usize,
        exchange_id: u64,
        rank: usize,
        pointers: Vec<MemHandle>,
    ) -> CclResult<()> {
        ccl_trace!(
            "publish: group {}, exchange {}, rank {}, {} handles",
            group_id,
            exchange_id,
            rank,
            pointers.len()
        );
        let slot = self.slot(group_id)?;
        let mut state = slot.state.lock().map_err(poisoned)?;
        state
            .hash_table
            .entry(exchange_id)
            .or_default()
            .insert(rank, pointers);
        Ok(())
    }

    /// Record `pointers` of `rank` and wait until every member of the group did
    ///
    /// The group's barrier must have been set up by `init_barrier`.
    pub fn exchange(
        &self,
        group_id: usize,
        exchange_id: u64,
        rank: usize,
        pointers: Vec<MemHandle>,
    ) -> CclResult<()> {
        let barrier = {
            let slot = self.slot(group_id)?;
            let state = slot.state.lock().map_err(poisoned)?;
            state.barrier.clone().ok_or_else(|| {
                CclError::Synchronization(format!(
                    "exchange on group {} before its barrier was initialized",
                    group_id
                ))
            })?
        };
        self.publish(group_id, exchange_id, rank, pointers)?;
        barrier.wait()
    }

    /// Handles published by every peer along `addressing`, indexed by peer
    ///
    /// The caller's own slot holds `local`. Peers that did not publish under
    /// `exchange_id` are left as `None`.
    pub fn get_remote_pointers(
        &self,
        group_id: usize,
        exchange_id: u64,
        addressing: &PeerAddressing,
        handle_index: usize,
        local: &MemHandle,
    ) -> CclResult<Vec<Option<MemHandle>>> {
        let rank = addressing.rank();
        let size = addressing.size();
        let mut remote: Vec<Option<MemHandle>> = vec![None; size];
        remote[rank] = Some(local.clone());

        let slot = self.slot(group_id)?;
        let state = slot.state.lock().map_err(poisoned)?;
        let table = match state.hash_table.get(&exchange_id) {
            Some(table) => table,
            None => return Ok(remote),
        };

        for i in 1..size {
            let peer = (rank + i) % size;
            let peer_node_rank = addressing.node_rank_of(peer);
            if let Some(handles) = table.get(&peer_node_rank) {
                let handle = handles.get(handle_index).ok_or_else(|| {
                    CclError::invalid(format!(
                        "handle index {} out of range, node rank {} published {} handles",
                        handle_index,
                        peer_node_rank,
                        handles.len()
                    ))
                })?;
                remote[peer] = Some(handle.clone());
            }
        }
        Ok(remote)
    }

    /// Drop the handles `rank` published under `exchange_id`
    pub fn release(&self, group_id: usize, exchange_id: u64, rank: usize) -> CclResult<()> {
        let slot = self.slot(group_id)?;
        let mut state = slot.state.lock().map_err(poisoned)?;
        if let Some(table) = state.hash_table.get_mut(&exchange_id) {
            table.remove(&rank);
            if table.is_empty() {
                state.hash_table.remove(&exchange_id);
            }
        }
        Ok(())
    }

    /// Number of exchanges of `group_id` still holding handles
    pub fn pending_exchanges(&self, group_id: usize) -> CclResult<usize> {
        let slots = self.slots.read().map_err(poisoned)?;
        match slots.get(group_id) {
            Some(Some(slot)) => Ok(slot.state.lock().map_err(poisoned)?.hash_table.len()),
            _ => Ok(0),
        }
    }

    /// Drop every group: handle tables and barriers
    pub fn finalize(&self) -> CclResult<()> {
        let mut slots = self.slots.write().map_err(poisoned)?;
        ccl_debug!("finalize shared resources: {} group slots", slots.len());
        slots.clear();
        Ok(())
    }
}
