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

//! Barrier-staged schedules
//!
//! A schedule is a list of entries cut into stages by barrier markers.
//! Entries of one stage progress concurrently; the entries of the next stage
//! are started only once every entry before the barrier is complete.

use std::sync::Arc;

use crate::buffer::CclBuffer;
use crate::coll::{AlgorithmTag, CollType};
use crate::data_types::{Datatype, ReduceOp};
use crate::error::CclResult;
use crate::net::{Communicator, MatchId, Primitive};
use crate::{ccl_error, ccl_trace};

use super::entry::{Entry, EntryKind, EntryStatus, NodeGroup};

enum SchedItem {
    Entry(Entry),
    Barrier,
}

/// Plan of one collective call on one communicator
pub struct Schedule {
    coll: CollType,
    algo: Option<AlgorithmTag>,
    comm: Arc<dyn Communicator>,
    match_id: MatchId,
    items: Vec<SchedItem>,
    /// Index of the first item of the stage in progress
    stage_start: usize,
    finished: bool,
}

impl Schedule {
    pub fn new(coll: CollType, comm: Arc<dyn Communicator>, match_id: MatchId) -> Self {
        Self {
            coll,
            algo: None,
            comm,
            match_id,
            items: Vec::new(),
            stage_start: 0,
            finished: false,
        }
    }

    pub fn coll(&self) -> CollType {
        self.coll
    }

    pub fn algorithm(&self) -> Option<AlgorithmTag> {
        self.algo
    }

    pub fn set_algorithm(&mut self, algo: AlgorithmTag) {
        self.algo = Some(algo);
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    /// Append an entry to the current stage
    pub fn add_entry(&mut self, kind: EntryKind) {
        let entry = Entry::new(kind, self.comm.clone(), self.match_id);
        self.items.push(SchedItem::Entry(entry));
    }

    /// Close the current stage
    ///
    /// Leading and repeated barriers are dropped since they would separate
    /// empty stages.
    pub fn add_barrier(&mut self) {
        if matches!(self.items.last(), Some(SchedItem::Entry(_))) {
            self.items.push(SchedItem::Barrier);
        }
    }

    pub fn add_send(&mut self, buf: CclBuffer, peer: usize) {
        self.add_entry(EntryKind::Transport {
            op: Primitive::Send { buf, peer },
            req: None,
        });
    }

    pub fn add_recv(&mut self, buf: CclBuffer, peer: usize) {
        self.add_entry(EntryKind::Transport {
            op: Primitive::Recv { buf, peer },
            req: None,
        });
    }

    /// Duplex exchange: send `send` to `dst` while receiving `recv` from `src`
    pub fn add_send_recv(&mut self, send: CclBuffer, dst: usize, recv: CclBuffer, src: usize) {
        self.add_entry(EntryKind::SendRecv {
            send,
            dst,
            recv,
            src,
            reqs: Vec::new(),
        });
    }

    /// Collective primitive executed by the transport
    pub fn add_primitive(&mut self, op: Primitive) {
        self.add_entry(EntryKind::Transport { op, req: None });
    }

    pub fn add_copy(&mut self, src: CclBuffer, dst: CclBuffer) {
        self.add_entry(EntryKind::Copy { src, dst });
    }

    pub fn add_reduce(&mut self, src: CclBuffer, dst: CclBuffer, dtype: Datatype, op: ReduceOp) {
        self.add_entry(EntryKind::Reduce { src, dst, dtype, op });
    }

    pub fn add_handle_exchange(&mut self, group: NodeGroup, handles: Vec<CclBuffer>) {
        self.add_entry(EntryKind::HandleExchange {
            group,
            handles,
            pending: None,
        });
    }

    pub fn add_peer_copy(
        &mut self,
        group: NodeGroup,
        peer: usize,
        handle_index: usize,
        local: CclBuffer,
        src_offset: usize,
        dst: CclBuffer,
    ) {
        self.add_entry(EntryKind::PeerCopy {
            group,
            peer,
            handle_index,
            local,
            src_offset,
            dst,
        });
    }

    pub fn add_node_barrier(&mut self, group: NodeGroup, release_handles: bool) {
        self.add_entry(EntryKind::NodeBarrier {
            group,
            release_handles,
            pending: None,
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.items.iter().filter_map(|item| match item {
            SchedItem::Entry(entry) => Some(entry),
            SchedItem::Barrier => None,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entries().count()
    }

    pub fn barrier_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, SchedItem::Barrier))
            .count()
    }

    /// Entry names with `|` marking barriers, e.g. `COPY | SEND RECV`
    pub fn layout(&self) -> String {
        self.items
            .iter()
            .map(|item| match item {
                SchedItem::Entry(entry) => entry.name(),
                SchedItem::Barrier => "|",
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_complete(&self) -> bool {
        self.finished
    }

    /// True if any entry arrives at a node-group barrier
    pub fn uses_node_sync(&self) -> bool {
        self.entries().any(|entry| {
            matches!(
                entry.kind(),
                EntryKind::HandleExchange { .. } | EntryKind::NodeBarrier { .. }
            )
        })
    }

    fn stage_end(&self) -> usize {
        self.items[self.stage_start..]
            .iter()
            .position(|item| matches!(item, SchedItem::Barrier))
            .map_or(self.items.len(), |pos| self.stage_start + pos)
    }

    /// Advance the schedule without blocking
    ///
    /// Starts and updates the entries of the current stage and moves on to
    /// the next stage as soon as the current one is complete. Returns true
    /// once every entry is complete.
    pub fn do_progress(&mut self) -> CclResult<bool> {
        if self.finished {
            return Ok(true);
        }
        loop {
            let end = self.stage_end();
            let mut stage_done = true;
            for item in &mut self.items[self.stage_start..end] {
                if let SchedItem::Entry(entry) = item {
                    let result = match entry.status() {
                        EntryStatus::NotStarted => entry.start().and_then(|_| entry.update()),
                        EntryStatus::Started => entry.update(),
                        EntryStatus::Complete => Ok(()),
                    };
                    if let Err(e) = result {
                        ccl_error!(
                            "schedule aborted: coll {}, algo {}, comm {}, rank {}, entry {}: {}",
                            self.coll,
                            self.algo.map_or("none", |a| a.name()),
                            self.comm.comm_id(),
                            self.comm.rank(),
                            entry.name(),
                            e
                        );
                        return Err(e);
                    }
                    stage_done &= entry.is_complete();
                }
            }
            if !stage_done {
                return Ok(false);
            }
            if end >= self.items.len() {
                ccl_trace!(
                    "schedule complete: coll {}, comm {}, rank {}, tag {}",
                    self.coll,
                    self.comm.comm_id(),
                    self.comm.rank(),
                    self.match_id
                );
                self.finished = true;
                return Ok(true);
            }
            self.stage_start = end + 1;
        }
    }

    /// Progress until complete, spinning between polls
    pub fn run(&mut self) -> CclResult<()> {
        while !self.do_progress()? {
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Multi-line description of every entry
    pub fn dump(&self) -> String {
        let mut out = format!(
            "schedule: coll {}, algo {}, comm {}, rank {}, tag {}\n",
            self.coll,
            self.algo.map_or("none", |a| a.name()),
            self.comm.comm_id(),
            self.comm.rank(),
            self.match_id
        );
        for item in &self.items {
            match item {
                SchedItem::Entry(entry) => {
                    out.push_str(&format!("  {}: {}\n", entry.name(), entry.dump()))
                }
                SchedItem::Barrier => out.push_str("  ---- barrier ----\n"),
            }
        }
        out
    }
}
