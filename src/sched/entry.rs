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

//! Schedule entries
//!
//! An entry is one primitive step of a collective. `start` issues it and
//! `update` checks on it; neither blocks. Local steps (copy, reduce, peer
//! copy) finish inside `start`. Any failure is returned as-is and aborts the
//! owning schedule.

use std::fmt;
use std::sync::Arc;

use crate::buffer::CclBuffer;
use crate::comp;
use crate::data_types::{Datatype, ReduceOp};
use crate::error::{CclError, CclResult};
use crate::mt::{BarrierTicket, NodeBarrier, PeerAddressing, SharedResources};
use crate::net::{Communicator, MatchId, Primitive, RequestId, RequestStatus};
use crate::{ccl_error, ccl_trace};

/// Lifecycle of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    NotStarted,
    Started,
    Complete,
}

/// Node group whose shared resources an entry uses
#[derive(Clone)]
pub struct NodeGroup {
    pub resources: Arc<SharedResources>,
    pub group_id: usize,
    /// Caller's node rank
    pub rank: usize,
    pub size: usize,
    /// Key of the handle exchange inside the group
    pub exchange_id: u64,
}

impl NodeGroup {
    /// Group formed by `node_comm`, exchanging under `exchange_id`
    pub fn new(resources: Arc<SharedResources>, node_comm: &dyn Communicator, exchange_id: u64) -> Self {
        Self {
            resources,
            group_id: node_comm.comm_id().0,
            rank: node_comm.rank(),
            size: node_comm.size(),
            exchange_id,
        }
    }

    fn arrive(&self) -> CclResult<(Arc<dyn NodeBarrier>, BarrierTicket)> {
        let barrier = self.resources.barrier(self.size, self.group_id)?;
        let ticket = barrier.arrive()?;
        Ok((barrier, ticket))
    }
}

impl fmt::Debug for NodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeGroup")
            .field("group_id", &self.group_id)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("exchange_id", &self.exchange_id)
            .finish()
    }
}

/// What an entry does
pub enum EntryKind {
    /// Primitive issued through the schedule communicator's transport
    Transport {
        op: Primitive,
        req: Option<RequestId>,
    },
    /// Send and receive issued together and completed together
    SendRecv {
        send: CclBuffer,
        dst: usize,
        recv: CclBuffer,
        src: usize,
        reqs: Vec<RequestId>,
    },
    Copy {
        src: CclBuffer,
        dst: CclBuffer,
    },
    /// `dst = op(dst, src)`
    Reduce {
        src: CclBuffer,
        dst: CclBuffer,
        dtype: Datatype,
        op: ReduceOp,
    },
    /// Publish local handles to the node group and wait for every peer's
    HandleExchange {
        group: NodeGroup,
        handles: Vec<CclBuffer>,
        pending: Option<(Arc<dyn NodeBarrier>, BarrierTicket)>,
    },
    /// Copy `len` bytes at `src_offset` of a peer's exchanged handle into `dst`
    PeerCopy {
        group: NodeGroup,
        peer: usize,
        handle_index: usize,
        local: CclBuffer,
        src_offset: usize,
        dst: CclBuffer,
    },
    /// Node-group barrier, optionally dropping this rank's exchanged handles
    NodeBarrier {
        group: NodeGroup,
        release_handles: bool,
        pending: Option<(Arc<dyn NodeBarrier>, BarrierTicket)>,
    },
}

/// One step of a schedule
pub struct Entry {
    kind: EntryKind,
    status: EntryStatus,
    comm: Arc<dyn Communicator>,
    tag: MatchId,
}

impl Entry {
    pub fn new(kind: EntryKind, comm: Arc<dyn Communicator>, tag: MatchId) -> Self {
        Self {
            kind,
            status: EntryStatus::NotStarted,
            comm,
            tag,
        }
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn is_complete(&self) -> bool {
        self.status == EntryStatus::Complete
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            EntryKind::Transport { op, .. } => op.name(),
            EntryKind::SendRecv { .. } => "SEND_RECV",
            EntryKind::Copy { .. } => "COPY",
            EntryKind::Reduce { .. } => "REDUCE_LOCAL",
            EntryKind::HandleExchange { .. } => "HANDLE_EXCHANGE",
            EntryKind::PeerCopy { .. } => "PEER_COPY",
            EntryKind::NodeBarrier { .. } => "NODE_BARRIER",
        }
    }

    fn fail(&self, message: impl fmt::Display) -> CclError {
        ccl_error!(
            "{} entry failed: comm {}, rank {}, tag {}: {}",
            self.name(),
            self.comm.comm_id(),
            self.comm.rank(),
            self.tag,
            message
        );
        CclError::transport(format!("{} entry failed: {}", self.name(), message))
    }

    fn issue(&self, op: Primitive) -> CclResult<RequestId> {
        let transport = self.comm.transport();
        transport
            .start(&self.comm.endpoint(), self.tag, op)
            .map_err(|e| self.fail(e))
    }

    // Ok(true) once the request succeeded
    fn check(&self, req: RequestId) -> CclResult<bool> {
        match self.comm.transport().poll(req) {
            Ok(RequestStatus::Pending) => Ok(false),
            Ok(RequestStatus::Success) => Ok(true),
            Ok(RequestStatus::Error(msg)) => Err(self.fail(msg)),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Issue the step
    pub fn start(&mut self) -> CclResult<()> {
        ccl_trace!("start {}: {}", self.name(), self.dump());
        let status = match &self.kind {
            EntryKind::Transport { op, .. } => {
                let id = self.issue(op.clone())?;
                if let EntryKind::Transport { req, .. } = &mut self.kind {
                    *req = Some(id);
                }
                EntryStatus::Started
            }
            EntryKind::SendRecv {
                send,
                dst,
                recv,
                src,
                ..
            } => {
                let send_req = self.issue(Primitive::Send {
                    buf: send.clone(),
                    peer: *dst,
                })?;
                let recv_req = self.issue(Primitive::Recv {
                    buf: recv.clone(),
                    peer: *src,
                })?;
                if let EntryKind::SendRecv { reqs, .. } = &mut self.kind {
                    *reqs = vec![send_req, recv_req];
                }
                EntryStatus::Started
            }
            EntryKind::Copy { src, dst } => {
                dst.copy_from(src)?;
                EntryStatus::Complete
            }
            EntryKind::Reduce { src, dst, dtype, op } => {
                let data = src.to_vec()?;
                dst.with_mut(|d| comp::reduce(d, &data, *dtype, *op))??;
                EntryStatus::Complete
            }
            EntryKind::HandleExchange { group, handles, .. } => {
                group.resources.publish(
                    group.group_id,
                    group.exchange_id,
                    group.rank,
                    handles.clone(),
                )?;
                let arrived = group.arrive()?;
                if let EntryKind::HandleExchange { pending, .. } = &mut self.kind {
                    *pending = Some(arrived);
                }
                EntryStatus::Started
            }
            EntryKind::PeerCopy {
                group,
                peer,
                handle_index,
                local,
                src_offset,
                dst,
            } => {
                let addressing = PeerAddressing::Node {
                    rank: group.rank,
                    size: group.size,
                };
                let remote = group.resources.get_remote_pointers(
                    group.group_id,
                    group.exchange_id,
                    &addressing,
                    *handle_index,
                    local,
                )?;
                let handle = remote.get(*peer).cloned().flatten().ok_or_else(|| {
                    CclError::Synchronization(format!(
                        "node rank {} has no handle {} in exchange {} of group {}",
                        peer, handle_index, group.exchange_id, group.group_id
                    ))
                })?;
                dst.copy_from(&handle.slice(*src_offset, dst.len())?)?;
                EntryStatus::Complete
            }
            EntryKind::NodeBarrier { group, .. } => {
                let arrived = group.arrive()?;
                if let EntryKind::NodeBarrier { pending, .. } = &mut self.kind {
                    *pending = Some(arrived);
                }
                EntryStatus::Started
            }
        };
        self.status = status;
        Ok(())
    }

    /// Check on a started step
    pub fn update(&mut self) -> CclResult<()> {
        if self.status != EntryStatus::Started {
            return Ok(());
        }
        let done = match &self.kind {
            EntryKind::Transport { req, .. } => match req {
                Some(id) => self.check(*id)?,
                None => return Err(self.fail("started without a request")),
            },
            EntryKind::SendRecv { reqs, .. } => {
                let mut remaining = Vec::with_capacity(reqs.len());
                for id in reqs {
                    if !self.check(*id)? {
                        remaining.push(*id);
                    }
                }
                let done = remaining.is_empty();
                if let EntryKind::SendRecv { reqs, .. } = &mut self.kind {
                    *reqs = remaining;
                }
                done
            }
            EntryKind::HandleExchange { pending, .. } => match pending {
                Some((barrier, ticket)) => barrier.is_released(*ticket)?,
                None => return Err(self.fail("started without arriving at the node barrier")),
            },
            EntryKind::NodeBarrier {
                group,
                release_handles,
                pending,
            } => match pending {
                Some((barrier, ticket)) => {
                    let released = barrier.is_released(*ticket)?;
                    if released && *release_handles {
                        group
                            .resources
                            .release(group.group_id, group.exchange_id, group.rank)?;
                    }
                    released
                }
                None => return Err(self.fail("started without arriving at the node barrier")),
            },
            EntryKind::Copy { .. } | EntryKind::Reduce { .. } | EntryKind::PeerCopy { .. } => true,
        };
        if done {
            ccl_trace!("complete {}: tag {}", self.name(), self.tag);
            self.status = EntryStatus::Complete;
        }
        Ok(())
    }

    /// One-line description used in logs
    pub fn dump(&self) -> String {
        let detail = match &self.kind {
            EntryKind::Transport { op, .. } => match op {
                Primitive::Send { buf, peer } => format!("dst {}, bytes {}", peer, buf.len()),
                Primitive::Recv { buf, peer } => format!("src {}, bytes {}", peer, buf.len()),
                Primitive::Bcast { buf, root } => format!("root {}, bytes {}", root, buf.len()),
                Primitive::Reduce { send, root, op, .. } => {
                    format!("root {}, op {}, bytes {}", root, op, send.len())
                }
                Primitive::Allgather { send, .. }
                | Primitive::Alltoall { send, .. }
                | Primitive::ReduceScatter { send, .. } => format!("bytes {}", send.len()),
                Primitive::Barrier => String::new(),
            },
            EntryKind::SendRecv {
                send,
                dst,
                recv,
                src,
                ..
            } => format!(
                "dst {}, send bytes {}, src {}, recv bytes {}",
                dst,
                send.len(),
                src,
                recv.len()
            ),
            EntryKind::Copy { src, dst } => {
                format!("bytes {}, in place {}", src.len(), src.is_same(dst))
            }
            EntryKind::Reduce { src, dtype, op, .. } => {
                format!("dtype {}, op {}, bytes {}", dtype, op, src.len())
            }
            EntryKind::HandleExchange { group, handles, .. } => format!(
                "group {}, exchange {}, handles {}",
                group.group_id,
                group.exchange_id,
                handles.len()
            ),
            EntryKind::PeerCopy {
                peer,
                handle_index,
                src_offset,
                dst,
                ..
            } => format!(
                "peer {}, handle {}, offset {}, bytes {}",
                peer,
                handle_index,
                src_offset,
                dst.len()
            ),
            EntryKind::NodeBarrier {
                group,
                release_handles,
                ..
            } => format!("group {}, release {}", group.group_id, release_handles),
        };
        format!(
            "comm_id {}, tag {}, status {:?}, {}",
            self.comm.comm_id(),
            self.tag,
            self.status,
            detail
        )
    }
}
