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

//! In-process transport
//!
//! `LocalFabric` connects every rank living in one OS process, whether the
//! ranks run on their own threads or are multiplexed on one executor. Sends
//! are eager: the payload is copied into the peer's mailbox when the request
//! starts. Receives and collectives complete on the first poll that finds
//! their data. A poll delay makes every request stay pending for a number of
//! polls, which exercises the scheduler's staging.

use std::collections::VecDeque;

use hashbrown::HashMap;
use std::sync::{Arc, Mutex};

use crate::buffer::CclBuffer;
use crate::comp;
use crate::config::CclConfig;
use crate::data_types::{Datatype, ReduceOp};
use crate::error::{poisoned, CclError, CclResult};

use super::{CommId, Endpoint, MatchId, Primitive, RequestId, RequestStatus, Transport};

type MailboxKey = (CommId, usize, usize, MatchId);
type RendezvousKey = (CommId, MatchId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollKind {
    Barrier,
    Bcast { root: usize },
    Allgather,
    Alltoall,
    Reduce { root: usize, dtype: Datatype, op: ReduceOp },
    ReduceScatter { dtype: Datatype, op: ReduceOp },
}

/// Contributions of every rank to one collective primitive
struct Rendezvous {
    kind: CollKind,
    contributions: Vec<Option<Vec<u8>>>,
    /// Ranks that still have to pick up their result
    remaining: usize,
}

impl Rendezvous {
    fn is_ready(&self) -> bool {
        match self.kind {
            CollKind::Bcast { root } => self.contributions[root].is_some(),
            _ => self.contributions.iter().all(Option::is_some),
        }
    }

    fn contribution(&self, rank: usize) -> CclResult<&[u8]> {
        self.contributions[rank]
            .as_deref()
            .ok_or_else(|| CclError::transport(format!("missing contribution of rank {}", rank)))
    }

    // Bytes written into the caller's receive buffer, if any
    fn result_for(&self, rank: usize, out_len: usize) -> CclResult<Option<Vec<u8>>> {
        let size = self.contributions.len();
        match self.kind {
            CollKind::Barrier => Ok(None),
            CollKind::Bcast { root } => {
                if rank == root {
                    Ok(None)
                } else {
                    Ok(Some(self.contribution(root)?.to_vec()))
                }
            }
            CollKind::Allgather => {
                let mut out = Vec::with_capacity(out_len);
                for r in 0..size {
                    out.extend_from_slice(self.contribution(r)?);
                }
                Ok(Some(out))
            }
            CollKind::Alltoall => {
                let mut out = Vec::with_capacity(out_len);
                for r in 0..size {
                    let block = self.contribution(r)?;
                    let chunk = block.len() / size;
                    out.extend_from_slice(&block[rank * chunk..(rank + 1) * chunk]);
                }
                Ok(Some(out))
            }
            CollKind::Reduce { root, dtype, op } => {
                if rank != root {
                    return Ok(None);
                }
                Ok(Some(self.fold(dtype, op)?))
            }
            CollKind::ReduceScatter { dtype, op } => {
                let all = self.fold(dtype, op)?;
                let block = all.len() / size;
                Ok(Some(all[rank * block..(rank + 1) * block].to_vec()))
            }
        }
    }

    fn fold(&self, dtype: Datatype, op: ReduceOp) -> CclResult<Vec<u8>> {
        let mut acc = self.contribution(0)?.to_vec();
        for r in 1..self.contributions.len() {
            comp::reduce(&mut acc, self.contribution(r)?, dtype, op)?;
        }
        Ok(acc)
    }
}

/// What `start` prepared before taking the fabric lock
enum Started {
    PointToPoint(PendingOp, Option<(MailboxKey, Vec<u8>)>),
    Coll(CollKind, Vec<u8>, Option<CclBuffer>),
}

enum PendingOp {
    Send,
    Recv { key: MailboxKey, buf: CclBuffer },
    Coll { key: RendezvousKey, rank: usize, out: Option<CclBuffer> },
}

struct PendingRequest {
    op: PendingOp,
    polls_left: usize,
}

#[derive(Default)]
struct FabricState {
    next_request: u64,
    requests: HashMap<u64, PendingRequest>,
    mailboxes: HashMap<MailboxKey, VecDeque<Vec<u8>>>,
    rendezvous: HashMap<RendezvousKey, Rendezvous>,
}

/// Output of a completed request, written after the fabric lock is released
enum Completion {
    Pending,
    Done(Option<(CclBuffer, Vec<u8>)>),
    Failed(String),
}

/// In-process transport shared by all local ranks
pub struct LocalFabric {
    state: Mutex<FabricState>,
    poll_delay: usize,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::with_poll_delay(0)
    }

    /// Every request stays pending for `polls` polls before it may complete
    pub fn with_poll_delay(polls: usize) -> Self {
        Self {
            state: Mutex::new(FabricState::default()),
            poll_delay: polls,
        }
    }

    pub fn shared(poll_delay: usize) -> Arc<Self> {
        Arc::new(Self::with_poll_delay(poll_delay))
    }

    /// Fabric using the poll delay of `config`
    pub fn from_config(config: &CclConfig) -> Arc<Self> {
        Self::shared(config.local_poll_delay)
    }

    /// Number of requests started but not yet reported complete
    pub fn in_flight(&self) -> CclResult<usize> {
        Ok(self.state.lock().map_err(poisoned)?.requests.len())
    }

    fn join(
        state: &mut FabricState,
        ep: &Endpoint,
        tag: MatchId,
        kind: CollKind,
        data: Vec<u8>,
    ) -> CclResult<()> {
        let key = (ep.comm_id, tag);
        let slot = state.rendezvous.entry(key).or_insert_with(|| Rendezvous {
            kind,
            contributions: vec![None; ep.size],
            remaining: ep.size,
        });
        if slot.kind != kind || slot.contributions.len() != ep.size {
            return Err(CclError::transport(format!(
                "mismatched collective on comm {} tag {}: {:?} vs {:?}",
                ep.comm_id, tag, slot.kind, kind
            )));
        }
        if slot.contributions[ep.rank].is_some() {
            return Err(CclError::transport(format!(
                "rank {} joined collective on comm {} tag {} twice",
                ep.rank, ep.comm_id, tag
            )));
        }
        slot.contributions[ep.rank] = Some(data);
        Ok(())
    }

    fn check_peer(ep: &Endpoint, peer: usize) -> CclResult<()> {
        if peer >= ep.size {
            return Err(CclError::transport(format!(
                "peer {} is outside comm {} of size {}",
                peer, ep.comm_id, ep.size
            )));
        }
        Ok(())
    }

    fn progress(state: &mut FabricState, req: &mut PendingRequest) -> CclResult<Completion> {
        if req.polls_left > 0 {
            req.polls_left -= 1;
            return Ok(Completion::Pending);
        }
        match &req.op {
            PendingOp::Send => Ok(Completion::Done(None)),
            PendingOp::Recv { key, buf } => {
                let msg = match state.mailboxes.get_mut(key).and_then(VecDeque::pop_front) {
                    Some(msg) => msg,
                    None => return Ok(Completion::Pending),
                };
                if state.mailboxes.get(key).map_or(false, VecDeque::is_empty) {
                    state.mailboxes.remove(key);
                }
                if msg.len() > buf.len() {
                    return Ok(Completion::Failed(format!(
                        "message of {} bytes truncated by {} byte receive buffer",
                        msg.len(),
                        buf.len()
                    )));
                }
                Ok(Completion::Done(Some((buf.clone(), msg))))
            }
            PendingOp::Coll { key, rank, out } => {
                let slot = match state.rendezvous.get_mut(key) {
                    Some(slot) => slot,
                    None => {
                        return Ok(Completion::Failed(format!(
                            "collective on comm {} tag {} vanished",
                            key.0, key.1
                        )))
                    }
                };
                if !slot.is_ready() {
                    return Ok(Completion::Pending);
                }
                let out_len = out.as_ref().map_or(0, CclBuffer::len);
                let result = match slot.result_for(*rank, out_len) {
                    Ok(result) => result,
                    Err(e) => return Ok(Completion::Failed(e.to_string())),
                };
                slot.remaining -= 1;
                if slot.remaining == 0 {
                    state.rendezvous.remove(key);
                }
                match (result, out) {
                    (Some(bytes), Some(buf)) => Ok(Completion::Done(Some((buf.clone(), bytes)))),
                    _ => Ok(Completion::Done(None)),
                }
            }
        }
    }
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalFabric {
    fn start(&self, ep: &Endpoint, tag: MatchId, op: Primitive) -> CclResult<RequestId> {
        // payloads are read before the fabric lock is taken
        let started = match op {
            Primitive::Send { buf, peer } => {
                Self::check_peer(ep, peer)?;
                let key = (ep.comm_id, ep.rank, peer, tag);
                Started::PointToPoint(PendingOp::Send, Some((key, buf.to_vec()?)))
            }
            Primitive::Recv { buf, peer } => {
                Self::check_peer(ep, peer)?;
                let key = (ep.comm_id, peer, ep.rank, tag);
                Started::PointToPoint(PendingOp::Recv { key, buf }, None)
            }
            Primitive::Barrier => Started::Coll(CollKind::Barrier, Vec::new(), None),
            Primitive::Bcast { buf, root } => {
                Self::check_peer(ep, root)?;
                let data = if ep.rank == root { buf.to_vec()? } else { Vec::new() };
                Started::Coll(CollKind::Bcast { root }, data, Some(buf))
            }
            Primitive::Allgather { send, recv } => {
                if recv.len() != send.len() * ep.size {
                    return Err(CclError::transport("allgather receive buffer size mismatch"));
                }
                Started::Coll(CollKind::Allgather, send.to_vec()?, Some(recv))
            }
            Primitive::Alltoall { send, recv } => {
                if send.len() != recv.len() || send.len() % ep.size != 0 {
                    return Err(CclError::transport("alltoall buffer size mismatch"));
                }
                Started::Coll(CollKind::Alltoall, send.to_vec()?, Some(recv))
            }
            Primitive::Reduce { send, recv, dtype, op, root } => {
                Self::check_peer(ep, root)?;
                let out = if ep.rank == root { Some(recv) } else { None };
                Started::Coll(CollKind::Reduce { root, dtype, op }, send.to_vec()?, out)
            }
            Primitive::ReduceScatter { send, recv, dtype, op } => {
                if send.len() != recv.len() * ep.size {
                    return Err(CclError::transport("reduce_scatter buffer size mismatch"));
                }
                Started::Coll(CollKind::ReduceScatter { dtype, op }, send.to_vec()?, Some(recv))
            }
        };

        let mut state = self.state.lock().map_err(poisoned)?;
        let pending = match started {
            Started::PointToPoint(pending, payload) => {
                if let Some((key, bytes)) = payload {
                    state.mailboxes.entry(key).or_default().push_back(bytes);
                }
                pending
            }
            Started::Coll(kind, data, out) => {
                Self::join(&mut state, ep, tag, kind, data)?;
                PendingOp::Coll {
                    key: (ep.comm_id, tag),
                    rank: ep.rank,
                    out,
                }
            }
        };
        let id = state.next_request;
        state.next_request += 1;
        state.requests.insert(
            id,
            PendingRequest {
                op: pending,
                polls_left: self.poll_delay,
            },
        );
        Ok(RequestId(id))
    }

    fn poll(&self, req: RequestId) -> CclResult<RequestStatus> {
        let completion = {
            let mut state = self.state.lock().map_err(poisoned)?;
            let mut pending = state
                .requests
                .remove(&req.0)
                .ok_or_else(|| CclError::transport(format!("unknown request {}", req.0)))?;
            let completion = Self::progress(&mut state, &mut pending)?;
            if let Completion::Pending = completion {
                state.requests.insert(req.0, pending);
            }
            completion
        };

        match completion {
            Completion::Pending => Ok(RequestStatus::Pending),
            Completion::Failed(msg) => Ok(RequestStatus::Error(msg)),
            Completion::Done(None) => Ok(RequestStatus::Success),
            Completion::Done(Some((buf, bytes))) => {
                buf.write(&bytes)?;
                Ok(RequestStatus::Success)
            }
        }
    }
}
