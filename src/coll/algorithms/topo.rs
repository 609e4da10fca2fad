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

//! Node-local builders over shared resources
//!
//! Every rank of the node group publishes its buffers under the schedule's
//! match id, reads what it needs straight from its peers' handles, then
//! meets the group at a node barrier before its own handles are released.
//! The group must span the whole communicator.

use std::sync::Arc;

use crate::error::{CclError, CclResult};
use crate::mt::SharedResources;
use crate::net::Communicator;
use crate::sched::{NodeGroup, Schedule};

use super::CollArgs;

/// Node group of the schedule's communicator
fn node_group(sched: &Schedule, resources: &Arc<SharedResources>) -> CclResult<NodeGroup> {
    let comm = sched.comm();
    let node: Arc<dyn Communicator> = comm.node_comm().unwrap_or_else(|| comm.clone());
    if node.size() != comm.size() || node.rank() != comm.rank() {
        return Err(CclError::invalid(format!(
            "node-local {} needs a single-node communicator: comm rank {} of {}, node rank {} of {}",
            sched.coll(),
            comm.rank(),
            comm.size(),
            node.rank(),
            node.size()
        )));
    }
    Ok(NodeGroup::new(
        resources.clone(),
        node.as_ref(),
        sched.match_id().0,
    ))
}

pub fn build_broadcast(
    sched: &mut Schedule,
    args: &CollArgs,
    resources: &Arc<SharedResources>,
) -> CclResult<()> {
    let group = node_group(sched, resources)?;
    let bytes = args.bytes();
    if bytes == 0 {
        return Ok(());
    }
    let recv = args.recv.slice(0, bytes)?;
    let is_root = group.rank == args.root;
    let local = if is_root {
        args.send.slice(0, bytes)?
    } else {
        recv.clone()
    };

    sched.add_handle_exchange(group.clone(), vec![local.clone()]);
    sched.add_barrier();
    if is_root {
        if !local.is_same(&recv) {
            sched.add_copy(local, recv);
        }
    } else {
        sched.add_peer_copy(group.clone(), args.root, 0, local, 0, recv);
    }
    sched.add_barrier();
    sched.add_node_barrier(group, true);
    Ok(())
}

pub fn build_allgather(
    sched: &mut Schedule,
    args: &CollArgs,
    resources: &Arc<SharedResources>,
) -> CclResult<()> {
    let group = node_group(sched, resources)?;
    let bytes = args.bytes();
    if bytes == 0 {
        return Ok(());
    }
    let send = args.send.slice(0, bytes)?;

    sched.add_handle_exchange(group.clone(), vec![send.clone()]);
    sched.add_barrier();
    for peer in 0..group.size {
        let dst = args.recv.slice(peer * bytes, bytes)?;
        if peer == group.rank {
            sched.add_copy(send.clone(), dst);
        } else {
            sched.add_peer_copy(group.clone(), peer, 0, send.clone(), 0, dst);
        }
    }
    sched.add_barrier();
    sched.add_node_barrier(group, true);
    Ok(())
}

/// Rank `r` reads block `r` of every peer's send buffer
pub fn build_alltoall(
    sched: &mut Schedule,
    args: &CollArgs,
    resources: &Arc<SharedResources>,
) -> CclResult<()> {
    let group = node_group(sched, resources)?;
    let bytes = args.bytes();
    if bytes == 0 {
        return Ok(());
    }
    let send = args.send.slice(0, bytes * group.size)?;

    sched.add_handle_exchange(group.clone(), vec![send.clone()]);
    sched.add_barrier();
    for peer in 0..group.size {
        let dst = args.recv.slice(peer * bytes, bytes)?;
        if peer == group.rank {
            sched.add_copy(send.slice(peer * bytes, bytes)?, dst);
        } else {
            sched.add_peer_copy(group.clone(), peer, 0, send.clone(), group.rank * bytes, dst);
        }
    }
    sched.add_barrier();
    sched.add_node_barrier(group, true);
    Ok(())
}
