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

//! Algorithm builders
//!
//! A builder appends the entries and barriers of one algorithm to a
//! schedule. Builders only compose; nothing is issued until the schedule
//! is progressed. `build` maps every algorithm tag to its builder.

use std::sync::Arc;

use crate::buffer::CclBuffer;
use crate::data_types::{Datatype, ReduceOp};
use crate::error::{CclError, CclResult};
use crate::mt::SharedResources;
use crate::sched::Schedule;
use crate::ccl_debug;

use super::{
    AlgorithmTag, AllgatherAlgo, AlltoallAlgo, BarrierAlgo, BcastAlgo, CollType, ReduceAlgo,
    ReduceScatterAlgo,
};

pub mod allgather;
pub mod alltoall;
pub mod barrier;
pub mod broadcast;
pub mod reduce;
pub mod reduce_scatter;
pub mod topo;

/// Buffers and parameters of one collective call
///
/// `count` is per rank: the broadcast/reduce length, the block each rank
/// contributes to allgather, the block exchanged with each peer in alltoall,
/// and the result block of reduce_scatter.
#[derive(Debug, Clone)]
pub struct CollArgs {
    pub send: CclBuffer,
    pub recv: CclBuffer,
    pub count: usize,
    pub dtype: Datatype,
    pub root: usize,
    pub op: ReduceOp,
}

impl CollArgs {
    pub fn new(send: CclBuffer, recv: CclBuffer, count: usize, dtype: Datatype) -> Self {
        Self {
            send,
            recv,
            count,
            dtype,
            root: 0,
            op: ReduceOp::Sum,
        }
    }

    /// Arguments of a barrier, which moves no data
    pub fn empty() -> Self {
        Self::new(CclBuffer::empty(), CclBuffer::empty(), 0, Datatype::Int8)
    }

    pub fn with_root(mut self, root: usize) -> Self {
        self.root = root;
        self
    }

    pub fn with_op(mut self, op: ReduceOp) -> Self {
        self.op = op;
        self
    }

    /// Bytes in one block of `count` elements
    pub fn bytes(&self) -> usize {
        self.count * self.dtype.size()
    }

    /// Check buffer lengths for `coll` on a group of `size` ranks where the
    /// caller is `rank`
    pub fn validate(&self, coll: CollType, rank: usize, size: usize) -> CclResult<()> {
        let bytes = self.bytes();
        let needs_root = matches!(coll, CollType::Bcast | CollType::Reduce);
        if needs_root && self.root >= size {
            return Err(CclError::invalid(format!(
                "{} root {} is outside a group of {} ranks",
                coll, self.root, size
            )));
        }
        let is_root = rank == self.root;
        let (send_needed, recv_needed) = match coll {
            CollType::Bcast => (if is_root { bytes } else { 0 }, bytes),
            CollType::Allgather => (bytes, bytes * size),
            CollType::Alltoall => (bytes * size, bytes * size),
            CollType::Reduce => (bytes, if is_root { bytes } else { 0 }),
            CollType::ReduceScatter => (bytes * size, bytes),
            CollType::Barrier => (0, 0),
        };
        if self.send.len() < send_needed || self.recv.len() < recv_needed {
            return Err(CclError::invalid(format!(
                "{} of {} x {} on rank {}: send buffer {} bytes (need {}), recv buffer {} bytes (need {})",
                coll,
                self.count,
                self.dtype,
                rank,
                self.send.len(),
                send_needed,
                self.recv.len(),
                recv_needed
            )));
        }
        Ok(())
    }
}

/// `(offset, len)` of block `index` when `total` bytes are cut into blocks of
/// `block` bytes; trailing blocks may be short or empty
pub(crate) fn chunk(index: usize, block: usize, total: usize) -> (usize, usize) {
    let offset = (index * block).min(total);
    let len = block.min(total - offset);
    (offset, len)
}

/// Append the entries of `algo` for `args` to `sched`
pub fn build(
    sched: &mut Schedule,
    algo: AlgorithmTag,
    args: &CollArgs,
    resources: &Arc<SharedResources>,
) -> CclResult<()> {
    ccl_debug!(
        "build {} {}: count {}, dtype {}, rank {}, size {}",
        algo.name(),
        algo.coll(),
        args.count,
        args.dtype,
        sched.comm().rank(),
        sched.comm().size()
    );
    sched.set_algorithm(algo);

    match algo {
        AlgorithmTag::Bcast(algo) => match algo {
            BcastAlgo::Direct => broadcast::build_direct(sched, args),
            BcastAlgo::Naive => broadcast::build_naive(sched, args),
            BcastAlgo::ScatterRing => broadcast::build_scatter_ring_allgather(sched, args),
            BcastAlgo::Topo => topo::build_broadcast(sched, args, resources),
        },
        AlgorithmTag::Allgather(algo) => match algo {
            AllgatherAlgo::Direct => allgather::build_direct(sched, args),
            AllgatherAlgo::Naive => allgather::build_naive(sched, args),
            AllgatherAlgo::Ring => allgather::build_ring(sched, args),
            AllgatherAlgo::Topo => topo::build_allgather(sched, args, resources),
        },
        AlgorithmTag::Alltoall(algo) => match algo {
            AlltoallAlgo::Direct => alltoall::build_direct(sched, args),
            AlltoallAlgo::Naive => alltoall::build_naive(sched, args),
            AlltoallAlgo::Topo => topo::build_alltoall(sched, args, resources),
        },
        AlgorithmTag::Reduce(algo) => match algo {
            ReduceAlgo::Direct => reduce::build_direct(sched, args),
            ReduceAlgo::Tree => reduce::build_tree(sched, args),
        },
        AlgorithmTag::ReduceScatter(algo) => match algo {
            ReduceScatterAlgo::Direct => reduce_scatter::build_direct(sched, args),
            ReduceScatterAlgo::Naive => reduce_scatter::build_naive(sched, args),
            ReduceScatterAlgo::Ring => reduce_scatter::build_ring(sched, args),
        },
        AlgorithmTag::Barrier(algo) => match algo {
            BarrierAlgo::Direct => barrier::build_direct(sched),
            BarrierAlgo::Ring => barrier::build_ring(sched),
        },
    }
}
