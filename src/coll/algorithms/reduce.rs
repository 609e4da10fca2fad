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

//! Reduce builders
//!
//! Every rank contributes `count` elements; only the root's `recv` is
//! written.

use crate::buffer::CclBuffer;
use crate::error::CclResult;
use crate::net::Primitive;
use crate::sched::Schedule;

use super::CollArgs;

pub fn build_direct(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let rank = sched.comm().rank();
    let bytes = args.bytes();
    let recv = if rank == args.root {
        args.recv.slice(0, bytes)?
    } else {
        CclBuffer::empty()
    };
    sched.add_primitive(Primitive::Reduce {
        send: args.send.slice(0, bytes)?,
        recv,
        dtype: args.dtype,
        op: args.op,
        root: args.root,
    });
    Ok(())
}

/// Binomial tree rooted at `root`
///
/// Each rank folds in the partial results of its children, then hands its
/// own partial result to its parent.
pub fn build_tree(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let rank = sched.comm().rank();
    let size = sched.comm().size();
    let bytes = args.bytes();
    let relative_rank = (rank + size - args.root) % size;

    let send = args.send.slice(0, bytes)?;
    let acc = if rank == args.root {
        args.recv.slice(0, bytes)?
    } else {
        CclBuffer::new(bytes)
    };
    if !send.is_same(&acc) {
        sched.add_copy(send, acc.clone());
        sched.add_barrier();
    }

    let mut mask = 1;
    while mask < size {
        if relative_rank & mask != 0 {
            let parent = (rank + size - mask) % size;
            sched.add_send(acc.clone(), parent);
            sched.add_barrier();
            break;
        }
        if relative_rank + mask < size {
            let child = (rank + mask) % size;
            let tmp = CclBuffer::new(bytes);
            sched.add_recv(tmp.clone(), child);
            sched.add_barrier();
            sched.add_reduce(tmp, acc.clone(), args.dtype, args.op);
            sched.add_barrier();
        }
        mask <<= 1;
    }
    Ok(())
}
