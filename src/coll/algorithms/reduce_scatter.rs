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

//! Reduce-scatter builders
//!
//! `send` holds one block of `count` elements per rank. Rank `r` ends with
//! block `r` reduced over every rank in `recv`.

use crate::buffer::CclBuffer;
use crate::error::CclResult;
use crate::net::Primitive;
use crate::sched::Schedule;

use super::CollArgs;

pub fn build_direct(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let size = sched.comm().size();
    let bytes = args.bytes();
    sched.add_primitive(Primitive::ReduceScatter {
        send: args.send.slice(0, bytes * size)?,
        recv: args.recv.slice(0, bytes)?,
        dtype: args.dtype,
        op: args.op,
    });
    Ok(())
}

/// Exchange blocks with every peer, then fold them in locally
pub fn build_naive(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let rank = sched.comm().rank();
    let size = sched.comm().size();
    let bytes = args.bytes();
    let recv = args.recv.slice(0, bytes)?;

    sched.add_copy(args.send.slice(rank * bytes, bytes)?, recv.clone());
    let tmp = CclBuffer::new(bytes * size);
    for peer in (0..size).filter(|&peer| peer != rank) {
        sched.add_send_recv(
            args.send.slice(peer * bytes, bytes)?,
            peer,
            tmp.slice(peer * bytes, bytes)?,
            peer,
        );
    }
    sched.add_barrier();

    for peer in (0..size).filter(|&peer| peer != rank) {
        sched.add_reduce(tmp.slice(peer * bytes, bytes)?, recv.clone(), args.dtype, args.op);
    }
    Ok(())
}

/// `size - 1` ring steps; each forwards a partial block to the right and
/// folds the one arriving from the left into the accumulator
pub fn build_ring(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let rank = sched.comm().rank();
    let size = sched.comm().size();
    let bytes = args.bytes();
    let recv = args.recv.slice(0, bytes)?;

    if size == 1 {
        sched.add_copy(args.send.slice(0, bytes)?, recv);
        return Ok(());
    }

    let acc = CclBuffer::new(bytes * size);
    sched.add_copy(args.send.slice(0, bytes * size)?, acc.clone());
    sched.add_barrier();

    let left = (rank + size - 1) % size;
    let right = (rank + 1) % size;
    let tmp = CclBuffer::new(bytes);
    for step in 0..size - 1 {
        let send_block = (rank + 2 * size - step - 1) % size;
        let recv_block = (rank + 2 * size - step - 2) % size;
        sched.add_send_recv(acc.slice(send_block * bytes, bytes)?, right, tmp.clone(), left);
        sched.add_barrier();
        sched.add_reduce(
            tmp.clone(),
            acc.slice(recv_block * bytes, bytes)?,
            args.dtype,
            args.op,
        );
        sched.add_barrier();
    }

    sched.add_copy(acc.slice(rank * bytes, bytes)?, recv);
    Ok(())
}
