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

//! Broadcast builders
//!
//! Only the root reads `send`. Every rank ends with the root's data in
//! `recv`; the root copies `send` into `recv` when they differ.

use crate::buffer::CclBuffer;
use crate::error::CclResult;
use crate::net::Primitive;
use crate::sched::Schedule;

use super::{chunk, CollArgs};

pub fn build_direct(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let rank = sched.comm().rank();
    let bytes = args.bytes();
    let recv = args.recv.slice(0, bytes)?;

    if rank == args.root {
        let send = args.send.slice(0, bytes)?;
        if !send.is_same(&recv) {
            sched.add_copy(send, recv.clone());
            sched.add_barrier();
        }
    }

    sched.add_primitive(Primitive::Bcast {
        buf: recv,
        root: args.root,
    });
    Ok(())
}

/// Root sends the whole message to every peer
pub fn build_naive(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let rank = sched.comm().rank();
    let size = sched.comm().size();
    let bytes = args.bytes();
    let recv = args.recv.slice(0, bytes)?;

    if rank == args.root {
        let send = args.send.slice(0, bytes)?;
        if !send.is_same(&recv) {
            sched.add_copy(send.clone(), recv);
            sched.add_barrier();
        }
        // independent peers, no barrier between sends
        for peer in (0..size).filter(|&peer| peer != rank) {
            sched.add_send(send.clone(), peer);
        }
    } else {
        sched.add_recv(recv, args.root);
    }
    Ok(())
}

/// Binomial scatter of `nbytes` from `root`: relative rank `r` ends up with
/// block `r` of `ceil(nbytes / size)` bytes at the same offset as on the root
fn build_scatter_for_broadcast(
    sched: &mut Schedule,
    send: &CclBuffer,
    recv: &CclBuffer,
    root: usize,
    nbytes: usize,
) -> CclResult<()> {
    let rank = sched.comm().rank();
    let size = sched.comm().size();
    let relative_rank = (rank + size - root) % size;
    let scatter_size = (nbytes + size - 1) / size;

    // root starts with all the data
    let mut curr_size = if rank == root { nbytes } else { 0 };

    let mut mask = 1;
    while mask < size {
        if relative_rank & mask != 0 {
            let src = (rank + size - mask) % size;
            // upper bound of what the parent sends
            let recv_size = nbytes.saturating_sub(relative_rank * scatter_size);
            curr_size = recv_size;
            if recv_size > 0 {
                sched.add_recv(recv.slice(relative_rank * scatter_size, recv_size)?, src);
                sched.add_barrier();
            }
            break;
        }
        mask <<= 1;
    }

    // this rank serves the subtrees below the bit it received on
    mask >>= 1;
    while mask > 0 {
        if relative_rank + mask < size && curr_size > scatter_size * mask {
            let send_size = curr_size - scatter_size * mask;
            let dst = (rank + mask) % size;
            sched.add_send(
                send.slice(scatter_size * (relative_rank + mask), send_size)?,
                dst,
            );
            sched.add_barrier();
            curr_size -= send_size;
        }
        mask >>= 1;
    }
    Ok(())
}

/// Binomial scatter followed by a ring allgather of the scattered blocks
pub fn build_scatter_ring_allgather(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let rank = sched.comm().rank();
    let size = sched.comm().size();
    let root = args.root;
    let nbytes = args.bytes();
    let recv = args.recv.slice(0, nbytes)?;

    // non-root ranks forward what they received
    let work = if rank == root {
        args.send.slice(0, nbytes)?
    } else {
        recv.clone()
    };

    if size > 1 {
        build_scatter_for_broadcast(sched, &work, &recv, root, nbytes)?;

        let scatter_size = (nbytes + size - 1) / size;
        let left = (rank + size - 1) % size;
        let right = (rank + 1) % size;

        let mut j = rank;
        let mut jnext = left;
        for _ in 1..size {
            let rel_j = (j + size - root) % size;
            let rel_jnext = (jnext + size - root) % size;
            let (right_disp, right_count) = chunk(rel_j, scatter_size, nbytes);
            let (left_disp, left_count) = chunk(rel_jnext, scatter_size, nbytes);

            sched.add_send_recv(
                work.slice(right_disp, right_count)?,
                right,
                recv.slice(left_disp, left_count)?,
                left,
            );
            sched.add_barrier();

            j = jnext;
            jnext = (jnext + size - 1) % size;
        }
    }

    if rank == root && !work.is_same(&recv) {
        sched.add_copy(work, recv);
        sched.add_barrier();
    }
    Ok(())
}
