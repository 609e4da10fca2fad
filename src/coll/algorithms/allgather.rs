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

//! Allgather builders
//!
//! Rank `r` contributes `count` elements from `send`; `recv` holds one
//! block per rank in rank order.

use crate::error::CclResult;
use crate::net::Primitive;
use crate::sched::Schedule;

use super::CollArgs;

pub fn build_direct(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let size = sched.comm().size();
    let bytes = args.bytes();
    sched.add_primitive(Primitive::Allgather {
        send: args.send.slice(0, bytes)?,
        recv: args.recv.slice(0, bytes * size)?,
    });
    Ok(())
}

/// Every rank sends its block to every peer and receives every peer's block
pub fn build_naive(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let rank = sched.comm().rank();
    let size = sched.comm().size();
    let bytes = args.bytes();
    let send = args.send.slice(0, bytes)?;

    sched.add_copy(send.clone(), args.recv.slice(rank * bytes, bytes)?);
    for peer in (0..size).filter(|&peer| peer != rank) {
        sched.add_send_recv(
            send.clone(),
            peer,
            args.recv.slice(peer * bytes, bytes)?,
            peer,
        );
    }
    Ok(())
}

/// `size - 1` steps, each passing the most recently received block to the right
pub fn build_ring(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let rank = sched.comm().rank();
    let size = sched.comm().size();
    let bytes = args.bytes();

    sched.add_copy(
        args.send.slice(0, bytes)?,
        args.recv.slice(rank * bytes, bytes)?,
    );
    sched.add_barrier();

    let left = (rank + size - 1) % size;
    let right = (rank + 1) % size;
    for step in 0..size.saturating_sub(1) {
        let send_block = (rank + size - step) % size;
        let recv_block = (rank + size - step - 1) % size;
        sched.add_send_recv(
            args.recv.slice(send_block * bytes, bytes)?,
            right,
            args.recv.slice(recv_block * bytes, bytes)?,
            left,
        );
        sched.add_barrier();
    }
    Ok(())
}
