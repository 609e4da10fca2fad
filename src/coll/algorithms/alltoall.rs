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

//! Alltoall builders
//!
//! Block `p` of `send` goes to rank `p`; block `p` of `recv` comes from
//! rank `p`. Each block holds `count` elements.

use crate::error::CclResult;
use crate::net::Primitive;
use crate::sched::Schedule;

use super::CollArgs;

pub fn build_direct(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let size = sched.comm().size();
    let total = args.bytes() * size;
    sched.add_primitive(Primitive::Alltoall {
        send: args.send.slice(0, total)?,
        recv: args.recv.slice(0, total)?,
    });
    Ok(())
}

/// Pairwise duplex exchange with every peer
pub fn build_naive(sched: &mut Schedule, args: &CollArgs) -> CclResult<()> {
    let rank = sched.comm().rank();
    let size = sched.comm().size();
    let bytes = args.bytes();

    sched.add_copy(
        args.send.slice(rank * bytes, bytes)?,
        args.recv.slice(rank * bytes, bytes)?,
    );
    for peer in (0..size).filter(|&peer| peer != rank) {
        sched.add_send_recv(
            args.send.slice(peer * bytes, bytes)?,
            peer,
            args.recv.slice(peer * bytes, bytes)?,
            peer,
        );
    }
    Ok(())
}
