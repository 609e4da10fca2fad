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

//! Barrier builders

use crate::buffer::CclBuffer;
use crate::error::CclResult;
use crate::net::Primitive;
use crate::sched::Schedule;

pub fn build_direct(sched: &mut Schedule) -> CclResult<()> {
    sched.add_primitive(Primitive::Barrier);
    Ok(())
}

/// Pass an empty token twice around the ring
///
/// After the first lap rank 0 knows everyone arrived; the second lap tells
/// everyone else.
pub fn build_ring(sched: &mut Schedule) -> CclResult<()> {
    let rank = sched.comm().rank();
    let size = sched.comm().size();
    if size == 1 {
        return Ok(());
    }

    let left = (rank + size - 1) % size;
    let right = (rank + 1) % size;
    let token = CclBuffer::empty();
    for _ in 0..2 {
        if rank == 0 {
            sched.add_send(token.clone(), right);
            sched.add_barrier();
            sched.add_recv(token.clone(), left);
        } else {
            sched.add_recv(token.clone(), left);
            sched.add_barrier();
            sched.add_send(token.clone(), right);
        }
        sched.add_barrier();
    }
    Ok(())
}
