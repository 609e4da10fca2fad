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

//! Networking and communication components
//!
//! The scheduler talks to the wire only through `Transport`: a primitive is
//! started with `start`, which returns a request id, and the request is
//! driven with `poll`. Neither call may block.

use std::fmt;

use crate::buffer::CclBuffer;
use crate::data_types::{Datatype, ReduceOp};
use crate::error::CclResult;

pub mod communicator;
pub mod local;

pub use communicator::{Comm, Communicator, Topology};
pub use local::LocalFabric;

/// Identifier of a communicator, equal on every member of the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommId(pub usize);

impl fmt::Display for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Match id used to pair up operations of one collective call across ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchId(pub u64);

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-side address of the calling rank within one communicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub comm_id: CommId,
    pub rank: usize,
    pub size: usize,
}

/// Request handle returned by `Transport::start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Outcome of one `Transport::poll`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Success,
    Error(String),
}

/// Primitive operations a transport executes on behalf of an entry
///
/// Collective primitives (`Bcast`, `Allgather`, ...) back the `direct`
/// algorithms, which hand the whole operation to the transport.
#[derive(Debug, Clone)]
pub enum Primitive {
    Send {
        buf: CclBuffer,
        peer: usize,
    },
    Recv {
        buf: CclBuffer,
        peer: usize,
    },
    Barrier,
    Bcast {
        buf: CclBuffer,
        root: usize,
    },
    /// Equal blocks: `recv.len() == send.len() * size`
    Allgather {
        send: CclBuffer,
        recv: CclBuffer,
    },
    /// `send` and `recv` hold one block per peer
    Alltoall {
        send: CclBuffer,
        recv: CclBuffer,
    },
    Reduce {
        send: CclBuffer,
        recv: CclBuffer,
        dtype: Datatype,
        op: ReduceOp,
        root: usize,
    },
    /// `send.len() == recv.len() * size`
    ReduceScatter {
        send: CclBuffer,
        recv: CclBuffer,
        dtype: Datatype,
        op: ReduceOp,
    },
}

impl Primitive {
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Send { .. } => "SEND",
            Primitive::Recv { .. } => "RECV",
            Primitive::Barrier => "BARRIER",
            Primitive::Bcast { .. } => "BCAST",
            Primitive::Allgather { .. } => "ALLGATHER",
            Primitive::Alltoall { .. } => "ALLTOALL",
            Primitive::Reduce { .. } => "REDUCE",
            Primitive::ReduceScatter { .. } => "REDUCE_SCATTER",
        }
    }
}

/// Non-blocking transport consumed by schedule entries
///
/// `start` returns `Err` when the call is rejected synchronously. A request
/// that fails later reports `RequestStatus::Error` from `poll`. Operations
/// of the same kind between the same endpoints and with the same match id
/// are matched in start order.
pub trait Transport: Send + Sync {
    fn start(&self, ep: &Endpoint, tag: MatchId, op: Primitive) -> CclResult<RequestId>;
    fn poll(&self, req: RequestId) -> CclResult<RequestStatus>;
}
