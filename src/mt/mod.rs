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

//! Synchronization shared by the ranks of one node

pub mod barrier;
pub mod shared_resources;

pub use barrier::{BarrierTicket, NodeBarrier, ThreadBarrier};
#[cfg(all(unix, feature = "shm"))]
pub use barrier::ShmBarrier;
pub use shared_resources::{BarrierBackend, MemHandle, PeerAddressing, SharedResources};
