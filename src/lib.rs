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

//! CCL: collective communication runtime
//!
//! Collectives (broadcast, allgather, alltoall, reduce, reduce_scatter and
//! barrier) are planned as barrier-staged schedules of non-blocking entries.
//! The algorithm for each call is picked from interval tables keyed by
//! message size, and node-local algorithms synchronize through shared
//! resources of the process.

pub mod buffer;
pub mod coll;
pub mod comp;
pub mod config;
pub mod ctx;
pub mod data_types;
pub mod error;
pub mod mt;
pub mod net;
pub mod sched;
pub mod util;

// Re-export commonly used types
pub use crate::buffer::{CclBuffer, MemKind};
pub use crate::coll::{AlgorithmTag, CollType};
pub use crate::config::CclConfig;
pub use crate::ctx::{CclContext, CollAttr};
pub use crate::data_types::{Datatype, ReduceOp};
pub use crate::error::{CclError, CclResult};
pub use crate::sched::CollRequest;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
