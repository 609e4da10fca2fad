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

//! CCL context
//!
//! A context belongs to one rank of one communicator. It owns the selectors
//! built from the configuration, an executor for the schedules it issues,
//! and a handle to the shared resources of the process. Collective calls
//! return a `CollRequest`; nothing completes until the context is
//! progressed through `wait`, `test` or `progress`.

use std::sync::Arc;

use crate::buffer::{CclBuffer, MemKind};
use crate::coll::algorithms::{self, CollArgs};
use crate::coll::{
    AlgorithmTag, Capability, CollType, DefaultCapability, SelectorParam, Selectors, TableKind,
};
use crate::config::CclConfig;
use crate::data_types::{Datatype, ReduceOp};
use crate::error::{CclError, CclResult};
use crate::mt::SharedResources;
use crate::net::Communicator;
use crate::sched::{CollRequest, Executor, Schedule};
use crate::{ccl_debug, ccl_info};

/// Per-call attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollAttr {
    /// Algorithm to use if it applies to the call
    pub hint: Option<AlgorithmTag>,
}

impl CollAttr {
    pub fn with_hint(hint: AlgorithmTag) -> Self {
        Self { hint: Some(hint) }
    }
}

/// Built-in rules restricted further by an optional user predicate
struct ContextCapability<'a> {
    user: Option<&'a dyn Capability>,
}

impl Capability for ContextCapability<'_> {
    fn can_use(&self, algo: AlgorithmTag, param: &SelectorParam, table: TableKind) -> bool {
        DefaultCapability.can_use(algo, param, table)
            && self.user.map_or(true, |user| user.can_use(algo, param, table))
    }
}

/// The entry point to collective operations of one rank
pub struct CclContext {
    config: CclConfig,
    comm: Arc<dyn Communicator>,
    selectors: Selectors,
    resources: Arc<SharedResources>,
    executor: Executor,
    capability: Option<Box<dyn Capability>>,
}

impl CclContext {
    pub fn new(
        config: CclConfig,
        comm: Arc<dyn Communicator>,
        resources: Arc<SharedResources>,
    ) -> CclResult<Self> {
        let selectors = Selectors::from_config(&config)?;
        ccl_info!(
            "context created: comm {}, rank {}, size {}, single node {}, fallback {}",
            comm.comm_id(),
            comm.rank(),
            comm.size(),
            comm.is_single_node(),
            selectors.enable_fallback()
        );
        Ok(Self {
            config,
            comm,
            selectors,
            resources,
            executor: Executor::new(),
            capability: None,
        })
    }

    /// Context configured from `CCL_*` environment variables
    pub fn from_env(comm: Arc<dyn Communicator>, resources: Arc<SharedResources>) -> CclResult<Self> {
        Self::new(CclConfig::from_env()?, comm, resources)
    }

    /// Install a predicate every selected algorithm must also satisfy
    pub fn with_capability(mut self, capability: impl Capability + 'static) -> Self {
        self.capability = Some(Box::new(capability));
        self
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn config(&self) -> &CclConfig {
        &self.config
    }

    pub fn selectors(&self) -> &Selectors {
        &self.selectors
    }

    pub fn selectors_mut(&mut self) -> &mut Selectors {
        &mut self.selectors
    }

    pub fn resources(&self) -> &Arc<SharedResources> {
        &self.resources
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn broadcast(
        &self,
        send: &CclBuffer,
        recv: &CclBuffer,
        count: usize,
        dtype: Datatype,
        root: usize,
        attr: &CollAttr,
    ) -> CclResult<CollRequest> {
        let args = CollArgs::new(send.clone(), recv.clone(), count, dtype).with_root(root);
        self.issue(CollType::Bcast, args, attr)
    }

    /// `count` is the number of elements each rank contributes
    pub fn allgather(
        &self,
        send: &CclBuffer,
        recv: &CclBuffer,
        count: usize,
        dtype: Datatype,
        attr: &CollAttr,
    ) -> CclResult<CollRequest> {
        let args = CollArgs::new(send.clone(), recv.clone(), count, dtype);
        self.issue(CollType::Allgather, args, attr)
    }

    /// `count` is the number of elements exchanged with each peer
    pub fn alltoall(
        &self,
        send: &CclBuffer,
        recv: &CclBuffer,
        count: usize,
        dtype: Datatype,
        attr: &CollAttr,
    ) -> CclResult<CollRequest> {
        let args = CollArgs::new(send.clone(), recv.clone(), count, dtype);
        self.issue(CollType::Alltoall, args, attr)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn reduce(
        &self,
        send: &CclBuffer,
        recv: &CclBuffer,
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        root: usize,
        attr: &CollAttr,
    ) -> CclResult<CollRequest> {
        let args = CollArgs::new(send.clone(), recv.clone(), count, dtype)
            .with_root(root)
            .with_op(op);
        self.issue(CollType::Reduce, args, attr)
    }

    /// `count` is the number of elements each rank receives
    pub fn reduce_scatter(
        &self,
        send: &CclBuffer,
        recv: &CclBuffer,
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        attr: &CollAttr,
    ) -> CclResult<CollRequest> {
        let args = CollArgs::new(send.clone(), recv.clone(), count, dtype).with_op(op);
        self.issue(CollType::ReduceScatter, args, attr)
    }

    pub fn barrier(&self, attr: &CollAttr) -> CclResult<CollRequest> {
        self.issue(CollType::Barrier, CollArgs::empty(), attr)
    }

    /// Selector parameters describing a call with `args`
    pub fn selector_param(&self, coll: CollType, args: &CollArgs, attr: &CollAttr) -> SelectorParam {
        let mut param = SelectorParam::new(coll, args.count, args.dtype)
            .with_scaleout(!self.comm.is_single_node())
            .with_mem_kind(mem_kind(args))
            .with_comm_size(self.comm.size());
        if let Some(node) = self.comm.node_comm() {
            param = param.with_node_size(node.size());
        }
        if let Some(hint) = attr.hint {
            param = param.with_hint(hint);
        }
        param
    }

    /// Algorithm a call with `args` would run
    pub fn select(&self, coll: CollType, args: &CollArgs, attr: &CollAttr) -> CclResult<AlgorithmTag> {
        let param = self.selector_param(coll, args, attr);
        let capability = ContextCapability {
            user: self.capability.as_deref(),
        };
        self.selectors.get(&param, &capability)
    }

    fn issue(&self, coll: CollType, args: CollArgs, attr: &CollAttr) -> CclResult<CollRequest> {
        args.validate(coll, self.comm.rank(), self.comm.size())?;
        let algo = self.select(coll, &args, attr)?;
        let mut sched = Schedule::new(coll, self.comm.clone(), self.comm.next_match_id());
        algorithms::build(&mut sched, algo, &args, &self.resources)?;
        ccl_debug!(
            "issue {} with {}: rank {}, tag {}, layout [{}]",
            coll,
            algo.name(),
            self.comm.rank(),
            sched.match_id(),
            sched.layout()
        );
        self.executor.submit(sched)
    }

    /// Progress until `request` completes
    pub fn wait(&self, request: &CollRequest) -> CclResult<()> {
        self.executor.wait(request)
    }

    /// Progress once; true if `request` completed
    pub fn test(&self, request: &CollRequest) -> CclResult<bool> {
        self.executor.test(request)
    }

    /// Progress every in-flight schedule once, returning how many remain
    pub fn progress(&self) -> CclResult<usize> {
        self.executor.progress()
    }

    /// Check that nothing is left in flight
    pub fn finalize(&self) -> CclResult<()> {
        let in_flight = self.executor.in_flight()?;
        if in_flight > 0 {
            return Err(CclError::invalid(format!(
                "finalize on rank {} with {} collectives in flight",
                self.comm.rank(),
                in_flight
            )));
        }
        ccl_info!(
            "context finalized: comm {}, rank {}",
            self.comm.comm_id(),
            self.comm.rank()
        );
        Ok(())
    }
}

/// Device if every buffer the call touches is device memory
fn mem_kind(args: &CollArgs) -> MemKind {
    let mut buffers = [&args.send, &args.recv]
        .into_iter()
        .filter(|buf| !buf.is_empty())
        .peekable();
    if buffers.peek().is_none() {
        return MemKind::Host;
    }
    if buffers.all(|buf| buf.kind() == MemKind::Device) {
        MemKind::Device
    } else {
        MemKind::Host
    }
}
