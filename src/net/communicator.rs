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

//! Communicator trait and related types
//!
//! A communicator is a group of ranks bound to a transport. Topology-aware
//! algorithms additionally need the node-local group and, on devices with two
//! sub-devices per card, the "pair" and "even" groups that split a node into a
//! two-dimensional grid: `node_rank = even_rank * pair_size + pair_rank`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CclError, CclResult};

use super::{CommId, Endpoint, MatchId, Transport};

/// Communicator trait - main interface for collective operations
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn comm_id(&self) -> CommId;
    fn transport(&self) -> Arc<dyn Transport>;

    /// Ranks of this group running on the same node as the caller
    fn node_comm(&self) -> Option<Arc<dyn Communicator>>;

    /// Ranks sharing one card with the caller
    fn pair_comm(&self) -> Option<Arc<dyn Communicator>>;

    /// Ranks of the node holding the same position within their pair
    fn even_comm(&self) -> Option<Arc<dyn Communicator>>;

    /// Next match id for a collective on this communicator
    ///
    /// Every rank that issues collectives in the same order gets the same
    /// sequence of ids.
    fn next_match_id(&self) -> MatchId;

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            comm_id: self.comm_id(),
            rank: self.rank(),
            size: self.size(),
        }
    }

    /// True when every rank of the group shares the caller's node
    fn is_single_node(&self) -> bool {
        match self.node_comm() {
            Some(node) => node.size() == self.size(),
            None => true,
        }
    }
}

/// Sub-groups of a world communicator
#[derive(Clone)]
struct SubComms {
    node: Arc<Comm>,
    pair: Arc<Comm>,
    even: Arc<Comm>,
}

/// Communicator over an arbitrary `Transport`
pub struct Comm {
    id: CommId,
    rank: usize,
    size: usize,
    transport: Arc<dyn Transport>,
    sub: Option<SubComms>,
    op_counter: AtomicU64,
}

impl Comm {
    /// Flat communicator with no topology information
    pub fn new(id: CommId, rank: usize, size: usize, transport: Arc<dyn Transport>) -> CclResult<Self> {
        if size == 0 || rank >= size {
            return Err(CclError::invalid(format!(
                "rank {} is outside a group of {} ranks",
                rank, size
            )));
        }
        Ok(Self {
            id,
            rank,
            size,
            transport,
            sub: None,
            op_counter: AtomicU64::new(0),
        })
    }

    /// World communicator for `rank` with node, pair and even groups derived
    /// from `topology`
    pub fn world(
        topology: &Topology,
        rank: usize,
        transport: Arc<dyn Transport>,
    ) -> CclResult<Arc<Self>> {
        topology.validate()?;
        let coords = topology.coords(rank)?;
        let node = Comm::new(
            topology.node_comm_id(coords.node),
            coords.node_rank,
            topology.ranks_per_node,
            transport.clone(),
        )?;
        let pair = Comm::new(
            topology.pair_comm_id(coords.node, coords.even_rank),
            coords.pair_rank,
            topology.pair_size,
            transport.clone(),
        )?;
        let even = Comm::new(
            topology.even_comm_id(coords.node, coords.pair_rank),
            coords.even_rank,
            topology.ranks_per_node / topology.pair_size,
            transport.clone(),
        )?;
        let mut world = Comm::new(topology.base_id, rank, topology.world_size, transport)?;
        world.sub = Some(SubComms {
            node: Arc::new(node),
            pair: Arc::new(pair),
            even: Arc::new(even),
        });
        Ok(Arc::new(world))
    }
}

impl Communicator for Comm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn comm_id(&self) -> CommId {
        self.id
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    fn node_comm(&self) -> Option<Arc<dyn Communicator>> {
        self.sub.as_ref().map(|s| s.node.clone() as Arc<dyn Communicator>)
    }

    fn pair_comm(&self) -> Option<Arc<dyn Communicator>> {
        self.sub.as_ref().map(|s| s.pair.clone() as Arc<dyn Communicator>)
    }

    fn even_comm(&self) -> Option<Arc<dyn Communicator>> {
        self.sub.as_ref().map(|s| s.even.clone() as Arc<dyn Communicator>)
    }

    fn next_match_id(&self) -> MatchId {
        MatchId(self.op_counter.fetch_add(1, Ordering::Relaxed))
    }
}

/// Position of one rank in a `Topology`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankCoords {
    pub node: usize,
    pub node_rank: usize,
    pub even_rank: usize,
    pub pair_rank: usize,
}

/// Static description of how ranks are laid out across nodes and cards
///
/// Ranks are packed: node `n` holds ranks `n * ranks_per_node ..`. Within a
/// node, consecutive `pair_size` ranks share a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub world_size: usize,
    pub ranks_per_node: usize,
    pub pair_size: usize,
    /// Id of the world communicator; sub-group ids follow it
    pub base_id: CommId,
}

impl Topology {
    /// All ranks on one node, one rank per card
    pub fn single_node(world_size: usize) -> Self {
        Self {
            world_size,
            ranks_per_node: world_size,
            pair_size: 1,
            base_id: CommId(0),
        }
    }

    pub fn new(world_size: usize, ranks_per_node: usize, pair_size: usize) -> Self {
        Self {
            world_size,
            ranks_per_node,
            pair_size,
            base_id: CommId(0),
        }
    }

    pub fn with_base_id(mut self, base_id: CommId) -> Self {
        self.base_id = base_id;
        self
    }

    pub fn num_nodes(&self) -> usize {
        self.world_size / self.ranks_per_node
    }

    fn validate(&self) -> CclResult<()> {
        if self.world_size == 0
            || self.ranks_per_node == 0
            || self.pair_size == 0
            || self.world_size % self.ranks_per_node != 0
            || self.ranks_per_node % self.pair_size != 0
        {
            return Err(CclError::invalid(format!("inconsistent topology {:?}", self)));
        }
        Ok(())
    }

    pub fn coords(&self, rank: usize) -> CclResult<RankCoords> {
        if rank >= self.world_size {
            return Err(CclError::invalid(format!(
                "rank {} is outside a world of {} ranks",
                rank, self.world_size
            )));
        }
        let node_rank = rank % self.ranks_per_node;
        Ok(RankCoords {
            node: rank / self.ranks_per_node,
            node_rank,
            even_rank: node_rank / self.pair_size,
            pair_rank: node_rank % self.pair_size,
        })
    }

    /// Number of communicator ids consumed starting at `base_id`
    pub fn comm_id_span(&self) -> usize {
        let nodes = self.num_nodes();
        let cards = self.ranks_per_node / self.pair_size;
        1 + nodes + nodes * cards + nodes * self.pair_size
    }

    fn node_comm_id(&self, node: usize) -> CommId {
        CommId(self.base_id.0 + 1 + node)
    }

    fn pair_comm_id(&self, node: usize, even_rank: usize) -> CommId {
        let cards = self.ranks_per_node / self.pair_size;
        CommId(self.base_id.0 + 1 + self.num_nodes() + node * cards + even_rank)
    }

    fn even_comm_id(&self, node: usize, pair_rank: usize) -> CommId {
        let cards = self.ranks_per_node / self.pair_size;
        let nodes = self.num_nodes();
        CommId(self.base_id.0 + 1 + nodes + nodes * cards + node * self.pair_size + pair_rank)
    }
}
