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

//! Collective types and their algorithm groups
//!
//! Each collective has a closed set of algorithms. `AlgorithmGroup` ties an
//! algorithm enum to its collective so the selector can be written once,
//! and `AlgorithmTag` carries any algorithm across that boundary (hints,
//! builder dispatch).

use std::fmt;

use crate::error::{CclError, CclResult};

pub mod algorithms;
pub mod selection;

pub use selection::{
    AlgorithmSelector, BorderKind, Capability, DefaultCapability, SelectionTable, SelectorParam,
    Selectors, TableKind,
};

/// Collective operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollType {
    Bcast,
    Allgather,
    Alltoall,
    Reduce,
    ReduceScatter,
    Barrier,
}

impl CollType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollType::Bcast => "bcast",
            CollType::Allgather => "allgather",
            CollType::Alltoall => "alltoall",
            CollType::Reduce => "reduce",
            CollType::ReduceScatter => "reduce_scatter",
            CollType::Barrier => "barrier",
        }
    }
}

impl fmt::Display for CollType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Algorithm enum of one collective
pub trait AlgorithmGroup:
    Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    const COLL: CollType;

    fn as_str(&self) -> &'static str;

    /// Every algorithm of the group, used to resolve names
    fn all() -> &'static [Self];

    fn default_main() -> Self;
    fn default_fallback() -> Self;
    fn default_scaleout() -> Self;

    fn into_tag(self) -> AlgorithmTag;

    /// The algorithm carried by `tag`, if it belongs to this group
    fn from_tag(tag: AlgorithmTag) -> Option<Self>;

    fn from_name(name: &str) -> CclResult<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|algo| algo.as_str() == name)
            .ok_or_else(|| {
                CclError::config(format!(
                    "unknown {} algorithm '{}', expected one of: {}",
                    Self::COLL,
                    name,
                    Self::all()
                        .iter()
                        .map(|a| a.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

macro_rules! algorithm_group {
    (
        $(#[$meta:meta])*
        $name:ident, $coll:expr, $variant:ident,
        main = $main:ident, fallback = $fallback:ident, scaleout = $scaleout:ident,
        { $($algo:ident => $str:expr),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($algo),+
        }

        impl AlgorithmGroup for $name {
            const COLL: CollType = $coll;

            fn as_str(&self) -> &'static str {
                match self {
                    $($name::$algo => $str),+
                }
            }

            fn all() -> &'static [Self] {
                &[$($name::$algo),+]
            }

            fn default_main() -> Self {
                $name::$main
            }

            fn default_fallback() -> Self {
                $name::$fallback
            }

            fn default_scaleout() -> Self {
                $name::$scaleout
            }

            fn into_tag(self) -> AlgorithmTag {
                AlgorithmTag::$variant(self)
            }

            fn from_tag(tag: AlgorithmTag) -> Option<Self> {
                match tag {
                    AlgorithmTag::$variant(algo) => Some(algo),
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

algorithm_group!(
    /// Broadcast algorithms
    BcastAlgo, CollType::Bcast, Bcast,
    main = Direct, fallback = Naive, scaleout = Direct,
    {
        Direct => "direct",
        Naive => "naive",
        ScatterRing => "scatter_ring",
        Topo => "topo",
    }
);

algorithm_group!(
    /// Allgather algorithms
    AllgatherAlgo, CollType::Allgather, Allgather,
    main = Direct, fallback = Naive, scaleout = Direct,
    {
        Direct => "direct",
        Naive => "naive",
        Ring => "ring",
        Topo => "topo",
    }
);

algorithm_group!(
    /// Alltoall algorithms
    AlltoallAlgo, CollType::Alltoall, Alltoall,
    main = Direct, fallback = Naive, scaleout = Direct,
    {
        Direct => "direct",
        Naive => "naive",
        Topo => "topo",
    }
);

algorithm_group!(
    /// Reduce algorithms
    ReduceAlgo, CollType::Reduce, Reduce,
    main = Direct, fallback = Tree, scaleout = Direct,
    {
        Direct => "direct",
        Tree => "tree",
    }
);

algorithm_group!(
    /// Reduce-scatter algorithms
    ReduceScatterAlgo, CollType::ReduceScatter, ReduceScatter,
    main = Direct, fallback = Naive, scaleout = Direct,
    {
        Direct => "direct",
        Naive => "naive",
        Ring => "ring",
    }
);

algorithm_group!(
    /// Barrier algorithms
    BarrierAlgo, CollType::Barrier, Barrier,
    main = Direct, fallback = Ring, scaleout = Direct,
    {
        Direct => "direct",
        Ring => "ring",
    }
);

/// Any algorithm of any collective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmTag {
    Bcast(BcastAlgo),
    Allgather(AllgatherAlgo),
    Alltoall(AlltoallAlgo),
    Reduce(ReduceAlgo),
    ReduceScatter(ReduceScatterAlgo),
    Barrier(BarrierAlgo),
}

impl AlgorithmTag {
    pub fn coll(&self) -> CollType {
        match self {
            AlgorithmTag::Bcast(_) => CollType::Bcast,
            AlgorithmTag::Allgather(_) => CollType::Allgather,
            AlgorithmTag::Alltoall(_) => CollType::Alltoall,
            AlgorithmTag::Reduce(_) => CollType::Reduce,
            AlgorithmTag::ReduceScatter(_) => CollType::ReduceScatter,
            AlgorithmTag::Barrier(_) => CollType::Barrier,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmTag::Bcast(a) => a.as_str(),
            AlgorithmTag::Allgather(a) => a.as_str(),
            AlgorithmTag::Alltoall(a) => a.as_str(),
            AlgorithmTag::Reduce(a) => a.as_str(),
            AlgorithmTag::ReduceScatter(a) => a.as_str(),
            AlgorithmTag::Barrier(a) => a.as_str(),
        }
    }

    /// Algorithms that address peer device memory directly
    pub fn is_topo(&self) -> bool {
        matches!(
            self,
            AlgorithmTag::Bcast(BcastAlgo::Topo)
                | AlgorithmTag::Allgather(AllgatherAlgo::Topo)
                | AlgorithmTag::Alltoall(AlltoallAlgo::Topo)
        )
    }

    /// Resolve `name` within the algorithm group of `coll`
    pub fn parse(coll: CollType, name: &str) -> CclResult<Self> {
        Ok(match coll {
            CollType::Bcast => BcastAlgo::from_name(name)?.into_tag(),
            CollType::Allgather => AllgatherAlgo::from_name(name)?.into_tag(),
            CollType::Alltoall => AlltoallAlgo::from_name(name)?.into_tag(),
            CollType::Reduce => ReduceAlgo::from_name(name)?.into_tag(),
            CollType::ReduceScatter => ReduceScatterAlgo::from_name(name)?.into_tag(),
            CollType::Barrier => BarrierAlgo::from_name(name)?.into_tag(),
        })
    }
}

impl fmt::Display for AlgorithmTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.coll(), self.name())
    }
}
