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

//! Message-size based algorithm selection
//!
//! A `SelectionTable` partitions the byte-size domain `[0, MAX_COLL_SIZE]`
//! into closed intervals, each tagged with one algorithm. An interval
//! `[low, high]` is stored as a `Left` entry keyed by `low` and a `Right`
//! entry keyed by `high`, or as a single `Both` entry when `low == high`.
//! Looking up the first key `>= size` therefore lands on the entry that
//! closes the interval containing `size`.
//!
//! Tables keep three invariants after every `insert`: sizes 0 and
//! `MAX_COLL_SIZE` are keys, intervals tile the domain without gaps or
//! overlaps, and no two neighbouring intervals carry the same algorithm.

use std::collections::BTreeMap;
use std::fmt;

use crate::buffer::MemKind;
use crate::config::CclConfig;
use crate::data_types::Datatype;
use crate::error::{CclError, CclResult};
use crate::util::to_string::size_to_string;
use crate::{ccl_debug, ccl_error, ccl_trace};

use super::{
    AlgorithmGroup, AlgorithmTag, AllgatherAlgo, AlltoallAlgo, BarrierAlgo, BcastAlgo, CollType,
    ReduceAlgo, ReduceScatterAlgo,
};

/// Sentinel for the unbounded upper end of the size domain
pub const MAX_COLL_SIZE: usize = usize::MAX;

const BLOCK_DELIMITER: char = ';';
const ALGO_DELIMITER: char = ':';
const SIZE_DELIMITER: char = '-';
const MAX_COLL_SIZE_STR: &str = "max";

/// Which end of an interval a table entry marks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BorderKind {
    Left,
    Right,
    /// Single-point interval
    Both,
}

impl fmt::Display for BorderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BorderKind::Left => "left",
            BorderKind::Right => "right",
            BorderKind::Both => "both",
        };
        f.write_str(s)
    }
}

/// Closed interval `[low, high]` of a selection table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval<A> {
    pub low: usize,
    pub high: usize,
    pub algo: A,
}

impl<A> Interval<A> {
    pub fn contains(&self, size: usize) -> bool {
        self.low <= size && size <= self.high
    }
}

/// Ordered interval map from message size to algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionTable<A> {
    entries: BTreeMap<usize, (A, BorderKind)>,
}

impl<A: AlgorithmGroup> Default for SelectionTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: AlgorithmGroup> SelectionTable<A> {
    /// Empty table, not valid until the domain is covered
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Table assigning `algo` to every size
    pub fn with_algorithm(algo: A) -> Self {
        let mut table = Self::new();
        table.put_interval(0, MAX_COLL_SIZE, algo);
        table
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains_key(&self, size: usize) -> bool {
        self.entries.contains_key(&size)
    }

    /// Raw entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (usize, A, BorderKind)> + '_ {
        self.entries
            .iter()
            .map(|(size, (algo, border))| (*size, *algo, *border))
    }

    /// First entry whose key is `>= size`
    pub fn lower_bound(&self, size: usize) -> Option<(usize, A, BorderKind)> {
        self.entries
            .range(size..)
            .next()
            .map(|(key, (algo, border))| (*key, *algo, *border))
    }

    /// Algorithm of the interval containing `size`
    pub fn get(&self, size: usize) -> Option<A> {
        self.lower_bound(size).map(|(_, algo, _)| algo)
    }

    /// Rebuild `[low, high]` pairs from the border entries
    pub fn intervals(&self) -> CclResult<Vec<Interval<A>>> {
        let mut intervals = Vec::with_capacity(self.entries.len() / 2 + 1);
        let mut iter = self.entries.iter();
        while let Some((&size, &(algo, border))) = iter.next() {
            match border {
                BorderKind::Both => intervals.push(Interval {
                    low: size,
                    high: size,
                    algo,
                }),
                BorderKind::Left => match iter.next() {
                    Some((&high, &(next_algo, BorderKind::Right))) if next_algo == algo => {
                        intervals.push(Interval {
                            low: size,
                            high,
                            algo,
                        })
                    }
                    Some((&next, &(next_algo, next_border))) => {
                        return Err(CclError::corrupted(format!(
                            "left border {} ({}) is followed by {} border {} ({})",
                            size_to_string(size),
                            algo,
                            next_border,
                            size_to_string(next),
                            next_algo
                        )))
                    }
                    None => {
                        return Err(CclError::corrupted(format!(
                            "missing right border after left border {} ({})",
                            size_to_string(size),
                            algo
                        )))
                    }
                },
                BorderKind::Right => {
                    return Err(CclError::corrupted(format!(
                        "right border {} ({}) without a left border",
                        size_to_string(size),
                        algo
                    )))
                }
            }
        }
        Ok(intervals)
    }

    // Callers guarantee neither key is present
    fn put_interval(&mut self, low: usize, high: usize, algo: A) {
        if low == high {
            self.entries.insert(low, (algo, BorderKind::Both));
        } else {
            self.entries.insert(low, (algo, BorderKind::Left));
            self.entries.insert(high, (algo, BorderKind::Right));
        }
    }

    fn remove_interval(&mut self, interval: &Interval<A>) {
        self.entries.remove(&interval.low);
        self.entries.remove(&interval.high);
    }

    /// Assign `algo` to every size in `[left, right]`
    ///
    /// Intervals fully inside the range are dropped, intervals crossing one of
    /// its edges keep their outer part, and neighbours left with the same
    /// algorithm are merged afterwards.
    pub fn insert(&mut self, left: usize, right: usize, algo: A) -> CclResult<()> {
        ccl_trace!(
            "insert: left {}, right {}, algo {}",
            size_to_string(left),
            size_to_string(right),
            algo
        );

        if left > right {
            return Err(CclError::config(format!(
                "left border should be less or equal to right border ({}, {})",
                size_to_string(left),
                size_to_string(right)
            )));
        }

        let overlapping: Vec<Interval<A>> = self
            .intervals()?
            .into_iter()
            .filter(|iv| iv.high >= left && iv.low <= right)
            .collect();

        for iv in overlapping {
            self.remove_interval(&iv);
            if iv.low < left {
                self.put_interval(iv.low, left - 1, iv.algo);
            }
            if iv.high > right {
                self.put_interval(right + 1, iv.high, iv.algo);
            }
        }

        if self.contains_key(left) || self.contains_key(right) {
            return Err(CclError::corrupted(format!(
                "borders {} and {} are still occupied after clearing the range",
                size_to_string(left),
                size_to_string(right)
            )));
        }
        self.put_interval(left, right, algo);

        self.coalesce()
    }

    /// Merge neighbouring intervals (`high + 1 == low`) with the same algorithm
    fn coalesce(&mut self) -> CclResult<()> {
        let intervals = self.intervals()?;
        let count = intervals.len();

        let mut merged: Vec<Interval<A>> = Vec::with_capacity(count);
        for iv in intervals {
            match merged.last_mut() {
                Some(prev) if prev.algo == iv.algo && prev.high.checked_add(1) == Some(iv.low) => {
                    prev.high = iv.high;
                }
                _ => merged.push(iv),
            }
        }

        if merged.len() != count {
            self.entries.clear();
            for iv in merged {
                self.put_interval(iv.low, iv.high, iv.algo);
            }
        }
        Ok(())
    }

    /// Check that the table covers the whole domain with well-formed intervals
    pub fn validate(&self) -> CclResult<()> {
        if self.entries.len() < 2 {
            return Err(CclError::config(format!(
                "{} selection table should have at least 2 entries, has {}",
                A::COLL,
                self.entries.len()
            )));
        }
        if !self.contains_key(0) || !self.contains_key(MAX_COLL_SIZE) {
            return Err(CclError::config(format!(
                "{} selection table should have entries for min and max message sizes",
                A::COLL
            )));
        }

        let mut expect_right = false;
        for (size, algo, border) in self.iter() {
            let expected = match border {
                BorderKind::Right => expect_right,
                BorderKind::Left | BorderKind::Both => !expect_right,
            };
            if !expected {
                return Err(CclError::config(format!(
                    "unexpected elem in {} table: size {}, algo {}, border {}",
                    A::COLL,
                    size_to_string(size),
                    algo,
                    border
                )));
            }
            expect_right = border == BorderKind::Left;
        }
        if expect_right {
            return Err(CclError::config(format!(
                "{} selection table ends with a left border",
                A::COLL
            )));
        }

        let intervals = self.intervals()?;
        for pair in intervals.windows(2) {
            if pair[0].high.checked_add(1) != Some(pair[1].low) {
                return Err(CclError::config(format!(
                    "{} selection table has a gap or overlap between [{} - {}] and [{} - {}]",
                    A::COLL,
                    size_to_string(pair[0].low),
                    size_to_string(pair[0].high),
                    size_to_string(pair[1].low),
                    size_to_string(pair[1].high)
                )));
            }
        }
        Ok(())
    }

    /// Apply a rule string of the form `algo:left-right;algo;...`
    pub fn fill_from_str(&mut self, rules: &str) -> CclResult<()> {
        let rules = rules.strip_suffix(BLOCK_DELIMITER).unwrap_or(rules);

        for block in rules.split(BLOCK_DELIMITER) {
            if block.trim().is_empty() {
                return Err(CclError::config(format!(
                    "empty block detected in string: {}",
                    rules
                )));
            }
            ccl_trace!("block {}", block);

            match block.split_once(ALGO_DELIMITER) {
                None => {
                    let algo = A::from_name(block.trim())?;
                    self.clear();
                    self.insert(0, MAX_COLL_SIZE, algo)?;
                }
                Some((name, range)) => {
                    let algo = A::from_name(name.trim())?;
                    let (left, right) = range.split_once(SIZE_DELIMITER).ok_or_else(|| {
                        CclError::config(format!(
                            "can not parse size range from string: {}, block: {}",
                            rules, block
                        ))
                    })?;
                    let left = parse_size(left, rules, block)?;
                    let right = parse_size(right, rules, block)?;
                    ccl_trace!(
                        "algo {}, left {}, right {}",
                        algo,
                        size_to_string(left),
                        size_to_string(right)
                    );
                    self.insert(left, right, algo)?;
                }
            }
        }
        Ok(())
    }

    /// Render one `[low - high]: algo` line per interval
    pub fn to_str(&self) -> CclResult<String> {
        let mut out = String::new();
        for iv in self.intervals()? {
            out.push_str(&format!(
                "[{} - {}]: {}\n",
                size_to_string(iv.low),
                size_to_string(iv.high),
                iv.algo
            ));
        }
        Ok(out)
    }
}

fn parse_size(value: &str, rules: &str, block: &str) -> CclResult<usize> {
    let value = value.trim();
    if value == MAX_COLL_SIZE_STR {
        return Ok(MAX_COLL_SIZE);
    }
    value.parse::<usize>().map_err(|_| {
        CclError::config(format!(
            "can not parse size '{}' from string: {}, block: {}",
            value, rules, block
        ))
    })
}

/// Which table of a selector a lookup is made against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Main,
    Fallback,
    Scaleout,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Main => "main table",
            TableKind::Fallback => "fallback table",
            TableKind::Scaleout => "scaleout table",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs of one algorithm selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorParam {
    pub coll: CollType,
    pub count: usize,
    pub dtype: Datatype,
    /// Algorithm requested by the caller, used if applicable
    pub hint: Option<AlgorithmTag>,
    /// The operation spans more than one node
    pub is_scaleout: bool,
    pub mem_kind: MemKind,
    pub comm_size: usize,
    /// Ranks of the caller's node group; `None` when the communicator has
    /// no topology and is its own node group
    pub node_size: Option<usize>,
}

impl SelectorParam {
    pub fn new(coll: CollType, count: usize, dtype: Datatype) -> Self {
        Self {
            coll,
            count,
            dtype,
            hint: None,
            is_scaleout: false,
            mem_kind: MemKind::Host,
            comm_size: 1,
            node_size: None,
        }
    }

    pub fn with_hint(mut self, hint: AlgorithmTag) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn with_scaleout(mut self, is_scaleout: bool) -> Self {
        self.is_scaleout = is_scaleout;
        self
    }

    pub fn with_mem_kind(mut self, kind: MemKind) -> Self {
        self.mem_kind = kind;
        self
    }

    pub fn with_comm_size(mut self, size: usize) -> Self {
        self.comm_size = size;
        self
    }

    pub fn with_node_size(mut self, size: usize) -> Self {
        self.node_size = Some(size);
        self
    }

    /// True when the node group holds every rank of the communicator
    pub fn node_covers_comm(&self) -> bool {
        self.node_size.map_or(true, |node| node == self.comm_size)
    }

    /// Message size in bytes, the key used for table lookup
    pub fn size(&self) -> usize {
        self.count.saturating_mul(self.dtype.size())
    }
}

impl fmt::Display for SelectorParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "coll {}, count {}, dtype {}, scaleout {}, mem {:?}, comm_size {}",
            self.coll, self.count, self.dtype, self.is_scaleout, self.mem_kind, self.comm_size
        )?;
        if let Some(hint) = self.hint {
            write!(f, ", hint {}", hint.name())?;
        }
        Ok(())
    }
}

/// Decides whether an algorithm can run the operation described by a param
pub trait Capability: Send + Sync {
    fn can_use(&self, algo: AlgorithmTag, param: &SelectorParam, table: TableKind) -> bool;
}

impl<F> Capability for F
where
    F: Fn(AlgorithmTag, &SelectorParam, TableKind) -> bool + Send + Sync,
{
    fn can_use(&self, algo: AlgorithmTag, param: &SelectorParam, table: TableKind) -> bool {
        self(algo, param, table)
    }
}

/// Built-in rules: peer-memory algorithms need device buffers and a node
/// group spanning the whole communicator
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCapability;

impl Capability for DefaultCapability {
    fn can_use(&self, algo: AlgorithmTag, param: &SelectorParam, _table: TableKind) -> bool {
        if algo.is_topo() {
            return param.mem_kind == MemKind::Device
                && !param.is_scaleout
                && param.node_covers_comm();
        }
        true
    }
}

/// Main, fallback and scale-out tables of one collective
#[derive(Debug, Clone)]
pub struct AlgorithmSelector<A: AlgorithmGroup> {
    main: SelectionTable<A>,
    fallback: SelectionTable<A>,
    scaleout: SelectionTable<A>,
}

impl<A: AlgorithmGroup> Default for AlgorithmSelector<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: AlgorithmGroup> AlgorithmSelector<A> {
    /// Selector holding the built-in defaults of the collective
    pub fn new() -> Self {
        Self {
            main: SelectionTable::with_algorithm(A::default_main()),
            fallback: SelectionTable::with_algorithm(A::default_fallback()),
            scaleout: SelectionTable::with_algorithm(A::default_scaleout()),
        }
    }

    /// Apply the main and scale-out rule strings and validate every table
    pub fn init(&mut self, main: Option<&str>, scaleout: Option<&str>) -> CclResult<()> {
        if let Some(rules) = main.filter(|s| !s.is_empty()) {
            self.main.fill_from_str(rules)?;
        }
        if let Some(rules) = scaleout.filter(|s| !s.is_empty()) {
            self.scaleout.fill_from_str(rules)?;
        }

        for kind in [TableKind::Main, TableKind::Fallback, TableKind::Scaleout] {
            if let Err(e) = self.table(kind).validate() {
                ccl_error!("{} {} is invalid: {}", A::COLL, kind, e);
                self.print();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn table(&self, kind: TableKind) -> &SelectionTable<A> {
        match kind {
            TableKind::Main => &self.main,
            TableKind::Fallback => &self.fallback,
            TableKind::Scaleout => &self.scaleout,
        }
    }

    pub fn table_mut(&mut self, kind: TableKind) -> &mut SelectionTable<A> {
        match kind {
            TableKind::Main => &mut self.main,
            TableKind::Fallback => &mut self.fallback,
            TableKind::Scaleout => &mut self.scaleout,
        }
    }

    /// Assign `algo` to `[left, right]` in one of the tables
    pub fn insert(&mut self, kind: TableKind, left: usize, right: usize, algo: A) -> CclResult<()> {
        self.table_mut(kind).insert(left, right, algo)
    }

    /// Pick the algorithm for `param`
    ///
    /// Order: applicable hint, then the scale-out table for scale-out
    /// operations, then the main table, then the fallback table if enabled.
    pub fn get(
        &self,
        param: &SelectorParam,
        capability: &dyn Capability,
        enable_fallback: bool,
    ) -> CclResult<A> {
        ccl_debug!("param: {}", param);
        let size = param.size();

        if let Some(tag) = param.hint {
            match A::from_tag(tag) {
                Some(algo) if capability.can_use(tag, param, TableKind::Main) => {
                    ccl_debug!(
                        "selected hint algo: coll {}, count {}, algo {}",
                        A::COLL,
                        param.count,
                        algo
                    );
                    return Ok(algo);
                }
                _ => ccl_debug!(
                    "can not select hint algorithm: coll {}, count {}, algo {}, switch to regular selection",
                    A::COLL,
                    param.count,
                    tag.name()
                ),
            }
        }

        if param.is_scaleout {
            if let Some(algo) = self.scaleout.get(size) {
                if capability.can_use(algo.into_tag(), param, TableKind::Scaleout) {
                    ccl_debug!(
                        "selected scale-out algo: coll {}, count {}, algo {}",
                        A::COLL,
                        param.count,
                        algo
                    );
                    return Ok(algo);
                }
            }
        }

        let main_choice = self
            .main
            .get(size)
            .filter(|algo| capability.can_use(algo.into_tag(), param, TableKind::Main));

        let algo = match main_choice {
            Some(algo) => algo,
            None => {
                if !enable_fallback {
                    return Err(self.exhausted(
                        param,
                        "can not select algo from main table and fallback is disabled",
                    ));
                }
                let algo = self
                    .fallback
                    .get(size)
                    .ok_or_else(|| self.exhausted(param, "size is out of range of fallback table"))?;
                if !capability.can_use(algo.into_tag(), param, TableKind::Fallback) {
                    return Err(self.exhausted(
                        param,
                        &format!("can not use {} from fallback table", algo),
                    ));
                }
                algo
            }
        };

        ccl_debug!(
            "selected algo: coll {}, count {}, algo {}",
            A::COLL,
            param.count,
            algo
        );
        Ok(algo)
    }

    fn exhausted(&self, param: &SelectorParam, reason: &str) -> CclError {
        ccl_error!(
            "can not select algorithm: coll {}, size {}: {}",
            A::COLL,
            param.size(),
            reason
        );
        CclError::SelectionExhausted {
            coll: A::COLL,
            size: param.size(),
            reason: reason.to_string(),
        }
    }

    /// All three tables, labelled
    pub fn dump(&self) -> CclResult<String> {
        let mut out = format!("{} selection\n", A::COLL);
        for kind in [TableKind::Main, TableKind::Fallback, TableKind::Scaleout] {
            out.push_str(&format!("  {}\n", kind));
            for line in self.table(kind).to_str()?.lines() {
                out.push_str(&format!("    {}\n", line));
            }
        }
        Ok(out)
    }

    /// Log the tables at debug level
    pub fn print(&self) {
        match self.dump() {
            Ok(text) => ccl_debug!("\n{}", text),
            Err(e) => ccl_debug!("{} selection tables can not be printed: {}", A::COLL, e),
        }
    }
}

/// Selectors of every collective
#[derive(Debug, Clone)]
pub struct Selectors {
    pub bcast: AlgorithmSelector<BcastAlgo>,
    pub allgather: AlgorithmSelector<AllgatherAlgo>,
    pub alltoall: AlgorithmSelector<AlltoallAlgo>,
    pub reduce: AlgorithmSelector<ReduceAlgo>,
    pub reduce_scatter: AlgorithmSelector<ReduceScatterAlgo>,
    pub barrier: AlgorithmSelector<BarrierAlgo>,
    enable_fallback: bool,
}

impl Selectors {
    /// Build every selector from the defaults overridden by `config`
    pub fn from_config(config: &CclConfig) -> CclResult<Self> {
        let mut selectors = Self {
            bcast: AlgorithmSelector::new(),
            allgather: AlgorithmSelector::new(),
            alltoall: AlgorithmSelector::new(),
            reduce: AlgorithmSelector::new(),
            reduce_scatter: AlgorithmSelector::new(),
            barrier: AlgorithmSelector::new(),
            enable_fallback: config.enable_algo_fallback,
        };

        fn init_one<A: AlgorithmGroup>(
            selector: &mut AlgorithmSelector<A>,
            config: &CclConfig,
        ) -> CclResult<()> {
            let strings = config.strings(A::COLL);
            selector.init(strings.main.as_deref(), strings.scaleout.as_deref())
        }

        init_one(&mut selectors.bcast, config)?;
        init_one(&mut selectors.allgather, config)?;
        init_one(&mut selectors.alltoall, config)?;
        init_one(&mut selectors.reduce, config)?;
        init_one(&mut selectors.reduce_scatter, config)?;
        init_one(&mut selectors.barrier, config)?;
        Ok(selectors)
    }

    pub fn enable_fallback(&self) -> bool {
        self.enable_fallback
    }

    pub fn set_enable_fallback(&mut self, enabled: bool) {
        self.enable_fallback = enabled;
    }

    /// Pick the algorithm for `param` from the selector of its collective
    pub fn get(&self, param: &SelectorParam, capability: &dyn Capability) -> CclResult<AlgorithmTag> {
        let fallback = self.enable_fallback;
        Ok(match param.coll {
            CollType::Bcast => self.bcast.get(param, capability, fallback)?.into_tag(),
            CollType::Allgather => self.allgather.get(param, capability, fallback)?.into_tag(),
            CollType::Alltoall => self.alltoall.get(param, capability, fallback)?.into_tag(),
            CollType::Reduce => self.reduce.get(param, capability, fallback)?.into_tag(),
            CollType::ReduceScatter => self
                .reduce_scatter
                .get(param, capability, fallback)?
                .into_tag(),
            CollType::Barrier => self.barrier.get(param, capability, fallback)?.into_tag(),
        })
    }

    pub fn dump(&self) -> CclResult<String> {
        Ok([
            self.bcast.dump()?,
            self.allgather.dump()?,
            self.alltoall.dump()?,
            self.reduce.dump()?,
            self.reduce_scatter.dump()?,
            self.barrier.dump()?,
        ]
        .concat())
    }

    pub fn print(&self) {
        self.bcast.print();
        self.allgather.print();
        self.alltoall.print();
        self.reduce.print();
        self.reduce_scatter.print();
        self.barrier.print();
    }
}
