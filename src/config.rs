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

//! Runtime configuration
//!
//! Algorithm selection strings use the grammar
//! `<algo>:<left>-<right>;<algo>:<left>-<right>;...` where a size is a
//! decimal byte count or `max`. A block made of only an algorithm name
//! assigns the whole size range. Unset strings keep the built-in defaults.

use serde::{Deserialize, Serialize};

use crate::coll::CollType;
use crate::error::{CclError, CclResult};

/// Environment variable holding the fallback switch
pub const ENV_ALGO_FALLBACK: &str = "CCL_ALGO_FALLBACK";

/// Selection strings of one collective
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionStrings {
    /// Rules for operations confined to one node
    pub main: Option<String>,
    /// Rules for operations spanning several nodes
    pub scaleout: Option<String>,
}

/// Configuration of a `CclContext`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CclConfig {
    pub bcast: SelectionStrings,
    pub allgather: SelectionStrings,
    pub alltoall: SelectionStrings,
    pub reduce: SelectionStrings,
    pub reduce_scatter: SelectionStrings,
    pub barrier: SelectionStrings,
    /// Use the fallback table when the main table's choice is not applicable
    pub enable_algo_fallback: bool,
    /// Polls every request of the in-process fabric stays pending
    pub local_poll_delay: usize,
}

impl Default for CclConfig {
    fn default() -> Self {
        Self {
            bcast: SelectionStrings::default(),
            allgather: SelectionStrings::default(),
            alltoall: SelectionStrings::default(),
            reduce: SelectionStrings::default(),
            reduce_scatter: SelectionStrings::default(),
            barrier: SelectionStrings::default(),
            enable_algo_fallback: true,
            local_poll_delay: 0,
        }
    }
}

const COLLS: [CollType; 6] = [
    CollType::Bcast,
    CollType::Allgather,
    CollType::Alltoall,
    CollType::Reduce,
    CollType::ReduceScatter,
    CollType::Barrier,
];

impl CclConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment variable names for the main and scale-out strings of `coll`
    pub fn env_names(coll: CollType) -> (String, String) {
        let main = format!("CCL_{}", coll.as_str().to_uppercase());
        let scaleout = format!("{}_SCALEOUT", main);
        (main, scaleout)
    }

    /// Read the configuration from `CCL_*` environment variables
    pub fn from_env() -> CclResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name to its value
    pub fn from_lookup<F>(lookup: F) -> CclResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        for coll in COLLS {
            let (main, scaleout) = Self::env_names(coll);
            let strings = config.strings_mut(coll);
            strings.main = lookup(&main);
            strings.scaleout = lookup(&scaleout);
        }
        if let Some(value) = lookup(ENV_ALGO_FALLBACK) {
            config.enable_algo_fallback = parse_bool(ENV_ALGO_FALLBACK, &value)?;
        }
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> CclResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> CclResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn strings(&self, coll: CollType) -> &SelectionStrings {
        match coll {
            CollType::Bcast => &self.bcast,
            CollType::Allgather => &self.allgather,
            CollType::Alltoall => &self.alltoall,
            CollType::Reduce => &self.reduce,
            CollType::ReduceScatter => &self.reduce_scatter,
            CollType::Barrier => &self.barrier,
        }
    }

    fn strings_mut(&mut self, coll: CollType) -> &mut SelectionStrings {
        match coll {
            CollType::Bcast => &mut self.bcast,
            CollType::Allgather => &mut self.allgather,
            CollType::Alltoall => &mut self.alltoall,
            CollType::Reduce => &mut self.reduce,
            CollType::ReduceScatter => &mut self.reduce_scatter,
            CollType::Barrier => &mut self.barrier,
        }
    }

    /// Set the main selection string of `coll`
    pub fn with_main(mut self, coll: CollType, rules: impl Into<String>) -> Self {
        self.strings_mut(coll).main = Some(rules.into());
        self
    }

    /// Set the scale-out selection string of `coll`
    pub fn with_scaleout(mut self, coll: CollType, rules: impl Into<String>) -> Self {
        self.strings_mut(coll).scaleout = Some(rules.into());
        self
    }

    pub fn with_algo_fallback(mut self, enabled: bool) -> Self {
        self.enable_algo_fallback = enabled;
        self
    }

    pub fn with_local_poll_delay(mut self, polls: usize) -> Self {
        self.local_poll_delay = polls;
        self
    }
}

fn parse_bool(name: &str, value: &str) -> CclResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CclError::config(format!(
            "{} expects a boolean, got '{}'",
            name, other
        ))),
    }
}
