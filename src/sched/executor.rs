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

//! Cooperative executor for in-flight schedules
//!
//! `progress` polls every queued schedule once. Callers interleave it with
//! their own work, or block on one request with `wait`, which spins on
//! `progress`. Started schedules can not be cancelled; they either complete
//! or fail.
//!
//! Schedules that synchronize through node-group barriers share one
//! reusable barrier per group, so they are progressed strictly in submission
//! order: one of them is not touched while an earlier one is in flight.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::coll::{AlgorithmTag, CollType};
use crate::error::{poisoned, CclError, CclResult, Status};
use crate::ccl_debug;

use super::schedule::Schedule;

struct RequestState {
    id: u64,
    coll: CollType,
    algo: Option<AlgorithmTag>,
    completed: AtomicBool,
    status: Mutex<Status>,
    error: Mutex<Option<CclError>>,
}

/// Completion handle of a submitted schedule
#[derive(Clone)]
pub struct CollRequest {
    state: Arc<RequestState>,
}

impl CollRequest {
    fn new(id: u64, coll: CollType, algo: Option<AlgorithmTag>) -> Self {
        Self {
            state: Arc::new(RequestState {
                id,
                coll,
                algo,
                completed: AtomicBool::new(false),
                status: Mutex::new(Status::ok()),
                error: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn coll(&self) -> CollType {
        self.state.coll
    }

    pub fn algorithm(&self) -> Option<AlgorithmTag> {
        self.state.algo
    }

    /// True once the schedule finished, successfully or not
    pub fn is_completed(&self) -> bool {
        self.state.completed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> CclResult<Status> {
        Ok(self.state.status.lock().map_err(poisoned)?.clone())
    }

    fn finish(&self, result: CclResult<()>) -> CclResult<()> {
        if let Err(e) = result {
            *self.state.status.lock().map_err(poisoned)? = Status::from(&e);
            *self.state.error.lock().map_err(poisoned)? = Some(e);
        }
        self.state.completed.store(true, Ordering::Release);
        Ok(())
    }

    /// Ok(true) if completed successfully, the schedule's error if it failed
    fn outcome(&self) -> CclResult<bool> {
        if !self.is_completed() {
            return Ok(false);
        }
        if let Some(e) = self.state.error.lock().map_err(poisoned)?.take() {
            return Err(e);
        }
        let status = self.status()?;
        if !status.is_ok() {
            return Err(CclError::transport(status.get_msg().to_string()));
        }
        Ok(true)
    }
}

impl fmt::Debug for CollRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollRequest")
            .field("id", &self.state.id)
            .field("coll", &self.state.coll)
            .field("algo", &self.state.algo)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Polls the schedules submitted to it
#[derive(Default)]
pub struct Executor {
    queue: Mutex<Vec<(Schedule, CollRequest)>>,
    next_id: AtomicU64,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `schedule` and make a first pass over it
    pub fn submit(&self, schedule: Schedule) -> CclResult<CollRequest> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = CollRequest::new(id, schedule.coll(), schedule.algorithm());
        ccl_debug!(
            "submit schedule {}: coll {}, algo {}, entries {}",
            id,
            schedule.coll(),
            schedule.algorithm().map_or("none", |a| a.name()),
            schedule.entry_count()
        );
        self.queue
            .lock()
            .map_err(poisoned)?
            .push((schedule, request.clone()));
        self.progress()?;
        Ok(request)
    }

    /// Poll every queued schedule once, returning how many are still in flight
    ///
    /// A failing schedule is dropped and its error is handed to its request.
    pub fn progress(&self) -> CclResult<usize> {
        let mut queue = self.queue.lock().map_err(poisoned)?;
        let mut still_running = Vec::with_capacity(queue.len());
        let mut node_sync_busy = false;
        for (mut schedule, request) in queue.drain(..) {
            let node_sync = schedule.uses_node_sync();
            if node_sync && node_sync_busy {
                still_running.push((schedule, request));
                continue;
            }
            match schedule.do_progress() {
                Ok(false) => {
                    node_sync_busy |= node_sync;
                    still_running.push((schedule, request));
                }
                Ok(true) => request.finish(Ok(()))?,
                Err(e) => request.finish(Err(e))?,
            }
        }
        *queue = still_running;
        Ok(queue.len())
    }

    pub fn in_flight(&self) -> CclResult<usize> {
        Ok(self.queue.lock().map_err(poisoned)?.len())
    }

    /// Progress once and report whether `request` completed
    pub fn test(&self, request: &CollRequest) -> CclResult<bool> {
        if !request.is_completed() {
            self.progress()?;
        }
        request.outcome()
    }

    /// Progress until `request` completes
    pub fn wait(&self, request: &CollRequest) -> CclResult<()> {
        while !self.test(request)? {
            std::thread::yield_now();
        }
        Ok(())
    }
}
