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

//! Integration tests for staged schedules and the executor
//!
//! A scripted transport keeps every request pending until the test
//! releases it, so stage boundaries can be observed one poll at a time.
//!
//! ```bash
//! cargo test --test schedule_test
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ccl::buffer::CclBuffer;
use ccl::coll::CollType;
use ccl::error::{CclError, CclResult, Code};
use ccl::net::{
    Comm, CommId, Communicator, Endpoint, MatchId, Primitive, RequestId, RequestStatus, Transport,
};
use ccl::sched::{EntryStatus, Executor, Schedule};
use ccl::{Datatype, ReduceOp};

#[derive(Default)]
struct Script {
    next: u64,
    started: Vec<&'static str>,
    open: HashSet<u64>,
    done: HashSet<u64>,
    fail_on: Option<&'static str>,
    failed: HashSet<u64>,
}

/// Transport whose requests complete only when the test says so
#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    fn failing_on(name: &'static str) -> Self {
        let transport = Self::default();
        transport.script.lock().unwrap().fail_on = Some(name);
        transport
    }

    fn started(&self) -> Vec<&'static str> {
        self.script.lock().unwrap().started.clone()
    }

    /// Complete every request started so far
    fn complete_all(&self) {
        let mut script = self.script.lock().unwrap();
        let open: Vec<u64> = script.open.drain().collect();
        script.done.extend(open);
    }
}

impl Transport for ScriptedTransport {
    fn start(&self, _ep: &Endpoint, _tag: MatchId, op: Primitive) -> CclResult<RequestId> {
        let mut script = self.script.lock().unwrap();
        let id = script.next;
        script.next += 1;
        script.started.push(op.name());
        if script.fail_on == Some(op.name()) {
            script.failed.insert(id);
        } else {
            script.open.insert(id);
        }
        Ok(RequestId(id))
    }

    fn poll(&self, req: RequestId) -> CclResult<RequestStatus> {
        let script = self.script.lock().unwrap();
        if script.failed.contains(&req.0) {
            return Ok(RequestStatus::Error("injected failure".to_string()));
        }
        if script.done.contains(&req.0) {
            return Ok(RequestStatus::Success);
        }
        Ok(RequestStatus::Pending)
    }
}

fn comm_over(transport: Arc<ScriptedTransport>) -> Arc<dyn Communicator> {
    Arc::new(Comm::new(CommId(7), 0, 2, transport).unwrap())
}

fn schedule(comm: &Arc<dyn Communicator>) -> Schedule {
    Schedule::new(CollType::Allgather, comm.clone(), comm.next_match_id())
}

// ============================================================================
// Schedule staging
// ============================================================================

mod staging_tests {
    use super::*;

    #[test]
    fn test_barrier_separates_stages() {
        let transport = Arc::new(ScriptedTransport::default());
        let comm = comm_over(transport.clone());
        let mut sched = schedule(&comm);
        sched.add_send(CclBuffer::new(8), 1);
        sched.add_barrier();
        sched.add_recv(CclBuffer::new(8), 1);
        assert_eq!(sched.layout(), "SEND | RECV");

        assert!(!sched.do_progress().unwrap());
        assert_eq!(transport.started(), vec!["SEND"]);

        // the first stage is still pending, nothing new may start
        assert!(!sched.do_progress().unwrap());
        assert_eq!(transport.started(), vec!["SEND"]);

        transport.complete_all();
        assert!(!sched.do_progress().unwrap());
        assert_eq!(transport.started(), vec!["SEND", "RECV"]);

        transport.complete_all();
        assert!(sched.do_progress().unwrap());
        assert!(sched.is_complete());
        assert!(sched.entries().all(|e| e.status() == EntryStatus::Complete));

        println!("✓ Entries after a barrier wait for the stage before it");
    }

    #[test]
    fn test_entries_of_one_stage_start_together() {
        let transport = Arc::new(ScriptedTransport::default());
        let comm = comm_over(transport.clone());
        let mut sched = schedule(&comm);
        sched.add_send(CclBuffer::new(4), 1);
        sched.add_recv(CclBuffer::new(4), 1);
        sched.add_send_recv(CclBuffer::new(4), 1, CclBuffer::new(4), 1);

        assert!(!sched.do_progress().unwrap());
        assert_eq!(transport.started(), vec!["SEND", "RECV", "SEND", "RECV"]);

        transport.complete_all();
        assert!(sched.do_progress().unwrap());

        println!("✓ One stage issues all of its entries");
    }

    #[test]
    fn test_local_entries_complete_in_one_pass() {
        let transport = Arc::new(ScriptedTransport::default());
        let comm = comm_over(transport.clone());

        let a = CclBuffer::from_vec(vec![1, 2, 3, 4]);
        let b = CclBuffer::new(4);
        let c = CclBuffer::from_vec(vec![10, 10, 10, 10]);

        let mut sched = schedule(&comm);
        sched.add_copy(a, b.clone());
        sched.add_barrier();
        sched.add_reduce(b.clone(), c.clone(), Datatype::UInt8, ReduceOp::Sum);
        assert_eq!(sched.layout(), "COPY | REDUCE_LOCAL");

        assert!(sched.do_progress().unwrap());
        assert_eq!(b.to_vec().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(c.to_vec().unwrap(), vec![11, 12, 13, 14]);
        assert!(transport.started().is_empty());

        println!("✓ Copy and reduce finish without the transport");
    }

    #[test]
    fn test_redundant_barriers_are_dropped() {
        let transport = Arc::new(ScriptedTransport::default());
        let comm = comm_over(transport);
        let mut sched = schedule(&comm);
        sched.add_barrier();
        sched.add_copy(CclBuffer::new(1), CclBuffer::new(1));
        sched.add_barrier();
        sched.add_barrier();

        assert_eq!(sched.barrier_count(), 1);
        assert_eq!(sched.entry_count(), 1);
        assert_eq!(sched.layout(), "COPY |");
        assert!(sched.do_progress().unwrap());

        println!("✓ Leading and repeated barriers are ignored");
    }

    #[test]
    fn test_empty_schedule_is_complete() {
        let transport = Arc::new(ScriptedTransport::default());
        let comm = comm_over(transport);
        let mut sched = schedule(&comm);
        assert!(sched.do_progress().unwrap());
        assert!(sched.is_complete());

        println!("✓ A schedule without entries completes at once");
    }

    #[test]
    fn test_transport_error_aborts() {
        let transport = Arc::new(ScriptedTransport::failing_on("RECV"));
        let comm = comm_over(transport.clone());
        let mut sched = schedule(&comm);
        sched.add_send(CclBuffer::new(4), 1);
        sched.add_recv(CclBuffer::new(4), 1);
        sched.add_barrier();
        sched.add_send(CclBuffer::new(4), 1);

        let err = sched.do_progress().unwrap_err();
        assert!(matches!(err, CclError::Transport(_)));
        assert_eq!(transport.started(), vec!["SEND", "RECV"]);
        assert!(!sched.is_complete());

        println!("✓ A failing entry aborts the schedule");
    }

    #[test]
    fn test_local_entry_error_aborts() {
        let transport = Arc::new(ScriptedTransport::default());
        let comm = comm_over(transport);
        let mut sched = schedule(&comm);
        sched.add_copy(CclBuffer::new(4), CclBuffer::new(8));
        // reduce of mismatched lengths
        sched.add_reduce(CclBuffer::new(4), CclBuffer::new(8), Datatype::Int32, ReduceOp::Max);

        let err = sched.do_progress().unwrap_err();
        assert_eq!(err.code(), Code::Invalid);

        println!("✓ Local entry errors abort the schedule");
    }
}

// ============================================================================
// Executor
// ============================================================================

mod executor_tests {
    use super::*;

    #[test]
    fn test_submit_and_wait() {
        let transport = Arc::new(ScriptedTransport::default());
        let comm = comm_over(transport.clone());
        let executor = Executor::new();

        let mut first = schedule(&comm);
        first.add_send(CclBuffer::new(4), 1);
        let mut second = schedule(&comm);
        second.add_recv(CclBuffer::new(4), 1);

        let r1 = executor.submit(first).unwrap();
        let r2 = executor.submit(second).unwrap();
        assert_ne!(r1.id(), r2.id());
        assert_eq!(r1.coll(), CollType::Allgather);
        assert_eq!(executor.in_flight().unwrap(), 2);
        assert!(!executor.test(&r1).unwrap());

        transport.complete_all();
        assert_eq!(executor.progress().unwrap(), 0);
        assert!(r1.is_completed());
        assert!(executor.test(&r2).unwrap());
        executor.wait(&r1).unwrap();
        assert!(r1.status().unwrap().is_ok());

        println!("✓ Executor completes submitted schedules");
    }

    #[test]
    fn test_failure_reaches_request() {
        let transport = Arc::new(ScriptedTransport::failing_on("SEND"));
        let comm = comm_over(transport);
        let executor = Executor::new();

        let mut sched = schedule(&comm);
        sched.add_send(CclBuffer::new(4), 1);
        let request = executor.submit(sched).unwrap();

        assert!(request.is_completed());
        assert_eq!(executor.in_flight().unwrap(), 0);
        assert!(!request.status().unwrap().is_ok());
        let err = executor.wait(&request).unwrap_err();
        assert_eq!(err.code(), Code::TransportFailure);

        println!("✓ Schedule errors are reported through the request");
    }
}
