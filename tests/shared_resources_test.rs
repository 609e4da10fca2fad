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

//! Integration tests for node-group shared resources and barriers
//!
//! ```bash
//! cargo test --test shared_resources_test
//! ```

use std::sync::Arc;
use std::thread;

use ccl::buffer::CclBuffer;
use ccl::error::{CclError, Code};
use ccl::mt::{NodeBarrier, PeerAddressing, SharedResources, ThreadBarrier};
use ccl::net::{Comm, Communicator, LocalFabric, Topology};

// ============================================================================
// Barriers
// ============================================================================

mod barrier_tests {
    use super::*;

    #[test]
    fn test_thread_barrier_generations() {
        let barrier = ThreadBarrier::new(2).unwrap();
        let t0 = barrier.arrive().unwrap();
        assert!(!barrier.is_released(t0).unwrap());
        let t1 = barrier.arrive().unwrap();
        assert_eq!(t0, t1);
        assert!(barrier.is_released(t0).unwrap());

        // reusable: the next round starts unreleased
        let t2 = barrier.arrive().unwrap();
        assert_ne!(t2, t0);
        assert!(!barrier.is_released(t2).unwrap());
        barrier.arrive().unwrap();
        assert!(barrier.is_released(t2).unwrap());

        println!("✓ Thread barrier counts generations");
    }

    #[test]
    fn test_thread_barrier_wait_across_threads() {
        let barrier = Arc::new(ThreadBarrier::new(4).unwrap());
        thread::scope(|s| {
            for _ in 0..4 {
                let barrier = barrier.clone();
                s.spawn(move || {
                    for _ in 0..10 {
                        barrier.wait().unwrap();
                    }
                });
            }
        });

        println!("✓ Thread barrier releases repeatedly");
    }

    #[test]
    fn test_zero_participants_rejected() {
        assert!(ThreadBarrier::new(0).is_err());
    }

    #[cfg(all(unix, feature = "shm"))]
    #[test]
    fn test_shm_barrier_shared_by_two_openers() {
        use ccl::mt::ShmBarrier;
        use ccl::util::shm_segment_name;

        let name = shm_segment_name("ccl-test", None, 0);
        let first = ShmBarrier::open(&name, 2, 7).unwrap();
        let second = ShmBarrier::open(&name, 2, 7).unwrap();
        assert!(first.is_creator());
        assert!(!second.is_creator());
        assert_eq!(first.attached(), 2);

        let ticket = first.arrive().unwrap();
        assert!(!second.is_released(ticket).unwrap());
        second.arrive().unwrap();
        assert!(first.is_released(ticket).unwrap());

        let err = ShmBarrier::open(&name, 3, 7).err().unwrap();
        assert!(matches!(err, CclError::Synchronization(_)));
        assert_eq!(first.attached(), 2);

        println!("✓ Shared-memory barrier {} works across openers", name);
    }

    #[cfg(all(unix, feature = "shm"))]
    #[test]
    fn test_shm_barrier_rejects_segment_of_earlier_job() {
        use ccl::mt::ShmBarrier;
        use ccl::util::shm_segment_name;

        let session = ccl::util::generate_simple_uuid();
        let name = shm_segment_name("ccl-test", Some(&session), 0);

        // a holder that arrived once and never detached
        let crashed = ShmBarrier::open(&name, 2, 1).unwrap();
        crashed.arrive().unwrap();
        std::mem::forget(crashed);

        let err = ShmBarrier::open(&name, 2, 2).err().unwrap();
        assert!(matches!(err, CclError::Synchronization(_)));
        assert_eq!(err.code(), Code::SynchronizationError);

        ShmBarrier::unlink(&name).unwrap();
        let fresh = ShmBarrier::open(&name, 2, 2).unwrap();
        assert!(fresh.is_creator());
        let ticket = fresh.arrive().unwrap();
        assert!(!fresh.is_released(ticket).unwrap());

        let peer = ShmBarrier::open(&name, 2, 2).unwrap();
        peer.arrive().unwrap();
        assert!(fresh.is_released(ticket).unwrap());

        println!("✓ Stale shared-memory barrier is not joined by a new job");
    }

    #[cfg(all(unix, feature = "shm"))]
    #[test]
    fn test_shm_barrier_survives_creator_drop() {
        use ccl::mt::ShmBarrier;
        use ccl::util::shm_segment_name;

        let name = shm_segment_name("ccl-test", None, 0);
        let creator = ShmBarrier::open(&name, 2, 3).unwrap();
        let early = ShmBarrier::open(&name, 2, 3).unwrap();
        drop(creator);

        // still linked while `early` is attached
        let late = ShmBarrier::open(&name, 2, 3).unwrap();
        assert!(!late.is_creator());
        assert_eq!(late.attached(), 2);

        let ticket = early.arrive().unwrap();
        assert!(!late.is_released(ticket).unwrap());
        late.arrive().unwrap();
        assert!(early.is_released(ticket).unwrap());

        drop(early);
        drop(late);
        assert!(ShmBarrier::unlink(&name).is_err());

        println!("✓ Last detaching handle unlinks the shared-memory barrier");
    }

    #[cfg(all(unix, feature = "shm"))]
    #[test]
    fn test_shm_backend_for_shared_resources() {
        use ccl::mt::BarrierBackend;

        let session = ccl::util::generate_simple_uuid();
        let backend = BarrierBackend::Shm {
            session: Some(session),
            epoch: 11,
        };
        let first = SharedResources::with_backend(backend.clone());
        let second = SharedResources::with_backend(backend);

        thread::scope(|s| {
            s.spawn(|| first.init_barrier(2, 4).unwrap());
            s.spawn(|| second.init_barrier(2, 4).unwrap());
        });
        assert!(first.is_initialized(4).unwrap());
        assert!(second.is_initialized(4).unwrap());

        println!("✓ Two resource tables meet in one shared-memory barrier");
    }
}

// ============================================================================
// Shared resources
// ============================================================================

mod resources_tests {
    use super::*;

    #[test]
    fn test_barrier_created_once() {
        let resources = SharedResources::new();
        assert!(!resources.is_initialized(3).unwrap());

        let a = resources.barrier(2, 3).unwrap();
        let b = resources.barrier(2, 3).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(resources.is_initialized(3).unwrap());
        assert!(!resources.is_initialized(4).unwrap());

        let err = resources.barrier(3, 3).err().unwrap();
        assert_eq!(err.code(), Code::SynchronizationError);

        println!("✓ One barrier per group id");
    }

    #[test]
    fn test_exchange_requires_barrier() {
        let resources = SharedResources::new();
        let err = resources
            .exchange(0, 1, 0, vec![CclBuffer::new(4)])
            .unwrap_err();
        assert!(matches!(err, CclError::Synchronization(_)));

        println!("✓ Exchange before init is rejected");
    }

    #[test]
    fn test_exchange_and_remote_pointers() {
        let resources = SharedResources::shared();
        let size = 4;
        let group = 2;
        let exchange = 42;

        let results: Vec<Vec<u8>> = thread::scope(|s| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let resources = resources.clone();
                    s.spawn(move || {
                        resources.init_barrier(size, group).unwrap();
                        let local = CclBuffer::from_vec(vec![rank as u8; 8]);
                        resources
                            .exchange(group, exchange, rank, vec![local.clone()])
                            .unwrap();

                        let addressing = PeerAddressing::Node { rank, size };
                        let remote = resources
                            .get_remote_pointers(group, exchange, &addressing, 0, &local)
                            .unwrap();
                        assert_eq!(remote.len(), size);
                        assert!(remote[rank].as_ref().unwrap().is_same(&local));
                        let firsts: Vec<u8> = remote
                            .iter()
                            .map(|h| h.as_ref().unwrap().to_vec().unwrap()[0])
                            .collect();

                        // nobody drops its handles before everyone has read
                        resources.barrier(size, group).unwrap().wait().unwrap();
                        resources.release(group, exchange, rank).unwrap();
                        firsts
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for firsts in results {
            assert_eq!(firsts, vec![0, 1, 2, 3]);
        }
        assert_eq!(resources.pending_exchanges(group).unwrap(), 0);

        println!("✓ Every rank sees every peer's handle");
    }

    #[test]
    fn test_missing_peers_are_none() {
        let resources = SharedResources::new();
        let local = CclBuffer::new(4);
        resources.publish(0, 9, 2, vec![CclBuffer::new(4)]).unwrap();

        let addressing = PeerAddressing::Node { rank: 0, size: 3 };
        let remote = resources
            .get_remote_pointers(0, 9, &addressing, 0, &local)
            .unwrap();
        assert!(remote[0].is_some());
        assert!(remote[1].is_none());
        assert!(remote[2].is_some());

        let err = resources
            .get_remote_pointers(0, 9, &addressing, 5, &local)
            .unwrap_err();
        assert_eq!(err.code(), Code::Invalid);

        println!("✓ Unpublished peers are reported as None");
    }

    #[test]
    fn test_even_and_pair_addressing() {
        // node of 6 ranks: 3 cards of 2
        assert_eq!(SharedResources::get_node_rank([2, 1], 2), 5);

        let resources = SharedResources::new();
        for node_rank in 0..6 {
            resources
                .publish(0, 1, node_rank, vec![CclBuffer::from_vec(vec![node_rank as u8])])
                .unwrap();
        }
        let local = CclBuffer::from_vec(vec![0xff]);
        let value = |h: &Option<CclBuffer>| h.as_ref().unwrap().to_vec().unwrap()[0];

        // caller is node rank 3 = even rank 1, pair rank 1
        let topology = Topology::new(6, 6, 2);
        let comm = Comm::world(&topology, 3, Arc::new(LocalFabric::new())).unwrap();
        let even_comm = comm.even_comm().unwrap();
        let pair_comm = comm.pair_comm().unwrap();

        let even = PeerAddressing::even(even_comm.as_ref(), pair_comm.as_ref());
        assert_eq!(
            even,
            PeerAddressing::Even {
                even_rank: 1,
                even_size: 3,
                pair_rank: 1,
                pair_size: 2,
            }
        );
        let remote = resources.get_remote_pointers(0, 1, &even, 0, &local).unwrap();
        assert_eq!(remote.iter().map(value).collect::<Vec<_>>(), vec![1, 0xff, 5]);

        let pair = PeerAddressing::pair(even_comm.as_ref(), pair_comm.as_ref());
        assert_eq!(
            pair,
            PeerAddressing::Pair {
                even_rank: 1,
                pair_rank: 1,
                pair_size: 2,
            }
        );
        let remote = resources.get_remote_pointers(0, 1, &pair, 0, &local).unwrap();
        assert_eq!(remote.iter().map(value).collect::<Vec<_>>(), vec![2, 0xff]);

        println!("✓ Even and pair peers map onto node ranks");
    }

    #[test]
    fn test_release_and_finalize() {
        let resources = SharedResources::new();
        resources.publish(1, 5, 0, vec![CclBuffer::new(1)]).unwrap();
        resources.publish(1, 5, 1, vec![CclBuffer::new(1)]).unwrap();
        resources.publish(1, 6, 0, vec![CclBuffer::new(1)]).unwrap();
        assert_eq!(resources.pending_exchanges(1).unwrap(), 2);

        resources.release(1, 5, 0).unwrap();
        assert_eq!(resources.pending_exchanges(1).unwrap(), 2);
        resources.release(1, 5, 1).unwrap();
        assert_eq!(resources.pending_exchanges(1).unwrap(), 1);

        resources.barrier(2, 1).unwrap();
        resources.finalize().unwrap();
        assert_eq!(resources.pending_exchanges(1).unwrap(), 0);
        assert!(!resources.is_initialized(1).unwrap());

        println!("✓ Release drops handles, finalize drops groups");
    }
}
