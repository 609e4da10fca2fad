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

//! End-to-end collective tests over the in-process fabric
//!
//! Every algorithm of every collective runs on one thread per rank and
//! must produce the same result. The multiplexing tests drive all ranks
//! from a single thread through `test`/`progress`.
//!
//! ```bash
//! cargo test --test collectives_test
//! ```

use std::sync::Arc;
use std::thread;

use ccl::coll::{
    AlgorithmTag, AllgatherAlgo, AlltoallAlgo, BarrierAlgo, BcastAlgo, ReduceAlgo,
    ReduceScatterAlgo, SelectorParam, TableKind,
};
use ccl::mt::SharedResources;
use ccl::net::{Comm, Communicator, LocalFabric, Topology};
use ccl::{CclBuffer, CclConfig, CclContext, CclError, CollAttr, CollRequest, Datatype, ReduceOp};

fn i32_buffer(values: &[i32]) -> CclBuffer {
    CclBuffer::from_vec(values.iter().flat_map(|v| v.to_ne_bytes()).collect())
}

fn i32_values(buf: &CclBuffer) -> Vec<i32> {
    buf.to_vec()
        .unwrap()
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn device(buf: CclBuffer, on_device: bool) -> CclBuffer {
    if on_device {
        buf.into_device()
    } else {
        buf
    }
}

/// One context per rank of a single-node world sharing one fabric
fn contexts(world: usize, config: &CclConfig) -> Vec<CclContext> {
    ccl::util::logging::init_logging();
    let fabric = LocalFabric::from_config(config);
    let resources = SharedResources::shared();
    let topology = Topology::single_node(world);
    (0..world)
        .map(|rank| {
            let comm: Arc<dyn Communicator> =
                Comm::world(&topology, rank, fabric.clone()).unwrap();
            CclContext::new(config.clone(), comm, resources.clone()).unwrap()
        })
        .collect()
}

/// Run `f` on one thread per context, collecting results in rank order
fn on_threads<T, F>(contexts: &[CclContext], f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&CclContext) -> T + Sync,
{
    thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = contexts.iter().map(|ctx| s.spawn(move || f(ctx))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn wait_checked(ctx: &CclContext, request: &CollRequest, expected: AlgorithmTag) {
    assert_eq!(request.algorithm(), Some(expected));
    ctx.wait(request).unwrap();
    assert!(request.is_completed());
}

// ============================================================================
// Broadcast
// ============================================================================

mod broadcast_tests {
    use super::*;

    const COUNT: usize = 10;
    const ROOT: usize = 1;

    fn root_data() -> Vec<i32> {
        (0..COUNT as i32).map(|i| i * 7 + 1).collect()
    }

    fn run(world: usize, algo: BcastAlgo, on_device: bool) -> Vec<Vec<i32>> {
        let ctxs = contexts(world, &CclConfig::default());
        let tag = AlgorithmTag::Bcast(algo);
        on_threads(&ctxs, |ctx| {
            let send = if ctx.rank() == ROOT {
                device(i32_buffer(&root_data()), on_device)
            } else {
                CclBuffer::empty()
            };
            let recv = device(CclBuffer::new(COUNT * 4), on_device);
            let req = ctx
                .broadcast(&send, &recv, COUNT, Datatype::Int32, ROOT, &CollAttr::with_hint(tag))
                .unwrap();
            wait_checked(ctx, &req, tag);
            i32_values(&recv)
        })
    }

    #[test]
    fn test_every_algorithm_agrees() {
        for algo in [BcastAlgo::Direct, BcastAlgo::Naive, BcastAlgo::ScatterRing, BcastAlgo::Topo] {
            for result in run(4, algo, true) {
                assert_eq!(result, root_data(), "algo {}", algo);
            }
        }

        println!("✓ Broadcast algorithms produce the root's data");
    }

    #[test]
    fn test_scatter_ring_odd_sizes() {
        for world in [1, 2, 3, 5] {
            for result in run(world, BcastAlgo::ScatterRing, false) {
                assert_eq!(result, root_data(), "world {}", world);
            }
        }

        println!("✓ Scatter-ring handles uneven block splits");
    }

    #[test]
    fn test_in_place_root() {
        let ctxs = contexts(3, &CclConfig::default());
        let results = on_threads(&ctxs, |ctx| {
            let buf = if ctx.rank() == 0 {
                i32_buffer(&[5, 6, 7])
            } else {
                CclBuffer::new(12)
            };
            let attr = CollAttr::with_hint(AlgorithmTag::Bcast(BcastAlgo::Naive));
            let req = ctx.broadcast(&buf, &buf, 3, Datatype::Int32, 0, &attr).unwrap();
            ctx.wait(&req).unwrap();
            i32_values(&buf)
        });
        for result in results {
            assert_eq!(result, vec![5, 6, 7]);
        }

        println!("✓ In-place broadcast");
    }

    #[test]
    fn test_topo_hint_needs_device_memory() {
        let ctxs = contexts(2, &CclConfig::default());
        on_threads(&ctxs, |ctx| {
            let send = i32_buffer(&[1, 2]);
            let recv = CclBuffer::new(8);
            let attr = CollAttr::with_hint(AlgorithmTag::Bcast(BcastAlgo::Topo));
            let req = ctx.broadcast(&send, &recv, 2, Datatype::Int32, 0, &attr).unwrap();
            // host buffers: the hint is skipped and the main table answers
            wait_checked(ctx, &req, AlgorithmTag::Bcast(BcastAlgo::Direct));
            assert_eq!(i32_values(&recv), vec![1, 2]);
        });

        println!("✓ Topo hint ignored for host buffers");
    }
}

// ============================================================================
// Allgather / Alltoall
// ============================================================================

mod exchange_tests {
    use super::*;

    const COUNT: usize = 3;

    #[test]
    fn test_allgather_algorithms() {
        let world = 4;
        let expected: Vec<i32> = (0..world as i32)
            .flat_map(|r| (0..COUNT as i32).map(move |i| r * 100 + i))
            .collect();

        for algo in [
            AllgatherAlgo::Direct,
            AllgatherAlgo::Naive,
            AllgatherAlgo::Ring,
            AllgatherAlgo::Topo,
        ] {
            let ctxs = contexts(world, &CclConfig::default());
            let tag = AlgorithmTag::Allgather(algo);
            let results = on_threads(&ctxs, |ctx| {
                let own: Vec<i32> = (0..COUNT as i32).map(|i| ctx.rank() as i32 * 100 + i).collect();
                let send = i32_buffer(&own).into_device();
                let recv = CclBuffer::new_device(COUNT * 4 * world);
                let req = ctx
                    .allgather(&send, &recv, COUNT, Datatype::Int32, &CollAttr::with_hint(tag))
                    .unwrap();
                wait_checked(ctx, &req, tag);
                i32_values(&recv)
            });
            for result in results {
                assert_eq!(result, expected, "algo {}", algo);
            }
        }

        println!("✓ Allgather algorithms agree");
    }

    #[test]
    fn test_alltoall_algorithms() {
        let world = 3;
        for algo in [AlltoallAlgo::Direct, AlltoallAlgo::Naive, AlltoallAlgo::Topo] {
            let ctxs = contexts(world, &CclConfig::default());
            let tag = AlgorithmTag::Alltoall(algo);
            let results = on_threads(&ctxs, |ctx| {
                let r = ctx.rank() as i32;
                let data: Vec<i32> = (0..world as i32)
                    .flat_map(|p| (0..COUNT as i32).map(move |i| r * 100 + p * 10 + i))
                    .collect();
                let send = i32_buffer(&data).into_device();
                let recv = CclBuffer::new_device(COUNT * 4 * world);
                let req = ctx
                    .alltoall(&send, &recv, COUNT, Datatype::Int32, &CollAttr::with_hint(tag))
                    .unwrap();
                wait_checked(ctx, &req, tag);
                i32_values(&recv)
            });
            for (r, result) in results.into_iter().enumerate() {
                let expected: Vec<i32> = (0..world as i32)
                    .flat_map(|p| (0..COUNT as i32).map(move |i| p * 100 + r as i32 * 10 + i))
                    .collect();
                assert_eq!(result, expected, "algo {}, rank {}", algo, r);
            }
        }

        println!("✓ Alltoall algorithms agree");
    }

    #[test]
    fn test_short_buffer_rejected() {
        let ctxs = contexts(2, &CclConfig::default());
        let send = CclBuffer::new(8);
        let recv = CclBuffer::new(8);
        let err = ctxs[0]
            .allgather(&send, &recv, 2, Datatype::Int32, &CollAttr::default())
            .unwrap_err();
        assert!(matches!(err, CclError::Invalid(_)));

        println!("✓ Undersized receive buffer is rejected before scheduling");
    }
}

// ============================================================================
// Reductions and barrier
// ============================================================================

mod reduction_tests {
    use super::*;

    const COUNT: usize = 4;

    #[test]
    fn test_reduce_algorithms() {
        let world = 5;
        let root = 2;
        let expected: Vec<i32> = (0..COUNT as i32)
            .map(|i| (0..world as i32).map(|r| r + i).sum())
            .collect();

        for algo in [ReduceAlgo::Direct, ReduceAlgo::Tree] {
            let ctxs = contexts(world, &CclConfig::default());
            let tag = AlgorithmTag::Reduce(algo);
            let results = on_threads(&ctxs, |ctx| {
                let own: Vec<i32> = (0..COUNT as i32).map(|i| ctx.rank() as i32 + i).collect();
                let send = i32_buffer(&own);
                let recv = if ctx.rank() == root {
                    CclBuffer::new(COUNT * 4)
                } else {
                    CclBuffer::empty()
                };
                let req = ctx
                    .reduce(
                        &send,
                        &recv,
                        COUNT,
                        Datatype::Int32,
                        ReduceOp::Sum,
                        root,
                        &CollAttr::with_hint(tag),
                    )
                    .unwrap();
                wait_checked(ctx, &req, tag);
                i32_values(&recv)
            });
            assert_eq!(results[root], expected, "algo {}", algo);
            for (r, result) in results.iter().enumerate() {
                if r != root {
                    assert!(result.is_empty());
                }
            }
        }

        println!("✓ Reduce algorithms agree");
    }

    #[test]
    fn test_reduce_scatter_algorithms() {
        let world = 4;
        for algo in [
            ReduceScatterAlgo::Direct,
            ReduceScatterAlgo::Naive,
            ReduceScatterAlgo::Ring,
        ] {
            let ctxs = contexts(world, &CclConfig::default());
            let tag = AlgorithmTag::ReduceScatter(algo);
            let results = on_threads(&ctxs, |ctx| {
                let r = ctx.rank() as i32;
                let data: Vec<i32> = (0..world as i32)
                    .flat_map(|b| (0..COUNT as i32).map(move |i| r * 1000 + b * 10 + i))
                    .collect();
                let send = i32_buffer(&data);
                let recv = CclBuffer::new(COUNT * 4);
                let req = ctx
                    .reduce_scatter(
                        &send,
                        &recv,
                        COUNT,
                        Datatype::Int32,
                        ReduceOp::Max,
                        &CollAttr::with_hint(tag),
                    )
                    .unwrap();
                wait_checked(ctx, &req, tag);
                i32_values(&recv)
            });
            for (b, result) in results.into_iter().enumerate() {
                let expected: Vec<i32> = (0..COUNT as i32)
                    .map(|i| (world as i32 - 1) * 1000 + b as i32 * 10 + i)
                    .collect();
                assert_eq!(result, expected, "algo {}, rank {}", algo, b);
            }
        }

        println!("✓ Reduce-scatter algorithms agree");
    }

    #[test]
    fn test_reduce_scatter_ring_sum() {
        let world = 3;
        let ctxs = contexts(world, &CclConfig::default());
        let tag = AlgorithmTag::ReduceScatter(ReduceScatterAlgo::Ring);
        let results = on_threads(&ctxs, |ctx| {
            let r = ctx.rank() as i32;
            let data: Vec<i32> = (0..world as i32 * COUNT as i32).map(|i| r + i).collect();
            let send = i32_buffer(&data);
            let recv = CclBuffer::new(COUNT * 4);
            let req = ctx
                .reduce_scatter(
                    &send,
                    &recv,
                    COUNT,
                    Datatype::Int32,
                    ReduceOp::Sum,
                    &CollAttr::with_hint(tag),
                )
                .unwrap();
            ctx.wait(&req).unwrap();
            i32_values(&recv)
        });
        for (b, result) in results.into_iter().enumerate() {
            let expected: Vec<i32> = (0..COUNT as i32)
                .map(|i| (0..world as i32).map(|r| r + b as i32 * COUNT as i32 + i).sum())
                .collect();
            assert_eq!(result, expected, "rank {}", b);
        }

        println!("✓ Ring reduce-scatter sums every contribution once");
    }

    #[test]
    fn test_barrier_algorithms() {
        for algo in [BarrierAlgo::Direct, BarrierAlgo::Ring] {
            let ctxs = contexts(4, &CclConfig::default());
            let tag = AlgorithmTag::Barrier(algo);
            on_threads(&ctxs, |ctx| {
                for _ in 0..3 {
                    let req = ctx.barrier(&CollAttr::with_hint(tag)).unwrap();
                    wait_checked(ctx, &req, tag);
                }
                ctx.finalize().unwrap();
            });
        }

        println!("✓ Barrier algorithms complete repeatedly");
    }

    #[test]
    fn test_match_ids_advance_in_lockstep() {
        let ctxs = contexts(3, &CclConfig::default());
        let tag = AlgorithmTag::Barrier(BarrierAlgo::Ring);
        on_threads(&ctxs, |ctx| {
            for _ in 0..4 {
                let req = ctx.barrier(&CollAttr::with_hint(tag)).unwrap();
                wait_checked(ctx, &req, tag);
            }
        });

        let next: Vec<_> = ctxs.iter().map(|ctx| ctx.comm().next_match_id()).collect();
        assert!(next.iter().all(|id| *id == next[0]));

        println!("✓ Ranks issuing the same calls share match ids");
    }
}

// ============================================================================
// Selection through the context
// ============================================================================

mod context_tests {
    use super::*;

    #[test]
    fn test_config_strings_drive_selection() {
        let config = CclConfig::new().with_main(
            ccl::CollType::Allgather,
            "naive:0-15;ring:16-max",
        );
        let ctxs = contexts(2, &config);
        let results = on_threads(&ctxs, |ctx| {
            let small_send = CclBuffer::new(8);
            let small_recv = CclBuffer::new(16);
            let small = ctx
                .allgather(&small_send, &small_recv, 2, Datatype::Int32, &CollAttr::default())
                .unwrap();
            let large_send = CclBuffer::new(64);
            let large_recv = CclBuffer::new(128);
            let large = ctx
                .allgather(&large_send, &large_recv, 16, Datatype::Int32, &CollAttr::default())
                .unwrap();
            ctx.wait(&small).unwrap();
            ctx.wait(&large).unwrap();
            (small.algorithm(), large.algorithm())
        });
        for (small, large) in results {
            assert_eq!(small, Some(AlgorithmTag::Allgather(AllgatherAlgo::Naive)));
            assert_eq!(large, Some(AlgorithmTag::Allgather(AllgatherAlgo::Ring)));
        }

        println!("✓ Context selects from configured tables");
    }

    #[test]
    fn test_user_capability_falls_back() {
        let ctxs: Vec<CclContext> = contexts(2, &CclConfig::default())
            .into_iter()
            .map(|ctx| {
                ctx.with_capability(|algo: AlgorithmTag, _: &SelectorParam, _: TableKind| {
                    algo != AlgorithmTag::Allgather(AllgatherAlgo::Direct)
                })
            })
            .collect();
        let results = on_threads(&ctxs, |ctx| {
            let send = i32_buffer(&[ctx.rank() as i32]);
            let recv = CclBuffer::new(8);
            let req = ctx
                .allgather(&send, &recv, 1, Datatype::Int32, &CollAttr::default())
                .unwrap();
            wait_checked(ctx, &req, AlgorithmTag::Allgather(AllgatherAlgo::Naive));
            i32_values(&recv)
        });
        for result in results {
            assert_eq!(result, vec![0, 1]);
        }

        println!("✓ User predicate sends selection to the fallback table");
    }

    #[test]
    fn test_selection_exhausted_without_fallback() {
        let config = CclConfig::new().with_algo_fallback(false);
        let ctx = contexts(1, &config)
            .pop()
            .unwrap()
            .with_capability(|_: AlgorithmTag, _: &SelectorParam, _: TableKind| false);
        let err = ctx.barrier(&CollAttr::default()).unwrap_err();
        assert!(matches!(err, CclError::SelectionExhausted { .. }));

        println!("✓ Exhausted selection is reported to the caller");
    }
}

// ============================================================================
// Cooperative multiplexing on one thread
// ============================================================================

mod multiplexing_tests {
    use super::*;

    fn drive(ctxs: &[CclContext], requests: &[(usize, CollRequest)]) {
        let mut rounds = 0;
        while !requests
            .iter()
            .all(|(rank, req)| ctxs[*rank].test(req).unwrap())
        {
            rounds += 1;
            assert!(rounds < 10_000, "collectives did not complete");
        }
    }

    #[test]
    fn test_single_thread_drives_all_ranks() {
        let world = 4;
        let config = CclConfig::new().with_local_poll_delay(2);
        let ctxs = contexts(world, &config);

        let mut requests = Vec::new();
        let mut gathered = Vec::new();
        let mut broadcast = Vec::new();
        for ctx in &ctxs {
            let send = i32_buffer(&[ctx.rank() as i32 + 1]);
            let recv = CclBuffer::new(4 * world);
            let ring = CollAttr::with_hint(AlgorithmTag::Allgather(AllgatherAlgo::Ring));
            requests.push((ctx.rank(), ctx.allgather(&send, &recv, 1, Datatype::Int32, &ring).unwrap()));
            gathered.push(recv);

            let data = i32_buffer(&[9, 8, 7, 6, 5]);
            let out = CclBuffer::new(20);
            let scatter = CollAttr::with_hint(AlgorithmTag::Bcast(BcastAlgo::ScatterRing));
            requests.push((ctx.rank(), ctx.broadcast(&data, &out, 5, Datatype::Int32, 3, &scatter).unwrap()));
            broadcast.push(out);
        }
        assert!(requests.iter().all(|(_, req)| !req.is_completed()));

        drive(&ctxs, &requests);

        for buf in &gathered {
            assert_eq!(i32_values(buf), vec![1, 2, 3, 4]);
        }
        for buf in &broadcast {
            assert_eq!(i32_values(buf), vec![9, 8, 7, 6, 5]);
        }
        for ctx in &ctxs {
            assert_eq!(ctx.progress().unwrap(), 0);
            ctx.finalize().unwrap();
        }

        println!("✓ One thread progresses every rank's schedules");
    }

    #[test]
    fn test_single_thread_node_local_sequence() {
        let world = 3;
        let ctxs = contexts(world, &CclConfig::default());
        let topo = CollAttr::with_hint(AlgorithmTag::Bcast(BcastAlgo::Topo));

        let mut requests = Vec::new();
        let mut outputs = Vec::new();
        // two node-local broadcasts per rank in flight at once
        for value in [11, 22] {
            for ctx in &ctxs {
                let send = i32_buffer(&[value, value + 1]).into_device();
                let recv = CclBuffer::new_device(8);
                requests.push((ctx.rank(), ctx.broadcast(&send, &recv, 2, Datatype::Int32, 0, &topo).unwrap()));
                outputs.push((value, recv));
            }
        }

        drive(&ctxs, &requests);

        for (value, recv) in &outputs {
            assert_eq!(i32_values(recv), vec![*value, value + 1]);
        }
        for (rank, req) in &requests {
            assert_eq!(req.algorithm(), Some(AlgorithmTag::Bcast(BcastAlgo::Topo)));
            assert!(ctxs[*rank].test(req).unwrap());
        }
        assert_eq!(ctxs[0].resources().pending_exchanges(1).unwrap(), 0);

        println!("✓ Node-local schedules complete in submission order");
    }
}

// ============================================================================
// Several nodes
// ============================================================================

mod scaleout_tests {
    use super::*;
    use std::collections::BTreeSet;

    use ccl::net::CommId;
    use ccl::CollType;

    /// World contexts over `topology` plus one context per rank on its node group
    fn multi_node_contexts(
        topology: &Topology,
        config: &CclConfig,
    ) -> (Vec<CclContext>, Vec<CclContext>) {
        ccl::util::logging::init_logging();
        let fabric = LocalFabric::from_config(config);
        let resources = SharedResources::shared();
        let mut world = Vec::new();
        let mut node = Vec::new();
        for rank in 0..topology.world_size {
            let comm: Arc<dyn Communicator> =
                Comm::world(topology, rank, fabric.clone()).unwrap();
            let node_comm = comm.node_comm().unwrap();
            node.push(CclContext::new(config.clone(), node_comm, resources.clone()).unwrap());
            world.push(CclContext::new(config.clone(), comm, resources.clone()).unwrap());
        }
        (world, node)
    }

    fn scaleout_config() -> CclConfig {
        CclConfig::new()
            .with_main(CollType::Bcast, "naive")
            .with_scaleout(CollType::Bcast, "scatter_ring")
            .with_scaleout(CollType::ReduceScatter, "ring")
    }

    #[test]
    fn test_sub_communicator_ids() {
        let topology = Topology::new(8, 4, 2);
        let (world, _) = multi_node_contexts(&topology, &CclConfig::default());

        let mut ids = BTreeSet::new();
        for ctx in &world {
            let comm = ctx.comm();
            let node = comm.node_comm().unwrap();
            let pair = comm.pair_comm().unwrap();
            let even = comm.even_comm().unwrap();
            assert_eq!(comm.comm_id(), CommId(0));
            assert!(!comm.is_single_node());
            assert_eq!((node.size(), pair.size(), even.size()), (4, 2, 2));
            assert_eq!(node.comm_id(), CommId(1 + ctx.rank() / 4));
            assert_eq!(node.rank(), ctx.rank() % 4);
            assert_eq!(pair.rank(), ctx.rank() % 2);
            assert_eq!(even.rank(), (ctx.rank() % 4) / 2);
            ids.extend([comm.comm_id(), node.comm_id(), pair.comm_id(), even.comm_id()]);
        }
        // every group gets its own id inside the span
        assert_eq!(ids.len(), topology.comm_id_span());
        assert!(ids.iter().all(|id| id.0 < topology.comm_id_span()));

        println!("✓ Sub-communicators of a 2-node world get distinct ids");
    }

    #[test]
    fn test_scaleout_table_drives_selection() {
        let topology = Topology::new(8, 4, 2);
        let (world, _) = multi_node_contexts(&topology, &scaleout_config());
        let root = 5;
        let values: Vec<i32> = (0..7).map(|i| 40 + i).collect();
        let expected_bcast = AlgorithmTag::Bcast(BcastAlgo::ScatterRing);

        let topo = CollAttr::with_hint(AlgorithmTag::Bcast(BcastAlgo::Topo));
        let results = on_threads(&world, |ctx| {
            let mut out = Vec::new();
            // no hint, then a topo hint the built-in rules reject across nodes
            for attr in [CollAttr::default(), topo] {
                let send = device(i32_buffer(&values), true);
                let recv = CclBuffer::new_device(values.len() * 4);
                let req = ctx
                    .broadcast(&send, &recv, values.len(), Datatype::Int32, root, &attr)
                    .unwrap();
                wait_checked(ctx, &req, expected_bcast);
                out.push(i32_values(&recv));
            }

            let send: Vec<i32> = (0..8)
                .flat_map(|block| (0..2).map(move |i| ctx.rank() as i32 * 100 + block * 10 + i))
                .collect();
            let recv = CclBuffer::new(8);
            let req = ctx
                .reduce_scatter(
                    &i32_buffer(&send),
                    &recv,
                    2,
                    Datatype::Int32,
                    ReduceOp::Sum,
                    &CollAttr::default(),
                )
                .unwrap();
            wait_checked(ctx, &req, AlgorithmTag::ReduceScatter(ReduceScatterAlgo::Ring));
            out.push(i32_values(&recv));
            ctx.finalize().unwrap();
            out
        });

        for (rank, out) in results.iter().enumerate() {
            assert_eq!(out[0], values);
            assert_eq!(out[1], values);
            let base = 2800 + 80 * rank as i32;
            assert_eq!(out[2], vec![base, base + 8]);
        }

        println!("✓ Scale-out tables pick the algorithms of a 2-node world");
    }

    #[test]
    fn test_node_groups_keep_topo() {
        let topology = Topology::new(8, 4, 2);
        let (_, node) = multi_node_contexts(&topology, &scaleout_config());
        let topo = CollAttr::with_hint(AlgorithmTag::Bcast(BcastAlgo::Topo));

        let results = on_threads(&node, |ctx| {
            assert!(ctx.comm().is_single_node());
            let send = i32_buffer(&[ctx.comm().comm_id().0 as i32; 3]).into_device();
            let recv = CclBuffer::new_device(12);
            let req = ctx.broadcast(&send, &recv, 3, Datatype::Int32, 1, &topo).unwrap();
            wait_checked(ctx, &req, AlgorithmTag::Bcast(BcastAlgo::Topo));
            let topo_result = i32_values(&recv);

            // host buffers skip the hint and use the node's main table
            let host = CclBuffer::new(12);
            let req = ctx.broadcast(&send, &host, 3, Datatype::Int32, 1, &topo).unwrap();
            wait_checked(ctx, &req, AlgorithmTag::Bcast(BcastAlgo::Naive));
            assert_eq!(i32_values(&host), topo_result);
            ctx.finalize().unwrap();
            topo_result
        });

        for (rank, recv) in results.iter().enumerate() {
            let node_id = 1 + rank / 4;
            assert_eq!(recv, &vec![node_id as i32; 3]);
        }

        println!("✓ Each node group runs its own topo broadcast");
    }
}

// ============================================================================
// In-process fabric
// ============================================================================

mod fabric_tests {
    use super::*;

    use ccl::net::{CommId, Endpoint, MatchId, Primitive, RequestStatus, Transport};

    fn endpoint(rank: usize, size: usize) -> Endpoint {
        Endpoint {
            comm_id: CommId(9),
            rank,
            size,
        }
    }

    fn finish(fabric: &LocalFabric, req: ccl::net::RequestId) -> RequestStatus {
        loop {
            match fabric.poll(req).unwrap() {
                RequestStatus::Pending => thread::yield_now(),
                done => return done,
            }
        }
    }

    #[test]
    fn test_point_to_point_and_collectives_start() {
        let fabric = LocalFabric::new();
        let tag = MatchId(3);

        let send = fabric
            .start(&endpoint(0, 2), tag, Primitive::Send { buf: i32_buffer(&[4, 5]), peer: 1 })
            .unwrap();
        let recv_buf = CclBuffer::new(8);
        let recv = fabric
            .start(&endpoint(1, 2), tag, Primitive::Recv { buf: recv_buf.clone(), peer: 0 })
            .unwrap();
        assert_eq!(finish(&fabric, send), RequestStatus::Success);
        assert_eq!(finish(&fabric, recv), RequestStatus::Success);
        assert_eq!(i32_values(&recv_buf), vec![4, 5]);

        let gathered: Vec<_> = (0..2).map(|_| CclBuffer::new(8)).collect();
        let reqs: Vec<_> = (0..2)
            .map(|rank| {
                let op = Primitive::Allgather {
                    send: i32_buffer(&[rank as i32 + 1]),
                    recv: gathered[rank].clone(),
                };
                fabric.start(&endpoint(rank, 2), MatchId(4), op).unwrap()
            })
            .collect();
        for req in reqs {
            assert_eq!(finish(&fabric, req), RequestStatus::Success);
        }
        for buf in &gathered {
            assert_eq!(i32_values(buf), vec![1, 2]);
        }

        println!("✓ Fabric starts every primitive kind");
    }

    #[test]
    fn test_collective_size_mismatch_rejected() {
        let fabric = LocalFabric::new();
        let op = Primitive::Allgather {
            send: CclBuffer::new(4),
            recv: CclBuffer::new(4),
        };
        let err = fabric.start(&endpoint(0, 2), MatchId(0), op).unwrap_err();
        assert!(matches!(err, CclError::Transport(_)));

        let op = Primitive::Send {
            buf: CclBuffer::new(4),
            peer: 2,
        };
        assert!(fabric.start(&endpoint(0, 2), MatchId(0), op).is_err());

        println!("✓ Fabric rejects malformed primitives at start");
    }
}
