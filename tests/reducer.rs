//! End-to-end reduction scenarios over single- and multi-rank worlds.

mod common;

use std::sync::Arc;
use std::thread;

use common::{
    grad_vec, leaf_f32, write_grad, CollectiveWorld, FakeSizeGroup, RecordingGroup,
    ThreadedProcessGroup,
};
use reducr::{
    compute_bucket_assignment_by_size, DType, Device, Engine, GraphNode, LocalProcessGroup,
    Reducer, ReducerOptions, Tensor, Variable,
};

#[test]
fn test_two_params_divided_by_world_size() {
    let engine = Arc::new(Engine::new());
    let p0 = leaf_f32(&[0.0; 4], &[4]);
    let p1 = leaf_f32(&[0.0; 4], &[4]);

    let reducer = Reducer::new(
        vec![vec![p0.clone(), p1.clone()]],
        vec![vec![0, 1]],
        Arc::new(FakeSizeGroup { world_size: 2 }),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default().with_bucket_bytes_cap(64),
    )
    .unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    write_grad(&p0, &[1.0; 4]);
    write_grad(&p1, &[2.0; 4]);
    engine.run_post_hooks(p0.accumulator());
    engine.run_post_hooks(p1.accumulator());
    engine.run_callbacks();

    assert_eq!(grad_vec(&p0), vec![0.5; 4]);
    assert_eq!(grad_vec(&p1), vec![1.0; 4]);

    // Both gradients landed in the same flat bucket buffer.
    let g0 = p0.grad().unwrap();
    let g1 = p1.grad().unwrap();
    assert!(g0.is_alias_of(&g1));

    // The iteration finalized cleanly; a new one may begin.
    reducer.prepare_for_backward(&[]).unwrap();
}

#[test]
fn test_out_of_order_readiness_launches_once() {
    let engine = Arc::new(Engine::new());
    let p0 = leaf_f32(&[0.0], &[1]);
    let p1 = leaf_f32(&[0.0; 2], &[2]);
    let p2 = leaf_f32(&[0.0; 3], &[3]);

    let group = RecordingGroup::new();
    let launches = Arc::clone(&group.launches);
    let reducer = Reducer::new(
        vec![vec![p0.clone(), p1.clone(), p2.clone()]],
        vec![vec![0, 1, 2]],
        Arc::new(group),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    write_grad(&p0, &[1.0]);
    write_grad(&p1, &[1.0; 2]);
    write_grad(&p2, &[1.0; 3]);

    // Hooks fire out of parameter order; the bucket must launch exactly
    // once, after the last gradient lands.
    engine.run_post_hooks(p2.accumulator());
    assert!(launches.lock().is_empty());
    engine.run_post_hooks(p0.accumulator());
    assert!(launches.lock().is_empty());
    engine.run_post_hooks(p1.accumulator());
    assert_eq!(*launches.lock(), vec![6]);

    engine.run_callbacks();
    reducer.prepare_for_backward(&[]).unwrap();
}

#[test]
fn test_buckets_launch_in_index_order() {
    let engine = Arc::new(Engine::new());
    let p0 = leaf_f32(&[0.0], &[1]);
    let p1 = leaf_f32(&[0.0; 2], &[2]);
    let p2 = leaf_f32(&[0.0; 3], &[3]);

    let group = RecordingGroup::new();
    let launches = Arc::clone(&group.launches);
    let reducer = Reducer::new(
        vec![vec![p0.clone(), p1.clone(), p2.clone()]],
        vec![vec![0], vec![1], vec![2]],
        Arc::new(group),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    write_grad(&p0, &[1.0]);
    write_grad(&p1, &[1.0; 2]);
    write_grad(&p2, &[1.0; 3]);

    // Later buckets complete first but stay parked until bucket 0 is
    // ready; then everything launches in index order.
    engine.run_post_hooks(p2.accumulator());
    engine.run_post_hooks(p1.accumulator());
    assert!(launches.lock().is_empty());
    engine.run_post_hooks(p0.accumulator());
    assert_eq!(*launches.lock(), vec![1, 2, 3]);

    engine.run_callbacks();
    reducer.prepare_for_backward(&[]).unwrap();
}

#[test]
fn test_unused_parameter_left_untouched() {
    let engine = Arc::new(Engine::new());
    let params: Vec<Variable> = (0..4).map(|_| leaf_f32(&[0.0; 2], &[2])).collect();

    let reducer = Reducer::new(
        vec![params.clone()],
        vec![vec![0, 1, 2, 3]],
        Arc::new(FakeSizeGroup { world_size: 2 }),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default().with_find_unused_parameters(true),
    )
    .unwrap();

    // The forward output reaches every parameter except p2.
    let output_node = GraphNode::interior(vec![
        GraphNode::accumulator(params[0].accumulator()),
        GraphNode::accumulator(params[1].accumulator()),
        GraphNode::accumulator(params[3].accumulator()),
    ]);
    let output = Variable::from_forward(Tensor::zeros(&[1], DType::F32, Device::Cpu), output_node);
    reducer.prepare_for_backward(&[output]).unwrap();

    for index in [0, 1, 3] {
        write_grad(&params[index], &[4.0; 2]);
    }
    for index in [0, 1, 3] {
        engine.run_post_hooks(params[index].accumulator());
    }
    engine.run_callbacks();

    // p2 was never used: its gradient stays undefined. Everyone else is
    // averaged.
    assert!(params[2].grad().is_none());
    for index in [0, 1, 3] {
        assert_eq!(grad_vec(&params[index]), vec![2.0; 2]);
    }

    reducer.prepare_for_backward(&[]).unwrap();
}

#[test]
fn test_cross_process_stride_disagreement() {
    let world = CollectiveWorld::new(2);

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let world = Arc::clone(&world);
            thread::spawn(move || {
                let storage = Tensor::zeros(&[4], DType::F32, Device::Cpu);
                // Rank 1 lays the parameter out transposed.
                let strides: [usize; 2] = if rank == 0 { [1, 2] } else { [2, 1] };
                let param = Variable::leaf(storage.as_strided(&[2, 2], &strides, 0).unwrap());
                Reducer::new(
                    vec![vec![param]],
                    vec![vec![0]],
                    Arc::new(ThreadedProcessGroup::new(world, rank)),
                    Vec::new(),
                    Arc::new(Engine::new()),
                    ReducerOptions::default(),
                )
                .map(|_| ())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results[0].is_ok());
    let err = results[1].as_ref().unwrap_err().to_string();
    assert!(err.contains("replicas[0][0]"), "unexpected: {err}");
    assert!(err.contains("strides"), "unexpected: {err}");
}

#[test]
fn test_rebuild_follows_arrival_order() {
    let engine = Arc::new(Engine::new());
    let params: Vec<Variable> = (0..4).map(|_| leaf_f32(&[0.0; 2], &[2])).collect();

    let reducer = Reducer::new(
        vec![params.clone()],
        vec![vec![0, 1, 2, 3]],
        Arc::new(LocalProcessGroup),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default()
            .with_bucket_bytes_cap(16)
            .with_first_bucket_bytes(16),
    )
    .unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    for param in &params {
        write_grad(param, &[1.0; 2]);
    }
    for index in [3, 1, 0, 2] {
        engine.run_post_hooks(params[index].accumulator());
    }
    engine.run_callbacks();

    // The one-shot rebuild groups parameters by first-iteration arrival.
    reducer.prepare_forward().unwrap();
    assert_eq!(reducer.bucket_indices(), vec![vec![3, 1], vec![0, 2]]);

    // The rebuilt layout is exactly the assignment of the recorded order.
    let tensors: Vec<Tensor> = [3, 1, 0, 2]
        .iter()
        .map(|&index| params[index].data().clone())
        .collect();
    let expected = compute_bucket_assignment_by_size(
        &tensors,
        &[16, 16],
        &[false; 4],
        &[3, 1, 0, 2],
    )
    .unwrap();
    assert_eq!(reducer.bucket_indices(), expected);

    // A rebuild happens once; the next iteration keeps the layout and
    // still reduces correctly.
    reducer.prepare_for_backward(&[]).unwrap();
    for param in &params {
        write_grad(param, &[6.0; 2]);
    }
    for param in &params {
        engine.run_post_hooks(param.accumulator());
    }
    engine.run_callbacks();
    reducer.prepare_forward().unwrap();

    assert_eq!(reducer.bucket_indices(), expected);
    for param in &params {
        assert_eq!(grad_vec(param), vec![6.0; 2]);
    }
}

#[test]
fn test_rebuilt_layout_is_synced_from_rank_zero() {
    let world = CollectiveWorld::new(2);

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let world = Arc::clone(&world);
            thread::spawn(move || {
                let engine = Arc::new(Engine::new());
                let params: Vec<Variable> = (0..4).map(|_| leaf_f32(&[0.0; 2], &[2])).collect();
                let reducer = Reducer::new(
                    vec![params.clone()],
                    vec![vec![0, 1, 2, 3]],
                    Arc::new(ThreadedProcessGroup::new(world, rank)),
                    Vec::new(),
                    Arc::clone(&engine),
                    ReducerOptions::default()
                        .with_bucket_bytes_cap(16)
                        .with_first_bucket_bytes(16),
                )
                .unwrap();

                reducer.prepare_for_backward(&[]).unwrap();
                for param in &params {
                    write_grad(param, &[1.0; 2]);
                }
                // Gradient arrival order differs between the ranks.
                let arrival: [usize; 4] = if rank == 0 { [3, 1, 0, 2] } else { [0, 1, 2, 3] };
                for index in arrival {
                    engine.run_post_hooks(params[index].accumulator());
                }
                engine.run_callbacks();

                reducer.prepare_forward().unwrap();
                reducer.bucket_indices()
            })
        })
        .collect();

    let layouts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    // Rank 0's arrival order wins everywhere.
    assert_eq!(layouts[0], vec![vec![3, 1], vec![0, 2]]);
    assert_eq!(layouts[1], layouts[0]);
}

#[test]
fn test_gradients_average_across_ranks() {
    let world = CollectiveWorld::new(2);

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let world = Arc::clone(&world);
            thread::spawn(move || {
                let engine = Arc::new(Engine::new());
                let param = leaf_f32(&[0.0; 2], &[2]);
                let reducer = Reducer::new(
                    vec![vec![param.clone()]],
                    vec![vec![0]],
                    Arc::new(ThreadedProcessGroup::new(world, rank)),
                    Vec::new(),
                    Arc::clone(&engine),
                    ReducerOptions::default(),
                )
                .unwrap();

                reducer.prepare_for_backward(&[]).unwrap();
                let values: [f32; 2] = if rank == 0 { [1.0, 2.0] } else { [3.0, 4.0] };
                write_grad(&param, &values);
                engine.run_post_hooks(param.accumulator());
                engine.run_callbacks();
                grad_vec(&param)
            })
        })
        .collect();

    for handle in handles {
        // (1 + 3) / 2 and (2 + 4) / 2 on every rank.
        assert_eq!(handle.join().unwrap(), vec![2.0, 3.0]);
    }
}

#[test]
fn test_iterations_leave_no_residue() {
    let engine = Arc::new(Engine::new());
    let p0 = leaf_f32(&[0.0; 2], &[2]);
    let p1 = leaf_f32(&[0.0], &[1]);

    let reducer = Reducer::new(
        vec![vec![p0.clone(), p1.clone()]],
        vec![vec![0, 1]],
        Arc::new(LocalProcessGroup),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();

    // Two identical iterations produce identical gradients: the first runs
    // the copy path, the second writes through the aliased bucket views.
    for _ in 0..2 {
        reducer.prepare_for_backward(&[]).unwrap();
        write_grad(&p0, &[2.0, 4.0]);
        write_grad(&p1, &[6.0]);
        engine.run_post_hooks(p0.accumulator());
        engine.run_post_hooks(p1.accumulator());
        engine.run_callbacks();

        assert_eq!(grad_vec(&p0), vec![2.0, 4.0]);
        assert_eq!(grad_vec(&p1), vec![6.0]);
    }
}

#[test]
fn test_comm_hook_matches_builtin_path() {
    use reducr::AllreduceHook;

    let run = |with_hook: bool| -> Vec<f32> {
        let engine = Arc::new(Engine::new());
        let param = leaf_f32(&[0.0; 3], &[3]);
        let group = Arc::new(FakeSizeGroup { world_size: 2 });
        let reducer = Reducer::new(
            vec![vec![param.clone()]],
            vec![vec![0]],
            Arc::clone(&group) as Arc<dyn reducr::ProcessGroup>,
            Vec::new(),
            Arc::clone(&engine),
            ReducerOptions::default(),
        )
        .unwrap();
        if with_hook {
            reducer
                .register_comm_hook(Box::new(AllreduceHook::new(group)))
                .unwrap();
        }

        reducer.prepare_for_backward(&[]).unwrap();
        write_grad(&param, &[3.0, 6.0, 9.0]);
        engine.run_post_hooks(param.accumulator());
        engine.run_callbacks();
        reducer.prepare_for_backward(&[]).unwrap();
        grad_vec(&param)
    };

    let builtin = run(false);
    let hooked = run(true);
    assert_eq!(builtin, vec![1.5, 3.0, 4.5]);
    // The hook owns the scaling: exactly one division by world size.
    assert_eq!(hooked, builtin);
}

#[test]
fn test_sparse_gradient_passthrough() {
    let engine = Arc::new(Engine::new());
    let param = Variable::leaf(Tensor::zeros(&[8], DType::F32, Device::Cpu));

    let reducer = Reducer::new(
        vec![vec![param.clone()]],
        vec![vec![0]],
        Arc::new(FakeSizeGroup { world_size: 2 }),
        vec![vec![true]],
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    let grad = Tensor::sparse_coo(vec![0, 5], &[2.0f32, 8.0], &[8], Device::Cpu).unwrap();
    param.set_grad(Some(grad));
    engine.run_post_hooks(param.accumulator());
    engine.run_callbacks();

    let reduced = param.grad().unwrap();
    assert!(reduced.is_sparse());
    assert_eq!(reduced.sparse_indices().unwrap(), &[0, 5]);
    assert_eq!(reduced.to_vec::<f32>().unwrap(), vec![1.0, 4.0]);

    reducer.prepare_for_backward(&[]).unwrap();
}

#[test]
fn test_concurrent_hooks_preserve_launch_order() {
    let engine = Arc::new(Engine::new());
    let params = [
        leaf_f32(&[0.0], &[1]),
        leaf_f32(&[0.0], &[1]),
        leaf_f32(&[0.0; 2], &[2]),
        leaf_f32(&[0.0; 2], &[2]),
    ];

    let group = RecordingGroup::new();
    let launches = Arc::clone(&group.launches);
    let reducer = Reducer::new(
        vec![params.to_vec()],
        vec![vec![0, 1], vec![2, 3]],
        Arc::new(group),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    for param in &params {
        write_grad(param, &vec![1.0; param.numel()]);
    }

    // Hooks race in from engine worker threads; the reducer mutex
    // serializes them and buckets still launch in index order.
    thread::scope(|scope| {
        for param in &params {
            let engine = Arc::clone(&engine);
            scope.spawn(move || engine.run_post_hooks(param.accumulator()));
        }
    });
    engine.run_callbacks();

    assert_eq!(*launches.lock(), vec![2, 4]);
    reducer.prepare_for_backward(&[]).unwrap();
}

#[test]
fn test_grad_mutations_route_through_active_context() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use reducr::runtime::autograd::{set_current_context, GradContext};

    struct CountingContext {
        calls: AtomicUsize,
    }

    impl GradContext for CountingContext {
        fn run_grad_callback(
            &self,
            variable: &Variable,
            callback: &mut dyn FnMut(&mut Option<Tensor>) -> bool,
        ) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            variable.with_grad_mut(|grad| {
                callback(grad);
            });
        }
    }

    let context = Arc::new(CountingContext {
        calls: AtomicUsize::new(0),
    });
    set_current_context(Some(Arc::clone(&context) as Arc<dyn GradContext>));

    let engine = Arc::new(Engine::new());
    let param = leaf_f32(&[0.0; 2], &[2]);
    let reducer = Reducer::new(
        vec![vec![param.clone()]],
        vec![vec![0]],
        Arc::new(LocalProcessGroup),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    write_grad(&param, &[3.0, 5.0]);
    engine.run_post_hooks(param.accumulator());
    engine.run_callbacks();
    set_current_context(None);

    // Every gradient mutation went through the context's channel, and the
    // numerics are unchanged.
    assert!(context.calls.load(Ordering::SeqCst) > 0);
    assert_eq!(grad_vec(&param), vec![3.0, 5.0]);
}

#[test]
fn test_backward_stats_cover_the_replica_grid() {
    let engine = Arc::new(Engine::new());
    let p0 = leaf_f32(&[0.0], &[1]);
    let p1 = leaf_f32(&[0.0], &[1]);

    let reducer = Reducer::new(
        vec![vec![p0.clone(), p1.clone()]],
        vec![vec![0, 1]],
        Arc::new(LocalProcessGroup),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    write_grad(&p0, &[1.0]);
    write_grad(&p1, &[1.0]);
    engine.run_post_hooks(p0.accumulator());
    engine.run_post_hooks(p1.accumulator());
    engine.run_callbacks();

    let stats = reducer.backward_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].len(), 2);
}
